pub mod adapter;
pub mod config;
pub mod device_map;
mod error;
pub mod geometry;
pub mod loader;
mod loader_factory;
pub mod lora;
pub mod orchestrator;
pub mod output;
mod request;
pub mod seed;
mod util;

mod flux;

pub use adapter::{attach_adapter, list_adapters, resolve_adapter, AdapterBinding};
pub use config::{AdapterCatalog, Settings};
pub use device_map::*;
pub use error::{GenerationError, Result};
pub use flux::{FluxLoader, FluxPipeline, FluxVariant};
pub use geometry::{resolve_geometry, Aspect, ResolvedGeometry, MAX_DIMENSION};
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
pub use orchestrator::{GenerationOutcome, Orchestrator, OutcomeStatus, RunSummary};
pub use output::resolve_output_path;
pub use request::{GenerationRequest, DEFAULT_STEPS, MAX_IMAGES, MAX_STEPS, MIN_STEPS};
pub use seed::{plan_seeds, SeedPlan};
pub use util::probe_environment;
pub(crate) use util::*;

/// Fully resolved arguments of one pipeline call. Values are validated
/// upstream and passed through as is.
#[derive(Debug, Clone, Copy)]
pub struct PipelineInput<'a> {
    pub prompt: &'a str,
    pub negative_prompt: Option<&'a str>,
    pub steps: usize,
    pub guidance_scale: f64,
    pub geometry: ResolvedGeometry,
    pub seed: u64,
    pub device: &'a ResolvedDevice,
    pub adapter: Option<&'a AdapterBinding>,
}

/// A text-to-image pipeline.
///
/// `generate` is the only required operation. The optional toggles default
/// to "unsupported"; the orchestrator checks the `supports_*` flags before
/// calling them.
pub trait Pipeline: Send {
    fn generate(&mut self, input: &PipelineInput<'_>) -> anyhow::Result<DynamicImage>;

    /// Switches the attention kernel. Errors leave the current kernel active.
    fn activate_attention(&mut self, backend: AttentionBackend) -> anyhow::Result<()> {
        match backend {
            AttentionBackend::Sdpa => Ok(()),
            other => anyhow::bail!("{other} attention is not available in this pipeline"),
        }
    }

    fn supports_compile(&self) -> bool {
        false
    }

    fn supports_offload(&self) -> bool {
        false
    }

    fn supports_adapter(&self) -> bool {
        false
    }

    fn enable_compile(&mut self) -> anyhow::Result<()> {
        anyhow::bail!("compilation is not supported by this pipeline")
    }

    fn enable_cpu_offload(&mut self) -> anyhow::Result<()> {
        anyhow::bail!("cpu offload is not supported by this pipeline")
    }

    fn attach_adapter(&mut self, _adapter: &AdapterBinding) -> anyhow::Result<()> {
        anyhow::bail!("adapters are not supported by this pipeline")
    }
}
