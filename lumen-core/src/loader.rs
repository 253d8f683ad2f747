use anyhow::Result;

use crate::{EnvironmentSnapshot, Pipeline, ResolvedDevice};

/// Builds pipelines for the orchestrator.
pub trait Loader {
    type Pipeline: Pipeline;

    /// Probes the machine the pipeline would run on.
    fn environment(&self) -> EnvironmentSnapshot;

    /// Loads the model on the resolved device and precision.
    fn load(&self, device: &ResolvedDevice) -> Result<Self::Pipeline>;
}
