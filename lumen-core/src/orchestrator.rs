use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::output::{run_stamp, write_image_atomic};
use crate::{
    activate_attention, attach_adapter, list_adapters, plan_seeds, resolve_adapter, resolve_device,
    resolve_geometry, resolve_output_path, AdapterBinding, AttentionBackend, BackendNotice,
    DeviceChoice, DeviceKind, GenerationError, GenerationRequest, Loader, NoticeKind, Pipeline,
    PipelineInput, ResolvedDevice, ResolvedGeometry, Result, Settings,
};

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Ok,
    Failed,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub index: usize,
    pub seed: u64,
    pub path: PathBuf,
    pub status: OutcomeStatus,
    pub error: Option<String>,
}

impl GenerationOutcome {
    pub fn is_ok(&self) -> bool {
        self.status == OutcomeStatus::Ok
    }
}

/// Everything a front end reports about one run.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub geometry: ResolvedGeometry,
    pub device: ResolvedDevice,
    pub steps: usize,
    pub guidance_scale: f64,
    pub compile: bool,
    pub cpu_offload: bool,
    pub adapter: Option<AdapterBinding>,
    pub notices: Vec<BackendNotice>,
    pub outcomes: Vec<GenerationOutcome>,
    /// Why the batch stopped early. Images past the last outcome were
    /// never attempted.
    pub aborted: Option<String>,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// Every requested image was attempted and written.
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none() && self.failed() == 0
    }

    /// One-line description of the run settings.
    pub fn info(&self) -> String {
        let seeds = self
            .outcomes
            .iter()
            .map(|o| o.seed.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let mut info = format!(
            "device={}, dtype={}, steps={}, guidance={}, size={}, seed={}, attn={}, compile={}, cpu_offload={}",
            self.device.device,
            self.device.precision,
            self.steps,
            self.guidance_scale,
            self.geometry,
            seeds,
            self.device.attention_backend,
            self.compile,
            self.cpu_offload,
        );
        if let Some(adapter) = &self.adapter {
            info.push_str(&format!(", lora={}, lora_scale={}", adapter.name, adapter.scale));
        }
        info
    }
}

/// Run-level options that require reloading the pipeline when they change.
#[derive(Debug, Clone, PartialEq)]
struct SessionKey {
    device: DeviceChoice,
    attention_backend: AttentionBackend,
    compile: bool,
    cpu_offload: bool,
    adapter: Option<AdapterBinding>,
}

struct Session<P> {
    key: SessionKey,
    pipeline: P,
    device: ResolvedDevice,
    compile: bool,
    cpu_offload: bool,
    notices: Vec<BackendNotice>,
}

/// Turns requests into images on disk, one image at a time.
///
/// The loaded pipeline is kept between runs and reused while the static
/// options (device, attention, compile, offload, adapter) stay the same.
pub struct Orchestrator<L: Loader> {
    loader: L,
    settings: Settings,
    session: Option<Session<L::Pipeline>>,
}

impl<L: Loader> Orchestrator<L> {
    pub fn new(loader: L, settings: Settings) -> Self {
        Self {
            loader,
            settings,
            session: None,
        }
    }

    /// Adapters available to requests.
    pub fn adapters(&self) -> Vec<String> {
        list_adapters(&self.settings.adapters)
    }

    /// Drops the loaded pipeline; the next run loads a fresh one.
    pub fn reset(&mut self) {
        if self.session.take().is_some() {
            info!("released loaded pipeline");
        }
    }

    /// Runs a whole batch.
    ///
    /// Configuration problems fail before anything is loaded. A failure of
    /// a single image is recorded in its outcome and the batch goes on. An
    /// unusable output directory fails the run before the first image, and
    /// later stops the batch with the outcomes so far in the summary.
    pub fn run(&mut self, request: &GenerationRequest) -> Result<RunSummary> {
        request.validate()?;
        let geometry = resolve_geometry(
            request.aspect,
            request.height,
            request.width,
            self.settings.default_geometry,
        )?;
        let adapter = resolve_adapter(
            request.lora.as_deref(),
            request.lora_scale,
            &self.settings.adapters,
        )?;

        let key = SessionKey {
            device: request.device,
            attention_backend: request.attention_backend,
            compile: request.compile,
            cpu_offload: request.cpu_offload,
            adapter,
        };
        let seeds = plan_seeds(request.seed, request.num_images);
        let total = seeds.seeds().len();
        let default_dir = self.settings.output_dir.clone();
        let session = self.session_for(key)?;

        let stamp = run_stamp();
        let negative_prompt = request.negative_prompt();
        info!(
            "generating {total} image(s) at {geometry} on {} ({})",
            session.device.device, session.device.precision
        );

        let mut outcomes = Vec::with_capacity(total);
        let mut aborted = None;
        for (index, &seed) in seeds.seeds().iter().enumerate() {
            let path = match resolve_output_path(
                request.output.as_deref(),
                request.outdir.as_deref(),
                &default_dir,
                index,
                total,
                &stamp,
            ) {
                Ok(path) => path,
                Err(err) if outcomes.is_empty() => return Err(err),
                Err(err) => {
                    error!("aborting after {} of {total} images: {err}", outcomes.len());
                    aborted = Some(err.to_string());
                    break;
                }
            };

            let input = PipelineInput {
                prompt: &request.prompt,
                negative_prompt,
                steps: request.steps,
                guidance_scale: request.guidance_scale,
                geometry,
                seed,
                device: &session.device,
                adapter: session.key.adapter.as_ref(),
            };
            let result = session
                .pipeline
                .generate(&input)
                .and_then(|image| write_image_atomic(&image, &path));

            let outcome = match result {
                Ok(()) => {
                    info!("[{}/{total}] seed {seed} -> {}", index + 1, path.display());
                    GenerationOutcome {
                        index,
                        seed,
                        path,
                        status: OutcomeStatus::Ok,
                        error: None,
                    }
                }
                Err(err) => {
                    warn!("[{}/{total}] seed {seed} failed: {err:#}", index + 1);
                    GenerationOutcome {
                        index,
                        seed,
                        path,
                        status: OutcomeStatus::Failed,
                        error: Some(format!("{err:#}")),
                    }
                }
            };
            outcomes.push(outcome);
        }

        Ok(RunSummary {
            geometry,
            device: session.device,
            steps: request.steps,
            guidance_scale: request.guidance_scale,
            compile: session.compile,
            cpu_offload: session.cpu_offload,
            adapter: session.key.adapter.clone(),
            notices: session.notices.clone(),
            outcomes,
            aborted,
        })
    }

    /// The cached session when `key` matches it, else a freshly loaded one.
    fn session_for(&mut self, key: SessionKey) -> Result<&mut Session<L::Pipeline>> {
        let session = match self.session.take() {
            Some(session) if session.key == key => {
                info!("reusing loaded pipeline");
                session
            }
            stale => {
                // Release the old model before loading the next one.
                drop(stale);
                self.open_session(key)?
            }
        };
        Ok(self.session.insert(session))
    }

    fn open_session(&self, key: SessionKey) -> Result<Session<L::Pipeline>> {
        let env = self.loader.environment();
        let mut resolution = resolve_device(&env, key.device, key.attention_backend);
        info!(
            "resolved device {} ({}, {} attention)",
            resolution.resolved.device,
            resolution.resolved.precision,
            resolution.resolved.attention_backend
        );

        let mut pipeline = self
            .loader
            .load(&resolution.resolved)
            .map_err(GenerationError::PipelineLoad)?;
        activate_attention(&mut pipeline, &mut resolution);
        let mut notices = resolution.notices;

        let compile = key.compile
            && enable_toggle(
                &mut notices,
                NoticeKind::Compile,
                pipeline.supports_compile(),
                || pipeline.enable_compile(),
            );

        let cpu_offload = if key.cpu_offload && resolution.resolved.device != DeviceKind::Cuda {
            notices.push(BackendNotice::new(
                NoticeKind::Offload,
                "cpu_offload",
                "disabled",
                format!(
                    "cpu offload only applies to cuda, running on {}",
                    resolution.resolved.device
                ),
            ));
            false
        } else {
            key.cpu_offload
                && enable_toggle(
                    &mut notices,
                    NoticeKind::Offload,
                    pipeline.supports_offload(),
                    || pipeline.enable_cpu_offload(),
                )
        };

        if let Some(adapter) = &key.adapter {
            attach_adapter(&mut pipeline, adapter)?;
        }
        for notice in &notices {
            warn!("{notice}");
        }

        Ok(Session {
            key,
            pipeline,
            device: resolution.resolved,
            compile,
            cpu_offload,
            notices,
        })
    }
}

/// Applies an optional pipeline toggle, recording a notice when it is not
/// available. Returns whether it ended up enabled.
fn enable_toggle(
    notices: &mut Vec<BackendNotice>,
    kind: NoticeKind,
    supported: bool,
    enable: impl FnOnce() -> anyhow::Result<()>,
) -> bool {
    let requested = format!("{kind:?}").to_lowercase();
    if !supported {
        notices.push(BackendNotice::new(
            kind,
            requested,
            "disabled",
            "not supported by the pipeline",
        ));
        return false;
    }
    match enable() {
        Ok(()) => true,
        Err(err) => {
            notices.push(BackendNotice::new(kind, requested, "disabled", format!("{err:#}")));
            false
        }
    }
}
