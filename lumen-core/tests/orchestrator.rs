use std::path::Path;
use std::sync::{Arc, Mutex};

use image::{DynamicImage, RgbImage};
use lumen_core::{
    AdapterBinding, AdapterCatalog, Aspect, AttentionBackend, Capability, CapabilityCheck,
    DeviceChoice, DeviceKind, EnvironmentSnapshot, GenerationError, GenerationRequest, Loader,
    NoticeKind, OutcomeStatus, Orchestrator, Pipeline, PipelineInput, Precision, ResolvedDevice,
    ResolvedGeometry, Settings, MAX_IMAGES,
};
use tempfile::TempDir;

type Hook = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Default)]
struct Script {
    fail_seeds: Vec<u64>,
    /// Runs when the image with this seed is generated.
    on_seed: Option<(u64, Hook)>,
    compile: bool,
    offload: bool,
    adapter: bool,
    flash: bool,
}

#[derive(Default)]
struct Log {
    loads: Vec<ResolvedDevice>,
    calls: Vec<(u64, ResolvedGeometry, ResolvedDevice)>,
    attention: Vec<AttentionBackend>,
    adapters: Vec<AdapterBinding>,
    compiled: bool,
    offloaded: bool,
}

struct FakePipeline {
    script: Script,
    log: Arc<Mutex<Log>>,
}

impl Pipeline for FakePipeline {
    fn generate(&mut self, input: &PipelineInput<'_>) -> anyhow::Result<DynamicImage> {
        self.log
            .lock()
            .unwrap()
            .calls
            .push((input.seed, input.geometry, *input.device));
        if let Some((seed, hook)) = &self.script.on_seed {
            if *seed == input.seed {
                hook();
            }
        }
        if self.script.fail_seeds.contains(&input.seed) {
            anyhow::bail!("out of memory");
        }
        let ResolvedGeometry { width, height } = input.geometry;
        Ok(DynamicImage::ImageRgb8(RgbImage::new(width as u32, height as u32)))
    }

    fn activate_attention(&mut self, backend: AttentionBackend) -> anyhow::Result<()> {
        self.log.lock().unwrap().attention.push(backend);
        match backend {
            AttentionBackend::Sdpa => Ok(()),
            _ if self.script.flash => Ok(()),
            other => anyhow::bail!("{other} kernels missing"),
        }
    }

    fn supports_compile(&self) -> bool {
        self.script.compile
    }

    fn supports_offload(&self) -> bool {
        self.script.offload
    }

    fn supports_adapter(&self) -> bool {
        self.script.adapter
    }

    fn enable_compile(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().compiled = true;
        Ok(())
    }

    fn enable_cpu_offload(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().offloaded = true;
        Ok(())
    }

    fn attach_adapter(&mut self, adapter: &AdapterBinding) -> anyhow::Result<()> {
        self.log.lock().unwrap().adapters.push(adapter.clone());
        Ok(())
    }
}

struct FakeLoader {
    env: EnvironmentSnapshot,
    script: Script,
    log: Arc<Mutex<Log>>,
}

impl Loader for FakeLoader {
    type Pipeline = FakePipeline;

    fn environment(&self) -> EnvironmentSnapshot {
        self.env.clone()
    }

    fn load(&self, device: &ResolvedDevice) -> anyhow::Result<FakePipeline> {
        self.log.lock().unwrap().loads.push(*device);
        Ok(FakePipeline {
            script: self.script.clone(),
            log: self.log.clone(),
        })
    }
}

fn cuda_env() -> EnvironmentSnapshot {
    EnvironmentSnapshot::new(vec![
        CapabilityCheck::fail(Capability::Device(DeviceKind::Mps), "no metal"),
        CapabilityCheck::pass(Capability::Device(DeviceKind::Cuda)),
        CapabilityCheck::pass(Capability::Bf16(DeviceKind::Cuda)),
    ])
}

struct Harness {
    dir: TempDir,
    log: Arc<Mutex<Log>>,
    orchestrator: Orchestrator<FakeLoader>,
}

impl Harness {
    fn new(env: EnvironmentSnapshot, script: Script) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            output_dir: dir.path().join("output"),
            adapters: AdapterCatalog {
                root: dir.path().join("loras"),
                bundled: Default::default(),
            },
            ..Settings::default()
        };
        let log = Arc::new(Mutex::new(Log::default()));
        let loader = FakeLoader {
            env,
            script,
            log: log.clone(),
        };
        Self {
            dir,
            log,
            orchestrator: Orchestrator::new(loader, settings),
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn loads(&self) -> usize {
        self.log.lock().unwrap().loads.len()
    }
}

fn small_request() -> GenerationRequest {
    GenerationRequest {
        aspect: Some(Aspect::Custom),
        height: Some(32),
        width: Some(48),
        ..GenerationRequest::new("a lighthouse at dusk")
    }
}

#[test]
fn failed_image_does_not_abort_the_batch() {
    let mut h = Harness::new(
        EnvironmentSnapshot::cpu_only(),
        Script {
            fail_seeds: vec![124],
            ..Default::default()
        },
    );
    let request = GenerationRequest {
        seed: Some(123),
        num_images: 3,
        ..small_request()
    };

    let summary = h.orchestrator.run(&request).unwrap();
    let statuses: Vec<_> = summary.outcomes.iter().map(|o| o.status).collect();
    assert_eq!(
        statuses,
        vec![OutcomeStatus::Ok, OutcomeStatus::Failed, OutcomeStatus::Ok]
    );
    assert_eq!(summary.outcomes.iter().map(|o| o.seed).collect::<Vec<_>>(), vec![123, 124, 125]);
    assert!(summary.outcomes[0].path.is_file());
    assert!(!summary.outcomes[1].path.exists());
    assert!(summary.outcomes[2].path.is_file());
    assert!(summary.outcomes[1].error.as_deref().unwrap().contains("out of memory"));
    assert_eq!((summary.succeeded(), summary.failed()), (2, 1));

    let written = image::open(&summary.outcomes[0].path).unwrap();
    assert_eq!((written.width(), written.height()), (48, 32));
    assert!(summary.outcomes[0].path.starts_with(h.root().join("output")));
}

#[test]
fn every_image_shares_the_static_resolution() {
    let mut h = Harness::new(cuda_env(), Script::default());
    let request = GenerationRequest {
        aspect: Some(Aspect::Landscape),
        num_images: 2,
        ..GenerationRequest::new("x")
    };
    let summary = h.orchestrator.run(&request).unwrap();

    let log = h.log.lock().unwrap();
    assert_eq!(log.loads.len(), 1);
    assert_eq!(log.calls.len(), 2);
    for (_, geometry, device) in &log.calls {
        assert_eq!(*geometry, ResolvedGeometry { width: 1280, height: 720 });
        assert_eq!(device.device, DeviceKind::Cuda);
        assert_eq!(device.precision, Precision::Bf16);
    }
    assert_eq!(summary.geometry, ResolvedGeometry { width: 1280, height: 720 });
    assert_ne!(summary.outcomes[0].path, summary.outcomes[1].path);
}

#[test]
fn unknown_adapter_fails_before_loading() {
    let mut h = Harness::new(
        cuda_env(),
        Script {
            adapter: true,
            ..Default::default()
        },
    );
    let request = GenerationRequest {
        lora: Some("does-not-exist".into()),
        ..small_request()
    };
    let err = h.orchestrator.run(&request).unwrap_err();
    assert!(matches!(err, GenerationError::AdapterNotFound { .. }));
    assert!(err.is_client_error());
    assert_eq!(h.loads(), 0);
    assert!(h.log.lock().unwrap().calls.is_empty());
}

#[test]
fn adapter_is_attached_once_with_its_scale() {
    let mut h = Harness::new(
        EnvironmentSnapshot::cpu_only(),
        Script {
            adapter: true,
            ..Default::default()
        },
    );
    let weights = h.root().join("loras/film/film.safetensors");
    std::fs::create_dir_all(weights.parent().unwrap()).unwrap();
    std::fs::write(&weights, b"").unwrap();

    let request = GenerationRequest {
        lora: Some("film".into()),
        lora_scale: 0.7,
        num_images: 2,
        ..small_request()
    };
    let summary = h.orchestrator.run(&request).unwrap();

    let log = h.log.lock().unwrap();
    assert_eq!(log.adapters.len(), 1);
    assert_eq!(log.adapters[0].weights, weights);
    assert_eq!(log.adapters[0].scale, 0.7);
    assert_eq!(summary.adapter.as_ref().map(|a| a.name.as_str()), Some("film"));
    assert!(summary.info().contains("lora=film, lora_scale=0.7"));
}

#[test]
fn adapter_on_a_pipeline_without_support_is_fatal() {
    let mut h = Harness::new(EnvironmentSnapshot::cpu_only(), Script::default());
    let weights = h.root().join("style.safetensors");
    std::fs::write(&weights, b"").unwrap();

    let request = GenerationRequest {
        lora: Some(weights.to_string_lossy().into_owned()),
        ..small_request()
    };
    let err = h.orchestrator.run(&request).unwrap_err();
    assert!(matches!(err, GenerationError::Adapter { .. }));
    assert!(h.log.lock().unwrap().calls.is_empty());
}

#[test]
fn pinned_cuda_without_cuda_runs_on_cpu() {
    let mut h = Harness::new(EnvironmentSnapshot::cpu_only(), Script::default());
    let request = GenerationRequest {
        device: DeviceChoice::Cuda,
        ..small_request()
    };
    let summary = h.orchestrator.run(&request).unwrap();

    assert_eq!(summary.device.device, DeviceKind::Cpu);
    assert_eq!(summary.device.precision, Precision::Fp32);
    assert!(summary.notices.iter().any(|n| n.kind == NoticeKind::Device));
    assert_eq!(summary.outcomes[0].status, OutcomeStatus::Ok);
}

#[test]
fn rejected_attention_backend_falls_back_to_sdpa() {
    let mut h = Harness::new(cuda_env(), Script::default());
    let request = GenerationRequest {
        attention_backend: AttentionBackend::Flash3,
        ..small_request()
    };
    let summary = h.orchestrator.run(&request).unwrap();

    assert_eq!(summary.device.attention_backend, AttentionBackend::Sdpa);
    assert!(summary.notices.iter().any(|n| n.kind == NoticeKind::Attention));
    assert_eq!(
        h.log.lock().unwrap().attention,
        vec![AttentionBackend::Flash3, AttentionBackend::Sdpa]
    );
}

#[test]
fn accepted_attention_backend_is_kept() {
    let mut h = Harness::new(
        cuda_env(),
        Script {
            flash: true,
            ..Default::default()
        },
    );
    let request = GenerationRequest {
        attention_backend: AttentionBackend::Flash2,
        ..small_request()
    };
    let summary = h.orchestrator.run(&request).unwrap();
    assert_eq!(summary.device.attention_backend, AttentionBackend::Flash2);
    assert!(summary.notices.is_empty());
}

#[test]
fn compile_and_offload_are_pipeline_toggles() {
    let mut h = Harness::new(
        cuda_env(),
        Script {
            compile: true,
            offload: true,
            ..Default::default()
        },
    );
    let request = GenerationRequest {
        compile: true,
        cpu_offload: true,
        num_images: 2,
        ..small_request()
    };
    let summary = h.orchestrator.run(&request).unwrap();
    assert!(summary.compile && summary.cpu_offload);
    assert!(summary.notices.is_empty());
    let log = h.log.lock().unwrap();
    assert!(log.compiled && log.offloaded);
}

#[test]
fn unsupported_toggles_leave_notices() {
    let mut h = Harness::new(EnvironmentSnapshot::cpu_only(), Script::default());
    let request = GenerationRequest {
        compile: true,
        cpu_offload: true,
        ..small_request()
    };
    let summary = h.orchestrator.run(&request).unwrap();

    assert!(!summary.compile && !summary.cpu_offload);
    let kinds: Vec<_> = summary.notices.iter().map(|n| n.kind).collect();
    assert_eq!(kinds, vec![NoticeKind::Compile, NoticeKind::Offload]);
    assert!(summary.notices[1].reason.contains("cuda"));
}

#[test]
fn pipeline_is_reused_while_static_options_match() {
    let mut h = Harness::new(cuda_env(), Script::default());
    h.orchestrator.run(&small_request()).unwrap();
    h.orchestrator
        .run(&GenerationRequest {
            seed: Some(5),
            steps: 4,
            ..small_request()
        })
        .unwrap();
    assert_eq!(h.loads(), 1);

    h.orchestrator
        .run(&GenerationRequest {
            device: DeviceChoice::Cpu,
            ..small_request()
        })
        .unwrap();
    assert_eq!(h.loads(), 2);
}

#[test]
fn config_errors_fail_before_loading() {
    let mut h = Harness::new(cuda_env(), Script::default());
    let conflicting = GenerationRequest {
        aspect: Some(Aspect::Square),
        width: Some(640),
        ..GenerationRequest::new("x")
    };
    for request in [GenerationRequest::new(""), conflicting] {
        let err = h.orchestrator.run(&request).unwrap_err();
        assert!(matches!(err, GenerationError::Config(_)), "{err}");
    }
    assert_eq!(h.loads(), 0);
}

#[test]
fn write_failures_are_per_image() {
    let mut h = Harness::new(EnvironmentSnapshot::cpu_only(), Script::default());
    let target = h.root().join("render.unknown");
    let request = GenerationRequest {
        output: Some(target.to_string_lossy().into_owned()),
        num_images: 2,
        ..small_request()
    };
    let summary = h.orchestrator.run(&request).unwrap();
    assert!(summary.outcomes.iter().all(|o| o.status == OutcomeStatus::Failed));
    assert_eq!(h.log.lock().unwrap().calls.len(), 2);
}

#[test]
fn unusable_output_directory_is_fatal() {
    let mut h = Harness::new(EnvironmentSnapshot::cpu_only(), Script::default());
    let blocker = h.root().join("taken");
    std::fs::write(&blocker, b"file").unwrap();
    let request = GenerationRequest {
        outdir: Some(blocker.join("inside")),
        ..small_request()
    };
    let err = h.orchestrator.run(&request).unwrap_err();
    assert!(matches!(err, GenerationError::Io { .. }));
    assert!(h.log.lock().unwrap().calls.is_empty());
}

#[test]
fn info_line_describes_the_run() {
    let mut h = Harness::new(EnvironmentSnapshot::cpu_only(), Script::default());
    let request = GenerationRequest {
        seed: Some(77),
        ..small_request()
    };
    let info = h.orchestrator.run(&request).unwrap().info();
    assert_eq!(
        info,
        "device=cpu, dtype=fp32, steps=9, guidance=0, size=48x32, seed=77, attn=sdpa, \
         compile=false, cpu_offload=false"
    );
}

#[test]
fn adapters_lists_the_catalog() {
    let h = Harness::new(EnvironmentSnapshot::cpu_only(), Script::default());
    std::fs::create_dir_all(h.root().join("loras/watercolor")).unwrap();
    assert_eq!(h.orchestrator.adapters(), vec!["watercolor".to_string()]);
}

#[test]
fn oversized_batch_fails_before_loading() {
    let mut h = Harness::new(cuda_env(), Script::default());
    for num_images in [MAX_IMAGES + 1, usize::MAX] {
        let request = GenerationRequest {
            num_images,
            ..small_request()
        };
        let err = h.orchestrator.run(&request).unwrap_err();
        assert!(matches!(err, GenerationError::Config(_)), "{err}");
    }
    assert_eq!(h.loads(), 0);
}

#[test]
fn output_directory_lost_mid_batch_keeps_earlier_outcomes() {
    let dir = tempfile::tempdir().unwrap();
    let outdir = dir.path().join("renders/today");
    let (renders, moved) = (dir.path().join("renders"), dir.path().join("moved"));
    let hook: Hook = Arc::new(move || {
        std::fs::rename(&renders, &moved).unwrap();
        std::fs::write(&renders, b"not a directory").unwrap();
    });
    let mut h = Harness::new(
        EnvironmentSnapshot::cpu_only(),
        Script {
            on_seed: Some((11, hook)),
            ..Default::default()
        },
    );
    let request = GenerationRequest {
        seed: Some(10),
        num_images: 4,
        outdir: Some(outdir),
        ..small_request()
    };

    let summary = h.orchestrator.run(&request).unwrap();
    let statuses: Vec<_> = summary.outcomes.iter().map(|o| o.status).collect();
    assert_eq!(statuses, vec![OutcomeStatus::Ok, OutcomeStatus::Failed]);
    assert!(summary.aborted.is_some());
    assert!(!summary.is_complete());
    let first = summary.outcomes[0].path.file_name().unwrap();
    assert!(dir.path().join("moved/today").join(first).is_file());
    assert_eq!(h.log.lock().unwrap().calls.len(), 2);
}

#[test]
fn complete_runs_are_not_aborted() {
    let mut h = Harness::new(EnvironmentSnapshot::cpu_only(), Script::default());
    let summary = h.orchestrator.run(&small_request()).unwrap();
    assert_eq!(summary.aborted, None);
    assert!(summary.is_complete());
}

#[test]
fn reset_forces_a_reload() {
    let mut h = Harness::new(cuda_env(), Script::default());
    h.orchestrator.run(&small_request()).unwrap();
    h.orchestrator.reset();
    h.orchestrator.run(&small_request()).unwrap();
    assert_eq!(h.loads(), 2);
}

#[test]
fn notices_are_returned_once_per_session() {
    let mut h = Harness::new(EnvironmentSnapshot::cpu_only(), Script::default());
    let request = GenerationRequest {
        device: DeviceChoice::Cuda,
        attention_backend: AttentionBackend::Flash2,
        ..small_request()
    };
    let first = h.orchestrator.run(&request).unwrap();
    let second = h.orchestrator.run(&request).unwrap();
    let kinds: Vec<_> = first.notices.iter().map(|n| n.kind).collect();
    assert_eq!(kinds, vec![NoticeKind::Device, NoticeKind::Attention]);
    assert_eq!(first.notices, second.notices);
    assert_eq!(h.loads(), 1);
}
