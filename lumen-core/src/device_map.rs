use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Pipeline;

/// Device requested by the caller.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeviceChoice {
    #[default]
    Auto,
    Mps,
    Cuda,
    Cpu,
}

/// Device the run actually executes on.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Mps,
    Cuda,
    Cpu,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Bf16,
    Fp32,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AttentionBackend {
    #[default]
    Sdpa,
    Flash2,
    Flash3,
}

serde_plain::derive_fromstr_from_deserialize!(DeviceChoice);
serde_plain::derive_display_from_serialize!(DeviceChoice);
serde_plain::derive_display_from_serialize!(DeviceKind);
serde_plain::derive_display_from_serialize!(Precision);
serde_plain::derive_fromstr_from_deserialize!(AttentionBackend);
serde_plain::derive_display_from_serialize!(AttentionBackend);

impl AttentionBackend {
    fn needs_cuda(self) -> bool {
        matches!(self, Self::Flash2 | Self::Flash3)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResolvedDevice {
    pub device: DeviceKind,
    pub precision: Precision,
    pub attention_backend: AttentionBackend,
}

/// A capability the resolver may ask the environment about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    /// The device is compiled in and can be opened.
    Device(DeviceKind),
    /// The device runs bf16 kernels.
    Bf16(DeviceKind),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapabilityCheck {
    pub capability: Capability,
    pub passed: bool,
    pub reason: String,
}

impl CapabilityCheck {
    pub fn pass(capability: Capability) -> Self {
        Self {
            capability,
            passed: true,
            reason: "ok".to_string(),
        }
    }

    pub fn fail(capability: Capability, reason: impl Into<String>) -> Self {
        Self {
            capability,
            passed: false,
            reason: reason.into(),
        }
    }
}

/// Result of probing the machine once, in probe order.
///
/// Capabilities that were never probed count as failed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvironmentSnapshot {
    pub checks: Vec<CapabilityCheck>,
}

impl EnvironmentSnapshot {
    pub fn new(checks: Vec<CapabilityCheck>) -> Self {
        Self { checks }
    }

    /// A machine with nothing but a CPU.
    pub fn cpu_only() -> Self {
        Self::default()
    }

    pub fn check(&self, capability: Capability) -> Result<(), String> {
        match self.checks.iter().find(|c| c.capability == capability) {
            Some(check) if check.passed => Ok(()),
            Some(check) => Err(check.reason.clone()),
            None => Err("not probed".to_string()),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    Device,
    Precision,
    Attention,
    Compile,
    Offload,
}

/// A non-fatal downgrade recorded while resolving the static configuration.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct BackendNotice {
    pub kind: NoticeKind,
    pub requested: String,
    pub applied: String,
    pub reason: String,
}

impl BackendNotice {
    pub fn new(
        kind: NoticeKind,
        requested: impl ToString,
        applied: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            requested: requested.to_string(),
            applied: applied.to_string(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for BackendNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} fallback: requested {}, using {} ({})",
            self.kind, self.requested, self.applied, self.reason
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceResolution {
    pub resolved: ResolvedDevice,
    pub notices: Vec<BackendNotice>,
}

/// Order in which `auto` tries accelerators.
const AUTO_PRIORITY: [DeviceKind; 2] = [DeviceKind::Mps, DeviceKind::Cuda];

/// Picks the device, precision and attention backend for a run.
///
/// Pure function of the snapshot. Never fails: anything unavailable
/// degrades to a working configuration and leaves a notice.
pub fn resolve_device(
    env: &EnvironmentSnapshot,
    requested: DeviceChoice,
    backend: AttentionBackend,
) -> DeviceResolution {
    let mut notices = Vec::new();

    let device = match requested {
        DeviceChoice::Cpu => DeviceKind::Cpu,
        DeviceChoice::Auto => AUTO_PRIORITY
            .into_iter()
            .find(|&kind| env.check(Capability::Device(kind)).is_ok())
            .unwrap_or(DeviceKind::Cpu),
        DeviceChoice::Mps | DeviceChoice::Cuda => {
            let kind = if requested == DeviceChoice::Mps {
                DeviceKind::Mps
            } else {
                DeviceKind::Cuda
            };
            match env.check(Capability::Device(kind)) {
                Ok(()) => kind,
                Err(reason) => {
                    notices.push(BackendNotice::new(
                        NoticeKind::Device,
                        kind,
                        DeviceKind::Cpu,
                        reason,
                    ));
                    DeviceKind::Cpu
                }
            }
        }
    };

    let precision = match device {
        DeviceKind::Cpu => Precision::Fp32,
        kind => match env.check(Capability::Bf16(kind)) {
            Ok(()) => Precision::Bf16,
            Err(reason) => {
                notices.push(BackendNotice::new(
                    NoticeKind::Precision,
                    Precision::Bf16,
                    Precision::Fp32,
                    reason,
                ));
                Precision::Fp32
            }
        },
    };

    let attention_backend = if backend.needs_cuda() && device != DeviceKind::Cuda {
        notices.push(BackendNotice::new(
            NoticeKind::Attention,
            backend,
            AttentionBackend::Sdpa,
            format!("{backend} kernels require a cuda device, running on {device}"),
        ));
        AttentionBackend::Sdpa
    } else {
        backend
    };

    DeviceResolution {
        resolved: ResolvedDevice {
            device,
            precision,
            attention_backend,
        },
        notices,
    }
}

/// Activates the resolved attention backend on a loaded pipeline, falling
/// back to sdpa when the pipeline rejects it.
pub fn activate_attention<P: Pipeline + ?Sized>(pipeline: &mut P, resolution: &mut DeviceResolution) {
    let backend = resolution.resolved.attention_backend;
    let Err(err) = pipeline.activate_attention(backend) else {
        return;
    };
    if backend == AttentionBackend::Sdpa {
        warn!("pipeline rejected sdpa attention, keeping its built-in kernel: {err:#}");
        return;
    }

    resolution.notices.push(BackendNotice::new(
        NoticeKind::Attention,
        backend,
        AttentionBackend::Sdpa,
        format!("{err:#}"),
    ));
    resolution.resolved.attention_backend = AttentionBackend::Sdpa;
    if let Err(err) = pipeline.activate_attention(AttentionBackend::Sdpa) {
        warn!("pipeline rejected sdpa attention, keeping its built-in kernel: {err:#}");
    }
}
