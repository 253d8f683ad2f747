use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use image::DynamicImage;
use tracing::debug;

use crate::{Capability, CapabilityCheck, DeviceKind, EnvironmentSnapshot, Precision, ResolvedDevice};

/// Probes Metal, then CUDA: whether each is compiled in and opens, and
/// whether it runs bf16 matmuls.
pub fn probe_environment() -> EnvironmentSnapshot {
    let mut checks = Vec::with_capacity(4);
    for kind in [DeviceKind::Mps, DeviceKind::Cuda] {
        match open_device(kind) {
            Ok(device) => {
                checks.push(CapabilityCheck::pass(Capability::Device(kind)));
                checks.push(match bf16_matmul(&device) {
                    Ok(()) => CapabilityCheck::pass(Capability::Bf16(kind)),
                    Err(err) => CapabilityCheck::fail(Capability::Bf16(kind), format!("{err:#}")),
                });
            }
            Err(err) => {
                let reason = format!("{err:#}");
                debug!("{kind} unavailable: {reason}");
                checks.push(CapabilityCheck::fail(Capability::Device(kind), reason.clone()));
                checks.push(CapabilityCheck::fail(Capability::Bf16(kind), reason));
            }
        }
    }
    EnvironmentSnapshot::new(checks)
}

pub fn open_device(kind: DeviceKind) -> Result<Device> {
    match kind {
        DeviceKind::Cpu => Ok(Device::Cpu),
        DeviceKind::Cuda if cuda_is_available() => Ok(Device::new_cuda(0)?),
        DeviceKind::Mps if metal_is_available() => Ok(Device::new_metal(0)?),
        DeviceKind::Cuda => {
            anyhow::bail!("cuda support is not compiled in, build with `--features cuda`")
        }
        DeviceKind::Mps => {
            anyhow::bail!("metal support is not compiled in, build with `--features metal`")
        }
    }
}

fn bf16_matmul(device: &Device) -> Result<()> {
    let a = Tensor::ones((2, 2), DType::BF16, device)?;
    a.matmul(&a)?.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    Ok(())
}

pub(crate) fn dtype_of(resolved: &ResolvedDevice) -> DType {
    match resolved.precision {
        Precision::Bf16 => DType::BF16,
        Precision::Fp32 => DType::F32,
    }
}

/// Converts a tensor with shape (3, height, width) into an RGB image.
pub(crate) fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_always_opens() {
        assert!(open_device(DeviceKind::Cpu).unwrap().is_cpu());
    }

    #[test]
    fn probe_reports_every_accelerator() {
        let env = probe_environment();
        assert_eq!(env.checks.len(), 4);
        assert_eq!(env.checks[0].capability, Capability::Device(DeviceKind::Mps));
        assert_eq!(env.checks[2].capability, Capability::Device(DeviceKind::Cuda));
    }

    #[test]
    fn tensor_round_trips_into_rgb() {
        let t = Tensor::zeros((3, 16, 32), DType::U8, &Device::Cpu).unwrap();
        let img = tensor_to_image(&t).unwrap();
        assert_eq!((img.width(), img.height()), (32, 16));

        let gray = Tensor::zeros((1, 16, 16), DType::U8, &Device::Cpu).unwrap();
        assert!(tensor_to_image(&gray).is_err());
    }
}
