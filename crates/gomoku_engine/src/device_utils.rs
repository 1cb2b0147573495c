//! Device and dtype selection for training and inference.

use anyhow::{bail, Result};
use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    Cpu,
    #[serde(alias = "cuda")]
    Gpu,
    #[serde(alias = "metal")]
    Mps,
    #[default]
    Auto,
}

/// Numeric width used for activations. Master weights always stay F32.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Precision {
    #[default]
    Full,
    Half,
    BFloat,
}

impl Precision {
    /// Accepts the spellings used in run configs: `32`, `16`, `16-mixed`, `bf16`, `bf16-mixed`.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "32" | "32-true" | "f32" => Ok(Precision::Full),
            "16" | "16-mixed" | "f16" | "half" => Ok(Precision::Half),
            "bf16" | "bf16-mixed" => Ok(Precision::BFloat),
            other => bail!("unsupported precision '{other}'"),
        }
    }

    pub fn dtype(self) -> DType {
        match self {
            Precision::Full => DType::F32,
            Precision::Half => DType::F16,
            Precision::BFloat => DType::BF16,
        }
    }

    /// Half precision kernels are only worth it on accelerators; CPU falls back to F32.
    pub fn effective_dtype(self, device: &Device) -> DType {
        if device.is_cpu() && self != Precision::Full {
            tracing::warn!(
                "{:?} precision requested on CPU; computing in F32 instead",
                self
            );
            return DType::F32;
        }
        self.dtype()
    }
}

/// Picks the device for `accelerator`, using the first entry of `devices`.
pub fn select_device(accelerator: Accelerator, devices: &[usize]) -> Result<Device> {
    if devices.len() > 1 {
        tracing::warn!(
            "{} devices requested but training runs on one device; using {}",
            devices.len(),
            devices[0]
        );
    }
    let ordinal = devices.first().copied().unwrap_or(0);

    let device = match accelerator {
        Accelerator::Cpu => Device::Cpu,
        Accelerator::Gpu => Device::new_cuda(ordinal)?,
        Accelerator::Mps => Device::new_metal(ordinal)?,
        Accelerator::Auto => Device::cuda_if_available(ordinal).unwrap_or(Device::Cpu),
    };
    tracing::info!("Device initialized: {:?}", device);
    Ok(device)
}

/// Seeds the accelerator generator. The CPU backend has no seedable
/// generator; CPU runs get reproducible weights from `layers::reseed_parameters`.
pub fn seed_device(device: &Device, seed: u64) -> Result<()> {
    if device.is_cpu() {
        tracing::debug!("CPU device: parameters are seeded on the host");
        return Ok(());
    }
    device.set_seed(seed)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precision_spellings() -> Result<()> {
        assert_eq!(Precision::parse("16")?, Precision::Half);
        assert_eq!(Precision::parse("16-mixed")?, Precision::Half);
        assert_eq!(Precision::parse("BF16")?, Precision::BFloat);
        assert_eq!(Precision::parse("32")?, Precision::Full);
        assert!(Precision::parse("8").is_err());
        Ok(())
    }

    #[test]
    fn half_precision_falls_back_on_cpu() {
        assert_eq!(Precision::Half.effective_dtype(&Device::Cpu), DType::F32);
        assert_eq!(Precision::Full.effective_dtype(&Device::Cpu), DType::F32);
    }

    #[test]
    fn seeding_the_cpu_is_not_an_error() -> Result<()> {
        seed_device(&Device::Cpu, 123)?;
        Ok(())
    }

    #[test]
    fn cpu_selection_ignores_extra_devices() -> Result<()> {
        let device = select_device(Accelerator::Cpu, &[0, 1])?;
        assert!(device.is_cpu());
        Ok(())
    }
}
