#![forbid(unsafe_code)]

use std::fmt;

use of_core::{DenseTensor, Device};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    Mismatch { expected: Device, actual: Device },
    Empty,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mismatch { expected, actual } => {
                write!(f, "device mismatch: expected {expected:?}, got {actual:?}")
            }
            Self::Empty => write!(f, "no tensors to resolve a device from"),
        }
    }
}

impl std::error::Error for DeviceError {}

/// Where an operator is asked to run: a device type plus an ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceOption {
    pub device: Device,
    pub device_id: u32,
}

impl DeviceOption {
    #[must_use]
    pub const fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            device_id: 0,
        }
    }

    #[must_use]
    pub const fn cuda(device_id: u32) -> Self {
        Self {
            device: Device::Cuda,
            device_id,
        }
    }

    #[must_use]
    pub fn label(&self) -> String {
        match self.device {
            Device::Cpu => "cpu".to_string(),
            Device::Cuda => format!("cuda:{}", self.device_id),
        }
    }
}

impl Default for DeviceOption {
    fn default() -> Self {
        Self::cpu()
    }
}

impl fmt::Display for DeviceOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Device configurations that have registered kernels.
#[must_use]
pub fn available_device_options() -> Vec<DeviceOption> {
    vec![DeviceOption::cpu()]
}

/// Every configuration the engine understands, including accelerators that
/// only run through the hardened CPU fallback.
#[must_use]
pub fn all_device_options() -> Vec<DeviceOption> {
    vec![DeviceOption::cpu(), DeviceOption::cuda(0)]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGuard {
    option: DeviceOption,
}

impl DeviceGuard {
    #[must_use]
    pub fn new(option: DeviceOption) -> Self {
        Self { option }
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.option.device
    }

    #[must_use]
    pub fn option(&self) -> DeviceOption {
        self.option
    }

    pub fn ensure_tensor_device(&self, tensor: &DenseTensor) -> Result<(), DeviceError> {
        let actual = tensor.device();
        if actual != self.option.device {
            return Err(DeviceError::Mismatch {
                expected: self.option.device,
                actual,
            });
        }
        Ok(())
    }

    pub fn ensure_all(&self, tensors: &[&DenseTensor]) -> Result<(), DeviceError> {
        tensors
            .iter()
            .try_for_each(|tensor| self.ensure_tensor_device(tensor))
    }
}

pub fn ensure_same_device(tensors: &[&DenseTensor]) -> Result<Device, DeviceError> {
    let (first, rest) = tensors.split_first().ok_or(DeviceError::Empty)?;
    let expected = first.device();
    for tensor in rest {
        if tensor.device() != expected {
            return Err(DeviceError::Mismatch {
                expected,
                actual: tensor.device(),
            });
        }
    }
    Ok(expected)
}
