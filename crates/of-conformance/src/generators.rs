use of_core::ExecutionMode;
use of_device::{all_device_options, available_device_options};
use proptest::prelude::*;
use proptest::test_runner::Config as ProptestConfig;
use rand::Rng;
use rand::rngs::StdRng;

use crate::checks::{CheckDevice, InputTensor};

pub const PROFILE_ENV: &str = "OPFORGE_CONFORMANCE_PROFILE";

/// How many generated cases each property runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConformanceProfile {
    Dev,
    Ci,
    Debug,
}

impl ConformanceProfile {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Ci => "ci",
            Self::Debug => "debug",
        }
    }

    #[must_use]
    pub const fn cases(self) -> u32 {
        match self {
            Self::Dev => 10,
            Self::Ci => 100,
            Self::Debug => 1000,
        }
    }

    pub fn from_name(raw: &str) -> Result<Self, String> {
        match raw {
            "dev" => Ok(Self::Dev),
            "ci" => Ok(Self::Ci),
            "debug" => Ok(Self::Debug),
            other => Err(format!(
                "unsupported conformance profile '{other}'; expected dev|ci|debug"
            )),
        }
    }

    /// Reads the profile from the environment; unset means `Dev`.
    pub fn from_env() -> Result<Self, String> {
        match std::env::var(PROFILE_ENV) {
            Ok(raw) => Self::from_name(raw.trim()),
            Err(std::env::VarError::NotPresent) => Ok(Self::Dev),
            Err(error) => Err(format!("failed reading {PROFILE_ENV}: {error}")),
        }
    }

    #[must_use]
    pub fn proptest_config(self) -> ProptestConfig {
        ProptestConfig::with_cases(self.cases())
    }
}

/// Devices a run may target: only registered kernels in strict mode, every
/// known configuration in hardened mode.
#[must_use]
pub fn devices_for_mode(mode: ExecutionMode) -> Vec<CheckDevice> {
    let options = match mode {
        ExecutionMode::Strict => available_device_options(),
        ExecutionMode::Hardened => all_device_options(),
    };
    options
        .into_iter()
        .map(|option| CheckDevice::new(option, mode))
        .collect()
}

/// One device to run the checks on, plus every device for cross-device
/// comparison.
pub fn gcs(mode: ExecutionMode) -> impl Strategy<Value = (CheckDevice, Vec<CheckDevice>)> {
    let devices = devices_for_mode(mode);
    (0..devices.len()).prop_map(move |idx| (devices[idx], devices.clone()))
}

pub fn shape_strategy(bounds: &'static [(usize, usize)]) -> impl Strategy<Value = Vec<usize>> {
    bounds
        .iter()
        .map(|(lo, hi)| *lo..=*hi)
        .collect::<Vec<_>>()
}

pub fn value_seed() -> impl Strategy<Value = u64> {
    any::<u64>()
}

pub fn sample_shape(rng: &mut StdRng, bounds: &[(usize, usize)]) -> Vec<usize> {
    bounds
        .iter()
        .map(|(lo, hi)| rng.gen_range(*lo..=*hi))
        .collect()
}

/// Fills `shape` with `U[0, 1) + shift`.
pub fn uniform_tensor(rng: &mut StdRng, shape: &[usize], shift: f32) -> InputTensor {
    let numel = shape.iter().product::<usize>();
    let values = (0..numel).map(|_| rng.r#gen::<f32>() + shift).collect();
    InputTensor::new(shape.to_vec(), values)
}
