#![forbid(unsafe_code)]

use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda,
}

/// Policy applied when an operator cannot run exactly where it was asked to.
///
/// `Strict` fails closed; `Hardened` is allowed to reroute to the CPU kernels
/// and must record that it did so.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Strict,
    Hardened,
}

/// Shape and placement of a dense row-major f32 tensor.
///
/// Every tensor in the harness owns exactly `numel` contiguous values, so the
/// shape alone fixes the layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorMeta {
    shape: Vec<usize>,
    numel: usize,
    device: Device,
}

impl TensorMeta {
    pub fn new(shape: Vec<usize>, device: Device) -> Result<Self, DenseTensorError> {
        let numel = shape
            .iter()
            .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
            .ok_or(DenseTensorError::NumelOverflow { rank: shape.len() })?;
        Ok(Self {
            shape,
            numel,
            device,
        })
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.numel
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Two operands of one elementwise kernel must agree on device and shape.
    pub fn check_compatible(&self, other: &Self) -> Result<(), TensorCompatError> {
        if self.device != other.device {
            return Err(TensorCompatError::DeviceMismatch {
                lhs: self.device,
                rhs: other.device,
            });
        }
        if self.shape != other.shape {
            return Err(TensorCompatError::ShapeMismatch {
                lhs: self.shape.clone(),
                rhs: other.shape.clone(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn fingerprint64(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorCompatError {
    DeviceMismatch { lhs: Device, rhs: Device },
    ShapeMismatch { lhs: Vec<usize>, rhs: Vec<usize> },
}

impl fmt::Display for TensorCompatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceMismatch { lhs, rhs } => {
                write!(f, "device mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::ShapeMismatch { lhs, rhs } => {
                write!(f, "shape mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
        }
    }
}

impl std::error::Error for TensorCompatError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenseTensorError {
    NumelOverflow { rank: usize },
    StorageLengthMismatch { expected: usize, actual: usize },
}

impl fmt::Display for DenseTensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NumelOverflow { rank } => {
                write!(f, "element count overflows usize for rank-{rank} shape")
            }
            Self::StorageLengthMismatch { expected, actual } => write!(
                f,
                "value count does not match shape: expected={expected}, actual={actual}"
            ),
        }
    }
}

impl std::error::Error for DenseTensorError {}

/// An owned, contiguous f32 tensor.
///
/// Tensors are never mutated in place; kernels produce new tensors through
/// [`DenseTensor::with_values`], which bumps the version.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseTensor {
    id: u64,
    version: u64,
    meta: TensorMeta,
    values: Vec<f32>,
}

impl DenseTensor {
    pub fn from_contiguous_values(
        values: Vec<f32>,
        shape: Vec<usize>,
        device: Device,
    ) -> Result<Self, DenseTensorError> {
        Self::assemble(TensorMeta::new(shape, device)?, values, 0)
    }

    pub fn full(shape: Vec<usize>, value: f32, device: Device) -> Result<Self, DenseTensorError> {
        let meta = TensorMeta::new(shape, device)?;
        let values = vec![value; meta.numel()];
        Self::assemble(meta, values, 0)
    }

    /// Builds an out-of-place result with the same shape and device.
    pub fn with_values(&self, values: Vec<f32>) -> Result<Self, DenseTensorError> {
        Self::assemble(self.meta.clone(), values, self.version.saturating_add(1))
    }

    fn assemble(meta: TensorMeta, values: Vec<f32>, version: u64) -> Result<Self, DenseTensorError> {
        if values.len() != meta.numel() {
            return Err(DenseTensorError::StorageLengthMismatch {
                expected: meta.numel(),
                actual: values.len(),
            });
        }
        Ok(Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            version,
            meta,
            values,
        })
    }

    #[must_use]
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    #[must_use]
    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.meta.shape()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.meta.numel()
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.meta.device()
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Hash of identity, metadata and value bits, logged with dispatch evidence.
    #[must_use]
    pub fn evidence_fingerprint64(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        (self.id, self.version, self.meta.fingerprint64()).hash(&mut hasher);
        for value in &self.values {
            value.to_bits().hash(&mut hasher);
        }
        hasher.finish()
    }
}

pub fn ensure_compatible(lhs: &DenseTensor, rhs: &DenseTensor) -> Result<(), TensorCompatError> {
    lhs.meta().check_compatible(rhs.meta())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{DenseTensor, DenseTensorError, Device, TensorCompatError, TensorMeta};

    #[test]
    fn empty_shape_is_a_single_element() {
        let meta = TensorMeta::new(Vec::new(), Device::Cpu).expect("rank-0 meta");
        assert_eq!(meta.numel(), 1);
    }

    #[test]
    fn zero_dimension_means_no_elements() {
        let tensor = DenseTensor::full(vec![3, 0, 2], 1.0, Device::Cpu).expect("empty tensor");
        assert_eq!(tensor.numel(), 0);
        assert!(tensor.values().is_empty());
    }

    #[test]
    fn overflowing_shape_is_rejected() {
        let err = TensorMeta::new(vec![usize::MAX, 2], Device::Cpu).expect_err("must overflow");
        assert_eq!(err, DenseTensorError::NumelOverflow { rank: 2 });
    }

    #[test]
    fn value_count_must_match_shape() {
        let err = DenseTensor::from_contiguous_values(vec![1.0; 5], vec![2, 3], Device::Cpu)
            .expect_err("5 values cannot fill a 2x3 tensor");
        assert_eq!(
            err,
            DenseTensorError::StorageLengthMismatch {
                expected: 6,
                actual: 5
            }
        );
    }

    #[test]
    fn with_values_is_out_of_place() {
        let base = DenseTensor::full(vec![2], 0.5, Device::Cuda).expect("base");
        let next = base.with_values(vec![1.0, 2.0]).expect("same length");

        assert_ne!(base.id(), next.id());
        assert_eq!(next.version(), base.version() + 1);
        assert_eq!(next.device(), Device::Cuda);
        assert_eq!(base.values(), &[0.5, 0.5]);
        assert_eq!(next.values(), &[1.0, 2.0]);
        assert!(base.with_values(vec![1.0]).is_err());
    }

    #[test]
    fn compatibility_checks_device_before_shape() {
        let cpu = DenseTensor::full(vec![2], 1.0, Device::Cpu).expect("cpu");
        let cuda = DenseTensor::full(vec![3], 1.0, Device::Cuda).expect("cuda");
        let wide = DenseTensor::full(vec![1, 2], 1.0, Device::Cpu).expect("wide");

        assert_eq!(
            super::ensure_compatible(&cpu, &cuda),
            Err(TensorCompatError::DeviceMismatch {
                lhs: Device::Cpu,
                rhs: Device::Cuda
            })
        );
        assert_eq!(
            super::ensure_compatible(&cpu, &wide),
            Err(TensorCompatError::ShapeMismatch {
                lhs: vec![2],
                rhs: vec![1, 2]
            })
        );
        assert_eq!(super::ensure_compatible(&cpu, &cpu.clone()), Ok(()));
    }

    #[test]
    fn fingerprint_tracks_values() {
        let tensor = DenseTensor::full(vec![2], 1.0, Device::Cpu).expect("tensor");
        let copy = tensor.clone();
        assert_eq!(tensor.evidence_fingerprint64(), copy.evidence_fingerprint64());

        let changed = tensor.with_values(vec![1.0, 1.5]).expect("changed");
        assert_ne!(
            tensor.evidence_fingerprint64(),
            changed.evidence_fingerprint64()
        );
    }

    proptest! {
        #[test]
        fn prop_numel_is_product_of_dims(shape in prop::collection::vec(0usize..=6, 0..=4)) {
            let expected: usize = shape.iter().product();
            let tensor = DenseTensor::full(shape, 0.25, Device::Cpu).expect("small shapes fit");
            prop_assert_eq!(tensor.numel(), expected);
            prop_assert_eq!(tensor.values().len(), expected);
        }

        #[test]
        fn prop_meta_fingerprint_ignores_tensor_identity(
            shape in prop::collection::vec(1usize..=5, 1..=3),
        ) {
            let a = DenseTensor::full(shape.clone(), 1.0, Device::Cpu).expect("a");
            let b = DenseTensor::full(shape, 2.0, Device::Cpu).expect("b");
            prop_assert_eq!(a.meta().fingerprint64(), b.meta().fingerprint64());
        }
    }
}
