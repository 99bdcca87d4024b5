#![forbid(unsafe_code)]

use std::fmt;

use of_core::{TensorCompatError, TensorMeta};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    Incompatible(TensorCompatError),
    StorageLengthMismatch {
        side: &'static str,
        expected: usize,
        actual: usize,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incompatible(error) => write!(f, "incompatible operands: {error}"),
            Self::StorageLengthMismatch {
                side,
                expected,
                actual,
            } => write!(
                f,
                "{side} carries {actual} values but its shape needs {expected}"
            ),
        }
    }
}

impl std::error::Error for KernelError {}

impl From<TensorCompatError> for KernelError {
    fn from(value: TensorCompatError) -> Self {
        Self::Incompatible(value)
    }
}

/// One kernel operand: contiguous f32 values plus the metadata they claim.
#[derive(Debug, Clone, Copy)]
pub struct Operand<'a> {
    pub values: &'a [f32],
    pub meta: &'a TensorMeta,
    pub side: &'static str,
}

impl<'a> Operand<'a> {
    #[must_use]
    pub fn new(values: &'a [f32], meta: &'a TensorMeta, side: &'static str) -> Self {
        Self { values, meta, side }
    }

    fn checked(&self) -> Result<&'a [f32], KernelError> {
        if self.values.len() != self.meta.numel() {
            return Err(KernelError::StorageLengthMismatch {
                side: self.side,
                expected: self.meta.numel(),
                actual: self.values.len(),
            });
        }
        Ok(self.values)
    }
}

fn unary_contiguous_f32<F>(input: Operand<'_>, op: F) -> Result<Vec<f32>, KernelError>
where
    F: Fn(f32) -> f32,
{
    Ok(input.checked()?.iter().map(|value| op(*value)).collect())
}

fn binary_contiguous_f32<F>(
    lhs: Operand<'_>,
    rhs: Operand<'_>,
    op: F,
) -> Result<Vec<f32>, KernelError>
where
    F: Fn(f32, f32) -> f32,
{
    lhs.meta.check_compatible(rhs.meta)?;
    let lhs_window = lhs.checked()?;
    let rhs_window = rhs.checked()?;

    Ok(lhs_window
        .iter()
        .zip(rhs_window.iter())
        .map(|(left, right)| op(*left, *right))
        .collect())
}

fn ternary_contiguous_f32<F>(
    first: Operand<'_>,
    second: Operand<'_>,
    third: Operand<'_>,
    op: F,
) -> Result<Vec<f32>, KernelError>
where
    F: Fn(f32, f32, f32) -> f32,
{
    first.meta.check_compatible(second.meta)?;
    first.meta.check_compatible(third.meta)?;
    let first_window = first.checked()?;
    let second_window = second.checked()?;
    let third_window = third.checked()?;

    Ok(first_window
        .iter()
        .zip(second_window.iter())
        .zip(third_window.iter())
        .map(|((a, b), c)| op(*a, *b, *c))
        .collect())
}

#[must_use]
pub fn sigmoid_f32(value: f32) -> f32 {
    1.0 / (1.0 + (-value).exp())
}

pub fn div_tensor_contiguous_f32(
    lhs: Operand<'_>,
    rhs: Operand<'_>,
) -> Result<Vec<f32>, KernelError> {
    binary_contiguous_f32(lhs, rhs, |left, right| left / right)
}

pub fn log_tensor_contiguous_f32(input: Operand<'_>) -> Result<Vec<f32>, KernelError> {
    unary_contiguous_f32(input, f32::ln)
}

pub fn sqr_tensor_contiguous_f32(input: Operand<'_>) -> Result<Vec<f32>, KernelError> {
    unary_contiguous_f32(input, |value| value * value)
}

pub fn sigmoid_tensor_contiguous_f32(input: Operand<'_>) -> Result<Vec<f32>, KernelError> {
    unary_contiguous_f32(input, sigmoid_f32)
}

/// Gradient of `Z = A / B`: returns `(dA, dB)` with `dA = dZ / B` and
/// `dB = -dZ * Z / B`.
pub fn div_backward_contiguous_f32(
    grad_out: Operand<'_>,
    rhs: Operand<'_>,
    out: Operand<'_>,
) -> Result<(Vec<f32>, Vec<f32>), KernelError> {
    let lhs_grad = binary_contiguous_f32(grad_out, rhs, |dz, b| dz / b)?;
    let rhs_grad = ternary_contiguous_f32(grad_out, rhs, out, |dz, b, z| -dz * z / b)?;
    Ok((lhs_grad, rhs_grad))
}

/// `dX = dY / X`
pub fn log_backward_contiguous_f32(
    grad_out: Operand<'_>,
    input: Operand<'_>,
) -> Result<Vec<f32>, KernelError> {
    binary_contiguous_f32(grad_out, input, |dy, x| dy / x)
}

/// `dX = 2 * X * dY`
pub fn sqr_backward_contiguous_f32(
    grad_out: Operand<'_>,
    input: Operand<'_>,
) -> Result<Vec<f32>, KernelError> {
    binary_contiguous_f32(grad_out, input, |dy, x| 2.0 * x * dy)
}

/// Uses the forward output: `dX = dY * Y * (1 - Y)`.
pub fn sigmoid_backward_contiguous_f32(
    grad_out: Operand<'_>,
    out: Operand<'_>,
) -> Result<Vec<f32>, KernelError> {
    binary_contiguous_f32(grad_out, out, |dy, y| dy * y * (1.0 - y))
}
