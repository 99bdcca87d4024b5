#![forbid(unsafe_code)]

use std::fmt;

use of_core::{
    DenseTensor, DenseTensorError, Device, ExecutionMode, TensorCompatError, ensure_compatible,
};
use of_kernel_cpu::{
    KernelError, Operand, div_backward_contiguous_f32, div_tensor_contiguous_f32,
    log_backward_contiguous_f32, log_tensor_contiguous_f32, sigmoid_backward_contiguous_f32,
    sigmoid_tensor_contiguous_f32, sqr_backward_contiguous_f32, sqr_tensor_contiguous_f32,
};

/// The elementwise operators the engine registers, addressed by their
/// canonical operator-type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Div,
    Log,
    Sqr,
    Sigmoid,
}

impl OpKind {
    #[must_use]
    pub const fn all() -> &'static [OpKind] {
        &[OpKind::Div, OpKind::Log, OpKind::Sqr, OpKind::Sigmoid]
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Div => "Div",
            Self::Log => "Log",
            Self::Sqr => "Sqr",
            Self::Sigmoid => "Sigmoid",
        }
    }

    #[must_use]
    pub const fn gradient_name(self) -> &'static str {
        match self {
            Self::Div => "DivGradient",
            Self::Log => "LogGradient",
            Self::Sqr => "SqrGradient",
            Self::Sigmoid => "SigmoidGradient",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, OpRegistryError> {
        Self::all()
            .iter()
            .copied()
            .find(|op| op.name() == name)
            .ok_or_else(|| OpRegistryError::UnknownOperator {
                name: name.to_string(),
            })
    }

    #[must_use]
    pub const fn num_inputs(self) -> usize {
        match self {
            Self::Div => 2,
            Self::Log | Self::Sqr | Self::Sigmoid => 1,
        }
    }

    #[must_use]
    pub const fn num_outputs(self) -> usize {
        1
    }

    /// Inputs consumed by the gradient operator: `(dZ, B, Z)` for Div,
    /// `(dY, X)` or `(dY, Y)` for the unary operators.
    #[must_use]
    pub const fn gradient_num_inputs(self) -> usize {
        match self {
            Self::Div => 3,
            Self::Log | Self::Sqr | Self::Sigmoid => 2,
        }
    }

    /// One gradient per forward input.
    #[must_use]
    pub const fn gradient_num_outputs(self) -> usize {
        self.num_inputs()
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpRegistryError {
    UnknownOperator { name: String },
}

impl fmt::Display for OpRegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOperator { name } => {
                write!(f, "no operator registered under '{name}'")
            }
        }
    }
}

impl std::error::Error for OpRegistryError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchPhase {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DispatchKey {
    Undefined = 0,
    BackendSelect = 1,
    CompositeImplicitAutograd = 2,
    CompositeExplicitAutograd = 3,
    CPU = 4,
    CUDA = 5,
    AutogradCPU = 6,
    AutogradCUDA = 7,
}

impl DispatchKey {
    #[must_use]
    pub const fn all() -> &'static [DispatchKey] {
        &[
            DispatchKey::BackendSelect,
            DispatchKey::CompositeImplicitAutograd,
            DispatchKey::CompositeExplicitAutograd,
            DispatchKey::CPU,
            DispatchKey::CUDA,
            DispatchKey::AutogradCPU,
            DispatchKey::AutogradCUDA,
        ]
    }

    #[must_use]
    pub const fn bit(self) -> u64 {
        1u64 << (self as u8)
    }
}

const TYPE_PRIORITY: [DispatchKey; 7] = [
    DispatchKey::AutogradCUDA,
    DispatchKey::AutogradCPU,
    DispatchKey::CompositeExplicitAutograd,
    DispatchKey::CompositeImplicitAutograd,
    DispatchKey::CUDA,
    DispatchKey::CPU,
    DispatchKey::BackendSelect,
];

const BACKEND_PRIORITY: [DispatchKey; 2] = [DispatchKey::CUDA, DispatchKey::CPU];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DispatchKeySet {
    bits: u64,
}

impl DispatchKeySet {
    #[must_use]
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    #[must_use]
    pub fn from_keys(keys: &[DispatchKey]) -> Self {
        let mut out = Self::empty();
        for key in keys {
            out.add(*key);
        }
        out
    }

    pub fn from_bits_checked(bits: u64) -> Result<Self, DispatchKeyError> {
        let known_mask = DispatchKey::all()
            .iter()
            .fold(0u64, |mask, key| mask | key.bit());
        let unknown = bits & !known_mask;
        if unknown != 0 {
            return Err(DispatchKeyError::UnknownBits {
                unknown_mask: unknown,
            });
        }
        Ok(Self { bits })
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.bits
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.bits == 0
    }

    pub fn add(&mut self, key: DispatchKey) {
        self.bits |= key.bit();
    }

    pub fn remove(&mut self, key: DispatchKey) {
        self.bits &= !key.bit();
    }

    #[must_use]
    pub const fn has(self, key: DispatchKey) -> bool {
        (self.bits & key.bit()) != 0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self {
            bits: self.bits | other.bits,
        }
    }

    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self {
            bits: self.bits & other.bits,
        }
    }

    pub fn highest_priority_type_id(self) -> Result<DispatchKey, DispatchKeyError> {
        if self.is_empty() {
            return Err(DispatchKeyError::EmptySet);
        }
        TYPE_PRIORITY
            .iter()
            .find(|&&key| self.has(key))
            .copied()
            .ok_or(DispatchKeyError::NoTypeKey)
    }

    pub fn highest_priority_backend_type_id(self) -> Result<DispatchKey, DispatchKeyError> {
        if self.is_empty() {
            return Err(DispatchKeyError::EmptySet);
        }
        BACKEND_PRIORITY
            .iter()
            .find(|&&key| self.has(key))
            .copied()
            .ok_or(DispatchKeyError::NoBackendKey)
    }

    pub fn validate_for_elementwise(self) -> Result<(), DispatchKeyError> {
        if self.is_empty() {
            return Err(DispatchKeyError::EmptySet);
        }
        if self.has(DispatchKey::AutogradCPU) && !self.has(DispatchKey::CPU) {
            return Err(DispatchKeyError::IncompatibleSet {
                reason: "AutogradCPU requires CPU backend availability",
            });
        }
        if self.has(DispatchKey::AutogradCUDA) && !self.has(DispatchKey::CUDA) {
            return Err(DispatchKeyError::IncompatibleSet {
                reason: "AutogradCUDA requires CUDA backend availability",
            });
        }
        self.highest_priority_type_id()?;
        self.highest_priority_backend_type_id()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKeyError {
    EmptySet,
    NoTypeKey,
    NoBackendKey,
    UnknownBits { unknown_mask: u64 },
    IncompatibleSet { reason: &'static str },
    MissingKernel { key: DispatchKey },
}

impl fmt::Display for DispatchKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptySet => write!(f, "dispatch keyset is empty"),
            Self::NoTypeKey => write!(f, "dispatch keyset has no resolvable type key"),
            Self::NoBackendKey => write!(f, "dispatch keyset has no backend key"),
            Self::UnknownBits { unknown_mask } => {
                write!(
                    f,
                    "dispatch keyset has unknown bitmask 0x{unknown_mask:016x}"
                )
            }
            Self::IncompatibleSet { reason } => {
                write!(f, "incompatible dispatch keyset: {reason}")
            }
            Self::MissingKernel { key } => {
                write!(f, "no kernel registered for {key:?} in strict mode")
            }
        }
    }
}

impl std::error::Error for DispatchKeyError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchDecision {
    pub op: OpKind,
    pub phase: DispatchPhase,
    pub mode: ExecutionMode,
    pub kernel: &'static str,
    pub selected_key: DispatchKey,
    pub backend_key: DispatchKey,
    pub keyset_bits: u64,
    pub fallback_used: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub tensors: Vec<DenseTensor>,
    pub decision: DispatchDecision,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    Kernel(KernelError),
    Key(DispatchKeyError),
    Tensor(DenseTensorError),
    Incompatible(TensorCompatError),
    Arity {
        op: OpKind,
        expected: usize,
        actual: usize,
    },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kernel(error) => write!(f, "kernel dispatch failure: {error}"),
            Self::Key(error) => write!(f, "dispatch key failure: {error}"),
            Self::Tensor(error) => write!(f, "kernel output rejected: {error}"),
            Self::Incompatible(error) => write!(f, "incompatible operands: {error}"),
            Self::Arity {
                op,
                expected,
                actual,
            } => write!(
                f,
                "operator {op} expects {expected} input tensors, got {actual}"
            ),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<TensorCompatError> for DispatchError {
    fn from(value: TensorCompatError) -> Self {
        Self::Incompatible(value)
    }
}

impl From<KernelError> for DispatchError {
    fn from(value: KernelError) -> Self {
        Self::Kernel(value)
    }
}

impl From<DispatchKeyError> for DispatchError {
    fn from(value: DispatchKeyError) -> Self {
        Self::Key(value)
    }
}

impl From<DenseTensorError> for DispatchError {
    fn from(value: DenseTensorError) -> Self {
        Self::Tensor(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Cpu,
    AutogradCpu,
}

#[derive(Debug, Clone, Copy)]
struct ResolvedRoute {
    route: Route,
    selected_key: DispatchKey,
    backend_key: DispatchKey,
    fallback_used: bool,
}

#[must_use]
pub fn dispatch_keyset_for_tensors(
    inputs: &[&DenseTensor],
    requires_grad: bool,
) -> DispatchKeySet {
    let mut keyset = DispatchKeySet::empty();
    keyset.add(DispatchKey::BackendSelect);
    match inputs.first().map(|tensor| tensor.device()) {
        Some(Device::Cpu) => {
            keyset.add(DispatchKey::CPU);
            if requires_grad {
                keyset.add(DispatchKey::AutogradCPU);
            }
        }
        Some(Device::Cuda) => {
            keyset.add(DispatchKey::CUDA);
            if requires_grad {
                keyset.add(DispatchKey::AutogradCUDA);
            }
        }
        None => {}
    }
    keyset
}

fn resolve_route(
    keyset: DispatchKeySet,
    mode: ExecutionMode,
) -> Result<ResolvedRoute, DispatchError> {
    keyset.validate_for_elementwise()?;
    let selected_key = keyset.highest_priority_type_id()?;
    let backend_key = keyset.highest_priority_backend_type_id()?;

    let (route, fallback_used) = match selected_key {
        DispatchKey::AutogradCPU => (Route::AutogradCpu, false),
        DispatchKey::CPU => (Route::Cpu, false),
        // Accelerator keys have no kernels of their own.
        DispatchKey::AutogradCUDA | DispatchKey::CUDA => match mode {
            ExecutionMode::Strict => {
                return Err(DispatchKeyError::MissingKernel { key: selected_key }.into());
            }
            ExecutionMode::Hardened if selected_key == DispatchKey::AutogradCUDA => {
                (Route::AutogradCpu, true)
            }
            ExecutionMode::Hardened => (Route::Cpu, true),
        },
        DispatchKey::CompositeExplicitAutograd
        | DispatchKey::CompositeImplicitAutograd
        | DispatchKey::BackendSelect => match mode {
            ExecutionMode::Strict => {
                return Err(DispatchKeyError::IncompatibleSet {
                    reason: "strict mode forbids composite/backend fallback routing",
                }
                .into());
            }
            ExecutionMode::Hardened => (Route::Cpu, true),
        },
        DispatchKey::Undefined => return Err(DispatchKeyError::NoTypeKey.into()),
    };

    Ok(ResolvedRoute {
        route,
        selected_key,
        backend_key,
        fallback_used,
    })
}

const fn kernel_name(op: OpKind, phase: DispatchPhase, route: Route) -> &'static str {
    match (phase, route, op) {
        (DispatchPhase::Forward, Route::AutogradCpu, OpKind::Div) => "autograd_cpu::div_tensor",
        (DispatchPhase::Forward, Route::AutogradCpu, OpKind::Log) => "autograd_cpu::log_tensor",
        (DispatchPhase::Forward, Route::AutogradCpu, OpKind::Sqr) => "autograd_cpu::sqr_tensor",
        (DispatchPhase::Forward, Route::AutogradCpu, OpKind::Sigmoid) => {
            "autograd_cpu::sigmoid_tensor"
        }
        (DispatchPhase::Forward, Route::Cpu, OpKind::Div) => "cpu::div_tensor",
        (DispatchPhase::Forward, Route::Cpu, OpKind::Log) => "cpu::log_tensor",
        (DispatchPhase::Forward, Route::Cpu, OpKind::Sqr) => "cpu::sqr_tensor",
        (DispatchPhase::Forward, Route::Cpu, OpKind::Sigmoid) => "cpu::sigmoid_tensor",
        (DispatchPhase::Backward, _, OpKind::Div) => "autograd_cpu::div_backward",
        (DispatchPhase::Backward, _, OpKind::Log) => "autograd_cpu::log_backward",
        (DispatchPhase::Backward, _, OpKind::Sqr) => "autograd_cpu::sqr_backward",
        (DispatchPhase::Backward, _, OpKind::Sigmoid) => "autograd_cpu::sigmoid_backward",
    }
}

fn operand<'a>(tensor: &'a DenseTensor, side: &'static str) -> Operand<'a> {
    Operand::new(tensor.values(), tensor.meta(), side)
}

fn ensure_arity(op: OpKind, inputs: &[&DenseTensor]) -> Result<(), DispatchError> {
    if inputs.len() != op.num_inputs() {
        return Err(DispatchError::Arity {
            op,
            expected: op.num_inputs(),
            actual: inputs.len(),
        });
    }
    if let Some((first, rest)) = inputs.split_first() {
        for other in rest {
            ensure_compatible(first, other)?;
        }
    }
    Ok(())
}

fn run_forward_kernel(op: OpKind, inputs: &[&DenseTensor]) -> Result<Vec<f32>, KernelError> {
    match op {
        OpKind::Div => {
            div_tensor_contiguous_f32(operand(inputs[0], "lhs"), operand(inputs[1], "rhs"))
        }
        OpKind::Log => log_tensor_contiguous_f32(operand(inputs[0], "input")),
        OpKind::Sqr => sqr_tensor_contiguous_f32(operand(inputs[0], "input")),
        OpKind::Sigmoid => sigmoid_tensor_contiguous_f32(operand(inputs[0], "input")),
    }
}

fn run_backward_kernel(
    op: OpKind,
    grad_out: &DenseTensor,
    inputs: &[&DenseTensor],
    output: &DenseTensor,
) -> Result<Vec<Vec<f32>>, KernelError> {
    let grad = operand(grad_out, "grad_out");
    match op {
        OpKind::Div => {
            let (lhs_grad, rhs_grad) =
                div_backward_contiguous_f32(grad, operand(inputs[1], "rhs"), operand(output, "out"))?;
            Ok(vec![lhs_grad, rhs_grad])
        }
        OpKind::Log => Ok(vec![log_backward_contiguous_f32(
            grad,
            operand(inputs[0], "input"),
        )?]),
        OpKind::Sqr => Ok(vec![sqr_backward_contiguous_f32(
            grad,
            operand(inputs[0], "input"),
        )?]),
        OpKind::Sigmoid => Ok(vec![sigmoid_backward_contiguous_f32(
            grad,
            operand(output, "out"),
        )?]),
    }
}

pub fn dispatch_forward(
    op: OpKind,
    mode: ExecutionMode,
    inputs: &[&DenseTensor],
    requires_grad: bool,
) -> Result<DispatchOutcome, DispatchError> {
    let keyset = dispatch_keyset_for_tensors(inputs, requires_grad);
    dispatch_forward_with_keyset(op, mode, inputs, keyset)
}

pub fn dispatch_forward_with_keyset(
    op: OpKind,
    mode: ExecutionMode,
    inputs: &[&DenseTensor],
    keyset: DispatchKeySet,
) -> Result<DispatchOutcome, DispatchError> {
    ensure_arity(op, inputs)?;
    let resolved = resolve_route(keyset, mode)?;
    let values = run_forward_kernel(op, inputs)?;
    let output = inputs[0].with_values(values)?;

    Ok(DispatchOutcome {
        tensors: vec![output],
        decision: DispatchDecision {
            op,
            phase: DispatchPhase::Forward,
            mode,
            kernel: kernel_name(op, DispatchPhase::Forward, resolved.route),
            selected_key: resolved.selected_key,
            backend_key: resolved.backend_key,
            keyset_bits: keyset.bits(),
            fallback_used: resolved.fallback_used,
        },
    })
}

/// Runs the gradient operator for `op`, returning one gradient per input in
/// input order.
pub fn dispatch_backward(
    op: OpKind,
    mode: ExecutionMode,
    grad_out: &DenseTensor,
    inputs: &[&DenseTensor],
    output: &DenseTensor,
) -> Result<DispatchOutcome, DispatchError> {
    ensure_arity(op, inputs)?;
    let keyset = dispatch_keyset_for_tensors(inputs, true);
    let resolved = resolve_route(keyset, mode)?;

    let grads = run_backward_kernel(op, grad_out, inputs, output)?;
    let tensors = grads
        .into_iter()
        .zip(inputs.iter())
        .map(|(values, input)| input.with_values(values))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DispatchOutcome {
        tensors,
        decision: DispatchDecision {
            op,
            phase: DispatchPhase::Backward,
            mode,
            kernel: kernel_name(op, DispatchPhase::Backward, resolved.route),
            selected_key: resolved.selected_key,
            backend_key: resolved.backend_key,
            keyset_bits: keyset.bits(),
            fallback_used: resolved.fallback_used,
        },
    })
}
