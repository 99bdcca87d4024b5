#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use of_autograd::{AutogradError, NodeId, OperationEvent, TensorBackwardReport, TensorTape};
use of_core::{DenseTensor, ExecutionMode};
use of_device::{DeviceError, DeviceGuard, DeviceOption};
use of_dispatch::{OpKind, OpRegistryError};
use of_runtime::{EvidenceEntry, EvidenceKind, RuntimeContext};

#[derive(Debug, Clone, PartialEq)]
pub enum ApiError {
    Operator(OpRegistryError),
    ArityMismatch {
        op: OpKind,
        role: &'static str,
        expected: usize,
        actual: usize,
    },
    MissingBlob {
        name: String,
    },
    Device(DeviceError),
    Autograd(AutogradError),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operator(error) => write!(f, "operator definition rejected: {error}"),
            Self::ArityMismatch {
                op,
                role,
                expected,
                actual,
            } => write!(f, "operator {op} takes {expected} {role}, got {actual}"),
            Self::MissingBlob { name } => write!(f, "blob '{name}' does not exist"),
            Self::Device(error) => write!(f, "device check failed: {error}"),
            Self::Autograd(error) => write!(f, "execution failed: {error}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<OpRegistryError> for ApiError {
    fn from(value: OpRegistryError) -> Self {
        Self::Operator(value)
    }
}

impl From<DeviceError> for ApiError {
    fn from(value: DeviceError) -> Self {
        Self::Device(value)
    }
}

impl From<AutogradError> for ApiError {
    fn from(value: AutogradError) -> Self {
        Self::Autograd(value)
    }
}

/// An operator type plus the blob names it reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorDef {
    op: OpKind,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl OperatorDef {
    pub fn new(op_type: &str, inputs: &[&str], outputs: &[&str]) -> Result<Self, ApiError> {
        let op = OpKind::from_name(op_type)?;
        if inputs.len() != op.num_inputs() {
            return Err(ApiError::ArityMismatch {
                op,
                role: "inputs",
                expected: op.num_inputs(),
                actual: inputs.len(),
            });
        }
        if outputs.len() != op.num_outputs() {
            return Err(ApiError::ArityMismatch {
                op,
                role: "outputs",
                expected: op.num_outputs(),
                actual: outputs.len(),
            });
        }
        Ok(Self {
            op,
            inputs: inputs.iter().map(|name| (*name).to_string()).collect(),
            outputs: outputs.iter().map(|name| (*name).to_string()).collect(),
        })
    }

    #[must_use]
    pub fn op(&self) -> OpKind {
        self.op
    }

    #[must_use]
    pub fn op_type(&self) -> &'static str {
        self.op.name()
    }

    #[must_use]
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    #[must_use]
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }
}

pub fn create_operator(
    op_type: &str,
    inputs: &[&str],
    outputs: &[&str],
) -> Result<OperatorDef, ApiError> {
    OperatorDef::new(op_type, inputs, outputs)
}

/// A named-blob workspace bound to one device configuration.
#[derive(Debug, Clone)]
pub struct OperatorSession {
    tape: TensorTape,
    runtime: RuntimeContext,
    guard: DeviceGuard,
    blobs: BTreeMap<String, NodeId>,
}

impl OperatorSession {
    #[must_use]
    pub fn new(mode: ExecutionMode, device_option: DeviceOption) -> Self {
        let mut runtime = RuntimeContext::new(mode);
        runtime.record(
            EvidenceKind::Device,
            format!("session bound to {device_option}"),
        );
        Self {
            tape: TensorTape::new(),
            runtime,
            guard: DeviceGuard::new(device_option),
            blobs: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.runtime.mode()
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.runtime.set_mode(mode);
    }

    #[must_use]
    pub fn device_option(&self) -> DeviceOption {
        self.guard.option()
    }

    /// Places `values` on the session device under `name`, replacing any blob
    /// already bound there.
    pub fn feed_blob(
        &mut self,
        name: &str,
        values: Vec<f32>,
        shape: Vec<usize>,
    ) -> Result<(), ApiError> {
        let option = self.guard.option();
        self.feed_blob_on(name, values, shape, option)
    }

    /// Feeds a blob placed on `option` instead of the session device.
    /// Operators reading it are rejected unless the two devices match.
    pub fn feed_blob_on(
        &mut self,
        name: &str,
        values: Vec<f32>,
        shape: Vec<usize>,
        option: DeviceOption,
    ) -> Result<(), ApiError> {
        let node = self.tape.leaf(values, shape, option.device, true)?;
        self.blobs.insert(name.to_string(), node);
        Ok(())
    }

    #[must_use]
    pub fn has_blob(&self, name: &str) -> bool {
        self.blobs.contains_key(name)
    }

    pub fn fetch_blob(&self, name: &str) -> Result<&[f32], ApiError> {
        Ok(self.tape.values(self.blob_node(name)?)?)
    }

    pub fn blob_shape(&self, name: &str) -> Result<&[usize], ApiError> {
        Ok(self.blob_tensor(name)?.shape())
    }

    pub fn blob_tensor(&self, name: &str) -> Result<&DenseTensor, ApiError> {
        Ok(self.tape.tensor(self.blob_node(name)?)?)
    }

    pub fn run_operator_once(&mut self, op: &OperatorDef) -> Result<(), ApiError> {
        let inputs = op
            .inputs()
            .iter()
            .map(|name| self.blob_node(name))
            .collect::<Result<Vec<_>, _>>()?;

        let tensors = inputs
            .iter()
            .map(|node| self.tape.tensor(*node))
            .collect::<Result<Vec<_>, _>>()?;
        if let Err(error) = self.guard.ensure_all(tensors.as_slice()) {
            let label = self.guard.option().label();
            self.runtime.record_device_rejection(&label, &error);
            return Err(error.into());
        }

        let mode = self.mode();
        let (out, event) = match self.tape.apply(op.op(), inputs.as_slice(), mode) {
            Ok(applied) => applied,
            Err(error) => {
                let label = self.guard.option().label();
                self.runtime.record_device_rejection(&label, &error);
                return Err(error.into());
            }
        };
        let fingerprint = self.tape.tensor(out)?.evidence_fingerprint64();
        self.record_operation(&event, fingerprint);

        for name in op.outputs() {
            self.blobs.insert(name.clone(), out);
        }
        Ok(())
    }

    /// Backpropagates `seed` from the blob `output_name` through every
    /// operator that produced it.
    pub fn backward(
        &mut self,
        output_name: &str,
        seed: &[f32],
    ) -> Result<TensorBackwardReport, ApiError> {
        let root = self.blob_node(output_name)?;
        let report = self.tape.backward_with_seed(root, seed)?;
        self.runtime.record(
            EvidenceKind::Backward,
            format!(
                "root={output_name} backward_steps={} queue_pushes={} queue_pops={} max_queue_len={} fallback={}",
                report.steps.len(),
                report.telemetry.queue_pushes,
                report.telemetry.queue_pops,
                report.telemetry.max_queue_len,
                report.telemetry.hardened_fallback_used
            ),
        );
        Ok(report)
    }

    #[must_use]
    pub fn gradient<'r>(
        &self,
        report: &'r TensorBackwardReport,
        input_name: &str,
    ) -> Option<&'r [f32]> {
        let node = self.blobs.get(input_name)?;
        report.gradient(*node)
    }

    #[must_use]
    pub fn evidence(&self) -> &[EvidenceEntry] {
        self.runtime.evidence()
    }

    #[must_use]
    pub fn evidence_len(&self) -> usize {
        self.runtime.evidence().len()
    }

    fn blob_node(&self, name: &str) -> Result<NodeId, ApiError> {
        self.blobs
            .get(name)
            .copied()
            .ok_or_else(|| ApiError::MissingBlob {
                name: name.to_string(),
            })
    }

    fn record_operation(&mut self, event: &OperationEvent, out_fingerprint: u64) {
        let inputs = event
            .inputs
            .iter()
            .map(|node| node.0.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.runtime.record(
            EvidenceKind::Dispatch,
            format!(
                "op={} inputs=[{inputs}] out={} mode={:?} kernel={} key={:?} backend={:?} keyset=0x{:016x} fallback={} out_fingerprint=0x{out_fingerprint:016x}",
                event.op,
                event.out.0,
                event.decision.mode,
                event.decision.kernel,
                event.decision.selected_key,
                event.decision.backend_key,
                event.decision.keyset_bits,
                event.decision.fallback_used
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use of_core::{Device, ExecutionMode};
    use of_device::{DeviceError, DeviceOption};
    use of_dispatch::{OpKind, OpRegistryError};
    use of_runtime::EvidenceKind;

    use super::{ApiError, OperatorSession, create_operator};

    #[test]
    fn operator_def_validates_name_and_arity() {
        let op = create_operator("Div", &["X", "Y"], &["Z"]).expect("valid Div");
        assert_eq!(op.op(), OpKind::Div);
        assert_eq!(op.op_type(), "Div");
        assert_eq!(op.inputs(), ["X".to_string(), "Y".to_string()]);

        let err = create_operator("Div", &["X"], &["Z"]).expect_err("Div takes two inputs");
        assert!(matches!(
            err,
            ApiError::ArityMismatch {
                role: "inputs",
                expected: 2,
                actual: 1,
                ..
            }
        ));

        let err = create_operator("Exp", &["X"], &["Y"]).expect_err("unregistered op");
        assert_eq!(
            err,
            ApiError::Operator(OpRegistryError::UnknownOperator {
                name: "Exp".to_string()
            })
        );
    }

    #[test]
    fn session_log_backward_records_evidence() {
        let mut session = OperatorSession::new(ExecutionMode::Strict, DeviceOption::cpu());
        session
            .feed_blob("X", vec![1.0; 20], vec![5, 4])
            .expect("feed");
        let op = create_operator("Log", &["X"], &["Y"]).expect("op");
        session.run_operator_once(&op).expect("run");

        assert_eq!(session.fetch_blob("Y").expect("Y"), &[0.0; 20]);
        assert_eq!(session.blob_shape("Y").expect("shape"), &[5, 4]);

        let report = session.backward("Y", &[1.0; 20]).expect("backward");
        assert_eq!(session.gradient(&report, "X"), Some(&[1.0f32; 20][..]));

        let kinds = session
            .evidence()
            .iter()
            .map(|entry| entry.kind)
            .collect::<Vec<_>>();
        assert!(kinds.contains(&EvidenceKind::Dispatch));
        assert!(kinds.contains(&EvidenceKind::Backward));
        assert!(session.evidence_len() >= 4);
    }

    #[test]
    fn session_div_gradient_covers_both_inputs() {
        let mut session = OperatorSession::new(ExecutionMode::Strict, DeviceOption::cpu());
        session.feed_blob("A", vec![6.0], vec![1]).expect("feed");
        session.feed_blob("B", vec![3.0], vec![1]).expect("feed");
        let op = create_operator("Div", &["A", "B"], &["C"]).expect("op");
        session.run_operator_once(&op).expect("run");
        assert_eq!(session.fetch_blob("C").expect("C"), &[2.0]);

        let report = session.backward("C", &[1.0]).expect("backward");
        let da = session.gradient(&report, "A").expect("dA");
        let db = session.gradient(&report, "B").expect("dB");
        assert!((da[0] - 1.0 / 3.0).abs() <= 1e-6);
        assert!((db[0] + 2.0 / 3.0).abs() <= 1e-6);
    }

    #[test]
    fn missing_input_blob_is_reported() {
        let mut session = OperatorSession::new(ExecutionMode::Strict, DeviceOption::cpu());
        let op = create_operator("Sqr", &["X"], &["Y"]).expect("op");
        let err = session.run_operator_once(&op).expect_err("X was never fed");
        assert_eq!(
            err,
            ApiError::MissingBlob {
                name: "X".to_string()
            }
        );
    }

    #[test]
    fn strict_accelerator_session_fails_closed_with_device_evidence() {
        let mut session = OperatorSession::new(ExecutionMode::Strict, DeviceOption::cuda(0));
        session.feed_blob("X", vec![0.0; 4], vec![4]).expect("feed");
        let op = create_operator("Sigmoid", &["X"], &["Y"]).expect("op");
        let err = session
            .run_operator_once(&op)
            .expect_err("no accelerator kernels in strict mode");
        assert!(matches!(err, ApiError::Autograd(_)));
        assert!(!session.has_blob("Y"));
        assert!(
            session
                .evidence()
                .iter()
                .any(|entry| entry.kind == EvidenceKind::Device
                    && entry.summary.contains("rejected"))
        );
    }

    #[test]
    fn blob_on_another_device_is_rejected_by_the_guard() {
        let mut session = OperatorSession::new(ExecutionMode::Hardened, DeviceOption::cpu());
        session
            .feed_blob_on("X", vec![1.0, 2.0], vec![2], DeviceOption::cuda(0))
            .expect("feed onto cuda:0");
        let op = create_operator("Sqr", &["X"], &["Z"]).expect("op");

        let err = session
            .run_operator_once(&op)
            .expect_err("cpu session cannot read a cuda blob");
        assert_eq!(
            err,
            ApiError::Device(DeviceError::Mismatch {
                expected: Device::Cpu,
                actual: Device::Cuda,
            })
        );
        assert!(!session.has_blob("Z"));
        assert!(
            session
                .evidence()
                .iter()
                .any(|entry| entry.kind == EvidenceKind::Device
                    && entry.summary.starts_with("device=cpu rejected"))
        );
    }

    #[test]
    fn hardened_accelerator_session_falls_back_and_says_so() {
        let mut session = OperatorSession::new(ExecutionMode::Hardened, DeviceOption::cuda(0));
        session.feed_blob("X", vec![0.0; 4], vec![4]).expect("feed");
        let op = create_operator("Sigmoid", &["X"], &["Y"]).expect("op");
        session.run_operator_once(&op).expect("hardened fallback");

        assert_eq!(session.fetch_blob("Y").expect("Y"), &[0.5; 4]);
        assert!(
            session
                .evidence()
                .iter()
                .any(|entry| entry.kind == EvidenceKind::Dispatch
                    && entry.summary.contains("fallback=true")
                    && entry.summary.contains("out_fingerprint=0x"))
        );
    }

    #[test]
    fn mode_switch_is_supported() {
        let mut session = OperatorSession::new(ExecutionMode::Strict, DeviceOption::cpu());
        session.set_mode(ExecutionMode::Hardened);
        assert_eq!(session.mode(), ExecutionMode::Hardened);
        assert_eq!(session.device_option(), DeviceOption::cpu());
    }
}
