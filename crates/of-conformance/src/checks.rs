use std::fmt;

use of_api::{ApiError, OperatorDef, OperatorSession};
use of_core::ExecutionMode;
use of_device::DeviceOption;
use of_dispatch::OpKind;
use of_runtime::EvidenceEntry;

/// A device configuration together with the policy it runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckDevice {
    pub option: DeviceOption,
    pub mode: ExecutionMode,
}

impl CheckDevice {
    #[must_use]
    pub const fn new(option: DeviceOption, mode: ExecutionMode) -> Self {
        Self { option, mode }
    }

    #[must_use]
    pub const fn strict(option: DeviceOption) -> Self {
        Self::new(option, ExecutionMode::Strict)
    }

    #[must_use]
    pub const fn hardened(option: DeviceOption) -> Self {
        Self::new(option, ExecutionMode::Hardened)
    }

    #[must_use]
    pub fn label(&self) -> String {
        format!("{}/{}", self.option, crate::mode_label(self.mode))
    }
}

impl From<DeviceOption> for CheckDevice {
    fn from(option: DeviceOption) -> Self {
        Self::strict(option)
    }
}

/// A host-side operator input: a shape and its row-major values.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl InputTensor {
    #[must_use]
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Self {
        Self { shape, values }
    }

    #[must_use]
    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let numel = shape.iter().product();
        Self {
            shape,
            values: vec![value; numel],
        }
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.values.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConformanceError {
    OutputMismatch {
        op: OpKind,
        device: String,
        output_index: usize,
        mismatches: usize,
        total: usize,
        worst_index: usize,
        actual: f32,
        expected: f32,
        max_abs_diff: f64,
        threshold: f64,
    },
    GradientMismatch {
        op: OpKind,
        device: String,
        input_index: usize,
        mismatches: usize,
        total: usize,
        worst_index: usize,
        analytic: f32,
        estimate: f64,
        max_abs_diff: f64,
        threshold: f64,
    },
    ReferenceArity {
        op: OpKind,
        expected: usize,
        actual: usize,
    },
    Execution {
        op: OpKind,
        device: String,
        detail: String,
    },
}

impl ConformanceError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::OutputMismatch { .. } => "output_mismatch",
            Self::GradientMismatch { .. } => "gradient_mismatch",
            Self::ReferenceArity { .. } => "reference_arity",
            Self::Execution { .. } => "execution_failed",
        }
    }
}

impl fmt::Display for ConformanceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutputMismatch {
                op,
                device,
                output_index,
                mismatches,
                total,
                worst_index,
                actual,
                expected,
                max_abs_diff,
                threshold,
            } => write!(
                f,
                "{op} output {output_index} on {device}: {mismatches}/{total} elements beyond tolerance {threshold}; worst at {worst_index}: actual={actual} expected={expected} abs_diff={max_abs_diff}"
            ),
            Self::GradientMismatch {
                op,
                device,
                input_index,
                mismatches,
                total,
                worst_index,
                analytic,
                estimate,
                max_abs_diff,
                threshold,
            } => write!(
                f,
                "{op} gradient wrt input {input_index} on {device}: {mismatches}/{total} elements beyond threshold {threshold}; worst at {worst_index}: analytic={analytic} estimate={estimate} abs_diff={max_abs_diff}"
            ),
            Self::ReferenceArity {
                op,
                expected,
                actual,
            } => write!(
                f,
                "wrong reference implementation for {op}: expected {expected} outputs, got {actual}"
            ),
            Self::Execution { op, device, detail } => {
                write!(f, "{op} failed to execute on {device}: {detail}")
            }
        }
    }
}

impl std::error::Error for ConformanceError {}

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceCheckReport {
    pub op: OpKind,
    pub device: String,
    pub outputs_checked: Vec<usize>,
    pub outputs: Vec<Vec<f32>>,
    pub max_abs_diff: f64,
    pub evidence: Vec<EvidenceEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradientCheckReport {
    pub op: OpKind,
    pub device: String,
    pub input_index: usize,
    pub outputs_with_grads: Vec<usize>,
    pub loss: f64,
    pub analytic: Vec<f32>,
    pub estimate: Vec<f64>,
    pub max_abs_diff: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCheckReport {
    pub op: OpKind,
    pub devices: Vec<String>,
    pub outputs_checked: Vec<usize>,
    pub max_abs_diff: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Closeness {
    mismatches: usize,
    worst_index: usize,
    max_abs_diff: f64,
}

impl Closeness {
    fn passed(self) -> bool {
        self.mismatches == 0
    }
}

/// Elementwise `|a - e| <= atol + rtol * |e|` with `atol = rtol = threshold`.
fn closeness<A, E>(actual: &[A], expected: &[E], threshold: f64) -> Closeness
where
    A: Copy + Into<f64>,
    E: Copy + Into<f64>,
{
    let mut mismatches = actual.len().abs_diff(expected.len());
    // Missing elements count as infinitely far off.
    let mut worst = (mismatches > 0).then(|| (actual.len().min(expected.len()), f64::INFINITY));

    for (idx, (a, e)) in actual.iter().zip(expected).enumerate() {
        let a: f64 = (*a).into();
        let e: f64 = (*e).into();
        let diff = (a - e).abs();
        if !(diff <= threshold + threshold * e.abs()) {
            mismatches += 1;
        }
        let is_worse = match worst {
            None => true,
            Some((_, current)) => !current.is_nan() && (diff.is_nan() || diff > current),
        };
        if is_worse {
            worst = Some((idx, diff));
        }
    }

    let (worst_index, max_abs_diff) = worst.unwrap_or((0, 0.0));
    Closeness {
        mismatches,
        worst_index,
        max_abs_diff,
    }
}

/// Judges an analytic gradient against its finite-difference estimate and
/// returns the largest absolute gap.
pub fn compare_gradients(
    op: OpKind,
    device: &str,
    input_index: usize,
    analytic: &[f32],
    estimate: &[f64],
    threshold: f64,
) -> Result<f64, ConformanceError> {
    let close = closeness(analytic, estimate, threshold);
    if close.passed() {
        return Ok(close.max_abs_diff);
    }
    Err(ConformanceError::GradientMismatch {
        op,
        device: device.to_string(),
        input_index,
        mismatches: close.mismatches,
        total: analytic.len(),
        worst_index: close.worst_index,
        analytic: analytic.get(close.worst_index).copied().unwrap_or(f32::NAN),
        estimate: estimate.get(close.worst_index).copied().unwrap_or(f64::NAN),
        max_abs_diff: close.max_abs_diff,
        threshold,
    })
}

/// Judges one output of `device` against the same output of the baseline
/// device and returns the largest absolute gap.
pub fn compare_device_outputs(
    op: OpKind,
    device: &str,
    output_index: usize,
    baseline: &[f32],
    actual: &[f32],
    threshold: f64,
) -> Result<f64, ConformanceError> {
    let close = closeness(actual, baseline, threshold);
    if close.passed() {
        return Ok(close.max_abs_diff);
    }
    Err(ConformanceError::OutputMismatch {
        op,
        device: device.to_string(),
        output_index,
        mismatches: close.mismatches,
        total: baseline.len(),
        worst_index: close.worst_index,
        actual: actual.get(close.worst_index).copied().unwrap_or(f32::NAN),
        expected: baseline.get(close.worst_index).copied().unwrap_or(f32::NAN),
        max_abs_diff: close.max_abs_diff,
        threshold,
    })
}

fn execution_error(op: &OperatorDef, device: CheckDevice, error: &ApiError) -> ConformanceError {
    ConformanceError::Execution {
        op: op.op(),
        device: device.label(),
        detail: error.to_string(),
    }
}

fn feed_inputs(
    session: &mut OperatorSession,
    op: &OperatorDef,
    device: CheckDevice,
    inputs: &[InputTensor],
) -> Result<(), ConformanceError> {
    if inputs.len() != op.inputs().len() {
        return Err(ConformanceError::Execution {
            op: op.op(),
            device: device.label(),
            detail: format!(
                "operator reads {} blobs but {} inputs were given",
                op.inputs().len(),
                inputs.len()
            ),
        });
    }
    for (name, input) in op.inputs().iter().zip(inputs) {
        session
            .feed_blob(name, input.values.clone(), input.shape.clone())
            .map_err(|error| execution_error(op, device, &error))?;
    }
    Ok(())
}

fn fetch_outputs(
    session: &OperatorSession,
    op: &OperatorDef,
    device: CheckDevice,
) -> Result<Vec<Vec<f32>>, ConformanceError> {
    op.outputs()
        .iter()
        .map(|name| {
            session
                .fetch_blob(name)
                .map(<[f32]>::to_vec)
                .map_err(|error| execution_error(op, device, &error))
        })
        .collect()
}

/// Runs `op` once on a fresh session and returns every output.
pub fn run_operator(
    device: CheckDevice,
    op: &OperatorDef,
    inputs: &[InputTensor],
) -> Result<(OperatorSession, Vec<Vec<f32>>), ConformanceError> {
    let mut session = OperatorSession::new(device.mode, device.option);
    feed_inputs(&mut session, op, device, inputs)?;
    session
        .run_operator_once(op)
        .map_err(|error| execution_error(op, device, &error))?;
    let outputs = fetch_outputs(&session, op, device)?;
    Ok((session, outputs))
}

fn resolve_outputs(
    op: &OperatorDef,
    outputs_to_check: Option<&[usize]>,
) -> Result<Vec<usize>, ConformanceError> {
    let available = op.outputs().len();
    let selected = outputs_to_check.map_or_else(|| (0..available).collect(), <[usize]>::to_vec);
    if let Some(bad) = selected.iter().find(|idx| **idx >= available) {
        return Err(ConformanceError::ReferenceArity {
            op: op.op(),
            expected: available,
            actual: bad + 1,
        });
    }
    Ok(selected)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceCheckOptions {
    pub threshold: f64,
    pub outputs_to_check: Option<Vec<usize>>,
}

impl Default for ReferenceCheckOptions {
    fn default() -> Self {
        Self {
            threshold: 1e-4,
            outputs_to_check: None,
        }
    }
}

/// Runs `op` on `device` and compares every checked output against
/// `reference`, which must return one array per checked output.
pub fn assert_reference_checks<D, F>(
    device: D,
    op: &OperatorDef,
    inputs: &[InputTensor],
    reference: F,
) -> Result<ReferenceCheckReport, ConformanceError>
where
    D: Into<CheckDevice>,
    F: Fn(&[InputTensor]) -> Vec<Vec<f32>>,
{
    assert_reference_checks_with(device, op, inputs, reference, &ReferenceCheckOptions::default())
}

pub fn assert_reference_checks_with<D, F>(
    device: D,
    op: &OperatorDef,
    inputs: &[InputTensor],
    reference: F,
    options: &ReferenceCheckOptions,
) -> Result<ReferenceCheckReport, ConformanceError>
where
    D: Into<CheckDevice>,
    F: Fn(&[InputTensor]) -> Vec<Vec<f32>>,
{
    let device = device.into();
    let checked = resolve_outputs(op, options.outputs_to_check.as_deref())?;
    let (session, outputs) = run_operator(device, op, inputs)?;

    let expected = reference(inputs);
    if expected.len() != checked.len() {
        return Err(ConformanceError::ReferenceArity {
            op: op.op(),
            expected: checked.len(),
            actual: expected.len(),
        });
    }

    let mut max_abs_diff = 0.0f64;
    for (output_index, expected_values) in checked.iter().copied().zip(&expected) {
        let actual = &outputs[output_index];
        let close = closeness(actual, expected_values, options.threshold);
        if !close.passed() {
            return Err(ConformanceError::OutputMismatch {
                op: op.op(),
                device: device.label(),
                output_index,
                mismatches: close.mismatches,
                total: expected_values.len(),
                worst_index: close.worst_index,
                actual: actual.get(close.worst_index).copied().unwrap_or(f32::NAN),
                expected: expected_values
                    .get(close.worst_index)
                    .copied()
                    .unwrap_or(f32::NAN),
                max_abs_diff: close.max_abs_diff,
                threshold: options.threshold,
            });
        }
        max_abs_diff = max_abs_diff.max(close.max_abs_diff);
    }

    Ok(ReferenceCheckReport {
        op: op.op(),
        device: device.label(),
        outputs_checked: checked,
        outputs,
        max_abs_diff,
        evidence: session.evidence().to_vec(),
    })
}

/// Compares the engine gradient of `loss = ½ Σ y²` against a central finite
/// difference, one input element at a time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientChecker {
    pub stepsize: f32,
    pub threshold: f64,
    pub device: CheckDevice,
}

impl GradientChecker {
    #[must_use]
    pub fn new(stepsize: f32, threshold: f64, device: impl Into<CheckDevice>) -> Self {
        Self {
            stepsize,
            threshold,
            device: device.into(),
        }
    }

    fn loss(outputs: &[Vec<f32>], outputs_with_grads: &[usize]) -> f64 {
        outputs_with_grads
            .iter()
            .flat_map(|idx| outputs[*idx].iter())
            .map(|value| {
                let value = f64::from(*value);
                0.5 * value * value
            })
            .sum()
    }

    pub fn check_simple(
        &self,
        op: &OperatorDef,
        inputs: &[InputTensor],
        input_index: usize,
        outputs_with_grads: &[usize],
    ) -> Result<GradientCheckReport, ConformanceError> {
        let device = self.device;
        if input_index >= inputs.len() {
            return Err(ConformanceError::Execution {
                op: op.op(),
                device: device.label(),
                detail: format!(
                    "input index {input_index} out of range for {} inputs",
                    inputs.len()
                ),
            });
        }
        let checked = resolve_outputs(op, Some(outputs_with_grads))?;

        let (mut session, outputs) = run_operator(device, op, inputs)?;
        let loss = Self::loss(&outputs, &checked);

        let input_name = op.inputs()[input_index].clone();
        let mut analytic = vec![0.0f32; inputs[input_index].numel()];
        for output_index in checked.iter().copied() {
            let seed = outputs[output_index].clone();
            let report = session
                .backward(&op.outputs()[output_index], &seed)
                .map_err(|error| execution_error(op, device, &error))?;
            let grad = session.gradient(&report, &input_name).ok_or_else(|| {
                ConformanceError::Execution {
                    op: op.op(),
                    device: device.label(),
                    detail: format!("no gradient reached input '{input_name}'"),
                }
            })?;
            for (acc, value) in analytic.iter_mut().zip(grad) {
                *acc += *value;
            }
        }

        let mut estimate = Vec::with_capacity(analytic.len());
        let mut perturbed = inputs.to_vec();
        let step = f64::from(self.stepsize);
        for idx in 0..analytic.len() {
            let original = inputs[input_index].values[idx];

            perturbed[input_index].values[idx] = original + self.stepsize;
            let (_, pos_outputs) = run_operator(device, op, &perturbed)?;
            perturbed[input_index].values[idx] = original - self.stepsize;
            let (_, neg_outputs) = run_operator(device, op, &perturbed)?;
            perturbed[input_index].values[idx] = original;

            let pos_loss = Self::loss(&pos_outputs, &checked);
            let neg_loss = Self::loss(&neg_outputs, &checked);
            estimate.push((pos_loss - neg_loss) / step / 2.0);
        }

        let max_abs_diff = compare_gradients(
            op.op(),
            &device.label(),
            input_index,
            &analytic,
            &estimate,
            self.threshold,
        )?;

        Ok(GradientCheckReport {
            op: op.op(),
            device: device.label(),
            input_index,
            outputs_with_grads: checked,
            loss,
            analytic,
            estimate,
            max_abs_diff,
        })
    }
}

pub fn assert_gradient_checks<D>(
    device: D,
    op: &OperatorDef,
    inputs: &[InputTensor],
    input_index: usize,
    output_indices: &[usize],
    stepsize: f32,
    threshold: f64,
) -> Result<GradientCheckReport, ConformanceError>
where
    D: Into<CheckDevice>,
{
    GradientChecker::new(stepsize, threshold, device).check_simple(
        op,
        inputs,
        input_index,
        output_indices,
    )
}

/// Runs `op` on every device and requires each to agree with the first.
pub fn assert_device_checks(
    devices: &[CheckDevice],
    op: &OperatorDef,
    inputs: &[InputTensor],
    outputs_to_check: Option<&[usize]>,
    threshold: f64,
) -> Result<DeviceCheckReport, ConformanceError> {
    let checked = resolve_outputs(op, outputs_to_check)?;
    let Some((first, rest)) = devices.split_first() else {
        return Ok(DeviceCheckReport {
            op: op.op(),
            devices: Vec::new(),
            outputs_checked: checked,
            max_abs_diff: 0.0,
        });
    };

    let (_, baseline) = run_operator(*first, op, inputs)?;
    let mut max_abs_diff = 0.0f64;
    for device in rest.iter().copied() {
        let (_, outputs) = run_operator(device, op, inputs)?;
        for output_index in checked.iter().copied() {
            let diff = compare_device_outputs(
                op.op(),
                &device.label(),
                output_index,
                &baseline[output_index],
                &outputs[output_index],
                threshold,
            )?;
            max_abs_diff = max_abs_diff.max(diff);
        }
    }

    Ok(DeviceCheckReport {
        op: op.op(),
        devices: devices.iter().map(CheckDevice::label).collect(),
        outputs_checked: checked,
        max_abs_diff,
    })
}

#[cfg(test)]
mod tests {
    use of_api::create_operator;
    use of_core::ExecutionMode;
    use of_device::DeviceOption;
    use of_dispatch::OpKind;

    use super::{
        CheckDevice, ConformanceError, InputTensor, ReferenceCheckOptions,
        assert_device_checks, assert_gradient_checks, assert_reference_checks,
        assert_reference_checks_with, closeness, compare_device_outputs, compare_gradients,
        run_operator,
    };

    fn sqr_reference(inputs: &[InputTensor]) -> Vec<Vec<f32>> {
        vec![inputs[0].values.iter().map(|x| x * x).collect()]
    }

    #[test]
    fn closeness_uses_absolute_plus_relative_tolerance() {
        let ok = closeness(&[100.5f32], &[100.0f32], 1e-2);
        assert_eq!(ok.mismatches, 0);
        let bad = closeness(&[0.5f32], &[0.0f32], 1e-2);
        assert_eq!(bad.mismatches, 1);
        assert_eq!(bad.max_abs_diff, 0.5);
        let short = closeness(&[1.0f32], &[1.0f32, 2.0], 1e-2);
        assert_eq!(short.mismatches, 1);
    }

    #[test]
    fn closeness_flags_nan_outputs() {
        let nan = closeness(&[1.0f32, f32::NAN], &[1.0f32, 1.0], 1e-2);
        assert_eq!(nan.mismatches, 1);
        assert_eq!(nan.worst_index, 1);
        assert!(nan.max_abs_diff.is_nan());
    }

    #[test]
    fn reference_check_passes_for_matching_formula() {
        let op = create_operator("Sqr", &["X"], &["Z"]).expect("op");
        let inputs = [InputTensor::new(vec![2, 2], vec![0.0, 0.5, 1.5, 3.0])];
        let report = assert_reference_checks(DeviceOption::cpu(), &op, &inputs, sqr_reference)
            .expect("sqr matches x^2");
        assert_eq!(report.outputs[0], vec![0.0, 0.25, 2.25, 9.0]);
        assert_eq!(report.outputs_checked, vec![0]);
        assert!(!report.evidence.is_empty());
    }

    #[test]
    fn reference_check_reports_output_mismatch() {
        let op = create_operator("Sqr", &["X"], &["Z"]).expect("op");
        let inputs = [InputTensor::new(vec![3], vec![1.0, 2.0, 3.0])];
        let err = assert_reference_checks(DeviceOption::cpu(), &op, &inputs, |inputs| {
            vec![inputs[0].values.clone()]
        })
        .expect_err("x is not x^2");
        match err {
            ConformanceError::OutputMismatch {
                op,
                mismatches,
                worst_index,
                ..
            } => {
                assert_eq!(op, OpKind::Sqr);
                assert_eq!(mismatches, 2);
                assert_eq!(worst_index, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn wrong_reference_arity_is_rejected() {
        let op = create_operator("Log", &["X"], &["Z"]).expect("op");
        let inputs = [InputTensor::full(vec![2], 1.0)];
        let err = assert_reference_checks(DeviceOption::cpu(), &op, &inputs, |_| Vec::new())
            .expect_err("reference returned nothing");
        assert_eq!(
            err,
            ConformanceError::ReferenceArity {
                op: OpKind::Log,
                expected: 1,
                actual: 0
            }
        );
    }

    #[test]
    fn out_of_range_output_selection_is_rejected() {
        let op = create_operator("Log", &["X"], &["Z"]).expect("op");
        let inputs = [InputTensor::full(vec![2], 1.0)];
        let options = ReferenceCheckOptions {
            threshold: 1e-4,
            outputs_to_check: Some(vec![1]),
        };
        let err = assert_reference_checks_with(
            DeviceOption::cpu(),
            &op,
            &inputs,
            |_| vec![vec![0.0, 0.0]],
            &options,
        )
        .expect_err("Log has one output");
        assert!(matches!(err, ConformanceError::ReferenceArity { .. }));
    }

    #[test]
    fn gradient_check_matches_analytic_sqr() {
        let op = create_operator("Sqr", &["X"], &["Z"]).expect("op");
        let inputs = [InputTensor::new(vec![4], vec![0.1, 0.4, 0.7, 0.9])];
        let report =
            assert_gradient_checks(DeviceOption::cpu(), &op, &inputs, 0, &[0], 1e-4, 1e-2)
                .expect("sqr gradient should check");
        // loss = ½ Σ x⁴, so dL/dx = 2x³.
        for (grad, x) in report.analytic.iter().zip(&inputs[0].values) {
            assert!((grad - 2.0 * x * x * x).abs() <= 1e-5);
        }
        assert_eq!(report.estimate.len(), 4);
    }

    #[test]
    fn gradient_check_covers_second_div_input() {
        let op = create_operator("Div", &["X", "Y"], &["Z"]).expect("op");
        let inputs = [
            InputTensor::new(vec![3], vec![0.2, 0.5, 0.9]),
            InputTensor::new(vec![3], vec![5.1, 5.5, 5.9]),
        ];
        let report =
            assert_gradient_checks(DeviceOption::cpu(), &op, &inputs, 1, &[0], 1e-3, 1e-2)
                .expect("div denominator gradient should check");
        assert!(report.analytic.iter().all(|grad| *grad <= 0.0));
    }

    #[test]
    fn bad_input_index_is_an_execution_error() {
        let op = create_operator("Log", &["X"], &["Z"]).expect("op");
        let inputs = [InputTensor::full(vec![2], 1.5)];
        let err = assert_gradient_checks(DeviceOption::cpu(), &op, &inputs, 3, &[0], 1e-4, 1e-2)
            .expect_err("only one input");
        assert_eq!(err.reason_code(), "execution_failed");
    }

    #[test]
    fn device_checks_agree_between_cpu_and_hardened_fallback() {
        let op = create_operator("Sigmoid", &["X"], &["Z"]).expect("op");
        let inputs = [InputTensor::new(vec![3], vec![-1.0, 0.0, 1.0])];
        let devices = [
            CheckDevice::strict(DeviceOption::cpu()),
            CheckDevice::hardened(DeviceOption::cuda(0)),
        ];
        let report = assert_device_checks(&devices, &op, &inputs, None, 1e-4)
            .expect("fallback agrees with cpu");
        assert_eq!(report.devices.len(), 2);
        assert_eq!(report.max_abs_diff, 0.0);
    }

    #[test]
    fn tripled_analytic_gradient_is_a_mismatch() {
        let op = create_operator("Sqr", &["X"], &["Z"]).expect("op");
        let inputs = [InputTensor::new(vec![3], vec![0.4, 0.7, 0.9])];
        let report =
            assert_gradient_checks(DeviceOption::cpu(), &op, &inputs, 0, &[0], 1e-4, 1e-2)
                .expect("honest gradient passes");
        assert_eq!(
            compare_gradients(
                OpKind::Sqr,
                &report.device,
                0,
                &report.analytic,
                &report.estimate,
                1e-2
            ),
            Ok(report.max_abs_diff)
        );

        let tripled = report.analytic.iter().map(|g| 3.0 * g).collect::<Vec<_>>();
        let err = compare_gradients(
            OpKind::Sqr,
            &report.device,
            0,
            &tripled,
            &report.estimate,
            1e-2,
        )
        .expect_err("3x gradient must be flagged");
        match err {
            ConformanceError::GradientMismatch {
                op,
                mismatches,
                total,
                worst_index,
                analytic,
                ..
            } => {
                assert_eq!(op, OpKind::Sqr);
                assert_eq!((mismatches, total, worst_index), (3, 3, 2));
                assert_eq!(analytic, tripled[2]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn drifted_device_output_is_a_mismatch() {
        let op = create_operator("Sigmoid", &["X"], &["Z"]).expect("op");
        let inputs = [InputTensor::new(vec![3], vec![-1.0, 0.0, 1.0])];
        let accelerator = CheckDevice::hardened(DeviceOption::cuda(0));
        let (_, baseline) =
            run_operator(CheckDevice::strict(DeviceOption::cpu()), &op, &inputs).expect("cpu");
        let (_, outputs) = run_operator(accelerator, &op, &inputs).expect("fallback");

        let mut drifted = outputs[0].clone();
        drifted[1] += 1e-2;
        let err = compare_device_outputs(
            OpKind::Sigmoid,
            &accelerator.label(),
            0,
            &baseline[0],
            &drifted,
            1e-4,
        )
        .expect_err("drift beyond threshold must be flagged");
        match err {
            ConformanceError::OutputMismatch {
                device,
                mismatches,
                worst_index,
                actual,
                expected,
                ..
            } => {
                assert_eq!(device, "cuda:0/hardened");
                assert_eq!((mismatches, worst_index), (1, 1));
                assert_eq!(expected, 0.5);
                assert_eq!(actual, drifted[1]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn strict_accelerator_is_an_execution_error() {
        let op = create_operator("Sigmoid", &["X"], &["Z"]).expect("op");
        let inputs = [InputTensor::full(vec![2], 0.0)];
        let err = assert_reference_checks(
            CheckDevice::new(DeviceOption::cuda(0), ExecutionMode::Strict),
            &op,
            &inputs,
            |_| vec![vec![0.5, 0.5]],
        )
        .expect_err("strict accelerator has no kernels");
        assert!(matches!(err, ConformanceError::Execution { .. }));
        assert!(err.to_string().contains("cuda:0/strict"));
    }
}
