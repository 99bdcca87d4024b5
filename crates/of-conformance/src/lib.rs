#![forbid(unsafe_code)]

mod cases;
mod checks;
mod generators;
mod logging;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use of_core::ExecutionMode;
use of_dispatch::OpKind;
use of_runtime::{EvidenceEntry, EvidenceKind, RuntimeContext};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::{Value, json};

pub use cases::{ELEMENTWISE_CASES, ElementwiseCase, reference_outputs};
pub use checks::{
    CheckDevice, ConformanceError, DeviceCheckReport, GradientCheckReport, GradientChecker,
    InputTensor, ReferenceCheckOptions, ReferenceCheckReport, assert_device_checks,
    assert_gradient_checks, assert_reference_checks, assert_reference_checks_with,
    compare_device_outputs, compare_gradients, run_operator,
};
pub use generators::{
    ConformanceProfile, PROFILE_ENV, devices_for_mode, gcs, sample_shape, shape_strategy,
    uniform_tensor, value_seed,
};
pub use logging::{
    STRUCTURED_LOG_SCHEMA_VERSION, StructuredCaseLog, det_seed, det64_label, digest_f32,
    mode_label,
};

pub const SAMPLES_ENV: &str = "OPFORGE_CONFORMANCE_SAMPLES";
pub const SEED_ENV: &str = "OPFORGE_CONFORMANCE_SEED";
const SUITE_ID: &str = "elementwise";
const MATRIX_FILE: &str = "elementwise_matrix.jsonl";

#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    pub artifact_root: PathBuf,
    pub strict_mode: bool,
    pub samples_per_case: usize,
    pub base_seed: u64,
    pub reference_threshold: f64,
    pub gradient_stepsize: f32,
    pub gradient_threshold: f64,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        let repo_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
        Self {
            artifact_root: repo_root.join("artifacts/conformance"),
            strict_mode: true,
            samples_per_case: 4,
            base_seed: 0,
            reference_threshold: 1e-4,
            gradient_stepsize: 1e-4,
            gradient_threshold: 1e-2,
        }
    }

    /// `default_paths()` with the sample count and base seed taken from the
    /// environment when set.
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default_paths();
        if let Some(samples) = read_env_u64(SAMPLES_ENV)? {
            config.samples_per_case = usize::try_from(samples)
                .map_err(|error| format!("{SAMPLES_ENV}={samples} does not fit: {error}"))?;
        }
        if let Some(seed) = read_env_u64(SEED_ENV)? {
            config.base_seed = seed;
        }
        Ok(config)
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        if self.strict_mode {
            ExecutionMode::Strict
        } else {
            ExecutionMode::Hardened
        }
    }

    #[must_use]
    pub fn matrix_path(&self) -> PathBuf {
        self.artifact_root.join(MATRIX_FILE)
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

fn read_env_u64(name: &str) -> Result<Option<u64>, String> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|error| format!("invalid {name}='{raw}': {error}")),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(error) => Err(format!("failed reading {name}: {error}")),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementwiseCaseReport {
    pub name: String,
    pub op: OpKind,
    pub mode: ExecutionMode,
    pub device: String,
    pub seed: u64,
    pub shape: Vec<usize>,
    pub reference_ok: bool,
    pub gradient_ok: bool,
    pub device_ok: bool,
    pub failure: Option<ConformanceError>,
    pub forensic_log: StructuredCaseLog,
}

impl ElementwiseCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.reference_ok && self.gradient_ok && self.device_ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub strict_mode: bool,
    pub samples_per_case: usize,
    pub cases_total: usize,
    pub cases_passed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixSummary {
    pub output_path: PathBuf,
    pub log_entries: usize,
    pub failed_entries: usize,
    pub modes: Vec<ExecutionMode>,
    pub op_filter: Option<OpKind>,
}

pub fn run_elementwise_conformance(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<ElementwiseCaseReport>), String> {
    run_elementwise_conformance_filtered(config, mode, None)
}

/// Runs `samples_per_case` seeded samples of every operator (or only
/// `op_filter`). Check failures land in the case reports; only setup
/// problems surface as `Err`.
pub fn run_elementwise_conformance_filtered(
    config: &HarnessConfig,
    mode: ExecutionMode,
    op_filter: Option<OpKind>,
) -> Result<(HarnessReport, Vec<ElementwiseCaseReport>), String> {
    let devices = devices_for_mode(mode);
    if devices.is_empty() {
        return Err(format!(
            "no device configurations available in {} mode",
            mode_label(mode)
        ));
    }

    let mut reports = Vec::new();
    for (op_index, case) in ELEMENTWISE_CASES.iter().enumerate() {
        if op_filter.is_some_and(|op| op != case.op) {
            continue;
        }
        for sample in 0..config.samples_per_case {
            let seed = det_seed(&[config.base_seed, op_index as u64, sample as u64]);
            let device = devices[sample % devices.len()];
            reports.push(run_elementwise_case(
                config, case, mode, device, &devices, sample, seed,
            )?);
        }
    }

    let (cases_total, cases_passed) =
        summarize_passes(reports.iter().map(ElementwiseCaseReport::passed));
    Ok((
        HarnessReport {
            suite: SUITE_ID,
            strict_mode: mode == ExecutionMode::Strict,
            samples_per_case: config.samples_per_case,
            cases_total,
            cases_passed,
        },
        reports,
    ))
}

#[allow(clippy::too_many_arguments)]
fn run_elementwise_case(
    config: &HarnessConfig,
    case: &ElementwiseCase,
    mode: ExecutionMode,
    device: CheckDevice,
    devices: &[CheckDevice],
    sample: usize,
    seed: u64,
) -> Result<ElementwiseCaseReport, String> {
    let started = Instant::now();
    let mut rng = StdRng::seed_from_u64(seed);
    let shape = case.sample_shape(&mut rng);
    let inputs = case.make_inputs(&shape, &mut rng);
    let def = case
        .operator_def()
        .map_err(|error| format!("failed to build {} operator: {error}", case.op))?;

    let mut runtime = RuntimeContext::new(mode);
    let mut failure: Option<ConformanceError> = None;
    let mut extra = BTreeMap::new();

    let options = ReferenceCheckOptions {
        threshold: config.reference_threshold,
        outputs_to_check: None,
    };
    let reference =
        assert_reference_checks_with(device, &def, &inputs, |xs| case.reference(xs), &options);
    let mut session_evidence: Vec<EvidenceEntry> = Vec::new();
    let mut output_digest = 0u64;
    let reference_ok = match reference {
        Ok(report) => {
            runtime.record_check(
                "reference",
                true,
                format!("op={} max_abs_diff={}", case.op, report.max_abs_diff),
            );
            extra.insert(
                "reference_max_abs_diff".to_string(),
                json!(report.max_abs_diff),
            );
            output_digest = digest_f32(&report.outputs.concat());
            session_evidence = report.evidence;
            true
        }
        Err(error) => {
            runtime.record_check("reference", false, &error);
            failure.get_or_insert(error);
            false
        }
    };

    let gradient = GradientChecker::new(config.gradient_stepsize, config.gradient_threshold, device)
        .check_simple(&def, &inputs, case.gradient_input, case.gradient_outputs);
    let gradient_ok = match gradient {
        Ok(report) => {
            runtime.record_check(
                "gradient",
                true,
                format!(
                    "op={} input={} max_abs_diff={}",
                    case.op, report.input_index, report.max_abs_diff
                ),
            );
            extra.insert("gradient_loss".to_string(), json!(report.loss));
            extra.insert(
                "gradient_max_abs_diff".to_string(),
                json!(report.max_abs_diff),
            );
            true
        }
        Err(error) => {
            runtime.record_check("gradient", false, &error);
            failure.get_or_insert(error);
            false
        }
    };

    // A single configuration has nothing to compare against.
    let device_ok = if devices.len() > 1 {
        match assert_device_checks(devices, &def, &inputs, None, config.reference_threshold) {
            Ok(report) => {
                runtime.record_check(
                    "device",
                    true,
                    format!("op={} devices={}", case.op, report.devices.join(",")),
                );
                extra.insert("device_max_abs_diff".to_string(), json!(report.max_abs_diff));
                true
            }
            Err(error) => {
                runtime.record_check("device", false, &error);
                failure.get_or_insert(error);
                false
            }
        }
    } else {
        true
    };

    let input_digest = digest_f32(
        &inputs
            .iter()
            .flat_map(|input| input.values.iter().copied())
            .collect::<Vec<_>>(),
    );
    let name = format!("{}_sample_{sample}", case.test_id());
    let (outcome, reason_code) = match failure.as_ref() {
        None => ("pass", "elementwise_checks_ok"),
        Some(error) => ("fail", error.reason_code()),
    };

    extra.insert("op".to_string(), json!(case.op.name()));
    extra.insert("device".to_string(), json!(device.label()));
    extra.insert("shape".to_string(), json!(shape));
    extra.insert(
        "devices_compared".to_string(),
        json!(devices.iter().map(CheckDevice::label).collect::<Vec<_>>()),
    );
    if let Some(error) = failure.as_ref() {
        extra.insert("failure".to_string(), json!(error.to_string()));
    }
    let mut evidence = session_evidence;
    evidence.extend_from_slice(runtime.evidence());
    extra.insert("runtime_evidence".to_string(), runtime_evidence_field(&evidence));

    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let forensic_log = StructuredCaseLog::new(
        SUITE_ID,
        &name,
        mode,
        seed,
        vec![config.matrix_path().display().to_string()],
        replay_command(config, mode, case.op),
        outcome,
        reason_code,
    )
    .with_digests(input_digest, output_digest)
    .with_duration_ms(duration_ms)
    .with_extra_fields(extra);

    Ok(ElementwiseCaseReport {
        name,
        op: case.op,
        mode,
        device: device.label(),
        seed,
        shape,
        reference_ok,
        gradient_ok,
        device_ok,
        failure,
        forensic_log,
    })
}

fn replay_command(config: &HarnessConfig, mode: ExecutionMode, op: OpKind) -> String {
    format!(
        "cargo run -p of-conformance --bin run_elementwise_matrix -- --mode {} --op {} --samples {} --seed {}",
        mode_label(mode),
        op.name(),
        config.samples_per_case,
        config.base_seed
    )
}

pub fn emit_elementwise_matrix(
    config: &HarnessConfig,
    output_path: &Path,
    modes: &[ExecutionMode],
    op_filter: Option<OpKind>,
) -> Result<MatrixSummary, String> {
    let selected_modes = if modes.is_empty() {
        vec![ExecutionMode::Strict, ExecutionMode::Hardened]
    } else {
        modes.to_vec()
    };

    let mut logs = Vec::new();
    for mode in selected_modes.iter().copied() {
        let (_, cases) = run_elementwise_conformance_filtered(config, mode, op_filter)?;
        logs.extend(cases.into_iter().map(|case| case.forensic_log));
    }

    let mut lines = String::new();
    for entry in &logs {
        let line = serde_json::to_string(entry)
            .map_err(|error| format!("failed to serialize structured log entry: {error}"))?;
        lines.push_str(&line);
        lines.push('\n');
    }

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent).map_err(|error| {
            format!(
                "failed to create matrix output dir {}: {error}",
                parent.display()
            )
        })?;
    }

    fs::write(output_path, lines).map_err(|error| {
        format!(
            "failed to write elementwise matrix log {}: {error}",
            output_path.display()
        )
    })?;

    let failed_entries = logs.iter().filter(|entry| !entry.passed()).count();

    Ok(MatrixSummary {
        output_path: output_path.to_path_buf(),
        log_entries: logs.len(),
        failed_entries,
        modes: selected_modes,
        op_filter,
    })
}

#[must_use]
pub fn run_smoke(config: &HarnessConfig) -> HarnessReport {
    let mode = config.mode();
    let (cases_total, cases_passed) = run_elementwise_conformance(config, mode)
        .map_or((0, 0), |(report, _)| (report.cases_total, report.cases_passed));

    HarnessReport {
        suite: "smoke",
        strict_mode: config.strict_mode,
        samples_per_case: config.samples_per_case,
        cases_total,
        cases_passed,
    }
}

fn runtime_evidence_field(entries: &[EvidenceEntry]) -> Value {
    let mut kind_counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for entry in entries {
        *kind_counts.entry(evidence_kind_label(entry.kind)).or_insert(0) += 1;
    }

    json!({
        "total_entries": entries.len(),
        "kind_counts": kind_counts,
        "entries": entries
            .iter()
            .map(|entry| {
                json!({
                    "ts_unix_ms": entry.ts_unix_ms,
                    "kind": evidence_kind_label(entry.kind),
                    "summary": entry.summary,
                })
            })
            .collect::<Vec<_>>(),
    })
}

fn evidence_kind_label(kind: EvidenceKind) -> &'static str {
    match kind {
        EvidenceKind::Dispatch => "dispatch",
        EvidenceKind::Backward => "backward",
        EvidenceKind::Policy => "policy",
        EvidenceKind::Device => "device",
        EvidenceKind::Check => "check",
    }
}

fn summarize_passes<I>(iter: I) -> (usize, usize)
where
    I: Iterator<Item = bool>,
{
    let mut total = 0usize;
    let mut passed = 0usize;
    for is_passed in iter {
        total += 1;
        if is_passed {
            passed += 1;
        }
    }
    (total, passed)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use of_core::ExecutionMode;
    use of_dispatch::OpKind;
    use serde_json::Value;

    use super::{
        HarnessConfig, StructuredCaseLog, emit_elementwise_matrix, run_elementwise_conformance,
        run_elementwise_conformance_filtered, run_smoke, summarize_passes,
    };

    fn small_config() -> HarnessConfig {
        HarnessConfig {
            samples_per_case: 2,
            base_seed: 17,
            ..HarnessConfig::default_paths()
        }
    }

    fn temp_matrix_path(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |duration| duration.as_nanos());
        std::env::temp_dir().join(format!(
            "opforge-{tag}-{}-{nanos}/{}",
            std::process::id(),
            super::MATRIX_FILE
        ))
    }

    #[test]
    fn strict_run_passes_every_operator() {
        let config = small_config();
        let (report, cases) =
            run_elementwise_conformance(&config, ExecutionMode::Strict).expect("run");
        assert_eq!(report.cases_total, 8);
        assert_eq!(report.cases_passed, 8, "failures: {cases:#?}");
        assert!(report.strict_mode);
        assert!(cases.iter().all(|case| case.device == "cpu/strict"));
        assert!(cases.iter().all(|case| case.forensic_log.passed()));
    }

    #[test]
    fn hardened_run_compares_cpu_with_fallback_device() {
        let config = small_config();
        let (report, cases) =
            run_elementwise_conformance_filtered(&config, ExecutionMode::Hardened, Some(OpKind::Div))
                .expect("run");
        assert_eq!(report.cases_total, 2);
        assert_eq!(report.cases_passed, 2);
        assert_eq!(cases[0].device, "cpu/hardened");
        assert_eq!(cases[1].device, "cuda:0/hardened");
        let compared = &cases[0].forensic_log.extra_fields["devices_compared"];
        assert_eq!(compared.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn seeds_are_reproducible() {
        let config = small_config();
        let (_, first) =
            run_elementwise_conformance_filtered(&config, ExecutionMode::Strict, Some(OpKind::Log))
                .expect("run");
        let (_, second) =
            run_elementwise_conformance_filtered(&config, ExecutionMode::Strict, Some(OpKind::Log))
                .expect("run");
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.seed, b.seed);
            assert_eq!(a.shape, b.shape);
            assert_eq!(a.forensic_log.input_digest, b.forensic_log.input_digest);
            assert_eq!(a.forensic_log.output_digest, b.forensic_log.output_digest);
        }
        assert_ne!(first[0].seed, first[1].seed);
    }

    #[test]
    fn forensic_logs_carry_runtime_evidence() {
        let config = small_config();
        let (_, cases) =
            run_elementwise_conformance_filtered(&config, ExecutionMode::Strict, Some(OpKind::Sqr))
                .expect("run");
        let log = &cases[0].forensic_log;
        assert_eq!(log.suite_id, "elementwise");
        assert_eq!(log.test_id, "test_sqr_sample_0");
        assert_eq!(log.reason_code, "elementwise_checks_ok");
        assert!(log.replay_command.contains("--op Sqr"));
        let evidence = &log.extra_fields["runtime_evidence"];
        assert!(evidence["kind_counts"]["check"].as_u64().unwrap_or(0) >= 2);
        assert!(evidence["kind_counts"]["dispatch"].as_u64().unwrap_or(0) >= 1);
    }

    #[test]
    fn matrix_emits_one_jsonl_line_per_case() {
        let config = small_config();
        let path = temp_matrix_path("matrix");
        let summary = emit_elementwise_matrix(&config, &path, &[], Some(OpKind::Sigmoid))
            .expect("matrix should be written");
        assert_eq!(summary.modes, vec![ExecutionMode::Strict, ExecutionMode::Hardened]);
        assert_eq!(summary.log_entries, 4);
        assert_eq!(summary.failed_entries, 0);

        let raw = std::fs::read_to_string(&path).expect("matrix readable");
        let logs = raw
            .lines()
            .map(|line| serde_json::from_str::<StructuredCaseLog>(line).expect("valid jsonl"))
            .collect::<Vec<_>>();
        assert_eq!(logs.len(), 4);
        assert!(logs.iter().all(|log| log.extra_fields["op"] == Value::from("Sigmoid")));
        if let Some(parent) = path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }

    #[test]
    fn smoke_covers_all_operators() {
        let report = run_smoke(&HarnessConfig {
            samples_per_case: 1,
            ..HarnessConfig::default_paths()
        });
        assert_eq!(report.suite, "smoke");
        assert_eq!(report.cases_total, 4);
        assert_eq!(report.cases_passed, report.cases_total);
    }

    #[test]
    fn zero_samples_yield_an_empty_report() {
        let config = HarnessConfig {
            samples_per_case: 0,
            ..HarnessConfig::default_paths()
        };
        let (report, cases) =
            run_elementwise_conformance(&config, ExecutionMode::Hardened).expect("run");
        assert_eq!(report.cases_total, 0);
        assert!(cases.is_empty());
    }

    #[test]
    fn summarize_passes_counts() {
        assert_eq!(summarize_passes([true, false, true].into_iter()), (3, 2));
    }
}
