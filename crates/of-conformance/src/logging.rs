use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use of_core::ExecutionMode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const STRUCTURED_LOG_SCHEMA_VERSION: &str = "opforge-conformance-log-v1";

/// One replayable record per executed case, emitted as a JSONL line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredCaseLog {
    pub schema_version: String,
    pub ts_unix_ms: u64,
    pub suite_id: String,
    pub test_id: String,
    pub scenario_id: String,
    pub mode: String,
    pub seed: u64,
    pub input_digest: String,
    pub output_digest: String,
    pub env_fingerprint: String,
    pub artifact_refs: Vec<String>,
    pub replay_command: String,
    pub duration_ms: u64,
    pub outcome: String,
    pub reason_code: String,
    #[serde(flatten)]
    pub extra_fields: BTreeMap<String, Value>,
}

impl StructuredCaseLog {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        suite_id: &str,
        test_id: &str,
        mode: ExecutionMode,
        seed: u64,
        artifact_refs: Vec<String>,
        replay_command: String,
        outcome: &str,
        reason_code: &str,
    ) -> Self {
        let mode_label = mode_label(mode);
        Self {
            schema_version: STRUCTURED_LOG_SCHEMA_VERSION.to_string(),
            ts_unix_ms: now_unix_ms(),
            suite_id: suite_id.to_string(),
            test_id: test_id.to_string(),
            scenario_id: format!("{suite_id}/{mode_label}:{test_id}"),
            mode: mode_label.to_string(),
            seed,
            input_digest: det64_label(seed),
            output_digest: det64_label(0),
            env_fingerprint: env_fingerprint(),
            artifact_refs,
            replay_command,
            duration_ms: 0,
            outcome: outcome.to_string(),
            reason_code: reason_code.to_string(),
            extra_fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_digests(mut self, input_digest: u64, output_digest: u64) -> Self {
        self.input_digest = det64_label(input_digest);
        self.output_digest = det64_label(output_digest);
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    #[must_use]
    pub fn with_extra_fields(mut self, extra_fields: BTreeMap<String, Value>) -> Self {
        self.extra_fields.extend(extra_fields);
        self
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == "pass"
    }
}

#[must_use]
pub fn mode_label(mode: ExecutionMode) -> &'static str {
    match mode {
        ExecutionMode::Strict => "strict",
        ExecutionMode::Hardened => "hardened",
    }
}

#[must_use]
pub fn det64_label(value: u64) -> String {
    format!("det64:{value:016x}")
}

/// FNV-1a over the little-endian bytes of every part.
#[must_use]
pub fn det_seed(parts: &[u64]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for value in parts {
        for byte in value.to_le_bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash
}

#[must_use]
pub fn digest_f32(values: &[f32]) -> u64 {
    let parts = values
        .iter()
        .map(|value| u64::from(value.to_bits()))
        .collect::<Vec<_>>();
    det_seed(parts.as_slice())
}

fn env_fingerprint() -> String {
    let raw = format!(
        "{}|{}|{}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        env!("CARGO_PKG_VERSION")
    );
    let parts = raw.bytes().map(u64::from).collect::<Vec<_>>();
    det64_label(det_seed(parts.as_slice()))
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::{SystemTime, UNIX_EPOCH};

    use of_core::ExecutionMode;
    use serde_json::json;

    use super::{StructuredCaseLog, det_seed, digest_f32, mode_label};

    #[test]
    fn records_are_stamped_with_wall_clock_millis() {
        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock after epoch")
            .as_millis();
        let log = StructuredCaseLog::new(
            "smoke",
            "log_seed_7",
            ExecutionMode::Strict,
            7,
            Vec::new(),
            String::new(),
            "pass",
            "elementwise_parity_ok",
        );
        assert!(u128::from(log.ts_unix_ms) >= before);

        let value = serde_json::to_value(&log).expect("log should serialize");
        assert!(value["ts_unix_ms"].is_u64());
    }

    #[test]
    fn extra_fields_flatten_into_the_record() {
        let mut extra = BTreeMap::new();
        extra.insert("op".to_string(), json!("Sqr"));
        let log = StructuredCaseLog::new(
            "elementwise",
            "sqr_seed_1",
            ExecutionMode::Hardened,
            1,
            vec!["artifacts/conformance/elementwise_matrix.jsonl".to_string()],
            "cargo test -p of-conformance".to_string(),
            "pass",
            "elementwise_parity_ok",
        )
        .with_extra_fields(extra);

        let value = serde_json::to_value(&log).expect("log should serialize");
        assert_eq!(value["op"], json!("Sqr"));
        assert_eq!(value["mode"], json!("hardened"));
        assert_eq!(value["scenario_id"], json!("elementwise/hardened:sqr_seed_1"));
        assert!(log.env_fingerprint.starts_with("det64:"));

        let back: StructuredCaseLog =
            serde_json::from_value(value).expect("log should deserialize");
        assert_eq!(back, log);
    }

    #[test]
    fn digests_are_stable_and_value_sensitive() {
        assert_eq!(det_seed(&[1, 2]), det_seed(&[1, 2]));
        assert_ne!(det_seed(&[1, 2]), det_seed(&[2, 1]));
        assert_ne!(digest_f32(&[0.0]), digest_f32(&[-0.0]));
        assert_eq!(mode_label(ExecutionMode::Strict), "strict");
    }
}
