#![forbid(unsafe_code)]

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use of_core::ExecutionMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceKind {
    Dispatch,
    Backward,
    Policy,
    Device,
    Check,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub summary: String,
}

/// Execution mode of one session plus the append-only evidence it produced.
///
/// Every mode change lands in the evidence as a `Policy` entry, so a replayed
/// log shows which policy each later entry ran under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    mode: ExecutionMode,
    evidence: Vec<EvidenceEntry>,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        let mut ctx = Self {
            mode,
            evidence: Vec::new(),
        };
        ctx.record(EvidenceKind::Policy, format!("mode={mode:?} initial"));
        ctx
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        let previous = self.mode;
        self.mode = mode;
        self.record(
            EvidenceKind::Policy,
            format!("mode={mode:?} previous={previous:?}"),
        );
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        let ts_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_millis());
        self.evidence.push(EvidenceEntry {
            ts_unix_ms,
            kind,
            summary: summary.into(),
        });
    }

    #[must_use]
    pub fn evidence(&self) -> &[EvidenceEntry] {
        &self.evidence
    }

    pub fn record_device_rejection<E>(&mut self, device_label: &str, error: &E)
    where
        E: fmt::Display + ?Sized,
    {
        self.record(
            EvidenceKind::Device,
            format!("device={device_label} rejected: {error}"),
        );
    }

    pub fn record_check(&mut self, check: &str, passed: bool, detail: impl fmt::Display) {
        let verdict = if passed { "pass" } else { "fail" };
        self.record(
            EvidenceKind::Check,
            format!("check={check} verdict={verdict} {detail}"),
        );
    }
}

#[cfg(test)]
mod tests {
    use of_core::ExecutionMode;

    use super::{EvidenceKind, RuntimeContext};

    fn summaries(ctx: &RuntimeContext, kind: EvidenceKind) -> Vec<&str> {
        ctx.evidence()
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| entry.summary.as_str())
            .collect()
    }

    #[test]
    fn mode_changes_are_policy_evidence() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Strict);
        ctx.set_mode(ExecutionMode::Hardened);

        assert_eq!(ctx.mode(), ExecutionMode::Hardened);
        assert_eq!(
            summaries(&ctx, EvidenceKind::Policy),
            vec!["mode=Strict initial", "mode=Hardened previous=Strict"]
        );
    }

    #[test]
    fn device_rejection_keeps_diagnostic() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Strict);
        ctx.record_device_rejection("cuda:0", "no kernel registered for AutogradCUDA");

        let device = summaries(&ctx, EvidenceKind::Device);
        assert_eq!(device.len(), 1);
        assert!(device[0].contains("cuda:0"));
        assert!(device[0].contains("AutogradCUDA"));
    }

    #[test]
    fn check_verdicts_are_appended_in_order() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Hardened);
        ctx.record(EvidenceKind::Dispatch, "op=Log kernel=log_cpu");
        ctx.record_check("reference", true, "op=Log max_abs_diff=0");
        ctx.record_check("gradient", false, "op=Div input=0");

        let kinds = ctx
            .evidence()
            .iter()
            .map(|entry| entry.kind)
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                EvidenceKind::Policy,
                EvidenceKind::Dispatch,
                EvidenceKind::Check,
                EvidenceKind::Check
            ]
        );
        let checks = summaries(&ctx, EvidenceKind::Check);
        assert!(checks[0].contains("verdict=pass"));
        assert!(checks[1].contains("verdict=fail"));
        assert!(ctx.evidence()[0].ts_unix_ms > 0);
    }
}
