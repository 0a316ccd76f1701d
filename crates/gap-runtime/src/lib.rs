#![forbid(unsafe_code)]

use std::fmt;

use gap_core::ExecutionMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceKind {
    /// Backend and kernel chosen for an operation.
    Dispatch,
    Allocation,
    /// Attach, release and dispose events on tensor handles.
    Ownership,
    Policy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary: summary.into(),
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    pub fn entries_of(&self, kind: EvidenceKind) -> impl Iterator<Item = &EvidenceEntry> {
        self.entries.iter().filter(move |entry| entry.kind == kind)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    mode: ExecutionMode,
    ledger: EvidenceLedger,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        let mut ledger = EvidenceLedger::new();
        ledger.record(
            EvidenceKind::Policy,
            format!("mode initialized to {}", mode.label()),
        );
        Self { mode, ledger }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.mode = mode;
        self.ledger.record(
            EvidenceKind::Policy,
            format!("mode switched to {}", mode.label()),
        );
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut EvidenceLedger {
        &mut self.ledger
    }

    pub fn record_allocation(&mut self, tensor: &str, backend: &str, nbytes: usize) {
        self.ledger.record(
            EvidenceKind::Allocation,
            format!("tensor={tensor} backend={backend} nbytes={nbytes}"),
        );
    }

    pub fn record_ownership(&mut self, tensor: &str, event: &str) {
        self.ledger.record(
            EvidenceKind::Ownership,
            format!("tensor={tensor} event={event}"),
        );
    }

    /// Failures are kept next to successes so a ledger replays the whole run.
    pub fn record_failure<E>(&mut self, kind: EvidenceKind, operation: &str, error: &E)
    where
        E: fmt::Display + ?Sized,
    {
        self.ledger.record(
            kind,
            format!(
                "{operation} failed mode={}: {error}",
                self.mode.label()
            ),
        );
    }
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}

#[cfg(test)]
mod tests {
    use gap_core::ExecutionMode;

    use super::{EvidenceKind, RuntimeContext};

    #[test]
    fn ledger_records_policy_and_custom_events() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Strict);
        ctx.ledger_mut()
            .record(EvidenceKind::Dispatch, "dispatch decision");

        assert_eq!(ctx.ledger().len(), 2);
        assert_eq!(ctx.ledger().entries()[1].kind, EvidenceKind::Dispatch);
    }

    #[test]
    fn mode_switch_records_event() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Strict);
        ctx.set_mode(ExecutionMode::Hardened);

        assert_eq!(ctx.mode(), ExecutionMode::Hardened);
        assert_eq!(ctx.ledger().len(), 2);
        assert!(ctx.ledger().entries()[1].summary.contains("hardened"));
    }

    #[test]
    fn allocation_and_ownership_are_filterable() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Hardened);
        ctx.record_allocation("A", "cpu.tiled", 48);
        ctx.record_ownership("A", "dispose");
        ctx.record_ownership("x", "release");

        let allocations: Vec<_> = ctx.ledger().entries_of(EvidenceKind::Allocation).collect();
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].summary, "tensor=A backend=cpu.tiled nbytes=48");
        assert_eq!(ctx.ledger().entries_of(EvidenceKind::Ownership).count(), 2);
    }

    #[test]
    fn failures_carry_mode_and_diagnostic() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Strict);
        ctx.record_failure(EvidenceKind::Dispatch, "gemv", "no backend supports i8/block2of4");

        let entry = ctx
            .ledger()
            .entries_of(EvidenceKind::Dispatch)
            .last()
            .expect("dispatch evidence entry should be present");
        assert!(
            entry.summary.contains("gemv failed mode=strict"),
            "unexpected summary: {}",
            entry.summary
        );
        assert!(entry.summary.contains("block2of4"));
    }
}
