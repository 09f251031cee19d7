// Invariant Framework
//
// Invariants are pure rules over a catalog table's rows that must hold
// across every DDL statement. They compare the rows before and after the
// statement, so a broken transition is reported against the statement
// that caused it.

use crate::record::{DdlOp, VtmdRecord};

/// Result of invariant evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantResult {
    Pass,
    Fail(String),
}

/// Trait implemented by all invariants.
///
/// Invariants must be:
/// - Pure
/// - Deterministic
/// - Side-effect free
pub trait Invariant: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate(
        &self,
        previous: &[VtmdRecord],
        op: DdlOp,
        next: &[VtmdRecord],
    ) -> InvariantResult;
}

/// Invariant engine that evaluates a set of invariants.
#[derive(Default)]
pub struct InvariantEngine {
    invariants: Vec<Box<dyn Invariant>>,
}

impl InvariantEngine {
    /// Create a new invariant engine.
    pub fn new() -> Self {
        Self {
            invariants: Vec::new(),
        }
    }

    /// Engine with every built-in catalog invariant registered.
    pub fn with_defaults() -> Self {
        let mut engine = Self::new();
        engine.register(SingleAliveRecord);
        engine.register(AliveRecordUnarchived);
        engine.register(ArchivedEpochsRetained);
        engine.register(ArchiveOnlyOnRelocation);
        engine
    }

    /// Register an invariant.
    pub fn register<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Evaluate all invariants.
    ///
    /// Stops at the first failure.
    pub fn evaluate(
        &self,
        previous: &[VtmdRecord],
        op: DdlOp,
        next: &[VtmdRecord],
    ) -> Result<(), InvariantViolation> {
        for invariant in &self.invariants {
            match invariant.validate(previous, op, next) {
                InvariantResult::Pass => continue,
                InvariantResult::Fail(reason) => {
                    return Err(InvariantViolation {
                        invariant: invariant.name(),
                        reason,
                    })
                }
            }
        }
        Ok(())
    }
}

/// Returned when an invariant is violated.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invariant `{invariant}` violated: {reason}")]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub reason: String,
}

/// At most one row has an open epoch.
pub struct SingleAliveRecord;

impl Invariant for SingleAliveRecord {
    fn name(&self) -> &'static str {
        "single-alive-record"
    }

    fn validate(
        &self,
        _previous: &[VtmdRecord],
        _op: DdlOp,
        next: &[VtmdRecord],
    ) -> InvariantResult {
        let alive = next.iter().filter(|r| r.is_alive()).count();
        if alive > 1 {
            InvariantResult::Fail(format!("{alive} alive records"))
        } else {
            InvariantResult::Pass
        }
    }
}

/// The alive row describes live data and so has no archive name.
pub struct AliveRecordUnarchived;

impl Invariant for AliveRecordUnarchived {
    fn name(&self) -> &'static str {
        "alive-record-unarchived"
    }

    fn validate(
        &self,
        _previous: &[VtmdRecord],
        _op: DdlOp,
        next: &[VtmdRecord],
    ) -> InvariantResult {
        match next
            .iter()
            .find(|r| r.is_alive() && r.archive_name.is_some())
        {
            Some(record) => InvariantResult::Fail(format!(
                "alive record `{}` carries archive name `{}`",
                record.name,
                record.archive_name.as_deref().unwrap_or_default()
            )),
            None => InvariantResult::Pass,
        }
    }
}

/// Closed epochs are never removed, and an archive name once set never
/// changes.
pub struct ArchivedEpochsRetained;

impl Invariant for ArchivedEpochsRetained {
    fn name(&self) -> &'static str {
        "archived-epochs-retained"
    }

    fn validate(
        &self,
        previous: &[VtmdRecord],
        _op: DdlOp,
        next: &[VtmdRecord],
    ) -> InvariantResult {
        for closed in previous.iter().filter(|r| !r.is_alive()) {
            let kept = next
                .iter()
                .find(|r| r.start == closed.start && r.end == closed.end);
            match kept {
                None => {
                    return InvariantResult::Fail(format!(
                        "epoch [{}, {}) of `{}` disappeared",
                        closed.start, closed.end, closed.name
                    ))
                }
                Some(kept)
                    if closed.archive_name.is_some()
                        && kept.archive_name != closed.archive_name =>
                {
                    return InvariantResult::Fail(format!(
                        "archive name of epoch [{}, {}) changed from {:?} to {:?}",
                        closed.start, closed.end, closed.archive_name, kept.archive_name
                    ))
                }
                Some(_) => {}
            }
        }
        InvariantResult::Pass
    }
}

/// Archive names are only ever given to closed epochs, and never by a
/// create.
pub struct ArchiveOnlyOnRelocation;

impl Invariant for ArchiveOnlyOnRelocation {
    fn name(&self) -> &'static str {
        "archive-only-on-relocation"
    }

    fn validate(&self, previous: &[VtmdRecord], op: DdlOp, next: &[VtmdRecord]) -> InvariantResult {
        let newly_archived = next.iter().filter(|r| {
            r.archive_name.is_some()
                && !previous
                    .iter()
                    .any(|p| p.start == r.start && p.archive_name == r.archive_name)
        });
        for record in newly_archived {
            if op == DdlOp::Create {
                return InvariantResult::Fail(format!(
                    "create archived epoch starting at {}",
                    record.start
                ));
            }
            if record.is_alive() {
                return InvariantResult::Fail(format!(
                    "open epoch starting at {} was archived",
                    record.start
                ));
            }
        }
        InvariantResult::Pass
    }
}
