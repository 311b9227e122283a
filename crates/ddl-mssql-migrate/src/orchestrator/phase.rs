//! Run phases and the transitions between them.

use serde::Serialize;
use tracing::info;

use crate::error::{MigrateError, Result};

/// Where a run is.
///
/// ```text
/// Idle → SchemaTranslated → ConflictsChecked → TargetProvisioned
///      → DataTransferred → [Scheduled] → Done
/// ```
///
/// A dry run goes from `ConflictsChecked` straight to `Done`. `Failed` is
/// reachable from every phase that is not terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    SchemaTranslated,
    ConflictsChecked,
    TargetProvisioned,
    DataTransferred,
    Scheduled,
    Done,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::SchemaTranslated => "schema_translated",
            Phase::ConflictsChecked => "conflicts_checked",
            Phase::TargetProvisioned => "target_provisioned",
            Phase::DataTransferred => "data_transferred",
            Phase::Scheduled => "scheduled",
            Phase::Done => "done",
            Phase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }

    pub fn can_transition_to(&self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Idle, SchemaTranslated)
            | (SchemaTranslated, ConflictsChecked)
            | (ConflictsChecked, TargetProvisioned)
            | (ConflictsChecked, Done)
            | (TargetProvisioned, DataTransferred)
            | (DataTransferred, Scheduled)
            | (DataTransferred, Done)
            | (Scheduled, Done) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current phase of one run.
#[derive(Debug)]
pub struct PhaseTracker {
    phase: Phase,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self { phase: Phase::Idle }
    }
}

impl PhaseTracker {
    pub fn current(&self) -> Phase {
        self.phase
    }

    /// Move to `next`, or fail with [`MigrateError::InvalidTransition`].
    pub fn advance(&mut self, next: Phase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(MigrateError::InvalidTransition {
                from: self.phase.as_str(),
                to: next.as_str(),
            });
        }
        info!("Phase: {} -> {}", self.phase, next);
        self.phase = next;
        Ok(())
    }

    /// Mark the run failed. No-op once terminal.
    pub fn fail(&mut self) {
        if !self.phase.is_terminal() {
            info!("Phase: {} -> {}", self.phase, Phase::Failed);
            self.phase = Phase::Failed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut tracker = PhaseTracker::default();
        for next in [
            Phase::SchemaTranslated,
            Phase::ConflictsChecked,
            Phase::TargetProvisioned,
            Phase::DataTransferred,
            Phase::Scheduled,
            Phase::Done,
        ] {
            tracker.advance(next).unwrap();
        }
        assert_eq!(tracker.current(), Phase::Done);
    }

    #[test]
    fn test_skipping_phases_is_rejected() {
        let mut tracker = PhaseTracker::default();
        let err = tracker.advance(Phase::TargetProvisioned).unwrap_err();
        assert!(matches!(
            err,
            MigrateError::InvalidTransition {
                from: "idle",
                to: "target_provisioned"
            }
        ));
        assert_eq!(tracker.current(), Phase::Idle);
    }

    #[test]
    fn test_failed_reachable_until_terminal() {
        for phase in [
            Phase::Idle,
            Phase::SchemaTranslated,
            Phase::ConflictsChecked,
            Phase::TargetProvisioned,
            Phase::DataTransferred,
            Phase::Scheduled,
        ] {
            assert!(phase.can_transition_to(Phase::Failed), "{}", phase);
        }
        assert!(!Phase::Done.can_transition_to(Phase::Failed));
        assert!(!Phase::Failed.can_transition_to(Phase::Failed));
        assert!(!Phase::Done.can_transition_to(Phase::Idle));
    }

    #[test]
    fn test_dry_run_path() {
        assert!(Phase::ConflictsChecked.can_transition_to(Phase::Done));
        assert!(!Phase::SchemaTranslated.can_transition_to(Phase::Done));
    }
}
