//! Run state machine and cancellation.
//!
//! A batch moves through
//! `Idle → Loading → Locked → (Applying → Verifying → Recording)* → Unlocking → Done`,
//! with `Failed` reachable from the per-migration phases. Rollbacks use the
//! `Reverting → VerifyingReversal → Unrecording` triple in place of the apply triple.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::grader::SafetyGrade;

/// Sub-step of a single migration, reported on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Step {
    /// Running the up path.
    Applying,
    /// Checking post-conditions after up.
    Verifying,
    /// Writing the ledger entry.
    Recording,
    /// Running the down path.
    Reverting,
    /// Checking post-conditions after down.
    VerifyingReversal,
    /// Removing the ledger entry.
    Unrecording,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Applying => write!(f, "applying"),
            Step::Verifying => write!(f, "verifying"),
            Step::Recording => write!(f, "recording"),
            Step::Reverting => write!(f, "reverting"),
            Step::VerifyingReversal => write!(f, "verifying reversal"),
            Step::Unrecording => write!(f, "unrecording"),
        }
    }
}

/// Phase of a runner. Indices refer to the position in the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunPhase {
    /// Nothing started.
    Idle,
    /// Diffing the registry against the ledger.
    Loading,
    /// Run-lock held.
    Locked,
    /// A migration sub-step is in progress.
    Running(usize, Step),
    /// Releasing the run-lock.
    Unlocking,
    /// Batch finished without failure.
    Done,
    /// Batch stopped on an error.
    Failed,
}

impl RunPhase {
    /// Whether the runner may move from `self` to `next`.
    pub fn can_transition(self, next: RunPhase) -> bool {
        use RunPhase::*;
        match (self, next) {
            (Idle | Done | Failed, Loading) => true,
            (Loading, Locked | Done | Failed) => true,
            (Locked, Running(0, Step::Applying | Step::Reverting)) => true,
            (Locked, Unlocking | Failed) => true,
            (Running(i, a), Running(j, b)) => {
                (i == j && matches!(
                    (a, b),
                    (Step::Applying, Step::Verifying)
                        | (Step::Verifying, Step::Recording)
                        | (Step::Reverting, Step::VerifyingReversal)
                        | (Step::VerifyingReversal, Step::Unrecording)
                )) || (j == i + 1
                    && matches!(
                        (a, b),
                        (Step::Recording, Step::Applying) | (Step::Unrecording, Step::Reverting)
                    ))
            }
            (Running(_, Step::Recording | Step::Unrecording), Unlocking) => true,
            (Running(..), Failed) => true,
            (Unlocking, Done | Failed) => true,
            _ => false,
        }
    }

    /// Whether the phase ends a batch.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Done | RunPhase::Failed)
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunPhase::Idle => write!(f, "idle"),
            RunPhase::Loading => write!(f, "loading"),
            RunPhase::Locked => write!(f, "locked"),
            RunPhase::Running(index, step) => write!(f, "{step} #{index}"),
            RunPhase::Unlocking => write!(f, "unlocking"),
            RunPhase::Done => write!(f, "done"),
            RunPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Tracks the current phase and the transitions taken in this batch.
#[derive(Debug, Clone)]
pub struct RunState {
    phase: RunPhase,
    history: Vec<RunPhase>,
}

impl RunState {
    /// A fresh, idle state.
    pub fn new() -> Self {
        Self {
            phase: RunPhase::Idle,
            history: vec![RunPhase::Idle],
        }
    }

    /// Current phase.
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Phases visited in the latest batch, in order.
    pub fn history(&self) -> &[RunPhase] {
        &self.history
    }

    /// Move to `next`. A new batch (entering `Loading`) resets the history.
    pub fn advance(&mut self, next: RunPhase) {
        debug_assert!(
            self.phase.can_transition(next),
            "invalid run transition {} -> {}",
            self.phase,
            next
        );
        if next == RunPhase::Loading {
            self.history.clear();
        }
        tracing::trace!(from = %self.phase, to = %next, "run phase");
        self.phase = next;
        self.history.push(next);
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

/// Cooperative cancellation flag, honored at backfill chunk boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// A token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Whether a migration has taken effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Recorded in the ledger.
    Applied,
    /// Registered but not recorded.
    Pending,
    /// Recorded in the ledger but unknown to the registry.
    Unregistered,
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationStatus::Applied => write!(f, "applied"),
            MigrationStatus::Pending => write!(f, "pending"),
            MigrationStatus::Unregistered => write!(f, "applied (unregistered)"),
        }
    }
}

/// One line of `status` output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEntry {
    /// Version key; `None` for unregistered ledger entries.
    pub version: Option<u64>,
    /// Migration name.
    pub name: String,
    /// Description from the definition.
    pub description: Option<String>,
    /// Overall safety grade; `None` for unregistered ledger entries.
    pub grade: Option<SafetyGrade>,
    /// Applied, pending or unregistered.
    pub status: MigrationStatus,
    /// When the migration was recorded.
    pub applied_at: Option<DateTime<Utc>>,
}
