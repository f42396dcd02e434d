//! Per-run bookkeeping for enrichment phases.
//!
//! Pure data and counters, decoupled from I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Phase, UpsertOutcome};

/// Outcome of processing a single fetched item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// New record inserted.
    Created,
    /// Existing record merged.
    Updated,
    /// Rejected by normalization, the source or the store.
    Failed,
    /// Deferred to a later run (parent missing).
    Skipped,
}

impl From<UpsertOutcome> for ItemOutcome {
    fn from(outcome: UpsertOutcome) -> Self {
        match outcome {
            UpsertOutcome::Created => ItemOutcome::Created,
            UpsertOutcome::Updated => ItemOutcome::Updated,
        }
    }
}

/// Counters for one run.
///
/// `fetched` counts raw items received from the source, including items that
/// are later rejected.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    #[serde(default)]
    pub skipped: usize,
}

impl RunStats {
    /// Creates a new empty stats tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an outcome, incrementing the appropriate counter.
    pub fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Created => self.created += 1,
            ItemOutcome::Updated => self.updated += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Skipped => self.skipped += 1,
        }
    }

    /// Returns the number of processed outcomes.
    pub fn total(&self) -> usize {
        self.created + self.updated + self.failed + self.skipped
    }
}

/// State of a run.
///
/// ```text
/// Idle → Fetching → Merging → Done
///           │          │
///           └──────────┴────→ Failed | Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Fetching,
    Merging,
    /// Finished, possibly with item failures.
    Done,
    /// The run could not be performed.
    Failed,
    /// Stopped by shutdown before the end.
    Cancelled,
}

impl RunState {
    /// Returns the string representation for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Fetching => "fetching",
            RunState::Merging => "merging",
            RunState::Done => "done",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One execution of one phase.
#[derive(Debug, Clone)]
pub struct TaskRun {
    pub phase: Phase,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stats: RunStats,
    /// Run-level error for `Failed` runs.
    pub error: Option<String>,
}

impl TaskRun {
    pub fn start(phase: Phase) -> Self {
        Self {
            phase,
            state: RunState::Idle,
            started_at: Utc::now(),
            finished_at: None,
            stats: RunStats::new(),
            error: None,
        }
    }

    /// Moves the run to a terminal state.
    pub fn finish(&mut self, state: RunState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
    }

    /// Marks the run failed with the given error.
    pub fn fail(&mut self, error: impl std::fmt::Display) {
        self.error = Some(error.to_string());
        self.finish(RunState::Failed);
    }

    pub fn is_done(&self) -> bool {
        self.state == RunState::Done
    }

    pub fn is_failed(&self) -> bool {
        self.state == RunState::Failed
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == RunState::Cancelled
    }

    /// Wall-clock duration, if finished.
    pub fn duration(&self) -> Option<chrono::TimeDelta> {
        self.finished_at.map(|end| end - self.started_at)
    }
}
