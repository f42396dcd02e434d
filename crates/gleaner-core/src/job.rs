//! Enrichment job types for the persistent task queue.
//!
//! The scheduler never runs a phase inline: each tick enqueues a job and a
//! worker claims it.
//!
//! ```text
//! pending → running → completed
//!              ↓
//!           failed | cancelled
//! ```
//!
//! At most one job per phase may be pending or running at a time. A crashed
//! worker leaves its job in `running`; such jobs are moved back to `pending`
//! once they are older than the stale timeout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Phase;
use crate::stats::RunStats;

// =============================================================================
// Job Status
// =============================================================================

/// Status of an enrichment job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a worker.
    Pending,
    /// Claimed by a worker.
    Running,
    /// The phase ran to the end, possibly with item failures.
    Completed,
    /// The phase run failed.
    Failed,
    /// Stopped by shutdown.
    Cancelled,
}

impl JobStatus {
    /// Returns the string representation for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Returns true if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Returns true if the job blocks another job for the same phase.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

/// Error type for parsing JobStatus from string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseJobStatusError(String);

impl std::fmt::Display for ParseJobStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid job status: {}", self.0)
    }
}

impl std::error::Error for ParseJobStatusError {}

impl std::str::FromStr for JobStatus {
    type Err = ParseJobStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(ParseJobStatusError(s.to_string())),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Enrichment Job
// =============================================================================

/// A queued run of one phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentJob {
    pub id: Uuid,
    pub phase: Phase,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Run-level error of a failed job.
    pub error_message: Option<String>,
    /// Counts of the finished run.
    pub run_stats: Option<RunStats>,
    /// Worker holding the job while it is running.
    pub worker_id: Option<String>,
    /// What enqueued the job, e.g. `scheduler` or `cli`.
    pub trigger: String,
}

// =============================================================================
// Job Creation Request
// =============================================================================

/// Request to enqueue a phase.
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub phase: Phase,
    pub trigger: String,
}

impl CreateJobRequest {
    /// Creates a request for the given phase, triggered by the scheduler.
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            trigger: "scheduler".to_string(),
        }
    }

    /// Set the trigger label.
    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = trigger.into();
        self
    }
}

// =============================================================================
// Worker Configuration
// =============================================================================

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker identifier.
    pub worker_id: String,
    /// How often to poll for new jobs.
    pub poll_interval: std::time::Duration,
    /// Consecutive failed runs of one phase before an alert is raised.
    pub alert_after_failures: u32,
    /// How often a running job is marked alive in the queue.
    pub heartbeat_interval: std::time::Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            poll_interval: std::time::Duration::from_secs(5),
            alert_after_failures: 3,
            heartbeat_interval: std::time::Duration::from_secs(60),
        }
    }
}

impl WorkerConfig {
    /// Default configuration with `ALERT_AFTER_FAILURES` and
    /// `HEARTBEAT_INTERVAL_SECS` applied.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            alert_after_failures: std::env::var("ALERT_AFTER_FAILURES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.alert_after_failures),
            heartbeat_interval: std::env::var("HEARTBEAT_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(std::time::Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            ..defaults
        }
    }

    /// Set the worker ID.
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: std::time::Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: std::time::Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the alert threshold (at least 1).
    pub fn with_alert_after_failures(mut self, failures: u32) -> Self {
        self.alert_after_failures = failures.max(1);
        self
    }
}
