//! Progress reporting for phase runs.
//!
//! [`EnrichmentService`](crate::enrich::EnrichmentService) emits
//! [`EnrichEvent`]s through a [`ProgressReporter`], so the caller decides where
//! they go: nowhere in tests, `tracing` in the CLI and the worker.

use tracing::{debug, info, warn};

use crate::models::Phase;
use crate::stats::{RunState, TaskRun};

/// Events emitted during a phase run.
#[derive(Debug, Clone)]
pub enum EnrichEvent<'a> {
    /// The run started.
    PhaseStarted { phase: Phase },
    /// A page of base records was fetched.
    PageFetched { phase: Phase, page: usize, items: usize },
    /// Users needing related records were listed.
    ParentsFound { phase: Phase, count: usize },
    /// One item could not be merged.
    ItemFailed {
        phase: Phase,
        item: &'a str,
        error: &'a str,
    },
    /// The run reached a terminal state.
    PhaseFinished { run: &'a TaskRun },
}

/// Trait for reporting phase progress.
pub trait ProgressReporter: Send + Sync {
    /// Called when an event occurs. The default implementation does nothing.
    fn report(&self, event: EnrichEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that ignores all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}

/// Reporter that logs events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn report(&self, event: EnrichEvent<'_>) {
        match event {
            EnrichEvent::PhaseStarted { phase } => {
                info!(%phase, "Phase started");
            }
            EnrichEvent::PageFetched { phase, page, items } => {
                debug!(%phase, page, items, "Page fetched");
            }
            EnrichEvent::ParentsFound { phase, count } => {
                info!(%phase, parents = count, "Users due for enrichment");
            }
            EnrichEvent::ItemFailed { phase, item, error } => {
                warn!(%phase, item, error, "Item failed");
            }
            EnrichEvent::PhaseFinished { run } => {
                let stats = &run.stats;
                let duration_ms = run.duration().map(|d| d.num_milliseconds());
                match run.state {
                    RunState::Failed => warn!(
                        phase = %run.phase,
                        fetched = stats.fetched,
                        created = stats.created,
                        updated = stats.updated,
                        failed = stats.failed,
                        skipped = stats.skipped,
                        error = run.error.as_deref().unwrap_or("unknown"),
                        "Phase failed"
                    ),
                    state => info!(
                        phase = %run.phase,
                        %state,
                        fetched = stats.fetched,
                        created = stats.created,
                        updated = stats.updated,
                        failed = stats.failed,
                        skipped = stats.skipped,
                        duration_ms,
                        "Phase finished"
                    ),
                }
            }
        }
    }
}
