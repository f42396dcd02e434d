//! Worker service for processing enrichment jobs from the queue.
//!
//! # Architecture
//!
//! Each worker follows a poll-based model:
//! ```text
//! loop {
//!     1. Check for cancellation
//!     2. Claim next pending job
//!     3. Run the job's phase using EnrichmentService, heartbeating the job
//!     4. Update job status (completed/failed/cancelled)
//!     5. If no jobs available, sleep for poll_interval
//! }
//! ```
//!
//! A [`WorkerPool`] runs several workers over the same queue. Different phases
//! run in parallel; the queue never hands out two jobs for the same phase.
//!
//! # Alerting
//!
//! Workers of a pool share a [`FailureTracker`]. When a phase fails
//! `alert_after_failures` times in a row, an `error!` event with
//! `alert = true` is emitted for every further failure until a run succeeds.
//!
//! # Graceful Shutdown
//!
//! On cancellation the current run stops before its next record, the job is
//! marked cancelled with partial counts, and the worker releases any job it
//! still holds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::enrich::EnrichmentService;
use crate::error::AppError;
use crate::job::{EnrichmentJob, WorkerConfig};
use crate::job_queue::JobQueue;
use crate::models::Phase;
use crate::progress::ProgressReporter;
use crate::stats::{RunState, RunStats, TaskRun};
use crate::traits::{EntityStore, SourceFactory};

// =============================================================================
// Worker Events
// =============================================================================

/// Events emitted by the worker during operation.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    /// Worker started and is ready to process jobs.
    Started { worker_id: &'a str },
    /// Worker is polling for new jobs.
    Polling,
    /// Worker claimed a job.
    JobClaimed { job: &'a EnrichmentJob },
    /// The job's run finished.
    JobCompleted {
        job_id: Uuid,
        phase: Phase,
        stats: &'a RunStats,
    },
    /// The job's run failed.
    JobFailed {
        job_id: Uuid,
        phase: Phase,
        error: &'a str,
    },
    /// A phase has failed too many times in a row.
    PhaseAlert {
        phase: Phase,
        consecutive_failures: u32,
        error: &'a str,
    },
    /// The job was cancelled by shutdown.
    JobCancelled {
        job_id: Uuid,
        phase: Phase,
        stats: &'a RunStats,
    },
    /// Worker is shutting down.
    ShuttingDown {
        worker_id: &'a str,
        jobs_released: u64,
    },
    /// Worker stopped.
    Stopped { worker_id: &'a str },
}

// =============================================================================
// Worker Reporter Trait
// =============================================================================

/// Trait for reporting worker events.
///
/// Similar to [`ProgressReporter`] but for worker-level events.
pub trait WorkerReporter: Send + Sync {
    /// Called when a worker event occurs. The default implementation does
    /// nothing.
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Silent worker reporter that ignores all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentWorkerReporter;

impl WorkerReporter for SilentWorkerReporter {}

/// Tracing-based worker reporter.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                info!(worker_id, "Worker started");
            }
            WorkerEvent::Polling => {
                tracing::trace!("Polling for jobs");
            }
            WorkerEvent::JobClaimed { job } => {
                info!(job_id = %job.id, phase = %job.phase, trigger = %job.trigger, "Job claimed");
            }
            WorkerEvent::JobCompleted {
                job_id,
                phase,
                stats,
            } => {
                info!(
                    %job_id,
                    %phase,
                    fetched = stats.fetched,
                    created = stats.created,
                    updated = stats.updated,
                    failed = stats.failed,
                    skipped = stats.skipped,
                    "Job completed"
                );
            }
            WorkerEvent::JobFailed {
                job_id,
                phase,
                error,
            } => {
                warn!(%job_id, %phase, error, "Job failed");
            }
            WorkerEvent::PhaseAlert {
                phase,
                consecutive_failures,
                error,
            } => {
                error!(
                    alert = true,
                    %phase,
                    consecutive_failures,
                    error,
                    "Phase keeps failing"
                );
            }
            WorkerEvent::JobCancelled {
                job_id,
                phase,
                stats,
            } => {
                info!(%job_id, %phase, processed = stats.total(), "Job cancelled");
            }
            WorkerEvent::ShuttingDown {
                worker_id,
                jobs_released,
            } => {
                info!(worker_id, jobs_released, "Worker shutting down");
            }
            WorkerEvent::Stopped { worker_id } => {
                info!(worker_id, "Worker stopped");
            }
        }
    }
}

// =============================================================================
// Failure Tracker
// =============================================================================

/// Consecutive failed runs per phase.
///
/// Done runs reset the count; cancelled runs leave it unchanged.
#[derive(Debug, Clone, Default)]
pub struct FailureTracker {
    counts: Arc<Mutex<HashMap<Phase, u32>>>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the count for the run's phase and returns it.
    pub fn record(&self, run: &TaskRun) -> u32 {
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(run.phase).or_insert(0);
        match run.state {
            RunState::Failed => *count += 1,
            RunState::Cancelled => {}
            _ => *count = 0,
        }
        *count
    }

    pub fn consecutive_failures(&self, phase: Phase) -> u32 {
        self.counts
            .lock()
            .unwrap()
            .get(&phase)
            .copied()
            .unwrap_or(0)
    }
}

// =============================================================================
// Worker Service
// =============================================================================

/// Worker that runs queued phases.
pub struct WorkerService<Q, S, F>
where
    Q: JobQueue,
    S: EntityStore,
    F: SourceFactory,
{
    queue: Q,
    service: EnrichmentService<S, F>,
    config: WorkerConfig,
    failures: FailureTracker,
}

impl<Q, S, F> WorkerService<Q, S, F>
where
    Q: JobQueue,
    S: EntityStore,
    F: SourceFactory,
{
    pub fn new(queue: Q, service: EnrichmentService<S, F>, config: WorkerConfig) -> Self {
        Self {
            queue,
            service,
            config,
            failures: FailureTracker::new(),
        }
    }

    /// Share a failure tracker with other workers.
    pub fn with_failure_tracker(mut self, failures: FailureTracker) -> Self {
        self.failures = failures;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run the worker until cancelled.
    pub async fn run<WR, PR>(
        &self,
        cancel_token: CancellationToken,
        worker_reporter: &WR,
        progress_reporter: &PR,
    ) -> Result<(), AppError>
    where
        WR: WorkerReporter,
        PR: ProgressReporter,
    {
        worker_reporter.report(WorkerEvent::Started {
            worker_id: &self.config.worker_id,
        });

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            worker_reporter.report(WorkerEvent::Polling);

            match self.queue.claim_job(&self.config.worker_id).await {
                Ok(Some(job)) => {
                    worker_reporter.report(WorkerEvent::JobClaimed { job: &job });
                    self.process_job(&job, &cancel_token, worker_reporter, progress_reporter)
                        .await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = cancel_token.cancelled() => break,
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.config.worker_id, error = %e, "Failed to claim job");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval * 2) => {}
                        _ = cancel_token.cancelled() => break,
                    }
                }
            }
        }

        let released = match self.queue.release_worker_jobs(&self.config.worker_id).await {
            Ok(n) => n,
            Err(e) => {
                error!(worker_id = %self.config.worker_id, error = %e, "Failed to release jobs");
                0
            }
        };

        worker_reporter.report(WorkerEvent::ShuttingDown {
            worker_id: &self.config.worker_id,
            jobs_released: released,
        });
        worker_reporter.report(WorkerEvent::Stopped {
            worker_id: &self.config.worker_id,
        });

        Ok(())
    }

    /// Runs the job's phase and records the result on the job.
    async fn process_job<WR, PR>(
        &self,
        job: &EnrichmentJob,
        cancel_token: &CancellationToken,
        worker_reporter: &WR,
        progress_reporter: &PR,
    ) where
        WR: WorkerReporter,
        PR: ProgressReporter,
    {
        let running = self.service.run_phase_with_progress(
            job.phase,
            progress_reporter,
            cancel_token.child_token(),
        );
        tokio::pin!(running);

        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let run = loop {
            tokio::select! {
                run = &mut running => break run,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.queue.heartbeat(job.id).await {
                        warn!(job_id = %job.id, error = %e, "Failed to record job heartbeat");
                    }
                }
            }
        };
        let consecutive_failures = self.failures.record(&run);

        let update = match run.state {
            RunState::Cancelled => {
                worker_reporter.report(WorkerEvent::JobCancelled {
                    job_id: job.id,
                    phase: job.phase,
                    stats: &run.stats,
                });
                self.queue.cancel_job(job.id, Some(run.stats.clone())).await
            }
            RunState::Failed => {
                let error = run.error.as_deref().unwrap_or("unknown error");
                worker_reporter.report(WorkerEvent::JobFailed {
                    job_id: job.id,
                    phase: job.phase,
                    error,
                });
                if consecutive_failures >= self.config.alert_after_failures {
                    worker_reporter.report(WorkerEvent::PhaseAlert {
                        phase: job.phase,
                        consecutive_failures,
                        error,
                    });
                }
                self.queue
                    .fail_job(job.id, error, Some(run.stats.clone()))
                    .await
            }
            _ => {
                worker_reporter.report(WorkerEvent::JobCompleted {
                    job_id: job.id,
                    phase: job.phase,
                    stats: &run.stats,
                });
                self.queue.complete_job(job.id, run.stats.clone()).await
            }
        };

        if let Err(e) = update {
            error!(job_id = %job.id, state = %run.state, error = %e, "Failed to update job status");
        }
    }

    /// Claims and runs at most one job, returning the finished job's id.
    ///
    /// Used by tests and one-shot invocations that should not poll.
    pub async fn run_once<WR, PR>(
        &self,
        cancel_token: CancellationToken,
        worker_reporter: &WR,
        progress_reporter: &PR,
    ) -> Result<Option<Uuid>, AppError>
    where
        WR: WorkerReporter,
        PR: ProgressReporter,
    {
        let Some(job) = self.queue.claim_job(&self.config.worker_id).await? else {
            return Ok(None);
        };
        worker_reporter.report(WorkerEvent::JobClaimed { job: &job });
        self.process_job(&job, &cancel_token, worker_reporter, progress_reporter)
            .await;
        Ok(Some(job.id))
    }
}

// =============================================================================
// Worker Pool
// =============================================================================

/// A fixed number of workers over one queue.
pub struct WorkerPool<Q, S, F>
where
    Q: JobQueue,
    S: EntityStore,
    F: SourceFactory,
{
    queue: Q,
    service: EnrichmentService<S, F>,
    config: WorkerConfig,
    size: usize,
    failures: FailureTracker,
}

impl<Q, S, F> WorkerPool<Q, S, F>
where
    Q: JobQueue + 'static,
    S: EntityStore + 'static,
    F: SourceFactory + 'static,
{
    /// Creates a pool of `size` workers (at least one). Worker ids are
    /// `config.worker_id` suffixed with the worker index.
    pub fn new(queue: Q, service: EnrichmentService<S, F>, config: WorkerConfig, size: usize) -> Self {
        Self {
            queue,
            service,
            config,
            size: size.max(1),
            failures: FailureTracker::new(),
        }
    }

    pub fn failures(&self) -> &FailureTracker {
        &self.failures
    }

    /// Spawns the workers on the current runtime.
    pub fn spawn<WR, PR>(
        &self,
        cancel_token: CancellationToken,
        worker_reporter: WR,
        progress_reporter: PR,
    ) -> WorkerPoolHandle
    where
        WR: WorkerReporter + Clone + 'static,
        PR: ProgressReporter + Clone + 'static,
    {
        let handles = (0..self.size)
            .map(|i| {
                let config = self
                    .config
                    .clone()
                    .with_worker_id(format!("{}-{}", self.config.worker_id, i));
                let worker = WorkerService::new(self.queue.clone(), self.service.clone(), config)
                    .with_failure_tracker(self.failures.clone());
                let cancel = cancel_token.clone();
                let worker_reporter = worker_reporter.clone();
                let progress_reporter = progress_reporter.clone();
                tokio::spawn(async move {
                    worker
                        .run(cancel, &worker_reporter, &progress_reporter)
                        .await
                })
            })
            .collect();

        WorkerPoolHandle { handles }
    }
}

/// Join handles of a spawned pool.
pub struct WorkerPoolHandle {
    handles: Vec<JoinHandle<Result<(), AppError>>>,
}

impl WorkerPoolHandle {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every worker to stop.
    pub async fn join(self) {
        for handle in self.handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Worker exited with error"),
                Err(e) => error!(error = %e, "Worker task panicked"),
            }
        }
    }
}
