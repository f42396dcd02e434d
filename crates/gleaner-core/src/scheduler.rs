//! Interval scheduler enqueuing phase runs.
//!
//! Each phase gets its own timer task. A tick only enqueues a job; the work
//! happens in the worker pool, so a slow run never delays another phase's
//! trigger. When the previous run of a phase is still pending or running, the
//! queue deduplicates the new job and the tick is dropped.
//!
//! The first tick of every phase fires immediately. Ticks missed while the
//! process was busy are skipped rather than replayed.
//!
//! # Example
//!
//! ```ignore
//! let mut scheduler = Scheduler::new(queue, ScheduleConfig::from_env());
//! scheduler.start().await;
//! shutdown_signal().await;
//! scheduler.shutdown().await;
//! ```

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ScheduleConfig;
use crate::error::AppError;
use crate::job::{CreateJobRequest, EnrichmentJob};
use crate::job_queue::JobQueue;
use crate::models::Phase;

/// Per-phase timers over a job queue.
pub struct Scheduler<Q: JobQueue> {
    queue: Q,
    config: ScheduleConfig,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl<Q: JobQueue + 'static> Scheduler<Q> {
    pub fn new(queue: Q, config: ScheduleConfig) -> Self {
        Self {
            queue,
            config,
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Stops the timers when `token` is cancelled, in addition to
    /// [`Scheduler::shutdown`].
    pub fn with_cancel_token(mut self, token: &CancellationToken) -> Self {
        self.cancel = token.child_token();
        self
    }

    pub fn is_running(&self) -> bool {
        !self.handles.is_empty() && !self.cancel.is_cancelled()
    }

    /// Releases stale jobs and spawns one timer per phase.
    ///
    /// Calling `start` on a running scheduler does nothing.
    pub async fn start(&mut self) {
        if !self.handles.is_empty() {
            return;
        }

        match self
            .queue
            .release_stale_jobs(self.config.stale_job_timeout)
            .await
        {
            Ok(0) => {}
            Ok(released) => info!(released, "Released stale jobs"),
            Err(e) => warn!(error = %e, "Failed to release stale jobs"),
        }

        for phase in Phase::ALL {
            let period = self.config.interval_for(phase);
            info!(%phase, interval_secs = period.as_secs(), "Scheduling phase");
            self.handles.push(tokio::spawn(run_timer(
                self.queue.clone(),
                phase,
                period,
                self.cancel.clone(),
            )));
        }
    }

    /// Stops the timers and waits for them to exit.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Scheduler timer panicked");
            }
        }
        info!("Scheduler stopped");
    }
}

/// Enqueues one run of `phase`. Returns `None` when deduplicated.
pub async fn enqueue_phase<Q: JobQueue>(
    queue: &Q,
    phase: Phase,
    trigger: &str,
) -> Result<Option<EnrichmentJob>, AppError> {
    let job = queue
        .create_job(CreateJobRequest::new(phase).with_trigger(trigger))
        .await?;
    match &job {
        Some(job) => info!(%phase, job_id = %job.id, trigger, "Phase enqueued"),
        None => debug!(%phase, trigger, "Phase already pending or running, not enqueued"),
    }
    Ok(job)
}

async fn run_timer<Q: JobQueue>(queue: Q, phase: Phase, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = enqueue_phase(&queue, phase, "scheduler").await {
                    error!(%phase, error = %e, "Failed to enqueue phase");
                }
            }
        }
    }
    debug!(%phase, "Timer stopped");
}
