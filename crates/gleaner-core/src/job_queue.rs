//! Job queue trait for abstracting job persistence.
//!
//! The scheduler enqueues through [`JobQueue`] and the workers claim from it.
//! `gleaner-db` provides the PostgreSQL implementation; [`MemoryJobQueue`]
//! keeps jobs in process memory for tests and single-process deployments.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{CreateJobRequest, EnrichmentJob, JobStatus};
use crate::stats::RunStats;

/// Trait for job queue persistence operations.
///
/// # Implementation Notes
///
/// Implementations must ensure:
/// - At most one pending or running job per phase
/// - Atomic claiming, so two workers never run the same job
/// - Safe concurrent access from multiple workers
pub trait JobQueue: Send + Sync + Clone {
    /// Enqueue a run of `request.phase`.
    ///
    /// Returns `None` if a job for that phase is already pending or running.
    fn create_job(
        &self,
        request: CreateJobRequest,
    ) -> impl Future<Output = Result<Option<EnrichmentJob>, AppError>> + Send;

    /// Claim the oldest pending job, marking it running for `worker_id`.
    ///
    /// Returns `None` if no jobs are available.
    fn claim_job(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<Option<EnrichmentJob>, AppError>> + Send;

    /// Mark a job as completed with the counts of its run.
    fn complete_job(
        &self,
        job_id: Uuid,
        stats: RunStats,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Mark a job as failed.
    fn fail_job(
        &self,
        job_id: Uuid,
        error: &str,
        stats: Option<RunStats>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Mark a job as cancelled, optionally saving partial counts.
    fn cancel_job(
        &self,
        job_id: Uuid,
        stats: Option<RunStats>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Get a job by ID.
    fn get_job(
        &self,
        job_id: Uuid,
    ) -> impl Future<Output = Result<Option<EnrichmentJob>, AppError>> + Send;

    /// List jobs, newest first, with optional status filter.
    fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<EnrichmentJob>, AppError>> + Send;

    /// Return every running job held by `worker_id` to pending.
    ///
    /// Returns the number of jobs released.
    fn release_worker_jobs(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Mark a running job as still alive.
    ///
    /// Workers call this periodically while a job runs. A no-op for jobs that
    /// are no longer running.
    fn heartbeat(&self, job_id: Uuid) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Return running jobs with no heartbeat for `older_than` to pending.
    fn release_stale_jobs(
        &self,
        older_than: Duration,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;
}

/// Finished jobs kept by [`MemoryJobQueue`] for `list_jobs`.
pub const DEFAULT_FINISHED_RETENTION: usize = 100;

/// In-memory job queue.
///
/// Jobs are lost when the process exits. Only the most recent finished jobs
/// are kept; older ones are dropped when a job finishes.
#[derive(Debug, Clone)]
pub struct MemoryJobQueue {
    jobs: Arc<Mutex<Vec<EnrichmentJob>>>,
    retention: usize,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self {
            jobs: Arc::default(),
            retention: DEFAULT_FINISHED_RETENTION,
        }
    }
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `retention` finished jobs.
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    /// Drops the oldest finished jobs beyond the retention count.
    fn prune(&self, jobs: &mut Vec<EnrichmentJob>) {
        let finished = jobs.iter().filter(|j| j.status.is_terminal()).count();
        let mut excess = finished.saturating_sub(self.retention);
        if excess == 0 {
            return;
        }
        // Jobs are stored in creation order.
        jobs.retain(|j| {
            if excess > 0 && j.status.is_terminal() {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }

    fn finish(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error: Option<&str>,
        stats: Option<RunStats>,
    ) -> Result<(), AppError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or(AppError::JobNotFound(job_id))?;
        let now = Utc::now();
        job.status = status;
        job.updated_at = now;
        job.completed_at = Some(now);
        job.error_message = error.map(str::to_string);
        if stats.is_some() {
            job.run_stats = stats;
        }
        job.worker_id = None;
        self.prune(&mut jobs);
        Ok(())
    }

    fn release_where(&self, predicate: impl Fn(&EnrichmentJob) -> bool) -> u64 {
        let mut jobs = self.jobs.lock().unwrap();
        let now = Utc::now();
        let mut released = 0;
        for job in jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Running && predicate(j))
        {
            job.status = JobStatus::Pending;
            job.worker_id = None;
            job.started_at = None;
            job.updated_at = now;
            released += 1;
        }
        released
    }
}

impl JobQueue for MemoryJobQueue {
    async fn create_job(&self, request: CreateJobRequest) -> Result<Option<EnrichmentJob>, AppError> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs
            .iter()
            .any(|j| j.phase == request.phase && j.status.is_active())
        {
            return Ok(None);
        }

        let now = Utc::now();
        let job = EnrichmentJob {
            id: Uuid::new_v4(),
            phase: request.phase,
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            run_stats: None,
            worker_id: None,
            trigger: request.trigger,
        };
        jobs.push(job.clone());
        Ok(Some(job))
    }

    async fn claim_job(&self, worker_id: &str) -> Result<Option<EnrichmentJob>, AppError> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Pending)
            .min_by_key(|j| j.created_at)
        else {
            return Ok(None);
        };

        let now = Utc::now();
        job.status = JobStatus::Running;
        job.worker_id = Some(worker_id.to_string());
        job.started_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn complete_job(&self, job_id: Uuid, stats: RunStats) -> Result<(), AppError> {
        self.finish(job_id, JobStatus::Completed, None, Some(stats))
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        error: &str,
        stats: Option<RunStats>,
    ) -> Result<(), AppError> {
        self.finish(job_id, JobStatus::Failed, Some(error), stats)
    }

    async fn cancel_job(&self, job_id: Uuid, stats: Option<RunStats>) -> Result<(), AppError> {
        self.finish(job_id, JobStatus::Cancelled, None, stats)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<EnrichmentJob>, AppError> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs.iter().find(|j| j.id == job_id).cloned())
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<EnrichmentJob>, AppError> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs
            .iter()
            .rev()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        Ok(self.release_where(|j| j.worker_id.as_deref() == Some(worker_id)))
    }

    async fn heartbeat(&self, job_id: Uuid) -> Result<(), AppError> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs
            .iter_mut()
            .find(|j| j.id == job_id && j.status == JobStatus::Running)
        {
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn release_stale_jobs(&self, older_than: Duration) -> Result<u64, AppError> {
        let older_than = TimeDelta::from_std(older_than)
            .map_err(|e| AppError::ConfigError(format!("Invalid stale job timeout: {}", e)))?;
        let cutoff = Utc::now() - older_than;
        Ok(self.release_where(|j| j.updated_at < cutoff))
    }
}
