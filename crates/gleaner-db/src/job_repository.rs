//! Job repository for PostgreSQL with SELECT FOR UPDATE SKIP LOCKED.
//!
//! Implements [`JobQueue`] on the `enrichment_jobs` table. A partial unique
//! index on `phase` over pending and running rows enforces at most one active
//! job per phase, so a duplicate enqueue is a no-op.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use gleaner_core::error::AppError;
use gleaner_core::job::{CreateJobRequest, EnrichmentJob, JobStatus};
use gleaner_core::job_queue::JobQueue;
use gleaner_core::models::Phase;
use gleaner_core::stats::RunStats;

/// PostgreSQL implementation of the job queue.
///
/// Several workers, in one process or many, can poll the same table: a job
/// row is locked while it is claimed and skipped by everyone else.
#[derive(Clone)]
pub struct JobRepository {
    pool: Pool<Postgres>,
}

impl JobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn finish(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error: Option<&str>,
        stats: Option<RunStats>,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE enrichment_jobs
            SET
                status = $2,
                error_message = $3,
                run_stats = COALESCE($4, run_stats),
                completed_at = NOW(),
                updated_at = NOW(),
                worker_id = NULL
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(error)
        .bind(stats.map(Json))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::JobNotFound(job_id));
        }
        Ok(())
    }
}

/// Helper struct for deserializing job rows from the database.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    phase: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    run_stats: Option<Json<RunStats>>,
    worker_id: Option<String>,
    trigger: String,
}

impl TryFrom<JobRow> for EnrichmentJob {
    type Error = AppError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            phase: row.phase.parse::<Phase>()?,
            status: row.status.parse().unwrap_or(JobStatus::Pending),
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            error_message: row.error_message,
            run_stats: row.run_stats.map(|j| j.0),
            worker_id: row.worker_id,
            trigger: row.trigger,
        })
    }
}

fn into_jobs(rows: Vec<JobRow>) -> Result<Vec<EnrichmentJob>, AppError> {
    rows.into_iter().map(EnrichmentJob::try_from).collect()
}

// =============================================================================
// JobQueue Trait Implementation
// =============================================================================

impl JobQueue for JobRepository {
    async fn create_job(&self, request: CreateJobRequest) -> Result<Option<EnrichmentJob>, AppError> {
        // The partial unique index turns a duplicate into DO NOTHING.
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            INSERT INTO enrichment_jobs (phase, trigger)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            RETURNING *
            "#,
        )
        .bind(request.phase.as_str())
        .bind(&request.trigger)
        .fetch_optional(&self.pool)
        .await?;

        row.map(EnrichmentJob::try_from).transpose()
    }

    async fn claim_job(&self, worker_id: &str) -> Result<Option<EnrichmentJob>, AppError> {
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            UPDATE enrichment_jobs
            SET
                status = 'running',
                worker_id = $1,
                started_at = NOW(),
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM enrichment_jobs
                WHERE status = 'pending'
                ORDER BY created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(EnrichmentJob::try_from).transpose()
    }

    async fn complete_job(&self, job_id: Uuid, stats: RunStats) -> Result<(), AppError> {
        self.finish(job_id, JobStatus::Completed, None, Some(stats))
            .await
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        error: &str,
        stats: Option<RunStats>,
    ) -> Result<(), AppError> {
        self.finish(job_id, JobStatus::Failed, Some(error), stats)
            .await
    }

    async fn cancel_job(&self, job_id: Uuid, stats: Option<RunStats>) -> Result<(), AppError> {
        self.finish(job_id, JobStatus::Cancelled, None, stats).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<EnrichmentJob>, AppError> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM enrichment_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(EnrichmentJob::try_from).transpose()
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<EnrichmentJob>, AppError> {
        let rows: Vec<JobRow> = if let Some(s) = status {
            sqlx::query_as(
                r#"
                SELECT * FROM enrichment_jobs
                WHERE status = $1
                ORDER BY created_at DESC
                LIMIT $2
                "#,
            )
            .bind(s.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                r#"
                SELECT * FROM enrichment_jobs
                ORDER BY created_at DESC
                LIMIT $1
                "#,
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
        };

        into_jobs(rows)
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE enrichment_jobs
            SET
                status = 'pending',
                worker_id = NULL,
                started_at = NULL,
                updated_at = NOW()
            WHERE worker_id = $1 AND status = 'running'
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn heartbeat(&self, job_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE enrichment_jobs
            SET updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn release_stale_jobs(&self, older_than: Duration) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE enrichment_jobs
            SET
                status = 'pending',
                worker_id = NULL,
                started_at = NULL,
                updated_at = NOW()
            WHERE status = 'running'
              AND updated_at < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
