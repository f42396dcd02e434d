//! Worker and worker pool tests against the in-memory queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gleaner_core::config::EnrichConfig;
use gleaner_core::job::{CreateJobRequest, EnrichmentJob, JobStatus, WorkerConfig};
use gleaner_core::job_queue::{JobQueue, MemoryJobQueue};
use gleaner_core::models::Phase;
use gleaner_core::progress::SilentReporter;
use gleaner_core::retry::RetryPolicy;
use gleaner_core::stats::RunStats;
use gleaner_core::worker::{SilentWorkerReporter, WorkerEvent, WorkerPool, WorkerReporter, WorkerService};
use gleaner_core::{AppError, EnrichmentService};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::common::{server_error, MockSourceFactory, MockStore, ScriptedSource};

fn enrichment(
    store: &MockStore,
    sources: MockSourceFactory,
) -> EnrichmentService<MockStore, MockSourceFactory> {
    EnrichmentService::with_config(
        store.clone(),
        sources,
        RetryPolicy::none(),
        EnrichConfig::default(),
    )
}

fn worker_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_worker_id("test-worker")
        .with_poll_interval(Duration::from_millis(10))
}

/// Records alert events.
#[derive(Clone, Default)]
struct AlertRecorder {
    alerts: Arc<Mutex<Vec<(Phase, u32)>>>,
}

impl WorkerReporter for AlertRecorder {
    fn report(&self, event: WorkerEvent<'_>) {
        if let WorkerEvent::PhaseAlert {
            phase,
            consecutive_failures,
            ..
        } = event
        {
            self.alerts
                .lock()
                .unwrap()
                .push((phase, consecutive_failures));
        }
    }
}

/// In-memory queue that counts heartbeats.
#[derive(Clone, Default)]
struct HeartbeatCounter {
    inner: MemoryJobQueue,
    beats: Arc<AtomicUsize>,
}

impl JobQueue for HeartbeatCounter {
    async fn create_job(&self, request: CreateJobRequest) -> Result<Option<EnrichmentJob>, AppError> {
        self.inner.create_job(request).await
    }

    async fn claim_job(&self, worker_id: &str) -> Result<Option<EnrichmentJob>, AppError> {
        self.inner.claim_job(worker_id).await
    }

    async fn complete_job(&self, job_id: Uuid, stats: RunStats) -> Result<(), AppError> {
        self.inner.complete_job(job_id, stats).await
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        error: &str,
        stats: Option<RunStats>,
    ) -> Result<(), AppError> {
        self.inner.fail_job(job_id, error, stats).await
    }

    async fn cancel_job(&self, job_id: Uuid, stats: Option<RunStats>) -> Result<(), AppError> {
        self.inner.cancel_job(job_id, stats).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<EnrichmentJob>, AppError> {
        self.inner.get_job(job_id).await
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<EnrichmentJob>, AppError> {
        self.inner.list_jobs(status, limit).await
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        self.inner.release_worker_jobs(worker_id).await
    }

    async fn heartbeat(&self, job_id: Uuid) -> Result<(), AppError> {
        self.beats.fetch_add(1, Ordering::SeqCst);
        self.inner.heartbeat(job_id).await
    }

    async fn release_stale_jobs(&self, older_than: Duration) -> Result<u64, AppError> {
        self.inner.release_stale_jobs(older_than).await
    }
}

#[tokio::test]
async fn test_worker_completes_job_with_stats() {
    let queue = MemoryJobQueue::new();
    let store = MockStore::new();
    let worker = WorkerService::new(
        queue.clone(),
        enrichment(&store, MockSourceFactory::standard(4)),
        worker_config(),
    );

    let job = queue
        .create_job(CreateJobRequest::new(Phase::Users).with_trigger("test"))
        .await
        .unwrap()
        .unwrap();
    let processed = worker
        .run_once(CancellationToken::new(), &SilentWorkerReporter, &SilentReporter)
        .await
        .unwrap();
    assert_eq!(processed, Some(job.id));

    let job = queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.run_stats.unwrap().created, 4);
    assert!(job.worker_id.is_none());
    assert_eq!(store.user_count(), 4);
}

#[tokio::test]
async fn test_worker_with_empty_queue() {
    let queue = MemoryJobQueue::new();
    let worker = WorkerService::new(
        queue,
        enrichment(&MockStore::new(), MockSourceFactory::standard(1)),
        worker_config(),
    );

    let processed = worker
        .run_once(CancellationToken::new(), &SilentWorkerReporter, &SilentReporter)
        .await
        .unwrap();
    assert!(processed.is_none());
}

#[tokio::test]
async fn test_repeated_failures_raise_alert() {
    let queue = MemoryJobQueue::new();
    let sources = MockSourceFactory::new().with(
        Phase::Users,
        ScriptedSource::failing("users", || AppError::NetworkError("refused".into())),
    );
    let worker = WorkerService::new(
        queue.clone(),
        enrichment(&MockStore::new(), sources),
        worker_config().with_alert_after_failures(3),
    );
    let reporter = AlertRecorder::default();

    for _ in 0..4 {
        let job = queue
            .create_job(CreateJobRequest::new(Phase::Users))
            .await
            .unwrap()
            .unwrap();
        worker
            .run_once(CancellationToken::new(), &reporter, &SilentReporter)
            .await
            .unwrap();

        let job = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("refused"));
    }

    let alerts = reporter.alerts.lock().unwrap().clone();
    assert_eq!(alerts, vec![(Phase::Users, 3), (Phase::Users, 4)]);
}

#[tokio::test]
async fn test_cancelled_run_marks_job_cancelled() {
    let queue = MemoryJobQueue::new();
    let worker = WorkerService::new(
        queue.clone(),
        enrichment(&MockStore::new(), MockSourceFactory::standard(2)),
        worker_config(),
    );
    let job = queue
        .create_job(CreateJobRequest::new(Phase::Users))
        .await
        .unwrap()
        .unwrap();

    let token = CancellationToken::new();
    token.cancel();
    worker
        .run_once(token, &SilentWorkerReporter, &SilentReporter)
        .await
        .unwrap();

    let job = queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    // A cancelled job no longer blocks the phase.
    assert!(
        queue
            .create_job(CreateJobRequest::new(Phase::Users))
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn test_pool_drains_queue_and_stops() {
    let queue = MemoryJobQueue::new();
    let store = MockStore::new();
    let pool = WorkerPool::new(
        queue.clone(),
        enrichment(&store, MockSourceFactory::standard(3)),
        worker_config(),
        2,
    );

    queue
        .create_job(CreateJobRequest::new(Phase::Users))
        .await
        .unwrap();
    let cancel = CancellationToken::new();
    let handle = pool.spawn(cancel.clone(), SilentWorkerReporter, SilentReporter);
    assert_eq!(handle.len(), 2);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let done = queue
            .list_jobs(Some(JobStatus::Completed), 10)
            .await
            .unwrap();
        if !done.is_empty() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job never completed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("workers did not stop");

    assert_eq!(store.user_count(), 3);
    assert_eq!(
        queue.list_jobs(Some(JobStatus::Running), 10).await.unwrap().len(),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_long_run_sends_heartbeats() {
    let queue = HeartbeatCounter::default();
    let sources = MockSourceFactory::new().with(
        Phase::Users,
        ScriptedSource::failing("users", server_error),
    );
    // Two retry delays of 30 s keep the run busy for a minute.
    let retry = RetryPolicy::default()
        .with_max_attempts(3)
        .with_base_delay(Duration::from_secs(30))
        .with_jitter(0.0);
    let service = EnrichmentService::with_config(
        MockStore::new(),
        sources,
        retry,
        EnrichConfig::default(),
    );
    let worker = WorkerService::new(
        queue.clone(),
        service,
        worker_config().with_heartbeat_interval(Duration::from_secs(10)),
    );
    queue
        .create_job(CreateJobRequest::new(Phase::Users))
        .await
        .unwrap();

    worker
        .run_once(CancellationToken::new(), &SilentWorkerReporter, &SilentReporter)
        .await
        .unwrap();

    assert!(queue.beats.load(Ordering::SeqCst) >= 4);
}

#[tokio::test]
async fn test_quick_run_sends_no_heartbeat() {
    let queue = HeartbeatCounter::default();
    let worker = WorkerService::new(
        queue.clone(),
        enrichment(&MockStore::new(), MockSourceFactory::standard(2)),
        worker_config(),
    );
    queue
        .create_job(CreateJobRequest::new(Phase::Users))
        .await
        .unwrap();

    worker
        .run_once(CancellationToken::new(), &SilentWorkerReporter, &SilentReporter)
        .await
        .unwrap();

    assert_eq!(queue.beats.load(Ordering::SeqCst), 0);
}
