//! Gleaner Core - domain types, enrichment pipeline, scheduling and workers.
//!
//! This crate provides the core functionality for Gleaner:
//!
//! - **Domain models**: [`User`], [`Address`], [`CreditCard`], [`Phase`]
//! - **Normalization**: raw source payloads into typed records ([`records`])
//! - **Resilience**: [`RetryPolicy`] for remote calls
//! - **Services**: [`EnrichmentService`] runs one phase of the pipeline
//! - **Scheduling**: [`Scheduler`] enqueues phases on a [`JobQueue`];
//!   [`WorkerPool`] runs them
//! - **Traits**: [`RecordSource`], [`SourceFactory`], [`EntityStore`] for
//!   dependency injection
//!
//! # Architecture
//!
//! Business logic is decoupled from I/O through traits. `gleaner-client`
//! implements the sources over HTTP and `gleaner-db` implements the store and
//! the job queue over PostgreSQL.
//!
//! ```text
//! Scheduler → JobQueue → WorkerPool → EnrichmentService
//!                                        ├── RecordSource (RetryPolicy)
//!                                        └── EntityStore
//! ```
//!
//! # Example
//!
//! ```ignore
//! use gleaner_core::{EnrichmentService, Phase, TracingReporter};
//! use tokio_util::sync::CancellationToken;
//!
//! let service = EnrichmentService::new(store, sources);
//! for run in service.run_cycle(&TracingReporter, CancellationToken::new()).await {
//!     println!("{}: {}", run.phase, run.state);
//! }
//! ```

pub mod config;
pub mod enrich;
pub mod error;
pub mod job;
pub mod job_queue;
pub mod models;
pub mod progress;
pub mod records;
pub mod retry;
pub mod scheduler;
pub mod stats;
pub mod traits;
pub mod worker;

// Configuration
pub use config::{DbConfig, EnrichConfig, HttpConfig, ScheduleConfig, SourceConfig};

// Error handling
pub use error::AppError;

// Domain models
pub use models::{
    Address, CreditCard, DatabaseStats, NewAddress, NewCreditCard, NewUser, ParentRef, Phase,
    PhaseStatus, RelatedKind, RelatedRecord, UpsertOutcome, User, UserSummary, UserWithRelations,
    coverage_percent,
};

// Source payloads
pub use records::{
    PageRequest, SourcePage, normalize_address, normalize_credit_card, normalize_related,
    normalize_user,
};

// Run bookkeeping
pub use stats::{ItemOutcome, RunState, RunStats, TaskRun};

// Retry
pub use retry::RetryPolicy;

// Progress reporting
pub use progress::{EnrichEvent, ProgressReporter, SilentReporter, TracingReporter};

// Traits for dependency injection
pub use traits::{EntityStore, RecordSource, SourceFactory};

// Services
pub use enrich::EnrichmentService;

// Job queue types
pub use job::{CreateJobRequest, EnrichmentJob, JobStatus, WorkerConfig};
pub use job_queue::{JobQueue, MemoryJobQueue};

// Scheduling and workers
pub use scheduler::{Scheduler, enqueue_phase};
pub use worker::{
    FailureTracker, SilentWorkerReporter, TracingWorkerReporter, WorkerEvent, WorkerPool,
    WorkerPoolHandle, WorkerReporter, WorkerService,
};
