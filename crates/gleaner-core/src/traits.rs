//! Trait definitions for external dependencies.
//!
//! The enrichment pipeline only talks to remote sources and to the store
//! through these traits, so the HTTP client and the PostgreSQL repository can
//! be swapped for in-memory mocks in tests.
//!
//! # Example
//!
//! ```ignore
//! use gleaner_core::traits::{EntityStore, RecordSource};
//! use gleaner_core::{normalize_user, AppError, PageRequest};
//!
//! async fn import_first_page<R, S>(source: &R, store: &S) -> Result<usize, AppError>
//! where
//!     R: RecordSource,
//!     S: EntityStore,
//! {
//!     let page = source.fetch_page(&PageRequest::default()).await?;
//!     for item in &page.items {
//!         store.upsert_user(&normalize_user(item)?).await?;
//!     }
//!     Ok(page.items.len())
//! }
//! ```

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::models::{
    DatabaseStats, NewUser, ParentRef, Phase, RelatedKind, RelatedRecord, UpsertOutcome,
    UserSummary, UserWithRelations,
};
use crate::records::{PageRequest, SourcePage};
use crate::stats::TaskRun;

/// A remote endpoint returning raw records.
///
/// Implementations map transport failures onto [`AppError`] so the retry
/// policy can tell transient from fatal errors. Items are returned as raw
/// JSON; normalization happens in the pipeline.
pub trait RecordSource: Send + Sync + Clone {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Fetches one page. `request.parent` selects the user for per-user
    /// endpoints; `request.cursor` continues a paged listing.
    fn fetch_page(
        &self,
        request: &PageRequest,
    ) -> impl Future<Output = Result<SourcePage, AppError>> + Send;
}

/// Factory for creating the source of each phase.
///
/// Separate from `RecordSource` to avoid async trait constructors.
pub trait SourceFactory: Send + Sync + Clone {
    type Source: RecordSource;

    fn create(&self, phase: Phase) -> Result<Self::Source, AppError>;
}

/// Store for users and their related records.
pub trait EntityStore: Send + Sync + Clone {
    /// Inserts or merges a user keyed on `external_id`, in one transaction.
    fn upsert_user(
        &self,
        user: &NewUser,
    ) -> impl Future<Output = Result<UpsertOutcome, AppError>> + Send;

    /// Inserts or merges a related record for the user with the given
    /// external id.
    ///
    /// Returns [`AppError::ParentNotFound`] when no such user exists.
    fn upsert_related(
        &self,
        parent_external_id: i64,
        record: &RelatedRecord,
    ) -> impl Future<Output = Result<UpsertOutcome, AppError>> + Send;

    /// Users that have no record of `kind`, or whose newest one was last
    /// updated before `refresh_before`. Ordered by external id.
    fn parents_due(
        &self,
        kind: RelatedKind,
        refresh_before: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<ParentRef>, AppError>> + Send;

    /// Records the outcome of a finished phase run.
    fn record_run(&self, run: &TaskRun) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Aggregate counts and coverage.
    fn get_stats(&self) -> impl Future<Output = Result<DatabaseStats, AppError>> + Send;

    /// A user with all of its related records, or `None` if unknown.
    fn get_user_with_relations(
        &self,
        external_id: i64,
    ) -> impl Future<Output = Result<Option<UserWithRelations>, AppError>> + Send;

    /// Users ordered by external id with related record counts.
    fn list_users(
        &self,
        limit: i64,
        offset: i64,
    ) -> impl Future<Output = Result<Vec<UserSummary>, AppError>> + Send;

    /// Checks store connectivity.
    fn health_check(&self) -> impl Future<Output = Result<(), AppError>> + Send;
}
