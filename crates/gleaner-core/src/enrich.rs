//! Enrichment service: runs one phase of the pipeline.
//!
//! A phase run fetches raw records from its source, normalizes them and merges
//! them into the store. The three phases share this code:
//!
//! - **Users** pages through the user listing. The first page is the
//!   connectivity check: if it cannot be fetched the run fails. A later page
//!   failure stops paging and counts as one failed item. Paging stops after
//!   `max_pages`, or early when a page starts with the same record as the
//!   previous one (a source that ignores the paging parameters).
//! - **Addresses** and **CreditCards** list the users that are due for
//!   enrichment, fetch each user's records with bounded concurrency and merge
//!   them in fetch order. Every due user is fetched; a user whose fetch fails
//!   counts as one failed item.
//!
//! Item failures never fail a run. A run fails only when its source or its
//! candidate list is unreachable, or when the store connection is lost while
//! merging.
//!
//! # Cancellation
//!
//! The token is checked between records. A cancelled run stops before the
//! next record and reports [`RunState::Cancelled`] with partial counts.

use chrono::{DateTime, TimeDelta, Utc};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EnrichConfig;
use crate::error::AppError;
use crate::models::{Phase, RelatedKind, UpsertOutcome};
use crate::progress::{EnrichEvent, ProgressReporter, SilentReporter};
use crate::records::{PageRequest, normalize_related, normalize_user};
use crate::retry::RetryPolicy;
use crate::stats::{ItemOutcome, RunState, TaskRun};
use crate::traits::{EntityStore, RecordSource, SourceFactory};

/// Service running enrichment phases against a store and a set of sources.
///
/// # Example
///
/// ```ignore
/// use gleaner_core::EnrichmentService;
///
/// let service = EnrichmentService::new(repo, HttpSourceFactory::new(sources, http)?);
/// let run = service.run_phase(Phase::Users).await;
/// println!("{}: created {} updated {}", run.phase, run.stats.created, run.stats.updated);
/// ```
pub struct EnrichmentService<S, F>
where
    S: EntityStore,
    F: SourceFactory,
{
    store: S,
    sources: F,
    retry: RetryPolicy,
    config: EnrichConfig,
}

impl<S, F> Clone for EnrichmentService<S, F>
where
    S: EntityStore,
    F: SourceFactory,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            sources: self.sources.clone(),
            retry: self.retry.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S, F> EnrichmentService<S, F>
where
    S: EntityStore,
    F: SourceFactory,
{
    /// Creates a service with the default retry policy and configuration.
    pub fn new(store: S, sources: F) -> Self {
        Self::with_config(store, sources, RetryPolicy::default(), EnrichConfig::default())
    }

    pub fn with_config(store: S, sources: F, retry: RetryPolicy, config: EnrichConfig) -> Self {
        Self {
            store,
            sources,
            retry,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs one phase to completion without progress reporting.
    pub async fn run_phase(&self, phase: Phase) -> TaskRun {
        self.run_phase_with_progress(phase, &SilentReporter, CancellationToken::new())
            .await
    }

    /// Runs every phase in dependency order, stopping early on cancellation.
    pub async fn run_cycle<R: ProgressReporter>(
        &self,
        reporter: &R,
        cancel: CancellationToken,
    ) -> Vec<TaskRun> {
        let mut runs = Vec::with_capacity(Phase::ALL.len());
        for phase in Phase::ALL {
            if cancel.is_cancelled() {
                break;
            }
            runs.push(
                self.run_phase_with_progress(phase, reporter, cancel.clone())
                    .await,
            );
        }
        runs
    }

    /// Runs one phase, reporting progress and honoring `cancel`.
    ///
    /// Never returns an error: failures are carried by the returned run,
    /// which is also recorded in the store.
    pub async fn run_phase_with_progress<R: ProgressReporter>(
        &self,
        phase: Phase,
        reporter: &R,
        cancel: CancellationToken,
    ) -> TaskRun {
        let mut run = TaskRun::start(phase);
        reporter.report(EnrichEvent::PhaseStarted { phase });

        if cancel.is_cancelled() {
            run.finish(RunState::Cancelled);
        } else {
            let result = match phase.related_kind() {
                None => self.run_users(&mut run, reporter, &cancel).await,
                Some(kind) => self.run_related(kind, &mut run, reporter, &cancel).await,
            };
            match result {
                Ok(state) => run.finish(state),
                Err(e) => run.fail(e),
            }
        }

        if let Err(e) = self.store.record_run(&run).await {
            warn!(%phase, error = %e, "Failed to record phase run");
        }

        reporter.report(EnrichEvent::PhaseFinished { run: &run });
        run
    }

    async fn run_users<R: ProgressReporter>(
        &self,
        run: &mut TaskRun,
        reporter: &R,
        cancel: &CancellationToken,
    ) -> Result<RunState, AppError> {
        let phase = run.phase;
        let source = self.sources.create(phase)?;
        let mut request = PageRequest::default();
        let mut pages = 0;
        let max_pages = self.config.max_pages as usize;
        let mut previous_first: Option<Value> = None;

        loop {
            run.state = RunState::Fetching;
            let fetched = self
                .retry
                .execute(source.name(), || source.fetch_page(&request))
                .await;

            let page = match fetched {
                Ok(page) => page,
                Err(e) if pages == 0 => return Err(e),
                Err(e) => {
                    let error = e.to_string();
                    reporter.report(EnrichEvent::ItemFailed {
                        phase,
                        item: &format!("page {}", pages + 1),
                        error: &error,
                    });
                    run.stats.record(ItemOutcome::Failed);
                    break;
                }
            };

            let first = page.items.first().and_then(|item| item.get("id")).cloned();
            if first.is_some() && first == previous_first {
                warn!(%phase, page = pages + 1, "Source repeated the previous page, stopping");
                break;
            }

            pages += 1;
            run.stats.fetched += page.items.len();
            reporter.report(EnrichEvent::PageFetched {
                phase,
                page: pages,
                items: page.items.len(),
            });

            run.state = RunState::Merging;
            for item in &page.items {
                if cancel.is_cancelled() {
                    return Ok(RunState::Cancelled);
                }
                let outcome = match normalize_user(item) {
                    Ok(user) => {
                        let result = self.store.upsert_user(&user).await;
                        self.classify(phase, &user.external_id.to_string(), result, reporter)?
                    }
                    Err(e) => self.rejected(phase, item, e, reporter),
                };
                run.stats.record(outcome);
            }

            match page.next_cursor {
                Some(_) if pages >= max_pages => {
                    warn!(%phase, max_pages, "Page limit reached, stopping");
                    break;
                }
                Some(cursor) if !page.items.is_empty() => {
                    request.cursor = Some(cursor);
                    previous_first = first;
                }
                _ => break,
            }
        }

        Ok(RunState::Done)
    }

    async fn run_related<R: ProgressReporter>(
        &self,
        kind: RelatedKind,
        run: &mut TaskRun,
        reporter: &R,
        cancel: &CancellationToken,
    ) -> Result<RunState, AppError> {
        let phase = run.phase;
        run.state = RunState::Fetching;

        let parents = self
            .store
            .parents_due(kind, refresh_cutoff(self.config.refresh_after))
            .await?;
        reporter.report(EnrichEvent::ParentsFound {
            phase,
            count: parents.len(),
        });
        if parents.is_empty() {
            return Ok(RunState::Done);
        }

        let source = self.sources.create(phase)?;

        let fetches = stream::iter(parents)
            .map(|parent| {
                let source = source.clone();
                let retry = self.retry.clone();
                async move {
                    let request = PageRequest::for_parent(parent.external_id);
                    let result = retry
                        .execute(source.name(), || source.fetch_page(&request))
                        .await;
                    (parent, result)
                }
            })
            .buffered(self.config.concurrency.max(1));
        let mut fetches = std::pin::pin!(fetches);

        run.state = RunState::Merging;
        while let Some((parent, result)) = fetches.next().await {
            if cancel.is_cancelled() {
                return Ok(RunState::Cancelled);
            }

            let page = match result {
                Ok(page) => page,
                Err(e) => {
                    let error = e.to_string();
                    reporter.report(EnrichEvent::ItemFailed {
                        phase,
                        item: &parent.external_id.to_string(),
                        error: &error,
                    });
                    run.stats.record(ItemOutcome::Failed);
                    continue;
                }
            };

            run.stats.fetched += page.items.len();
            for item in &page.items {
                if cancel.is_cancelled() {
                    return Ok(RunState::Cancelled);
                }
                let outcome = match normalize_related(kind, item, parent.external_id) {
                    Ok(record) => {
                        let result = self
                            .store
                            .upsert_related(parent.external_id, &record)
                            .await;
                        self.classify(phase, record.source_key(), result, reporter)?
                    }
                    Err(e) => self.rejected(phase, item, e, reporter),
                };
                run.stats.record(outcome);
            }
        }

        Ok(RunState::Done)
    }

    /// Maps a store result onto an item outcome. Connection-level store
    /// errors are returned and fail the run.
    fn classify<R: ProgressReporter>(
        &self,
        phase: Phase,
        item: &str,
        result: Result<UpsertOutcome, AppError>,
        reporter: &R,
    ) -> Result<ItemOutcome, AppError> {
        match result {
            Ok(outcome) => Ok(outcome.into()),
            Err(AppError::ParentNotFound(user)) => {
                debug!(%phase, user, item, "Parent missing, deferring record");
                Ok(ItemOutcome::Skipped)
            }
            Err(e) if e.is_persistence_fatal() => Err(e),
            Err(e) => {
                let error = e.to_string();
                reporter.report(EnrichEvent::ItemFailed {
                    phase,
                    item,
                    error: &error,
                });
                Ok(ItemOutcome::Failed)
            }
        }
    }

    fn rejected<R: ProgressReporter>(
        &self,
        phase: Phase,
        item: &Value,
        error: AppError,
        reporter: &R,
    ) -> ItemOutcome {
        let id = item
            .get("id")
            .or_else(|| item.get("uid"))
            .map(|v| v.to_string())
            .unwrap_or_else(|| "?".to_string());
        let error = error.to_string();
        reporter.report(EnrichEvent::ItemFailed {
            phase,
            item: &id,
            error: &error,
        });
        ItemOutcome::Failed
    }
}

/// Related records last updated before the returned instant are due again.
fn refresh_cutoff(refresh_after: std::time::Duration) -> DateTime<Utc> {
    TimeDelta::from_std(refresh_after)
        .ok()
        .and_then(|delta| Utc::now().checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
