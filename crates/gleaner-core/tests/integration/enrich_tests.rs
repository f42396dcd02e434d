//! Integration tests for `EnrichmentService`.

use std::sync::Mutex;
use std::time::Duration;

use gleaner_core::config::EnrichConfig;
use gleaner_core::models::{Phase, RelatedKind};
use gleaner_core::progress::{EnrichEvent, ProgressReporter, SilentReporter};
use gleaner_core::records::SourcePage;
use gleaner_core::retry::RetryPolicy;
use gleaner_core::stats::RunState;
use gleaner_core::traits::EntityStore;
use gleaner_core::{AppError, EnrichmentService};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::common::{
    MockSourceFactory, MockStore, ScriptedSource, address_json, server_error, user_json,
    users_json,
};

fn service(
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

// =============================================================================
// Users phase
// =============================================================================

#[tokio::test]
async fn test_two_consecutive_runs_create_then_update() {
    let store = MockStore::new();
    let service = service(&store, MockSourceFactory::standard(10));

    let first = service.run_phase(Phase::Users).await;
    assert_eq!(first.state, RunState::Done);
    assert_eq!(first.stats.fetched, 10);
    assert_eq!(first.stats.created, 10);
    assert_eq!(first.stats.updated, 0);

    let second = service.run_phase(Phase::Users).await;
    assert_eq!(second.state, RunState::Done);
    assert_eq!(second.stats.created, 0);
    assert_eq!(second.stats.updated, 10);

    assert_eq!(store.user_count(), 10);
    assert_eq!(store.runs().len(), 2);
}

#[tokio::test]
async fn test_malformed_record_fails_alone() {
    let mut items = users_json(10);
    items.push(json!({ "id": 11, "name": "No Email", "username": "noemail" }));

    let store = MockStore::new();
    let sources = MockSourceFactory::new().with(Phase::Users, ScriptedSource::fixed("users", items));
    let run = service(&store, sources).run_phase(Phase::Users).await;

    assert_eq!(run.state, RunState::Done);
    assert_eq!(run.stats.fetched, 11);
    assert_eq!(run.stats.created, 10);
    assert_eq!(run.stats.failed, 1);
    assert_eq!(store.user_count(), 10);
    assert!(store.user(11).is_none());
}

#[tokio::test]
async fn test_merge_overwrites_with_incoming_values() {
    let store = MockStore::new();
    let renamed = json!({
        "id": 1,
        "name": "Leanne Graham",
        "username": "Bret",
        "email": "Sincere@april.biz"
    });
    let sources = MockSourceFactory::new().with(
        Phase::Users,
        ScriptedSource::new("users", move |_, call| {
            let item = if call == 0 { user_json(1) } else { renamed.clone() };
            Ok(SourcePage::last(vec![item]))
        }),
    );
    let service = service(&store, sources);

    service.run_phase(Phase::Users).await;
    let run = service.run_phase(Phase::Users).await;

    assert_eq!(run.stats.updated, 1);
    let stored = store.user(1).unwrap();
    assert_eq!(stored.user.name, "Leanne Graham");
    assert_eq!(stored.user.email, "Sincere@april.biz");
}

#[tokio::test]
async fn test_first_page_failure_fails_run() {
    let store = MockStore::new();
    let sources = MockSourceFactory::new().with(
        Phase::Users,
        ScriptedSource::failing("users", || AppError::ClientStatus {
            status: 404,
            url: "http://source.test/users".to_string(),
        }),
    );
    let run = service(&store, sources).run_phase(Phase::Users).await;

    assert_eq!(run.state, RunState::Failed);
    assert!(run.error.as_deref().unwrap().contains("404"));
    assert_eq!(store.runs().len(), 1);
    assert_eq!(store.runs()[0].state, RunState::Failed);
}

#[tokio::test]
async fn test_later_page_failure_keeps_earlier_pages() {
    let store = MockStore::new();
    let sources = MockSourceFactory::new().with(
        Phase::Users,
        ScriptedSource::new("users", |request, _| match request.cursor.as_deref() {
            None => Ok(SourcePage {
                items: users_json(5),
                next_cursor: Some("2".to_string()),
            }),
            Some(_) => Err(AppError::ClientStatus {
                status: 400,
                url: "http://source.test/users?_page=2".to_string(),
            }),
        }),
    );
    let run = service(&store, sources).run_phase(Phase::Users).await;

    assert_eq!(run.state, RunState::Done);
    assert_eq!(run.stats.created, 5);
    assert_eq!(run.stats.failed, 1);
}

#[tokio::test]
async fn test_source_ignoring_paging_stops_on_repeated_page() {
    let store = MockStore::new();
    // Every call answers with the same full page and points at the next one.
    let users = ScriptedSource::new("users", |_, call| {
        Ok(SourcePage {
            items: users_json(3),
            next_cursor: Some((call + 2).to_string()),
        })
    });
    let sources = MockSourceFactory::new().with(Phase::Users, users.clone());
    let run = service(&store, sources).run_phase(Phase::Users).await;

    assert_eq!(run.state, RunState::Done);
    assert_eq!(users.calls(), 2);
    assert_eq!(run.stats.fetched, 3);
    assert_eq!(run.stats.created, 3);
    assert_eq!(run.stats.updated, 0);
    assert_eq!(store.user_count(), 3);
}

#[tokio::test]
async fn test_paging_stops_at_page_limit() {
    let store = MockStore::new();
    // Endless listing of distinct users.
    let users = ScriptedSource::new("users", |_, call| {
        let first = call as i64 * 2 + 1;
        Ok(SourcePage {
            items: vec![user_json(first), user_json(first + 1)],
            next_cursor: Some((call + 2).to_string()),
        })
    });
    let sources = MockSourceFactory::new().with(Phase::Users, users.clone());
    let config = EnrichConfig::default().with_max_pages(4);
    let run = EnrichmentService::with_config(store.clone(), sources, RetryPolicy::none(), config)
        .run_phase(Phase::Users)
        .await;

    assert_eq!(run.state, RunState::Done);
    assert_eq!(users.calls(), 4);
    assert_eq!(run.stats.created, 8);
    assert_eq!(store.user_count(), 8);
}

#[tokio::test]
async fn test_store_connection_loss_fails_run() {
    let store = MockStore::new();
    store.fail_upserts_fatally();
    let run = service(&store, MockSourceFactory::standard(3))
        .run_phase(Phase::Users)
        .await;

    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.stats.fetched, 3);
    assert_eq!(run.stats.total(), 0);
}

// =============================================================================
// Related phases
// =============================================================================

#[tokio::test]
async fn test_related_phase_enriches_each_user_once() {
    let store = MockStore::new();
    let service = service(&store, MockSourceFactory::standard(4));

    service.run_phase(Phase::Users).await;
    let run = service.run_phase(Phase::Addresses).await;
    assert_eq!(run.state, RunState::Done);
    assert_eq!(run.stats.created, 4);
    assert_eq!(store.related_count(RelatedKind::Address), 4);

    // Fresh records are not due again within the refresh window.
    let again = service.run_phase(Phase::Addresses).await;
    assert_eq!(again.state, RunState::Done);
    assert_eq!(again.stats.fetched, 0);
    assert_eq!(store.related_count(RelatedKind::Address), 4);
}

#[tokio::test]
async fn test_related_refetch_of_same_record_updates() {
    let store = MockStore::new();
    let config = EnrichConfig::default().with_refresh_after(Duration::ZERO);
    let service = EnrichmentService::with_config(
        store.clone(),
        MockSourceFactory::standard(2),
        RetryPolicy::none(),
        config,
    );

    service.run_phase(Phase::Users).await;
    service.run_phase(Phase::CreditCards).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let run = service.run_phase(Phase::CreditCards).await;

    assert_eq!(run.stats.created, 0);
    assert_eq!(run.stats.updated, 2);
    assert_eq!(store.related_count(RelatedKind::CreditCard), 2);
}

#[tokio::test]
async fn test_orphan_related_record_is_skipped() {
    let store = MockStore::new();
    let service = service(&store, MockSourceFactory::standard(2));
    service.run_phase(Phase::Users).await;

    store.add_phantom_parent(99);
    let run = service.run_phase(Phase::Addresses).await;

    assert_eq!(run.state, RunState::Done);
    assert_eq!(run.stats.created, 2);
    assert_eq!(run.stats.skipped, 1);
    assert_eq!(run.stats.failed, 0);
    assert_eq!(store.related_count(RelatedKind::Address), 2);
}

#[tokio::test]
async fn test_parent_lookup_failure_fails_run() {
    let store = MockStore::new();
    store.fail_parents_due();
    let run = service(&store, MockSourceFactory::standard(2))
        .run_phase(Phase::CreditCards)
        .await;

    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.stats.fetched, 0);
}

#[tokio::test]
async fn test_failing_parent_does_not_stop_run() {
    let store = MockStore::new();
    let sources = MockSourceFactory::standard(3).with(
        Phase::Addresses,
        ScriptedSource::new("addresses", |request, _| match request.parent {
            Some(2) => Err(AppError::ClientStatus {
                status: 404,
                url: "http://source.test/2".to_string(),
            }),
            Some(id) => Ok(SourcePage::last(vec![address_json(&format!("a-{}", id))])),
            None => Ok(SourcePage::default()),
        }),
    );
    let service = service(&store, sources);

    service.run_phase(Phase::Users).await;
    let run = service.run_phase(Phase::Addresses).await;

    assert_eq!(run.state, RunState::Done);
    assert_eq!(run.stats.created, 2);
    assert_eq!(run.stats.failed, 1);
}

#[tokio::test]
async fn test_failure_streak_does_not_stop_later_parents() {
    let store = MockStore::new();
    let addresses = ScriptedSource::new("addresses", |request, _| match request.parent {
        Some(id) if id <= 5 => Err(server_error()),
        Some(id) => Ok(SourcePage::last(vec![address_json(&format!("a-{}", id))])),
        None => Ok(SourcePage::default()),
    });
    let sources = MockSourceFactory::standard(8).with(Phase::Addresses, addresses.clone());
    let config = EnrichConfig::default().with_concurrency(1);
    let service =
        EnrichmentService::with_config(store.clone(), sources, RetryPolicy::none(), config);

    service.run_phase(Phase::Users).await;
    let run = service.run_phase(Phase::Addresses).await;

    assert_eq!(run.state, RunState::Done);
    assert_eq!(run.stats.failed, 5);
    assert_eq!(run.stats.created, 3);
    assert_eq!(run.stats.skipped, 0);
    assert_eq!(addresses.calls(), 8);
    assert_eq!(store.related_count(RelatedKind::Address), 3);
}

#[tokio::test]
async fn test_run_cycle_runs_phases_in_order() {
    let store = MockStore::new();
    let service = service(&store, MockSourceFactory::standard(3));

    let runs = service
        .run_cycle(&SilentReporter, CancellationToken::new())
        .await;

    let phases: Vec<Phase> = runs.iter().map(|r| r.phase).collect();
    assert_eq!(phases, Phase::ALL.to_vec());
    assert!(runs.iter().all(|r| r.is_done()));

    let stats = store.get_stats().await.unwrap();
    assert_eq!(stats.total_users, 3);
    assert_eq!(stats.total_addresses, 3);
    assert_eq!(stats.total_credit_cards, 3);
    assert_eq!(stats.address_coverage, 100.0);
    assert!(
        stats
            .phases
            .iter()
            .all(|p| p.last_successful_run.is_some())
    );
}

// =============================================================================
// Cancellation
// =============================================================================

/// Cancels the token as soon as the first page arrives.
struct CancelOnFirstPage {
    token: CancellationToken,
    events: Mutex<Vec<String>>,
}

impl ProgressReporter for CancelOnFirstPage {
    fn report(&self, event: EnrichEvent<'_>) {
        if let EnrichEvent::PageFetched { .. } = event {
            self.token.cancel();
        }
        self.events.lock().unwrap().push(format!("{:?}", event));
    }
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let store = MockStore::new();
    let token = CancellationToken::new();
    token.cancel();

    let run = service(&store, MockSourceFactory::standard(3))
        .run_phase_with_progress(Phase::Users, &SilentReporter, token)
        .await;

    assert_eq!(run.state, RunState::Cancelled);
    assert_eq!(run.stats.fetched, 0);
    assert_eq!(store.runs().len(), 1);
}

#[tokio::test]
async fn test_cancellation_stops_between_records() {
    let store = MockStore::new();
    let token = CancellationToken::new();
    let reporter = CancelOnFirstPage {
        token: token.clone(),
        events: Mutex::new(Vec::new()),
    };

    let run = service(&store, MockSourceFactory::standard(5))
        .run_phase_with_progress(Phase::Users, &reporter, token)
        .await;

    assert!(run.is_cancelled());
    assert_eq!(run.stats.fetched, 5);
    assert_eq!(run.stats.created, 0);
    assert_eq!(store.user_count(), 0);

    let events = reporter.events.lock().unwrap();
    assert!(events.first().unwrap().starts_with("PhaseStarted"));
    assert!(events.last().unwrap().starts_with("PhaseFinished"));
}
