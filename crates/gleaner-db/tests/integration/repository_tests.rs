//! Integration tests for EntityRepository.
//!
//! Each test runs against its own PostgreSQL container.

use chrono::{TimeDelta, Utc};
use gleaner_core::error::AppError;
use gleaner_core::models::{Phase, RelatedKind, UpsertOutcome};
use gleaner_core::stats::{RunState, TaskRun};
use gleaner_db::{EntityRepository, init_schema};

use crate::integration::common::{
    sample_address, sample_card, sample_user, setup_test_db,
};

#[tokio::test]
async fn test_upsert_user_creates_then_updates() {
    let (pool, _container) = setup_test_db().await;
    let repo = EntityRepository::new(pool);

    let user = sample_user(1);
    assert_eq!(repo.upsert_user(&user).await.unwrap(), UpsertOutcome::Created);
    let first = repo.get_user_with_relations(1).await.unwrap().unwrap().user;

    let mut renamed = user.clone();
    renamed.name = "Leanne Graham".to_string();
    assert_eq!(
        repo.upsert_user(&renamed).await.unwrap(),
        UpsertOutcome::Updated
    );
    let second = repo.get_user_with_relations(1).await.unwrap().unwrap().user;

    assert_eq!(second.id, first.id);
    assert_eq!(second.name, "Leanne Graham");
    assert_eq!(second.created_at, first.created_at);
    assert!(second.updated_at > first.updated_at);
    assert_eq!(repo.get_stats().await.unwrap().total_users, 1);
}

#[tokio::test]
async fn test_upsert_user_keeps_optional_fields_when_missing() {
    let (pool, _container) = setup_test_db().await;
    let repo = EntityRepository::new(pool);

    repo.upsert_user(&sample_user(7)).await.unwrap();

    let mut partial = sample_user(7);
    partial.phone = None;
    partial.company_name = None;
    repo.upsert_user(&partial).await.unwrap();

    let stored = repo.get_user_with_relations(7).await.unwrap().unwrap().user;
    assert_eq!(stored.phone.as_deref(), Some("1-770-736-8031"));
    assert_eq!(stored.company_name.as_deref(), Some("Acme"));
}

#[tokio::test]
async fn test_updated_at_advances_on_every_merge() {
    let (pool, _container) = setup_test_db().await;
    let repo = EntityRepository::new(pool);
    let user = sample_user(3);

    let mut previous = None;
    for _ in 0..5 {
        repo.upsert_user(&user).await.unwrap();
        let updated_at = repo
            .get_user_with_relations(3)
            .await
            .unwrap()
            .unwrap()
            .user
            .updated_at;
        if let Some(previous) = previous {
            assert!(updated_at > previous);
        }
        previous = Some(updated_at);
    }
}

#[tokio::test]
async fn test_concurrent_upserts_of_same_user() {
    let (pool, _container) = setup_test_db().await;
    let repo = EntityRepository::new(pool);
    let user = sample_user(11);

    let (a, b) = tokio::join!(repo.upsert_user(&user), repo.upsert_user(&user));
    let mut outcomes = vec![a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|o| *o == UpsertOutcome::Updated);

    assert_eq!(outcomes, vec![UpsertOutcome::Created, UpsertOutcome::Updated]);
    assert_eq!(repo.get_stats().await.unwrap().total_users, 1);
}

#[tokio::test]
async fn test_related_record_for_missing_parent() {
    let (pool, _container) = setup_test_db().await;
    let repo = EntityRepository::new(pool);

    let result = repo.upsert_related(99, &sample_address("addr-1")).await;
    assert!(matches!(result, Err(AppError::ParentNotFound(99))));
    assert_eq!(repo.get_stats().await.unwrap().total_addresses, 0);
}

#[tokio::test]
async fn test_related_record_is_idempotent() {
    let (pool, _container) = setup_test_db().await;
    let repo = EntityRepository::new(pool);
    repo.upsert_user(&sample_user(1)).await.unwrap();

    let address = sample_address("addr-1");
    assert_eq!(
        repo.upsert_related(1, &address).await.unwrap(),
        UpsertOutcome::Created
    );
    assert_eq!(
        repo.upsert_related(1, &address).await.unwrap(),
        UpsertOutcome::Updated
    );

    let user = repo.get_user_with_relations(1).await.unwrap().unwrap();
    assert_eq!(user.addresses.len(), 1);
    assert_eq!(user.addresses[0].source_key, "addr-1");
    assert_eq!(user.addresses[0].user_id, user.user.id);
    assert!(user.addresses[0].updated_at > user.addresses[0].created_at);
}

#[tokio::test]
async fn test_related_record_ownership_is_fixed() {
    let (pool, _container) = setup_test_db().await;
    let repo = EntityRepository::new(pool);
    repo.upsert_user(&sample_user(1)).await.unwrap();
    repo.upsert_user(&sample_user(2)).await.unwrap();

    repo.upsert_related(1, &sample_card("card-1")).await.unwrap();
    repo.upsert_related(2, &sample_card("card-1")).await.unwrap();

    let first = repo.get_user_with_relations(1).await.unwrap().unwrap();
    let second = repo.get_user_with_relations(2).await.unwrap().unwrap();
    assert_eq!(first.credit_cards.len(), 1);
    assert!(second.credit_cards.is_empty());
}

#[tokio::test]
async fn test_user_with_related_records_cannot_be_deleted() {
    let (pool, _container) = setup_test_db().await;
    let repo = EntityRepository::new(pool.clone());
    repo.upsert_user(&sample_user(1)).await.unwrap();
    repo.upsert_related(1, &sample_address("addr-1")).await.unwrap();

    let result = sqlx::query("DELETE FROM users WHERE external_id = 1")
        .execute(&pool)
        .await;
    match result {
        Err(sqlx::Error::Database(e)) => assert!(e.is_foreign_key_violation()),
        other => panic!("expected foreign key violation, got {:?}", other),
    }
    assert!(repo.get_user_with_relations(1).await.unwrap().is_some());
}

#[tokio::test]
async fn test_parents_due() {
    let (pool, _container) = setup_test_db().await;
    let repo = EntityRepository::new(pool);
    for id in [3, 1, 2] {
        repo.upsert_user(&sample_user(id)).await.unwrap();
    }
    repo.upsert_related(2, &sample_address("addr-2")).await.unwrap();

    let hour_ago = Utc::now() - TimeDelta::hours(1);
    let due: Vec<i64> = repo
        .parents_due(RelatedKind::Address, hour_ago)
        .await
        .unwrap()
        .iter()
        .map(|p| p.external_id)
        .collect();
    assert_eq!(due, vec![1, 3]);

    // Everything is stale against a future cutoff.
    let in_an_hour = Utc::now() + TimeDelta::hours(1);
    let due = repo
        .parents_due(RelatedKind::Address, in_an_hour)
        .await
        .unwrap();
    assert_eq!(due.len(), 3);

    // Addresses do not count for credit cards.
    let due = repo
        .parents_due(RelatedKind::CreditCard, hour_ago)
        .await
        .unwrap();
    assert_eq!(due.len(), 3);
}

#[tokio::test]
async fn test_stats_and_coverage() {
    let (pool, _container) = setup_test_db().await;
    let repo = EntityRepository::new(pool);

    let empty = repo.get_stats().await.unwrap();
    assert_eq!(empty.total_users, 0);
    assert_eq!(empty.address_coverage, 0.0);
    assert!(empty.last_update.is_none());

    for id in 1..=4 {
        repo.upsert_user(&sample_user(id)).await.unwrap();
    }
    repo.upsert_related(1, &sample_address("addr-1")).await.unwrap();
    repo.upsert_related(2, &sample_address("addr-2")).await.unwrap();
    repo.upsert_related(2, &sample_address("addr-2b")).await.unwrap();
    repo.upsert_related(2, &sample_card("card-2")).await.unwrap();

    let stats = repo.get_stats().await.unwrap();
    assert_eq!(stats.total_users, 4);
    assert_eq!(stats.total_addresses, 3);
    assert_eq!(stats.total_credit_cards, 1);
    assert_eq!(stats.users_with_addresses, 2);
    assert_eq!(stats.users_with_credit_cards, 1);
    assert_eq!(stats.users_with_both, 1);
    assert_eq!(stats.address_coverage, 50.0);
    assert_eq!(stats.credit_card_coverage, 25.0);
    assert!(stats.last_update.is_some());

    let users = repo.list_users(10, 0).await.unwrap();
    assert_eq!(users.len(), 4);
    assert_eq!(users[1].external_id, 2);
    assert_eq!(users[1].address_count, 2);
    assert_eq!(users[1].credit_card_count, 1);

    let page = repo.list_users(2, 2).await.unwrap();
    assert_eq!(
        page.iter().map(|u| u.external_id).collect::<Vec<_>>(),
        vec![3, 4]
    );
}

#[tokio::test]
async fn test_record_run_tracks_last_success() {
    let (pool, _container) = setup_test_db().await;
    let repo = EntityRepository::new(pool);

    let mut done = TaskRun::start(Phase::Users);
    done.finish(RunState::Done);
    repo.record_run(&done).await.unwrap();

    let mut failed = TaskRun::start(Phase::Users);
    failed.fail("connection refused");
    repo.record_run(&failed).await.unwrap();

    let stats = repo.get_stats().await.unwrap();
    let users = stats
        .phases
        .iter()
        .find(|p| p.phase == Phase::Users)
        .unwrap();
    assert_eq!(users.last_status.as_deref(), Some("failed"));
    assert!(users.last_successful_run.is_some());
    assert!(users.last_run_at >= users.last_successful_run);

    let addresses = stats
        .phases
        .iter()
        .find(|p| p.phase == Phase::Addresses)
        .unwrap();
    assert!(addresses.last_run_at.is_none());
}

#[tokio::test]
async fn test_schema_is_idempotent() {
    let (pool, _container) = setup_test_db().await;
    init_schema(&pool).await.unwrap();

    let repo = EntityRepository::new(pool);
    repo.health_check().await.unwrap();
}

#[tokio::test]
async fn test_unknown_user() {
    let (pool, _container) = setup_test_db().await;
    let repo = EntityRepository::new(pool);
    assert!(repo.get_user_with_relations(404).await.unwrap().is_none());
}
