//! User and related record repository for PostgreSQL.
//!
//! Every write is a single atomic insert-or-update keyed on the upstream
//! identity, committed in its own transaction. Two workers merging the same
//! record both succeed: PostgreSQL serializes them on the unique key and the
//! later one becomes an update. A unique violation that slips through
//! (e.g. a concurrent insert under a different plan) is retried once as a
//! plain update before surfacing as [`AppError::PersistenceConflict`].
//!
//! `updated_at` strictly advances on every merge, even when two merges land
//! within the same clock tick.

use gleaner_core::error::AppError;
use gleaner_core::models::{
    Address, CreditCard, DatabaseStats, NewAddress, NewCreditCard, NewUser, ParentRef, Phase,
    PhaseStatus, RelatedKind, RelatedRecord, UpsertOutcome, User, UserSummary, UserWithRelations,
    coverage_percent,
};
use gleaner_core::stats::{RunState, TaskRun};
use gleaner_core::traits::EntityStore;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgArguments;
use sqlx::query::QueryAs;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres};
use tracing::{debug, warn};

/// Column lists for SELECT queries. Must remain const literals.
const USER_COLUMNS: &str = "id, external_id, name, username, email, phone, website, company_name, company_catchphrase, company_bs, created_at, updated_at";
const ADDRESS_COLUMNS: &str = "id, user_id, source_key, street_number, street_name, city, state, country, postal_code, created_at, updated_at";
const CREDIT_CARD_COLUMNS: &str = "id, user_id, source_key, card_number, card_type, expiry_date, created_at, updated_at";

// Required columns are overwritten; optional ones keep the stored value when
// the incoming one is missing.
const UPSERT_USER: &str = r#"
    INSERT INTO users (external_id, name, username, email, phone, website,
                       company_name, company_catchphrase, company_bs, created_at, updated_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), NOW())
    ON CONFLICT (external_id)
    DO UPDATE SET
        name = EXCLUDED.name,
        username = EXCLUDED.username,
        email = EXCLUDED.email,
        phone = COALESCE(EXCLUDED.phone, users.phone),
        website = COALESCE(EXCLUDED.website, users.website),
        company_name = COALESCE(EXCLUDED.company_name, users.company_name),
        company_catchphrase = COALESCE(EXCLUDED.company_catchphrase, users.company_catchphrase),
        company_bs = COALESCE(EXCLUDED.company_bs, users.company_bs),
        updated_at = GREATEST(NOW(), users.updated_at + interval '1 microsecond')
    RETURNING (xmax = 0) AS inserted
"#;

const UPDATE_USER: &str = r#"
    UPDATE users SET
        name = $2,
        username = $3,
        email = $4,
        phone = COALESCE($5, phone),
        website = COALESCE($6, website),
        company_name = COALESCE($7, company_name),
        company_catchphrase = COALESCE($8, company_catchphrase),
        company_bs = COALESCE($9, company_bs),
        updated_at = GREATEST(NOW(), updated_at + interval '1 microsecond')
    WHERE external_id = $1
    RETURNING false AS inserted
"#;

// Ownership is fixed at insert: user_id is never rewritten on conflict.
const UPSERT_ADDRESS: &str = r#"
    INSERT INTO addresses (user_id, source_key, street_number, street_name, city,
                           state, country, postal_code, created_at, updated_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), NOW())
    ON CONFLICT (source_key)
    DO UPDATE SET
        street_number = COALESCE(EXCLUDED.street_number, addresses.street_number),
        street_name = COALESCE(EXCLUDED.street_name, addresses.street_name),
        city = COALESCE(EXCLUDED.city, addresses.city),
        state = COALESCE(EXCLUDED.state, addresses.state),
        country = COALESCE(EXCLUDED.country, addresses.country),
        postal_code = COALESCE(EXCLUDED.postal_code, addresses.postal_code),
        updated_at = GREATEST(NOW(), addresses.updated_at + interval '1 microsecond')
    RETURNING (xmax = 0) AS inserted
"#;

const UPDATE_ADDRESS: &str = r#"
    UPDATE addresses SET
        street_number = COALESCE($3, street_number),
        street_name = COALESCE($4, street_name),
        city = COALESCE($5, city),
        state = COALESCE($6, state),
        country = COALESCE($7, country),
        postal_code = COALESCE($8, postal_code),
        updated_at = GREATEST(NOW(), updated_at + interval '1 microsecond')
    WHERE source_key = $2 AND user_id = $1
    RETURNING false AS inserted
"#;

const UPSERT_CREDIT_CARD: &str = r#"
    INSERT INTO credit_cards (user_id, source_key, card_number, card_type, expiry_date,
                              created_at, updated_at)
    VALUES ($1, $2, $3, $4, $5, NOW(), NOW())
    ON CONFLICT (source_key)
    DO UPDATE SET
        card_number = COALESCE(EXCLUDED.card_number, credit_cards.card_number),
        card_type = COALESCE(EXCLUDED.card_type, credit_cards.card_type),
        expiry_date = COALESCE(EXCLUDED.expiry_date, credit_cards.expiry_date),
        updated_at = GREATEST(NOW(), credit_cards.updated_at + interval '1 microsecond')
    RETURNING (xmax = 0) AS inserted
"#;

const UPDATE_CREDIT_CARD: &str = r#"
    UPDATE credit_cards SET
        card_number = COALESCE($3, card_number),
        card_type = COALESCE($4, card_type),
        expiry_date = COALESCE($5, expiry_date),
        updated_at = GREATEST(NOW(), updated_at + interval '1 microsecond')
    WHERE source_key = $2 AND user_id = $1
    RETURNING false AS inserted
"#;

const PARENTS_DUE_ADDRESSES: &str = r#"
    SELECT u.id, u.external_id
    FROM users u
    LEFT JOIN (
        SELECT user_id, MAX(updated_at) AS newest FROM addresses GROUP BY user_id
    ) r ON r.user_id = u.id
    WHERE r.newest IS NULL OR r.newest < $1
    ORDER BY u.external_id
"#;

const PARENTS_DUE_CREDIT_CARDS: &str = r#"
    SELECT u.id, u.external_id
    FROM users u
    LEFT JOIN (
        SELECT user_id, MAX(updated_at) AS newest FROM credit_cards GROUP BY user_id
    ) r ON r.user_id = u.id
    WHERE r.newest IS NULL OR r.newest < $1
    ORDER BY u.external_id
"#;

type UpsertQuery<'q> = QueryAs<'q, Postgres, UpsertRow, PgArguments>;

/// Repository for users and their related records.
///
/// # Examples
///
/// ```no_run
/// use sqlx::postgres::PgPoolOptions;
/// use gleaner_db::EntityRepository;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = PgPoolOptions::new()
///     .max_connections(5)
///     .connect("postgresql://localhost/gleaner")
///     .await?;
///
/// let repo = EntityRepository::new(pool);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct EntityRepository {
    pool: PgPool,
}

impl EntityRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Inserts a user or merges it into the stored one.
    pub async fn upsert_user(&self, user: &NewUser) -> Result<UpsertOutcome, AppError> {
        let mut tx = self.pool.begin().await.map_err(AppError::DatabaseError)?;

        let result = bind_user(sqlx::query_as(UPSERT_USER), user)
            .fetch_one(&mut *tx)
            .await;

        match result {
            Ok(row) => {
                tx.commit().await.map_err(AppError::DatabaseError)?;
                Ok(row.outcome())
            }
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await.map_err(AppError::DatabaseError)?;
                debug!(external_id = user.external_id, "Unique race on user, retrying as update");
                let row = bind_user(sqlx::query_as(UPDATE_USER), user)
                    .fetch_optional(&self.pool)
                    .await;
                resolve_retry(row, || format!("users.external_id={}", user.external_id))
            }
            Err(e) => Err(AppError::DatabaseError(e)),
        }
    }

    /// Inserts a related record or merges it into the stored one.
    ///
    /// The parent row is share-locked for the duration of the transaction, so
    /// it cannot disappear between the lookup and the write.
    pub async fn upsert_related(
        &self,
        parent_external_id: i64,
        record: &RelatedRecord,
    ) -> Result<UpsertOutcome, AppError> {
        let mut tx = self.pool.begin().await.map_err(AppError::DatabaseError)?;

        let user_id: Option<i64> =
            sqlx::query_scalar("SELECT id FROM users WHERE external_id = $1 FOR SHARE")
                .bind(parent_external_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(AppError::DatabaseError)?;

        let Some(user_id) = user_id else {
            return Err(AppError::ParentNotFound(parent_external_id));
        };

        let result = related_query(record, user_id, false)
            .fetch_one(&mut *tx)
            .await;

        match result {
            Ok(row) => {
                tx.commit().await.map_err(AppError::DatabaseError)?;
                Ok(row.outcome())
            }
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await.map_err(AppError::DatabaseError)?;
                debug!(
                    source_key = record.source_key(),
                    "Unique race on related record, retrying as update"
                );
                let row = related_query(record, user_id, true)
                    .fetch_optional(&self.pool)
                    .await;
                resolve_retry(row, || {
                    format!("{}.source_key={}", record.kind().table(), record.source_key())
                })
            }
            Err(e) => Err(AppError::DatabaseError(e)),
        }
    }

    /// Users missing a record of `kind`, or whose newest one predates
    /// `refresh_before`.
    pub async fn parents_due(
        &self,
        kind: RelatedKind,
        refresh_before: DateTime<Utc>,
    ) -> Result<Vec<ParentRef>, AppError> {
        let query = match kind {
            RelatedKind::Address => PARENTS_DUE_ADDRESSES,
            RelatedKind::CreditCard => PARENTS_DUE_CREDIT_CARDS,
        };

        let parents: Vec<ParentRef> = sqlx::query_as(query)
            .bind(refresh_before)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        debug!(table = kind.table(), count = parents.len(), "Parents due");
        Ok(parents)
    }

    /// Upserts the phase run status row.
    ///
    /// `last_successful_run` only moves for runs that finished `done`.
    pub async fn record_run(&self, run: &TaskRun) -> Result<(), AppError> {
        let run_at = run.finished_at.unwrap_or(run.started_at);

        sqlx::query(
            r#"
            INSERT INTO phase_runs (phase, last_run_at, last_successful_run, last_status,
                                    last_stats, last_error, updated_at)
            VALUES ($1, $2, CASE WHEN $3 = 'done' THEN $2 ELSE NULL END, $3, $4, $5, NOW())
            ON CONFLICT (phase)
            DO UPDATE SET
                last_run_at = EXCLUDED.last_run_at,
                last_successful_run = CASE
                    WHEN EXCLUDED.last_status = 'done' THEN EXCLUDED.last_run_at
                    ELSE phase_runs.last_successful_run
                END,
                last_status = EXCLUDED.last_status,
                last_stats = EXCLUDED.last_stats,
                last_error = EXCLUDED.last_error,
                updated_at = NOW()
            "#,
        )
        .bind(run.phase.as_str())
        .bind(run_at)
        .bind(run.state.as_str())
        .bind(Json(&run.stats))
        .bind(run.error.as_deref())
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        if run.state != RunState::Done {
            warn!(phase = %run.phase, state = %run.state, "Recorded unsuccessful run");
        }
        Ok(())
    }

    /// Returns aggregated database statistics.
    pub async fn get_stats(&self) -> Result<DatabaseStats, AppError> {
        let row: StatsRow = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM users) AS total_users,
                (SELECT COUNT(*) FROM addresses) AS total_addresses,
                (SELECT COUNT(*) FROM credit_cards) AS total_credit_cards,
                (SELECT COUNT(DISTINCT user_id) FROM addresses) AS users_with_addresses,
                (SELECT COUNT(DISTINCT user_id) FROM credit_cards) AS users_with_credit_cards,
                (SELECT COUNT(*) FROM users u
                    WHERE EXISTS (SELECT 1 FROM addresses a WHERE a.user_id = u.id)
                      AND EXISTS (SELECT 1 FROM credit_cards c WHERE c.user_id = u.id)
                ) AS users_with_both,
                GREATEST(
                    (SELECT MAX(updated_at) FROM users),
                    (SELECT MAX(updated_at) FROM addresses),
                    (SELECT MAX(updated_at) FROM credit_cards)
                ) AS last_update
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        let runs: Vec<PhaseRunRow> = sqlx::query_as(
            "SELECT phase, last_run_at, last_successful_run, last_status FROM phase_runs",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        let phases = Phase::ALL
            .into_iter()
            .map(|phase| {
                let run = runs.iter().find(|r| r.phase == phase.as_str());
                PhaseStatus {
                    phase,
                    last_successful_run: run.and_then(|r| r.last_successful_run),
                    last_run_at: run.map(|r| r.last_run_at),
                    last_status: run.map(|r| r.last_status.clone()),
                }
            })
            .collect();

        let total_users = row.total_users.unwrap_or(0);
        let users_with_addresses = row.users_with_addresses.unwrap_or(0);
        let users_with_credit_cards = row.users_with_credit_cards.unwrap_or(0);

        Ok(DatabaseStats {
            total_users,
            total_addresses: row.total_addresses.unwrap_or(0),
            total_credit_cards: row.total_credit_cards.unwrap_or(0),
            users_with_addresses,
            users_with_credit_cards,
            users_with_both: row.users_with_both.unwrap_or(0),
            address_coverage: coverage_percent(users_with_addresses, total_users),
            credit_card_coverage: coverage_percent(users_with_credit_cards, total_users),
            last_update: row.last_update,
            phases,
        })
    }

    /// Loads a user by external id together with its related records.
    pub async fn get_user_with_relations(
        &self,
        external_id: i64,
    ) -> Result<Option<UserWithRelations>, AppError> {
        let query = format!("SELECT {} FROM users WHERE external_id = $1", USER_COLUMNS);
        let user: Option<User> = sqlx::query_as(&query)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        let Some(user) = user else {
            return Ok(None);
        };

        let query = format!(
            "SELECT {} FROM addresses WHERE user_id = $1 ORDER BY created_at, id",
            ADDRESS_COLUMNS
        );
        let addresses: Vec<Address> = sqlx::query_as(&query)
            .bind(user.id)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        let query = format!(
            "SELECT {} FROM credit_cards WHERE user_id = $1 ORDER BY created_at, id",
            CREDIT_CARD_COLUMNS
        );
        let credit_cards: Vec<CreditCard> = sqlx::query_as(&query)
            .bind(user.id)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        Ok(Some(UserWithRelations {
            user,
            addresses,
            credit_cards,
        }))
    }

    /// Lists users ordered by external id, with related record counts.
    pub async fn list_users(&self, limit: i64, offset: i64) -> Result<Vec<UserSummary>, AppError> {
        let users = sqlx::query_as::<_, UserSummary>(
            r#"
            SELECT
                u.external_id, u.name, u.username, u.email,
                (SELECT COUNT(*) FROM addresses a WHERE a.user_id = u.id) AS address_count,
                (SELECT COUNT(*) FROM credit_cards c WHERE c.user_id = u.id) AS credit_card_count,
                u.updated_at
            FROM users u
            ORDER BY u.external_id
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(users)
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        Ok(())
    }
}

fn bind_user<'q>(query: UpsertQuery<'q>, user: &'q NewUser) -> UpsertQuery<'q> {
    query
        .bind(user.external_id)
        .bind(user.name.as_str())
        .bind(user.username.as_str())
        .bind(user.email.as_str())
        .bind(user.phone.as_deref())
        .bind(user.website.as_deref())
        .bind(user.company_name.as_deref())
        .bind(user.company_catchphrase.as_deref())
        .bind(user.company_bs.as_deref())
}

fn bind_address<'q>(query: UpsertQuery<'q>, user_id: i64, address: &'q NewAddress) -> UpsertQuery<'q> {
    query
        .bind(user_id)
        .bind(address.source_key.as_str())
        .bind(address.street_number.as_deref())
        .bind(address.street_name.as_deref())
        .bind(address.city.as_deref())
        .bind(address.state.as_deref())
        .bind(address.country.as_deref())
        .bind(address.postal_code.as_deref())
}

fn bind_credit_card<'q>(
    query: UpsertQuery<'q>,
    user_id: i64,
    card: &'q NewCreditCard,
) -> UpsertQuery<'q> {
    query
        .bind(user_id)
        .bind(card.source_key.as_str())
        .bind(card.card_number.as_deref())
        .bind(card.card_type.as_deref())
        .bind(card.expiry_date.as_deref())
}

/// Builds the upsert, or the plain update used after a unique race.
fn related_query(record: &RelatedRecord, user_id: i64, update_only: bool) -> UpsertQuery<'_> {
    match record {
        RelatedRecord::Address(address) => {
            let sql = if update_only { UPDATE_ADDRESS } else { UPSERT_ADDRESS };
            bind_address(sqlx::query_as(sql), user_id, address)
        }
        RelatedRecord::CreditCard(card) => {
            let sql = if update_only {
                UPDATE_CREDIT_CARD
            } else {
                UPSERT_CREDIT_CARD
            };
            bind_credit_card(sqlx::query_as(sql), user_id, card)
        }
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Maps the outcome of the single update retry after a unique race.
fn resolve_retry(
    row: Result<Option<UpsertRow>, sqlx::Error>,
    key: impl FnOnce() -> String,
) -> Result<UpsertOutcome, AppError> {
    match row {
        Ok(Some(_)) => Ok(UpsertOutcome::Updated),
        Ok(None) => Err(AppError::PersistenceConflict(key())),
        Err(e) if is_unique_violation(&e) => Err(AppError::PersistenceConflict(key())),
        Err(e) => Err(AppError::DatabaseError(e)),
    }
}

/// Row returned by every upsert.
#[derive(Debug, sqlx::FromRow)]
struct UpsertRow {
    inserted: bool,
}

impl UpsertRow {
    fn outcome(&self) -> UpsertOutcome {
        if self.inserted {
            UpsertOutcome::Created
        } else {
            UpsertOutcome::Updated
        }
    }
}

/// Helper struct for deserializing stats query results
#[derive(sqlx::FromRow)]
struct StatsRow {
    total_users: Option<i64>,
    total_addresses: Option<i64>,
    total_credit_cards: Option<i64>,
    users_with_addresses: Option<i64>,
    users_with_credit_cards: Option<i64>,
    users_with_both: Option<i64>,
    last_update: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct PhaseRunRow {
    phase: String,
    last_run_at: DateTime<Utc>,
    last_successful_run: Option<DateTime<Utc>>,
    last_status: String,
}

// =============================================================================
// Trait Implementation: EntityStore
// =============================================================================

impl EntityStore for EntityRepository {
    async fn upsert_user(&self, user: &NewUser) -> Result<UpsertOutcome, AppError> {
        EntityRepository::upsert_user(self, user).await
    }

    async fn upsert_related(
        &self,
        parent_external_id: i64,
        record: &RelatedRecord,
    ) -> Result<UpsertOutcome, AppError> {
        EntityRepository::upsert_related(self, parent_external_id, record).await
    }

    async fn parents_due(
        &self,
        kind: RelatedKind,
        refresh_before: DateTime<Utc>,
    ) -> Result<Vec<ParentRef>, AppError> {
        EntityRepository::parents_due(self, kind, refresh_before).await
    }

    async fn record_run(&self, run: &TaskRun) -> Result<(), AppError> {
        EntityRepository::record_run(self, run).await
    }

    async fn get_stats(&self) -> Result<DatabaseStats, AppError> {
        EntityRepository::get_stats(self).await
    }

    async fn get_user_with_relations(
        &self,
        external_id: i64,
    ) -> Result<Option<UserWithRelations>, AppError> {
        EntityRepository::get_user_with_relations(self, external_id).await
    }

    async fn list_users(&self, limit: i64, offset: i64) -> Result<Vec<UserSummary>, AppError> {
        EntityRepository::list_users(self, limit, offset).await
    }

    async fn health_check(&self) -> Result<(), AppError> {
        EntityRepository::health_check(self).await
    }
}
