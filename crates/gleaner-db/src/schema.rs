//! Database schema.
//!
//! Identity is the upstream identifier: `users.external_id` and the related
//! tables' `source_key` are unique, so every write is an atomic
//! insert-or-update keyed on them. Related records reference their user with
//! `ON DELETE RESTRICT`: a user with enrichment cannot be deleted.

use gleaner_core::error::AppError;
use sqlx::PgPool;
use tracing::info;

/// Schema statements, executed one by one.
pub const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS users (
        id BIGSERIAL PRIMARY KEY,
        external_id BIGINT NOT NULL,
        name TEXT NOT NULL,
        username TEXT NOT NULL,
        email TEXT NOT NULL,
        phone TEXT,
        website TEXT,
        company_name TEXT,
        company_catchphrase TEXT,
        company_bs TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT uk_users_external_id UNIQUE (external_id),
        CONSTRAINT ck_users_timestamps CHECK (updated_at >= created_at)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS addresses (
        id BIGSERIAL PRIMARY KEY,
        user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE RESTRICT,
        source_key VARCHAR NOT NULL,
        street_number TEXT,
        street_name TEXT,
        city TEXT,
        state TEXT,
        country TEXT,
        postal_code TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT uk_addresses_source_key UNIQUE (source_key),
        CONSTRAINT ck_addresses_timestamps CHECK (updated_at >= created_at)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_addresses_user ON addresses(user_id, updated_at DESC)",
    r#"CREATE TABLE IF NOT EXISTS credit_cards (
        id BIGSERIAL PRIMARY KEY,
        user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE RESTRICT,
        source_key VARCHAR NOT NULL,
        card_number TEXT,
        card_type TEXT,
        expiry_date TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT uk_credit_cards_source_key UNIQUE (source_key),
        CONSTRAINT ck_credit_cards_timestamps CHECK (updated_at >= created_at)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_credit_cards_user ON credit_cards(user_id, updated_at DESC)",
    r#"CREATE TABLE IF NOT EXISTS phase_runs (
        phase VARCHAR PRIMARY KEY,
        last_run_at TIMESTAMPTZ NOT NULL,
        last_successful_run TIMESTAMPTZ,
        last_status VARCHAR NOT NULL,
        last_stats JSONB,
        last_error TEXT,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS enrichment_jobs (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        phase VARCHAR NOT NULL,
        status VARCHAR NOT NULL DEFAULT 'pending',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        started_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        error_message TEXT,
        run_stats JSONB,
        worker_id VARCHAR,
        trigger VARCHAR NOT NULL DEFAULT 'scheduler'
    )"#,
    // At most one active job per phase.
    r#"CREATE UNIQUE INDEX IF NOT EXISTS uq_enrichment_jobs_active_phase
        ON enrichment_jobs(phase) WHERE status IN ('pending', 'running')"#,
    r#"CREATE INDEX IF NOT EXISTS idx_enrichment_jobs_pending
        ON enrichment_jobs(created_at) WHERE status = 'pending'"#,
];

/// Creates every table and index that does not exist yet.
pub async fn init_schema(pool: &PgPool) -> Result<(), AppError> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!(statements = SCHEMA.len(), "Schema initialized");
    Ok(())
}
