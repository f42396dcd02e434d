//! Domain models for users and the records that enrich them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

// =============================================================================
// Phases
// =============================================================================

/// One of the independently scheduled enrichment phases.
///
/// `Users` fetches the base records; the other two attach related records to
/// users that already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Users,
    Addresses,
    CreditCards,
}

impl Phase {
    /// All phases in dependency order.
    pub const ALL: [Phase; 3] = [Phase::Users, Phase::Addresses, Phase::CreditCards];

    /// Returns the string representation for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Users => "users",
            Phase::Addresses => "addresses",
            Phase::CreditCards => "credit_cards",
        }
    }

    /// The related record type this phase produces, `None` for the base phase.
    pub fn related_kind(&self) -> Option<RelatedKind> {
        match self {
            Phase::Users => None,
            Phase::Addresses => Some(RelatedKind::Address),
            Phase::CreditCards => Some(RelatedKind::CreditCard),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "users" => Ok(Phase::Users),
            "addresses" => Ok(Phase::Addresses),
            "credit_cards" => Ok(Phase::CreditCards),
            _ => Err(AppError::ConfigError(format!(
                "Unknown phase: '{}'. Valid options: users, addresses, credit_cards",
                s
            ))),
        }
    }
}

/// Kind of record attached to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelatedKind {
    Address,
    CreditCard,
}

impl RelatedKind {
    /// Table holding records of this kind.
    pub fn table(&self) -> &'static str {
        match self {
            RelatedKind::Address => "addresses",
            RelatedKind::CreditCard => "credit_cards",
        }
    }
}

// =============================================================================
// Users
// =============================================================================

/// A stored user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    /// Surrogate key.
    pub id: i64,
    /// Identifier assigned by the upstream source. Unique.
    pub external_id: i64,
    pub name: String,
    pub username: String,
    pub email: String,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub company_name: Option<String>,
    pub company_catchphrase: Option<String>,
    pub company_bs: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A normalized user ready to be merged into the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub external_id: i64,
    pub name: String,
    pub username: String,
    pub email: String,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub company_name: Option<String>,
    pub company_catchphrase: Option<String>,
    pub company_bs: Option<String>,
}

/// Reference to a stored user, used by the related phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct ParentRef {
    pub id: i64,
    pub external_id: i64,
}

// =============================================================================
// Related records
// =============================================================================

/// A stored address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Address {
    pub id: i64,
    pub user_id: i64,
    pub source_key: String,
    pub street_number: Option<String>,
    pub street_name: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub postal_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A normalized address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAddress {
    /// Upstream identity: the source `uid`, or a content hash when absent.
    pub source_key: String,
    pub street_number: Option<String>,
    pub street_name: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub postal_code: Option<String>,
}

/// A stored credit card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CreditCard {
    pub id: i64,
    pub user_id: i64,
    pub source_key: String,
    pub card_number: Option<String>,
    pub card_type: Option<String>,
    pub expiry_date: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A normalized credit card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCreditCard {
    pub source_key: String,
    pub card_number: Option<String>,
    pub card_type: Option<String>,
    pub expiry_date: Option<String>,
}

/// A related record of either kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelatedRecord {
    Address(NewAddress),
    CreditCard(NewCreditCard),
}

impl RelatedRecord {
    pub fn kind(&self) -> RelatedKind {
        match self {
            RelatedRecord::Address(_) => RelatedKind::Address,
            RelatedRecord::CreditCard(_) => RelatedKind::CreditCard,
        }
    }

    pub fn source_key(&self) -> &str {
        match self {
            RelatedRecord::Address(a) => &a.source_key,
            RelatedRecord::CreditCard(c) => &c.source_key,
        }
    }
}

/// Result of an atomic insert-or-update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

// =============================================================================
// Reporting
// =============================================================================

/// A user with every record attached to it.
#[derive(Debug, Clone, Serialize)]
pub struct UserWithRelations {
    pub user: User,
    pub addresses: Vec<Address>,
    pub credit_cards: Vec<CreditCard>,
}

/// A user listing row with related record counts.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UserSummary {
    pub external_id: i64,
    pub name: String,
    pub username: String,
    pub email: String,
    pub address_count: i64,
    pub credit_card_count: i64,
    pub updated_at: DateTime<Utc>,
}

/// Last known run of one phase.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseStatus {
    pub phase: Phase,
    pub last_successful_run: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
}

/// Aggregate counts for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub total_users: i64,
    pub total_addresses: i64,
    pub total_credit_cards: i64,
    pub users_with_addresses: i64,
    pub users_with_credit_cards: i64,
    pub users_with_both: i64,
    /// Percentage of users with at least one address, two decimals.
    pub address_coverage: f64,
    /// Percentage of users with at least one credit card, two decimals.
    pub credit_card_coverage: f64,
    pub last_update: Option<DateTime<Utc>>,
    pub phases: Vec<PhaseStatus>,
}

/// Returns `part / total` as a percentage rounded to two decimals, 0 for an
/// empty store.
pub fn coverage_percent(part: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    let pct = part as f64 / total as f64 * 100.0;
    (pct * 100.0).round() / 100.0
}
