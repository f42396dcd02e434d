//! Configuration types for Gleaner components.
//!
//! Every struct has a `Default` and a `from_env()` that falls back to the
//! default for each unset or unparsable variable.

use std::time::Duration;

use crate::models::Phase;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self { max_connections: 5 }
    }
}

impl DbConfig {
    pub fn from_env() -> Self {
        Self {
            max_connections: env_parse("DB_MAX_CONNECTIONS").unwrap_or(5),
        }
    }
}

/// HTTP client configuration for remote sources.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

impl HttpConfig {
    pub fn from_env() -> Self {
        Self {
            timeout: env_parse("HTTP_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(10)),
        }
    }
}

/// Trigger interval of each phase.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleConfig {
    pub users: Duration,
    pub addresses: Duration,
    pub credit_cards: Duration,
    /// Running jobs without a heartbeat for this long are assumed orphaned.
    pub stale_job_timeout: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            users: Duration::from_secs(300),
            addresses: Duration::from_secs(600),
            credit_cards: Duration::from_secs(900),
            stale_job_timeout: Duration::from_secs(3600),
        }
    }
}

impl ScheduleConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |key: &str, fallback: Duration| {
            env_parse::<u64>(key)
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };
        Self {
            users: secs("USERS_INTERVAL_SECS", defaults.users),
            addresses: secs("ADDRESSES_INTERVAL_SECS", defaults.addresses),
            credit_cards: secs("CREDIT_CARDS_INTERVAL_SECS", defaults.credit_cards),
            stale_job_timeout: secs("STALE_JOB_TIMEOUT_SECS", defaults.stale_job_timeout),
        }
    }

    pub fn interval_for(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Users => self.users,
            Phase::Addresses => self.addresses,
            Phase::CreditCards => self.credit_cards,
        }
    }
}

/// Phase run configuration.
#[derive(Debug, Clone)]
pub struct EnrichConfig {
    /// Parents fetched concurrently by a related phase.
    pub concurrency: usize,
    /// Page size for paged listings, `None` to fetch a listing in one request.
    pub page_size: Option<u32>,
    /// Upper bound on pages fetched by one paged run.
    pub max_pages: u32,
    /// Related records older than this are fetched again.
    pub refresh_after: Duration,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            page_size: None,
            max_pages: 1000,
            refresh_after: Duration::from_secs(24 * 3600),
        }
    }
}

impl EnrichConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            concurrency: env_parse::<usize>("ENRICH_CONCURRENCY")
                .unwrap_or(defaults.concurrency)
                .max(1),
            page_size: env_parse::<u32>("PAGE_SIZE").filter(|n| *n > 0),
            max_pages: env_parse::<u32>("MAX_PAGES")
                .unwrap_or(defaults.max_pages)
                .max(1),
            refresh_after: env_parse("REFRESH_AFTER_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.refresh_after),
        }
    }

    /// Set the fetch concurrency (at least 1).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = Some(size.max(1));
        self
    }

    /// Set the page cap (at least 1).
    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub fn with_refresh_after(mut self, refresh_after: Duration) -> Self {
        self.refresh_after = refresh_after;
        self
    }
}

pub const DEFAULT_USERS_URL: &str = "https://jsonplaceholder.typicode.com/users";
pub const DEFAULT_ADDRESSES_URL: &str = "https://random-data-api.com/api/address/random_address";
pub const DEFAULT_CREDIT_CARDS_URL: &str =
    "https://random-data-api.com/api/business_credit_card/random_card";

/// Endpoint of each phase.
///
/// Related endpoints may contain a `{parent_id}` placeholder that is replaced
/// with the user's external id.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceConfig {
    pub users_url: String,
    pub addresses_url: String,
    pub credit_cards_url: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            users_url: DEFAULT_USERS_URL.to_string(),
            addresses_url: DEFAULT_ADDRESSES_URL.to_string(),
            credit_cards_url: DEFAULT_CREDIT_CARDS_URL.to_string(),
        }
    }
}

impl SourceConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            users_url: std::env::var("USERS_SOURCE_URL").unwrap_or(defaults.users_url),
            addresses_url: std::env::var("ADDRESSES_SOURCE_URL").unwrap_or(defaults.addresses_url),
            credit_cards_url: std::env::var("CREDIT_CARDS_SOURCE_URL")
                .unwrap_or(defaults.credit_cards_url),
        }
    }

    pub fn url_for(&self, phase: Phase) -> &str {
        match phase {
            Phase::Users => &self.users_url,
            Phase::Addresses => &self.addresses_url,
            Phase::CreditCards => &self.credit_cards_url,
        }
    }
}
