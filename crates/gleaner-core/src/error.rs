use thiserror::Error;
use uuid::Uuid;

/// Application-wide error types.
///
/// Variants fall into the categories the pipeline reacts to:
///
/// - **Transient source errors** ([`NetworkError`], [`Timeout`],
///   [`RateLimitExceeded`], [`ServerError`]) are retried by the
///   [`RetryPolicy`](crate::retry::RetryPolicy).
/// - **Fatal source errors** ([`ClientStatus`], [`SchemaReject`],
///   [`InvalidUrl`]) abort the current fetch immediately and are counted as an
///   item failure.
/// - [`RetryExhausted`] wraps the last transient error once all attempts are used.
/// - [`PersistenceConflict`] is a unique-constraint race that could not be
///   resolved by retrying as an update.
/// - [`DatabaseError`] covers everything sqlx reports. Connectivity failures
///   are classified by [`AppError::is_persistence_fatal`] and abort the run.
///
/// # Error Conversion
///
/// - `sqlx::Error` → `AppError::DatabaseError`
///
/// [`NetworkError`]: AppError::NetworkError
/// [`Timeout`]: AppError::Timeout
/// [`RateLimitExceeded`]: AppError::RateLimitExceeded
/// [`ServerError`]: AppError::ServerError
/// [`ClientStatus`]: AppError::ClientStatus
/// [`SchemaReject`]: AppError::SchemaReject
/// [`InvalidUrl`]: AppError::InvalidUrl
/// [`RetryExhausted`]: AppError::RetryExhausted
/// [`PersistenceConflict`]: AppError::PersistenceConflict
/// [`DatabaseError`]: AppError::DatabaseError
#[derive(Error, Debug)]
pub enum AppError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// Network or connection error while calling a remote source.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timeout.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// The remote source answered with HTTP 429.
    #[error("Rate limit exceeded. Please wait and try again.")]
    RateLimitExceeded,

    /// The remote source answered with a 5xx status.
    #[error("Server error: HTTP {status} from {url}")]
    ServerError { status: u16, url: String },

    /// The remote source answered with a non-retryable 4xx status.
    #[error("HTTP {status} from {url}")]
    ClientStatus { status: u16, url: String },

    /// A payload or a single record did not have the expected shape.
    #[error("Rejected record: {0}")]
    SchemaReject(String),

    /// All retry attempts failed. Carries the last underlying failure.
    #[error("Gave up after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Box<AppError> },

    /// A unique-constraint race that survived the retry-as-update.
    #[error("Unique constraint conflict: {0}")]
    PersistenceConflict(String),

    /// The parent user of a related record is not stored yet.
    #[error("Parent user not found: external id {0}")]
    ParentNotFound(i64),

    /// URL parsing failed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Job not found in the queue.
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl AppError {
    /// Returns a user-friendly error message suitable for CLI output.
    pub fn user_message(&self) -> String {
        match self {
            AppError::DatabaseError(_) if self.is_persistence_fatal() => {
                "Cannot connect to database. Is PostgreSQL running?\n   Check DATABASE_URL."
                    .to_string()
            }
            AppError::DatabaseError(e) => format!("Database error: {}", e),
            AppError::NetworkError(msg) => {
                format!("Network error: {}\n   Check your internet connection.", msg)
            }
            AppError::Timeout(secs) => {
                format!(
                    "Request timed out after {} seconds.\n   The source may be overloaded. Try again later.",
                    secs
                )
            }
            AppError::RateLimitExceeded => {
                "The source is rate limiting requests. The next scheduled run will retry."
                    .to_string()
            }
            AppError::RetryExhausted { attempts, last } => {
                format!(
                    "Gave up after {} attempts.\n   Last error: {}",
                    attempts,
                    last.user_message()
                )
            }
            AppError::ConfigError(msg) => {
                format!(
                    "Configuration error: {}\n   Check your environment variables.",
                    msg
                )
            }
            _ => self.to_string(),
        }
    }

    /// Returns true if the operation that produced this error may succeed when
    /// attempted again.
    ///
    /// # Examples
    ///
    /// ```
    /// use gleaner_core::error::AppError;
    ///
    /// assert!(AppError::NetworkError("connection reset".to_string()).is_retryable());
    /// assert!(AppError::ServerError { status: 503, url: "http://x".to_string() }.is_retryable());
    ///
    /// // 4xx responses abort immediately
    /// let err = AppError::ClientStatus { status: 404, url: "http://x".to_string() };
    /// assert!(!err.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::NetworkError(_)
                | AppError::Timeout(_)
                | AppError::RateLimitExceeded
                | AppError::ServerError { .. }
        )
    }

    /// Returns true if the store itself is unreachable.
    ///
    /// A run that hits such an error cannot make progress and is aborted;
    /// the next scheduled trigger retries the whole phase.
    pub fn is_persistence_fatal(&self) -> bool {
        match self {
            AppError::DatabaseError(e) => match e {
                sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::Protocol(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => true,
                // SQLSTATE class 08 (connection exception) and 57P01..57P03
                // (admin shutdown, crash shutdown, cannot connect now)
                sqlx::Error::Database(db) => db
                    .code()
                    .is_some_and(|code| code.starts_with("08") || code.starts_with("57P0")),
                _ => false,
            },
            _ => false,
        }
    }
}
