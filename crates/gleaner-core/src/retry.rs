//! Bounded exponential backoff for remote calls.
//!
//! [`RetryPolicy::execute`] wraps any fallible async operation. Errors for
//! which [`AppError::is_retryable`] is false are returned immediately; the
//! rest are retried until `max_attempts` is reached, after which
//! [`AppError::RetryExhausted`] carries the last failure.
//!
//! The delay before attempt `n` (n ≥ 2) is
//! `min(base_delay * multiplier^(n-2), max_delay)`, scaled by a random factor
//! in `[1 - jitter, 1 + jitter]`. Sleeping goes through `tokio::time`, so
//! tests pause the runtime clock and observe delays deterministically.
//!
//! # Example
//!
//! ```ignore
//! let policy = RetryPolicy::default();
//! let page = policy
//!     .execute("users", || source.fetch_page(&request))
//!     .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::AppError;

/// Retry configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Upper bound for the un-jittered delay.
    pub max_delay: Duration,
    /// Fraction of the delay to randomize, 0 disables jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy from environment variables with fallback to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: env_parse("RETRY_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
            base_delay: env_parse("RETRY_BASE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            multiplier: env_parse("RETRY_MULTIPLIER").unwrap_or(defaults.multiplier),
            max_delay: env_parse("RETRY_MAX_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            jitter: env_parse("RETRY_JITTER").unwrap_or(defaults.jitter),
        }
        .normalized()
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set the maximum number of attempts (at least 1).
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the jitter fraction, clamped to `[0, 1]`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    fn normalized(mut self) -> Self {
        self.max_attempts = self.max_attempts.max(1);
        self.jitter = self.jitter.clamp(0.0, 1.0);
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            self.multiplier = 1.0;
        }
        self
    }

    /// Un-jittered delay before `attempt` (1-based). Zero for the first attempt.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Delay before `attempt` with jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for_attempt(attempt);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        delay.mul_f64(factor)
    }

    /// Runs `operation` until it succeeds, fails fatally, or attempts run out.
    ///
    /// `label` names the operation in the per-attempt log events.
    pub async fn execute<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(value) => {
                    debug!(operation = label, attempt, outcome = "success", "Attempt finished");
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => {
                    warn!(operation = label, attempt, outcome = "fatal", error = %e, "Attempt failed");
                    return Err(e);
                }
                Err(e) if attempt >= max_attempts => {
                    warn!(operation = label, attempt, outcome = "exhausted", error = %e, "Attempt failed");
                    return Err(AppError::RetryExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.delay_for_attempt(attempt + 1);
                    warn!(
                        operation = label,
                        attempt,
                        outcome = "retry",
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
