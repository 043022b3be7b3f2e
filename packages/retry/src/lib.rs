#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Retry helpers for transient errors.
//!
//! Every network call that may hit throttling or a flaky connection goes
//! through [`retry`] with an explicit [`RetryPolicy`] instead of a
//! hand-written sleep loop. The error type decides which failures are
//! worth another attempt by implementing [`Retryable`].
//!
//! # Usage
//!
//! ```ignore
//! use replicator_retry::{retry, RetryPolicy};
//!
//! let policy = RetryPolicy::transfer();
//! let bytes = retry(&policy, "download part 3", |_attempt| source.fetch(&range)).await?;
//! ```

use std::future::Future;
use std::time::Duration;

/// Classifies an error as worth retrying or not.
pub trait Retryable {
    /// Returns `true` if the operation may succeed when attempted again
    /// (throttling, timeouts, connection resets, server errors).
    fn is_retryable(&self) -> bool;
}

/// Bounded exponential backoff.
///
/// The delay before retry `n` (0-based) is
/// `min(base_delay * 2^n, max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Part downloads and uploads: 5 attempts, `min(2^n, 10)` seconds.
    #[must_use]
    pub const fn transfer() -> Self {
        Self::new(5, Duration::from_secs(1), Duration::from_secs(10))
    }

    /// Job submission: 10 attempts, `2^n` seconds capped at one minute.
    #[must_use]
    pub const fn submission() -> Self {
        Self::new(10, Duration::from_secs(1), Duration::from_secs(60))
    }

    /// Polling an empty results queue: a flat 10 second wait, up to one
    /// hour of consecutive empty polls.
    #[must_use]
    pub const fn queue_idle() -> Self {
        Self::new(360, Duration::from_secs(10), Duration::from_secs(10))
    }

    /// Retries without sleeping. Intended for tests.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Same backoff, different attempt ceiling.
    #[must_use]
    pub const fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    /// Delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::transfer()
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempt ceiling is reached.
///
/// `op` receives the 0-based attempt number. The last error is returned
/// when attempts are exhausted. A policy with `max_attempts == 0` still
/// makes one attempt.
///
/// # Errors
///
/// Returns the error of the final attempt, or the first non-retryable
/// error.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                let delay = policy.delay(attempt);
                log::warn!(
                    "{label}: attempt {}/{attempts} failed: {e}; retrying in {delay:?}...",
                    attempt + 1
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    log::error!("{label}: giving up after {attempts} attempts: {e}");
                }
                return Err(e);
            }
        }
    }
}
