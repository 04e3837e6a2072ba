//! Bounded retry with exponential backoff for blocking collaborator calls.
//!
//! Only catalog queries and asset fetches go through here. Everything else
//! in the pipeline is deterministic and never retried.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::diagnostics::duration_serde;
use crate::types::PipelineError;

/// Retry budget and per-request timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first. Must be at least 1.
    pub max_attempts: u32,

    /// Delay before the second attempt (seconds in JSON).
    #[serde(with = "duration_serde")]
    pub initial_backoff: Duration,

    /// Upper bound on any single delay (seconds in JSON).
    #[serde(with = "duration_serde")]
    pub max_backoff: Duration,

    /// Timeout handed to the collaborator for each request (seconds in JSON).
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that tries once and never sleeps.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based): the initial
    /// backoff doubled per previous attempt, capped at `max_backoff`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1_u32 << doublings)
            .min(self.max_backoff)
    }

    /// Check the policy is usable.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] when `max_attempts` is zero.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_attempts == 0 {
            return Err(PipelineError::InvalidConfig(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Collaborator errors that can tell transient failures from permanent ones.
pub trait Retryable {
    /// Whether repeating the same request might succeed.
    fn is_transient(&self) -> bool;
}

/// Why a retried operation gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Every attempt failed transiently.
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last: E,
    },
    /// A permanent error stopped retrying early.
    Permanent(E),
}

/// Run `op` until it succeeds, fails permanently, or the attempt budget
/// is spent. `op` receives the 1-based attempt number.
///
/// Sleeps the calling thread between attempts.
///
/// # Errors
///
/// See [`RetryError`].
pub fn retry<T, E, F>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, RetryError<E>>
where
    E: Retryable + fmt::Display,
    F: FnMut(u32) -> Result<T, E>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(RetryError::Permanent(err)),
            Err(err) if attempt >= max_attempts => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }
            Err(err) => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts,
                    ?delay,
                    error = %err,
                    "transient failure, retrying"
                );
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                attempt += 1;
            }
        }
    }
}
