//! Retry policies and backoff strategies for Keeper object-store operations
//!
//! Object stores occasionally reject requests when many uploads are issued
//! back to back. This crate provides a small, blocking retry executor that
//! wraps a single operation, plus the policy type used to configure it.
//!
//! The default policy makes exactly two attempts with a fixed 100ms pause in
//! between, which matches how uploads have always been retried.

use backoff::backoff::{Backoff, Constant};
use backoff::ExponentialBackoffBuilder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Default number of attempts (the first try plus one retry)
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

/// Default pause between attempts
pub const DEFAULT_DELAY_MS: u64 = 100;

/// Errors returned by [`retry`]
#[derive(Error, Debug)]
pub enum RetryError<E: fmt::Display> {
    #[error("Operation '{operation}' failed after {attempts} attempts: {error}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        error: E,
    },
    #[error("Permanent error in '{operation}': {error}")]
    Permanent { operation: &'static str, error: E },
}

impl<E: fmt::Display> RetryError<E> {
    /// Unwrap the error produced by the last attempt
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { error, .. } => error,
            RetryError::Permanent { error, .. } => error,
        }
    }

    /// Number of attempts that were made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Permanent { .. } => 1,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T, E> = std::result::Result<T, RetryError<E>>;

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// How the pause between attempts evolves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same pause before every retry
    Fixed,
    /// Pause grows by `multiplier` up to `max_delay_ms`, without jitter
    Exponential,
}

/// Retry policy: how many attempts, and how long to wait between them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one; 1 disables retries
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
    /// Pause before the first retry
    pub initial_delay_ms: u64,
    /// Upper bound for exponential pauses
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            strategy: BackoffStrategy::Fixed,
            initial_delay_ms: DEFAULT_DELAY_MS,
            max_delay_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes a single attempt
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Fixed pause between a bounded number of attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            strategy: BackoffStrategy::Fixed,
            initial_delay_ms: delay.as_millis() as u64,
            ..Self::default()
        }
    }

    /// Exponentially growing pause between a bounded number of attempts
    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            strategy: BackoffStrategy::Exponential,
            initial_delay_ms: initial.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            multiplier,
        }
    }

    /// Check that the policy can actually be executed
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if self.strategy == BackoffStrategy::Exponential && self.multiplier < 1.0 {
            return Err("retry.multiplier must be >= 1.0 for exponential backoff".to_string());
        }
        Ok(())
    }

    fn backoff(&self) -> Box<dyn Backoff + Send> {
        let initial = Duration::from_millis(self.initial_delay_ms);
        match self.strategy {
            BackoffStrategy::Fixed => Box::new(Constant::new(initial)),
            BackoffStrategy::Exponential => Box::new(
                ExponentialBackoffBuilder::new()
                    .with_initial_interval(initial)
                    .with_max_interval(Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms)))
                    .with_multiplier(self.multiplier)
                    .with_randomization_factor(0.0)
                    .with_max_elapsed_time(None)
                    .build(),
            ),
        }
    }
}

/// Run `f` until it succeeds, fails permanently, or the policy runs out of attempts
///
/// `f` receives the 1-based attempt number. The error of the last attempt is
/// returned inside the [`RetryError`].
pub fn retry<T, E, F>(operation: &'static str, policy: &RetryPolicy, mut f: F) -> RetryResult<T, E>
where
    E: RetryableError + fmt::Display,
    F: FnMut(u32) -> Result<T, E>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut backoff = policy.backoff();
    let mut attempt = 1;

    loop {
        debug!(operation, attempt, "Attempting operation");

        match f(attempt) {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Operation succeeded after retrying");
                }
                return Ok(value);
            }
            Err(err) if err.is_permanent() => {
                warn!(operation, attempt, error = %err, "Operation failed permanently");
                return Err(RetryError::Permanent {
                    operation,
                    error: err,
                });
            }
            Err(err) => {
                if attempt >= max_attempts {
                    warn!(operation, attempt, error = %err, "Operation failed, no attempts left");
                    return Err(RetryError::Exhausted {
                        operation,
                        attempts: attempt,
                        error: err,
                    });
                }

                let delay = backoff
                    .next_backoff()
                    .unwrap_or_else(|| Duration::from_millis(policy.initial_delay_ms));
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Operation failed, retrying"
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}
