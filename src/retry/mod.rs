//! Bounded exponential-backoff retry.
//!
//! [`run`] drives a fallible async action under a [`RetryPolicy`]. Each
//! failure is handed to a classifier: permanent failures abort at once,
//! retryable ones sleep `min(maxDelay, initialDelay * multiplier^(attempt-1))`
//! and try again until the attempt budget is spent. The action and the sleep
//! both observe a [`CancellationToken`].
//!
//! # Example
//!
//! ```ignore
//! use stepforge::retry::{self, classify_llm_error, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! let response = retry::run(&policy, &cancel, |_| provider.generate(request.clone()), classify_llm_error).await?;
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::duration;
use crate::error::LlmError;

/// Outcome of classifying a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retryable,
    Permanent,
}

/// Retry settings, as found under `retryConfig` in a pipeline file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    #[serde(with = "duration")]
    pub initial_delay: Duration,
    #[serde(with = "duration")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

/// An inconsistent [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("maxAttempts must be at least 1")]
    NoAttempts,

    #[error("initialDelay must be greater than zero")]
    ZeroInitialDelay,

    #[error("maxDelay ({max:?}) must not be lower than initialDelay ({initial:?})")]
    MaxBelowInitial { initial: Duration, max: Duration },

    #[error("backoffMultiplier must be at least 1.0, got {0}")]
    MultiplierTooSmall(f64),
}

impl RetryPolicy {
    /// A policy that runs the action exactly once.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Checks the policy invariants. A disabled policy is always valid.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if !self.enabled {
            return Ok(());
        }
        if self.max_attempts == 0 {
            return Err(PolicyError::NoAttempts);
        }
        if self.initial_delay.is_zero() {
            return Err(PolicyError::ZeroInitialDelay);
        }
        if self.max_delay < self.initial_delay {
            return Err(PolicyError::MaxBelowInitial {
                initial: self.initial_delay,
                max: self.max_delay,
            });
        }
        if self.backoff_multiplier < 1.0 || self.backoff_multiplier.is_nan() {
            return Err(PolicyError::MultiplierTooSmall(self.backoff_multiplier));
        }
        Ok(())
    }

    /// Delay slept after the failed attempt number `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled)
    }

    fn attempt_budget(&self) -> u32 {
        if self.enabled {
            self.max_attempts.max(1)
        } else {
            1
        }
    }
}

/// Terminal failure of [`run`].
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The classifier marked the failure as permanent.
    #[error("permanent failure on attempt {attempt}: {error}")]
    Permanent { attempt: u32, error: E },

    /// Every attempt failed with a retryable error.
    #[error("giving up after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: E },

    /// The cancellation token fired.
    #[error("cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled)
    }
}

/// Runs `action` under `policy`, classifying each failure with `classify`.
///
/// The action receives the 1-based attempt number.
///
/// # Errors
///
/// - [`RetryError::Permanent`] as soon as `classify` returns
///   [`RetryDecision::Permanent`]
/// - [`RetryError::Exhausted`] when the last allowed attempt fails
/// - [`RetryError::Cancelled`] when `cancel` fires during the action or a
///   backoff sleep
pub async fn run<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut action: F,
    classify: C,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryDecision,
    E: fmt::Display,
{
    let budget = policy.attempt_budget();
    let mut attempt = 1;

    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            outcome = action(attempt) => outcome,
        };

        let error = match outcome {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if classify(&error) == RetryDecision::Permanent {
            return Err(RetryError::Permanent { attempt, error });
        }
        if attempt >= budget {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: error,
            });
        }

        let delay = policy.backoff_delay(attempt);
        tracing::warn!(
            attempt = attempt,
            max_attempts = budget,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient error, will retry"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

/// Default classification of generation failures.
///
/// Rate limits, the 500/502/503/504 server errors and timeouts are worth
/// another attempt. Everything else, including statuses not listed here, is
/// permanent.
pub fn classify_llm_error(error: &LlmError) -> RetryDecision {
    match error {
        LlmError::Timeout(_) | LlmError::RateLimited(_) => RetryDecision::Retryable,
        LlmError::ApiError { code, .. } => match code {
            429 | 500 | 502 | 503 | 504 => RetryDecision::Retryable,
            _ => RetryDecision::Permanent,
        },
        _ => RetryDecision::Permanent,
    }
}
