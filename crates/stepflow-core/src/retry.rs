//! Retry/backoff policy for failed steps.
//!
//! The policy is a pure decision over `(attempt_count, error_kind)`. Transient
//! kinds are retried with capped exponential backoff plus jitter until the
//! attempt budget runs out; permanent kinds give up on first occurrence.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Failure classification supplied by step authors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// External call did not answer in time.
    Timeout,
    /// External service asked us to slow down.
    RateLimited,
    /// Connection-level or 5xx failure.
    Network,
    /// Input rejected by the collaborator.
    Validation,
    /// Payload or response could not be decoded.
    MalformedInput,
    /// Bug or invariant violation inside the step.
    Internal,
}

impl ErrorKind {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Network => "network",
            Self::Validation => "validation",
            Self::MalformedInput => "malformed_input",
            Self::Internal => "internal",
        }
    }

    /// Whether failures of this kind are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::RateLimited | Self::Network)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "timeout" => Self::Timeout,
            "rate_limited" => Self::RateLimited,
            "network" => Self::Network,
            "validation" => Self::Validation,
            "malformed_input" => Self::MalformedInput,
            _ => Self::Internal,
        })
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-invoke the step after the given delay.
    RetryAfter(Duration),
    /// Stop and fail the step.
    GiveUp,
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay each time.
    Fixed,
    /// Delay increases linearly.
    Linear,
    /// Delay doubles each time.
    #[default]
    Exponential,
}

/// Retry policy applied to every step of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay (before jitter).
    pub max_delay: Duration,
    /// Fraction of the delay added as random jitter, in `[0, 1]`.
    pub jitter: f64,
    /// Backoff strategy.
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter: 0.2,
            backoff: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Decide what to do after `attempt_count` attempts ended in `kind`.
    pub fn decide(&self, attempt_count: u32, kind: ErrorKind) -> RetryDecision {
        self.decide_with_sample(attempt_count, kind, jitter_sample())
    }

    /// Same as [`decide`](Self::decide) with an explicit jitter sample in `[0, 1)`.
    pub fn decide_with_sample(
        &self,
        attempt_count: u32,
        kind: ErrorKind,
        sample: f64,
    ) -> RetryDecision {
        if !kind.is_transient() || attempt_count >= self.max_attempts {
            return RetryDecision::GiveUp;
        }

        let delay = self.calculate_backoff(attempt_count);
        let jitter = self.jitter.clamp(0.0, 1.0) * sample.clamp(0.0, 1.0);
        RetryDecision::RetryAfter(delay.mul_f64(1.0 + jitter))
    }

    /// Calculate backoff duration for a given attempt (no jitter).
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let backoff = match self.backoff {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        backoff.min(self.max_delay)
    }
}

/// Uniform sample in `[0, 1)` drawn from the v4 UUID generator.
fn jitter_sample() -> f64 {
    // Low 62 bits of a v4 UUID are random; version and variant bits sit above them.
    let bits = (Uuid::new_v4().as_u128() as u64) & ((1u64 << 53) - 1);
    bits as f64 / (1u64 << 53) as f64
}
