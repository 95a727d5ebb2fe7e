//! Error types and the retry-worthiness predicate.

use thiserror::Error;

/// Whether an error says something about the health of the remote side.
///
/// Breakers only count retryable errors as failures. Cancellation, deadlines
/// and the breaker's own rejections are not evidence that the dependency is
/// down, and counting them would let an open breaker keep itself open.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Error returned by [`crate::CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open; the call was not attempted.
    #[error("circuit breaker is open")]
    Open,

    /// The circuit is half-open and its trial budget is spent.
    #[error("circuit breaker is half-open: too many requests")]
    TooManyRequests,

    /// The wrapped call ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E: Retryable> Retryable for BreakerError<E> {
    fn is_retryable(&self) -> bool {
        match self {
            BreakerError::Inner(e) => e.is_retryable(),
            BreakerError::Open | BreakerError::TooManyRequests => false,
        }
    }
}

impl Retryable for tokio::time::error::Elapsed {
    fn is_retryable(&self) -> bool {
        false
    }
}

/// Denial from [`crate::RateLimiter::try_acquire`], naming the saturated limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RateLimited {
    #[error("per-minute quota exhausted")]
    PerMinute,
    #[error("per-hour quota exhausted")]
    PerHour,
    #[error("per-day quota exhausted")]
    PerDay,
    #[error("concurrency ceiling reached")]
    Concurrency,
}

/// Rejected configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
