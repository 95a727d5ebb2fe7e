//! `genq-resilience`: fault-isolation primitives for remote collaborators.
//!
//! - [`CircuitBreaker`]: three-state breaker that stops calling a failing
//!   dependency until it appears recovered.
//! - [`RateLimiter`]: minute/hour/day quota tracker plus a concurrency ceiling.
//!
//! Neither type knows anything about jobs; both are shared behind `Arc` and own
//! their own lock, never held across an `.await`.

pub mod circuit_breaker;
pub mod error;
pub mod rate_limiter;

pub use circuit_breaker::{BreakerStats, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use error::{BreakerError, ConfigError, RateLimited, Retryable};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterStats, RatePermit};
