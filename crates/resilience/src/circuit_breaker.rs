//! Three-state circuit breaker.
//!
//! ```text
//! closed ──failure_threshold consecutive failures──▶ open
//! open ──open_timeout elapsed, next call admitted──▶ half-open
//! half-open ──any failure──▶ open
//! half-open ──success_threshold consecutive successes──▶ closed
//! ```
//!
//! Every transition zeroes the consecutive counters and the trial count.
//! Cumulative totals survive transitions and are only cleared by
//! [`CircuitBreaker::reset`].

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{BreakerError, ConfigError, Retryable};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl core::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `closed` that open the circuit
    pub failure_threshold: u32,
    /// Consecutive successes in `half-open` that close it again
    pub success_threshold: u32,
    /// How long `open` rejects before letting a trial through
    pub open_timeout: Duration,
    /// Calls admitted while `half-open`
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            half_open_max_requests: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n;
        self
    }

    pub fn with_success_threshold(mut self, n: u32) -> Self {
        self.success_threshold = n;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_half_open_max_requests(mut self, n: u32) -> Self {
        self.half_open_max_requests = n;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold", "must be at least 1"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold", "must be at least 1"));
        }
        if self.half_open_max_requests == 0 {
            return Err(ConfigError::invalid(
                "half_open_max_requests",
                "must be at least 1",
            ));
        }
        // Trial slots are not returned on success, so fewer slots than the
        // success threshold would pin the breaker in half-open.
        if self.success_threshold > self.half_open_max_requests {
            return Err(ConfigError::invalid(
                "success_threshold",
                format!(
                    "{} exceeds half_open_max_requests ({})",
                    self.success_threshold, self.half_open_max_requests
                ),
            ));
        }
        Ok(())
    }
}

/// Point-in-time view of a breaker, for status endpoints and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub half_open_trials: u32,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub last_error: Option<String>,
    /// Time spent in the current state
    pub in_state_for: Duration,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Bumped on every transition; outcomes from an older generation only
    /// touch the cumulative totals.
    generation: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_trials: u32,
    last_failure_at: Option<Instant>,
    last_state_change_at: Instant,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
    last_error: Option<String>,
}

impl BreakerInner {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            generation: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            half_open_trials: 0,
            last_failure_at: None,
            last_state_change_at: now,
            total_requests: 0,
            total_successes: 0,
            total_failures: 0,
            total_rejections: 0,
            last_error: None,
        }
    }
}

/// Generic three-state circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker after validating its configuration.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new(Instant::now())),
        })
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether a call made now would be admitted. Takes no half-open slot.
    pub fn is_call_permitted(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner
                .last_failure_at
                .is_none_or(|at| Instant::now().duration_since(at) >= self.config.open_timeout),
            CircuitState::HalfOpen => inner.half_open_trials < self.config.half_open_max_requests,
        }
    }

    /// Run `f` under the breaker.
    ///
    /// Rejected calls return [`BreakerError::Open`] or
    /// [`BreakerError::TooManyRequests`] without invoking `f`. Errors for which
    /// [`Retryable::is_retryable`] is false are passed through without counting
    /// as failures.
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + core::fmt::Display,
    {
        let mut admission = self.admit::<E>()?;

        match f().await {
            Ok(value) => {
                admission.settle(Outcome::Success);
                Ok(value)
            }
            Err(err) if err.is_retryable() => {
                admission.settle(Outcome::Failure(err.to_string()));
                Err(BreakerError::Inner(err))
            }
            Err(err) => {
                admission.settle(Outcome::Ignored);
                Err(BreakerError::Inner(err))
            }
        }
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.lock();
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            half_open_trials: inner.half_open_trials,
            total_requests: inner.total_requests,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
            last_error: inner.last_error.clone(),
            in_state_for: Instant::now().duration_since(inner.last_state_change_at),
        }
    }

    /// Administrative reset: back to `closed` with every counter and total cleared.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let generation = inner.generation + 1;
        *inner = BreakerInner::new(Instant::now());
        inner.generation = generation;
        info!(breaker = %self.name, "circuit breaker reset");
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn admit<E>(&self) -> Result<Admission<'_>, BreakerError<E>> {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.total_requests += 1;

        match inner.state {
            CircuitState::Closed => {}
            CircuitState::Open => {
                let cooled_down = inner
                    .last_failure_at
                    .is_none_or(|at| now.duration_since(at) >= self.config.open_timeout);
                if !cooled_down {
                    inner.total_rejections += 1;
                    return Err(BreakerError::Open);
                }
                self.transition(&mut inner, CircuitState::HalfOpen, now);
                inner.half_open_trials = 1;
            }
            CircuitState::HalfOpen => {
                if inner.half_open_trials >= self.config.half_open_max_requests {
                    inner.total_rejections += 1;
                    return Err(BreakerError::TooManyRequests);
                }
                inner.half_open_trials += 1;
            }
        }

        Ok(Admission {
            breaker: self,
            generation: inner.generation,
            settled: false,
        })
    }

    fn record(&self, generation: u64, outcome: Outcome) {
        let mut inner = self.lock();
        let now = Instant::now();

        match &outcome {
            Outcome::Success => inner.total_successes += 1,
            Outcome::Failure(err) => {
                inner.total_failures += 1;
                inner.last_error = Some(err.clone());
            }
            Outcome::Ignored => {}
        }

        if inner.generation != generation {
            debug!(breaker = %self.name, "discarding outcome from a previous breaker state");
            return;
        }

        match (inner.state, outcome) {
            (CircuitState::Closed, Outcome::Success) => {
                inner.consecutive_failures = 0;
                inner.consecutive_successes += 1;
            }
            (CircuitState::Closed, Outcome::Failure(err)) => {
                inner.consecutive_successes = 0;
                inner.consecutive_failures += 1;
                inner.last_failure_at = Some(now);
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        error = %err,
                        "circuit breaker opening"
                    );
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            (CircuitState::HalfOpen, Outcome::Success) => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed, now);
                }
            }
            (CircuitState::HalfOpen, Outcome::Failure(err)) => {
                inner.last_failure_at = Some(now);
                warn!(breaker = %self.name, error = %err, "half-open trial failed, reopening");
                self.transition(&mut inner, CircuitState::Open, now);
            }
            (CircuitState::HalfOpen, Outcome::Ignored) => {
                // The trial told us nothing; give its slot back.
                inner.half_open_trials = inner.half_open_trials.saturating_sub(1);
            }
            (CircuitState::Closed, Outcome::Ignored) | (CircuitState::Open, _) => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.half_open_trials = 0;
        inner.last_state_change_at = now;
        info!(breaker = %self.name, %from, %to, "circuit breaker state change");
    }
}

enum Outcome {
    Success,
    Failure(String),
    Ignored,
}

/// An admitted call. Dropped unsettled (the caller's future was cancelled)
/// it counts as an ignored outcome.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl Admission<'_> {
    fn settle(&mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.record(self.generation, outcome);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record(self.generation, Outcome::Ignored);
        }
    }
}
