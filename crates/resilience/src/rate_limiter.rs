//! Multi-window rate limiter and concurrency governor.
//!
//! Grants are counted in three trailing windows (one minute, one hour, one
//! day) and against a live in-flight ceiling. A grant needs room in all four
//! at once; a denial changes nothing.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{ConfigError, RateLimited};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Quotas imposed by the remote dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub max_per_minute: u32,
    pub max_per_hour: u32,
    pub max_per_day: u32,
    pub max_concurrent: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_per_minute: 10,
            max_per_hour: 100,
            max_per_day: 1000,
            max_concurrent: 3,
        }
    }
}

impl RateLimiterConfig {
    pub fn with_max_per_minute(mut self, n: u32) -> Self {
        self.max_per_minute = n;
        self
    }

    pub fn with_max_per_hour(mut self, n: u32) -> Self {
        self.max_per_hour = n;
        self
    }

    pub fn with_max_per_day(mut self, n: u32) -> Self {
        self.max_per_day = n;
        self
    }

    pub fn with_max_concurrent(mut self, n: u32) -> Self {
        self.max_concurrent = n;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("max_per_minute", self.max_per_minute),
            ("max_per_hour", self.max_per_hour),
            ("max_per_day", self.max_per_day),
            ("max_concurrent", self.max_concurrent),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be at least 1"));
            }
        }
        Ok(())
    }
}

/// Remaining capacity and cumulative totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimiterStats {
    pub minute_remaining: u32,
    pub hour_remaining: u32,
    pub day_remaining: u32,
    pub in_flight: u32,
    pub max_concurrent: u32,
    pub total_granted: u64,
    pub total_denied: u64,
}

#[derive(Debug, Default)]
struct LimiterState {
    /// Grant timestamps, oldest first, pruned to the day window
    grants: VecDeque<Instant>,
    in_flight: u32,
    total_granted: u64,
    total_denied: u64,
}

impl LimiterState {
    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.grants.front() {
            if now.duration_since(*front) >= DAY {
                self.grants.pop_front();
            } else {
                break;
            }
        }
    }

    fn count_within(&self, now: Instant, window: Duration) -> u32 {
        // Newest at the back, so stop at the first grant outside the window.
        self.grants
            .iter()
            .rev()
            .take_while(|at| now.duration_since(**at) < window)
            .count() as u32
    }
}

/// Quota tracker guarding a remote dependency.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(LimiterState::default()),
        })
    }

    /// Take a slot if every limit has room. Never waits.
    ///
    /// The slot's concurrency share is returned when the permit drops; the
    /// window shares expire with time.
    pub fn try_acquire(&self) -> Result<RatePermit<'_>, RateLimited> {
        let mut state = self.lock();
        let now = Instant::now();
        state.prune(now);

        let denial = if state.in_flight >= self.config.max_concurrent {
            Some(RateLimited::Concurrency)
        } else if state.count_within(now, MINUTE) >= self.config.max_per_minute {
            Some(RateLimited::PerMinute)
        } else if state.count_within(now, HOUR) >= self.config.max_per_hour {
            Some(RateLimited::PerHour)
        } else if state.grants.len() as u32 >= self.config.max_per_day {
            Some(RateLimited::PerDay)
        } else {
            None
        };

        if let Some(reason) = denial {
            state.total_denied += 1;
            debug!(%reason, in_flight = state.in_flight, "rate limiter denied slot");
            return Err(reason);
        }

        state.grants.push_back(now);
        state.in_flight += 1;
        state.total_granted += 1;
        Ok(RatePermit { limiter: self })
    }

    pub fn stats(&self) -> RateLimiterStats {
        let mut state = self.lock();
        let now = Instant::now();
        state.prune(now);

        RateLimiterStats {
            minute_remaining: self
                .config
                .max_per_minute
                .saturating_sub(state.count_within(now, MINUTE)),
            hour_remaining: self
                .config
                .max_per_hour
                .saturating_sub(state.count_within(now, HOUR)),
            day_remaining: self
                .config
                .max_per_day
                .saturating_sub(state.grants.len() as u32),
            in_flight: state.in_flight,
            max_concurrent: self.config.max_concurrent,
            total_granted: state.total_granted,
            total_denied: state.total_denied,
        }
    }

    /// Forget window history and totals. Outstanding permits stay counted.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.grants.clear();
        state.total_granted = 0;
        state.total_denied = 0;
    }

    fn release(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A granted slot. Dropping it releases the concurrency share.
#[derive(Debug)]
#[must_use = "dropping the permit releases the slot immediately"]
pub struct RatePermit<'a> {
    limiter: &'a RateLimiter,
}

impl RatePermit<'_> {
    /// Release explicitly; same as dropping.
    pub fn release(self) {}
}

impl Drop for RatePermit<'_> {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(config: RateLimiterConfig) -> RateLimiter {
        RateLimiter::new(config).unwrap()
    }

    fn roomy() -> RateLimiterConfig {
        RateLimiterConfig {
            max_per_minute: 100,
            max_per_hour: 1000,
            max_per_day: 10_000,
            max_concurrent: 100,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn minute_quota_grants_two_then_denies() {
        let l = limiter(roomy().with_max_per_minute(2));

        let a = l.try_acquire().unwrap();
        let b = l.try_acquire().unwrap();
        assert_eq!(l.stats().minute_remaining, 0);
        assert_eq!(l.try_acquire().unwrap_err(), RateLimited::PerMinute);

        drop(a);
        drop(b);
        // Releasing frees concurrency, not the window.
        assert_eq!(l.try_acquire().unwrap_err(), RateLimited::PerMinute);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(l.try_acquire().is_ok());

        let stats = l.stats();
        assert_eq!(stats.total_granted, 3);
        assert_eq!(stats.total_denied, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hour_and_day_windows_are_independent() {
        let l = limiter(roomy().with_max_per_minute(10).with_max_per_hour(3).with_max_per_day(4));

        for _ in 0..3 {
            l.try_acquire().unwrap().release();
        }
        assert_eq!(l.try_acquire().unwrap_err(), RateLimited::PerHour);

        tokio::time::advance(HOUR).await;
        l.try_acquire().unwrap().release();
        assert_eq!(l.try_acquire().unwrap_err(), RateLimited::PerDay);

        let stats = l.stats();
        assert_eq!(stats.hour_remaining, 2);
        assert_eq!(stats.day_remaining, 0);

        tokio::time::advance(DAY).await;
        assert_eq!(l.stats().day_remaining, 4);
        assert!(l.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_ceiling_follows_permits() {
        let l = limiter(roomy().with_max_concurrent(2));

        let a = l.try_acquire().unwrap();
        let _b = l.try_acquire().unwrap();
        assert_eq!(l.try_acquire().unwrap_err(), RateLimited::Concurrency);
        assert_eq!(l.stats().in_flight, 2);

        drop(a);
        assert_eq!(l.stats().in_flight, 1);
        assert!(l.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn denial_takes_nothing() {
        let l = limiter(roomy().with_max_per_minute(1));
        let _held = l.try_acquire().unwrap();
        let before = l.stats();

        assert!(l.try_acquire().is_err());

        let after = l.stats();
        assert_eq!(after.minute_remaining, before.minute_remaining);
        assert_eq!(after.hour_remaining, before.hour_remaining);
        assert_eq!(after.day_remaining, before.day_remaining);
        assert_eq!(after.in_flight, before.in_flight);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_keeps_live_permits() {
        let l = limiter(roomy().with_max_per_minute(1).with_max_concurrent(1));
        let held = l.try_acquire().unwrap();

        l.reset();
        assert_eq!(l.stats().minute_remaining, 1);
        assert_eq!(l.try_acquire().unwrap_err(), RateLimited::Concurrency);

        drop(held);
        assert!(l.try_acquire().is_ok());
    }

    #[test]
    fn zero_quota_is_rejected() {
        assert!(RateLimiter::new(roomy().with_max_per_hour(0)).is_err());
    }
}
