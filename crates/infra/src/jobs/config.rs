//! Processor configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use genq_core::DEFAULT_MAX_ATTEMPTS;
use genq_resilience::{CircuitBreakerConfig, RateLimiterConfig};

/// Invalid processor configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Parse { var: String, value: String },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error(transparent)]
    Resilience(#[from] genq_resilience::ConfigError),
}

/// Job processor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// How often the dispatcher polls for ready jobs
    pub poll_interval: Duration,
    /// Jobs fetched per tick; also the worker queue capacity
    pub batch_size: usize,
    /// Lease age after which a `processing` job counts as abandoned
    pub stuck_job_timeout: Duration,
    /// Concurrent workers
    pub worker_count: usize,
    /// Attempts given to newly enqueued jobs
    pub max_attempts: u32,
    /// Breaker around the generation call, if any
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Quotas for the generation call, if any
    pub rate_limit: Option<RateLimiterConfig>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            stuck_job_timeout: Duration::from_secs(5 * 60),
            worker_count: 3,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            circuit_breaker: None,
            rate_limit: None,
        }
    }
}

impl ProcessorConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_stuck_job_timeout(mut self, timeout: Duration) -> Self {
        self.stuck_job_timeout = timeout;
        self
    }

    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn with_rate_limit(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::invalid("poll_interval", "must be positive"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be at least 1"));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::invalid("worker_count", "must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }
        if let Some(breaker) = &self.circuit_breaker {
            breaker.validate()?;
        }
        if let Some(limits) = &self.rate_limit {
            limits.validate()?;
        }
        Ok(())
    }

    /// Defaults overridden by `GENQ_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`ProcessorConfig::from_env`] with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let mut config = Self::default();

        if let Some(ms) = env.parse::<u64>("GENQ_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env.parse("GENQ_BATCH_SIZE")? {
            config.batch_size = n;
        }
        if let Some(secs) = env.parse::<u64>("GENQ_STUCK_JOB_TIMEOUT_SECS")? {
            config.stuck_job_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env.parse("GENQ_WORKER_COUNT")? {
            config.worker_count = n;
        }
        if let Some(n) = env.parse("GENQ_MAX_ATTEMPTS")? {
            config.max_attempts = n;
        }

        let per_minute = env.parse("GENQ_RATE_LIMIT_PER_MINUTE")?;
        let per_hour = env.parse("GENQ_RATE_LIMIT_PER_HOUR")?;
        let per_day = env.parse("GENQ_RATE_LIMIT_PER_DAY")?;
        let concurrent = env.parse("GENQ_RATE_LIMIT_CONCURRENT")?;
        if per_minute.is_some() || per_hour.is_some() || per_day.is_some() || concurrent.is_some() {
            let defaults = RateLimiterConfig::default();
            config.rate_limit = Some(RateLimiterConfig {
                max_per_minute: per_minute.unwrap_or(defaults.max_per_minute),
                max_per_hour: per_hour.unwrap_or(defaults.max_per_hour),
                max_per_day: per_day.unwrap_or(defaults.max_per_day),
                max_concurrent: concurrent.unwrap_or(defaults.max_concurrent),
            });
        }

        let failures = env.parse("GENQ_BREAKER_FAILURE_THRESHOLD")?;
        let successes = env.parse("GENQ_BREAKER_SUCCESS_THRESHOLD")?;
        let open_secs = env.parse::<u64>("GENQ_BREAKER_OPEN_TIMEOUT_SECS")?;
        let trials = env.parse("GENQ_BREAKER_HALF_OPEN_MAX_REQUESTS")?;
        if failures.is_some() || successes.is_some() || open_secs.is_some() || trials.is_some() {
            let defaults = CircuitBreakerConfig::default();
            config.circuit_breaker = Some(CircuitBreakerConfig {
                failure_threshold: failures.unwrap_or(defaults.failure_threshold),
                success_threshold: successes.unwrap_or(defaults.success_threshold),
                open_timeout: open_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.open_timeout),
                half_open_max_requests: trials.unwrap_or(defaults.half_open_max_requests),
            });
        }

        config.validate()?;
        Ok(config)
    }
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

struct Lookup<F>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    fn parse<T: FromStr>(&self, var: &str) -> Result<Option<T>, ConfigError> {
        match (self.0)(var) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::Parse {
                    var: var.to_string(),
                    value: raw,
                }),
        }
    }
}
