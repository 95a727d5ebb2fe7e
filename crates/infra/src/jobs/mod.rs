//! Background job engine for the generation pipeline.
//!
//! ## Design
//!
//! - One job per work-key at a time; enqueue is idempotent
//! - Failed attempts are retried with a fixed backoff table, then marked failed
//! - Quota denials and breaker rejections defer a job without spending an attempt
//! - Jobs abandoned mid-flight by a crash are recovered on start
//!
//! ## Components
//!
//! - `JobStore`: persistence for jobs (in-memory or durable)
//! - `Dispatcher`: polls for ready jobs and feeds the worker queue
//! - worker pool: runs the single-job routine under the rate limiter
//! - `JobProcessor`: lifecycle and query façade

mod dispatcher;
pub mod config;
pub mod error;
pub mod processor;
pub mod store;
mod worker;

pub use config::{ConfigError, ProcessorConfig};
pub use dispatcher::{recover_stuck_jobs, RecoveryReport, INTERRUPTED_BY_RESTART};
pub use error::ProcessorError;
pub use processor::JobProcessor;
pub use store::{InMemoryJobStore, JobCounts, JobStore, JobStoreError};
pub use worker::RuntimeStats;
