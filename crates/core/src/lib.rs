//! `genq-core`: job domain model.
//!
//! This crate contains the **pure** job state machine: no storage, no async,
//! no clocks. Every transition takes the current time from the caller.

pub mod error;
pub mod id;
pub mod job;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{FailureOutcome, Job, JobStatus, DEFAULT_MAX_ATTEMPTS, backoff_for_attempt};
