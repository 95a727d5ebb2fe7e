//! Job entity and its state machine.
//!
//! ```text
//! pending ──dispatch──▶ processing ──success──▶ completed
//!    ▲                      │
//!    └──retry (backoff)─────┤
//!                           └──attempts exhausted──▶ failed
//! ```
//!
//! `completed` and `failed` are terminal. The only way out of `failed` is an
//! explicit [`Job::reopen`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

/// Attempts allowed when the caller does not choose.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Retry delay after the given (1-indexed) failed attempt.
///
/// A fixed table, not a series: 5s, 15s, then 60s for every later attempt.
pub fn backoff_for_attempt(attempt: u32) -> Duration {
    match attempt {
        0 | 1 => Duration::from_secs(5),
        2 => Duration::from_secs(15),
        _ => Duration::from_secs(60),
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `scheduled_at` and a free worker
    Pending,
    /// Leased by a worker
    Processing,
    /// Output persisted
    Completed,
    /// Attempts exhausted
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a failed attempt turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to `pending`, eligible again at `retry_at`.
    Rescheduled { retry_at: DateTime<Utc> },
    /// Attempts exhausted; the job is now `failed`.
    Exhausted,
}

/// One retryable unit of work tied to a business work-key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Business identifier; at most one non-terminal job exists per key.
    pub work_key: String,
    pub status: JobStatus,
    /// Dispatches so far (incremented when the job enters `processing`).
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time the dispatcher may pick the job up.
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Failures ever recorded, not reset by [`Job::reopen`].
    pub error_count: u32,
}

impl Job {
    /// Create a `pending` job eligible immediately.
    pub fn new(work_key: impl Into<String>, now: DateTime<Utc>) -> DomainResult<Self> {
        let work_key = work_key.into();
        if work_key.trim().is_empty() {
            return Err(DomainError::validation("work key must not be empty"));
        }

        Ok(Self {
            id: JobId::new(),
            work_key,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            created_at: now,
            updated_at: now,
            scheduled_at: now,
            started_at: None,
            completed_at: None,
            last_error: None,
            error_count: 0,
        })
    }

    /// Set the attempt ceiling (at least one attempt is always allowed).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `pending` and past its scheduled time.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at <= now
    }

    /// `processing` with a lease taken longer than `timeout` ago.
    pub fn is_stuck(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        match self.started_at {
            Some(started) => now.signed_duration_since(started) > timeout,
            None => true,
        }
    }

    /// Take the processing lease: `pending → processing`.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_status(JobStatus::Pending, "dispatch")?;
        if self.attempts >= self.max_attempts {
            return Err(DomainError::invalid_transition(self.status, "dispatch"));
        }

        self.status = JobStatus::Processing;
        self.attempts += 1;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// `processing → completed`.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_status(JobStatus::Processing, "complete")?;

        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Record a failed attempt and either reschedule with backoff or give up.
    pub fn mark_failed(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<FailureOutcome> {
        self.expect_status(JobStatus::Processing, "fail")?;

        self.last_error = Some(error.into());
        self.error_count += 1;
        self.updated_at = now;

        if self.attempts < self.max_attempts {
            let delay = backoff_for_attempt(self.attempts);
            let retry_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            self.status = JobStatus::Pending;
            self.scheduled_at = retry_at;
            self.started_at = None;
            Ok(FailureOutcome::Rescheduled { retry_at })
        } else {
            self.status = JobStatus::Failed;
            self.completed_at = Some(now);
            Ok(FailureOutcome::Exhausted)
        }
    }

    /// Hand the lease back without counting the attempt: `processing → pending`.
    ///
    /// Only for attempts that never reached the remote dependency.
    pub fn defer(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_status(JobStatus::Processing, "defer")?;

        self.status = JobStatus::Pending;
        self.attempts = self.attempts.saturating_sub(1);
        self.started_at = None;
        self.scheduled_at = now;
        self.updated_at = now;
        Ok(())
    }

    /// Administrative recovery of a permanently failed job: `failed → pending`.
    ///
    /// Attempts start over; the error history is kept.
    pub fn reopen(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_status(JobStatus::Failed, "reopen")?;

        self.status = JobStatus::Pending;
        self.attempts = 0;
        self.scheduled_at = now;
        self.started_at = None;
        self.completed_at = None;
        self.updated_at = now;
        Ok(())
    }

    fn expect_status(&self, expected: JobStatus, action: &'static str) -> DomainResult<()> {
        if self.status == expected {
            Ok(())
        } else {
            Err(DomainError::invalid_transition(self.status, action))
        }
    }
}
