//! Worker pool: the single-job routine and the loop around it.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use genq_core::{FailureOutcome, Job, JobId};
use genq_resilience::{CircuitBreaker, RateLimiter};

use super::dispatcher::InFlight;
use super::error::ProcessorError;
use super::store::JobStore;
use crate::generation::Generator;
use crate::records::RecordStore;

/// Receiving end of the worker queue, shared by the pool.
pub(crate) type SharedQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>;

/// Worker runtime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeStats {
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    /// Rate-limited or circuit-rejected; left pending without penalty
    pub jobs_deferred: u64,
    pub jobs_skipped: u64,
    pub infrastructure_errors: u64,
}

/// What one pass of the single-job routine did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessOutcome {
    /// Already picked up elsewhere, or no longer due.
    Skipped,
    Deferred,
    Completed,
    Retried,
    Failed,
}

/// Why an attempt did not produce output.
enum AttemptError {
    /// The remote side was never called.
    Rejected(String),
    Failed(String),
}

/// State shared by every worker.
pub(crate) struct WorkerContext {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) records: Arc<dyn RecordStore>,
    pub(crate) generator: Arc<dyn Generator>,
    pub(crate) limiter: Option<Arc<RateLimiter>>,
    /// The breaker inside `generator`, if any; consulted before spending quota.
    pub(crate) breaker: Option<Arc<CircuitBreaker>>,
    pub(crate) in_flight: InFlight,
    pub(crate) stats: Mutex<RuntimeStats>,
}

impl WorkerContext {
    pub(crate) fn stats(&self) -> RuntimeStats {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record(&self, outcome: &Result<ProcessOutcome, ProcessorError>) {
        let mut s = self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match outcome {
            Ok(ProcessOutcome::Skipped) => s.jobs_skipped += 1,
            Ok(ProcessOutcome::Deferred) => s.jobs_deferred += 1,
            Ok(ProcessOutcome::Completed) => {
                s.jobs_processed += 1;
                s.jobs_completed += 1;
            }
            Ok(ProcessOutcome::Retried) => {
                s.jobs_processed += 1;
                s.jobs_retried += 1;
            }
            Ok(ProcessOutcome::Failed) => {
                s.jobs_processed += 1;
                s.jobs_failed += 1;
            }
            Err(_) => s.infrastructure_errors += 1,
        }
    }

    /// Run one job through the single-job routine.
    ///
    /// Store errors are returned as-is; whatever the store last accepted stays
    /// the job's state.
    pub(crate) async fn process(&self, queued: &Job) -> Result<ProcessOutcome, ProcessorError> {
        // The queued copy may be stale; the store decides.
        let Some(mut job) = self.store.get_by_id(queued.id).await? else {
            warn!(job_id = %queued.id, "queued job vanished from store");
            return Ok(ProcessOutcome::Skipped);
        };
        if !job.is_ready(Utc::now()) {
            debug!(job_id = %job.id, status = %job.status, "job no longer due, skipping");
            return Ok(ProcessOutcome::Skipped);
        }

        // An open circuit would reject the call anyway; don't burn quota on it.
        // A breaker that opens after this check still rejects via `defer`.
        if let Some(breaker) = self.breaker.as_deref() {
            if !breaker.is_call_permitted() {
                debug!(job_id = %job.id, "circuit open, leaving job pending");
                return Ok(ProcessOutcome::Deferred);
            }
        }

        // Released on every exit path below.
        let _permit = match self.limiter.as_deref() {
            Some(limiter) => match limiter.try_acquire() {
                Ok(permit) => Some(permit),
                Err(reason) => {
                    debug!(job_id = %job.id, %reason, "rate limited, leaving job pending");
                    return Ok(ProcessOutcome::Deferred);
                }
            },
            None => None,
        };

        job.mark_processing(Utc::now())?;
        self.store.update(&job).await?;
        debug!(
            job_id = %job.id,
            work_key = %job.work_key,
            attempt = job.attempts,
            "job processing"
        );

        match self.attempt(&job).await {
            Ok(()) => {
                job.mark_completed(Utc::now())?;
                self.store.update(&job).await?;
                info!(job_id = %job.id, work_key = %job.work_key, attempt = job.attempts, "job completed");
                Ok(ProcessOutcome::Completed)
            }
            Err(AttemptError::Rejected(reason)) => {
                job.defer(Utc::now())?;
                self.store.update(&job).await?;
                debug!(job_id = %job.id, %reason, "generation rejected, job deferred");
                Ok(ProcessOutcome::Deferred)
            }
            Err(AttemptError::Failed(reason)) => {
                let outcome = job.mark_failed(reason.clone(), Utc::now())?;
                self.store.update(&job).await?;
                match outcome {
                    FailureOutcome::Rescheduled { retry_at } => {
                        warn!(
                            job_id = %job.id,
                            attempt = job.attempts,
                            error = %reason,
                            %retry_at,
                            "job attempt failed, retry scheduled"
                        );
                        Ok(ProcessOutcome::Retried)
                    }
                    FailureOutcome::Exhausted => {
                        warn!(
                            job_id = %job.id,
                            attempts = job.attempts,
                            error = %reason,
                            "job failed permanently"
                        );
                        Ok(ProcessOutcome::Failed)
                    }
                }
            }
        }
    }

    /// Load inputs, call the generator, persist the output.
    async fn attempt(&self, job: &Job) -> Result<(), AttemptError> {
        let mut record = match self.records.get_by_id(&job.work_key).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(AttemptError::Failed(format!(
                    "record not found: {}",
                    job.work_key
                )));
            }
            Err(e) => return Err(AttemptError::Failed(e.to_string())),
        };

        let Some(input) = record.usable_input() else {
            return Err(AttemptError::Failed("record has no input text".to_string()));
        };

        let output = match self.generator.generate(input, &record.context).await {
            Ok(output) => output,
            Err(e) if e.is_rejection() => return Err(AttemptError::Rejected(e.to_string())),
            Err(e) => return Err(AttemptError::Failed(e.to_string())),
        };

        record.output_text = Some(output);
        record.generated_at = Some(Utc::now());
        self.records
            .update(&record)
            .await
            .map_err(|e| AttemptError::Failed(e.to_string()))
    }
}

/// Worker loop: take jobs until the queue closes and is drained.
pub(crate) async fn run_worker(worker: usize, ctx: Arc<WorkerContext>, queue: SharedQueue) {
    debug!(worker, "worker started");

    loop {
        let next = {
            let mut rx = queue.lock().await;
            rx.recv().await
        };
        let Some(job) = next else { break };
        let job_id: JobId = job.id;

        let outcome = ctx.process(&job).await;
        ctx.in_flight.release(job_id);
        ctx.record(&outcome);

        if let Err(e) = outcome {
            error!(worker, job_id = %job_id, error = %e, "job processing aborted by infrastructure error");
        }
    }

    debug!(worker, "worker stopped");
}
