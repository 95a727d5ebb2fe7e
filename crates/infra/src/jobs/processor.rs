//! Processor façade: lifecycle plus enqueue, status and stats.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use genq_core::{Job, JobId};
use genq_resilience::{BreakerStats, CircuitBreaker, RateLimiter, RateLimiterStats};

use super::config::ProcessorConfig;
use super::dispatcher::{recover_stuck_jobs, Dispatcher, InFlight};
use super::error::ProcessorError;
use super::store::{JobCounts, JobStore, JobStoreError};
use super::worker::{run_worker, RuntimeStats, SharedQueue, WorkerContext};
use crate::generation::{BreakerGuardedGenerator, Generator};
use crate::records::RecordStore;

/// Tasks owned by a running processor.
struct Running {
    cancel: CancellationToken,
    dispatcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

/// Background job processor for the generation pipeline.
pub struct JobProcessor {
    config: ProcessorConfig,
    store: Arc<dyn JobStore>,
    breaker: Option<Arc<CircuitBreaker>>,
    ctx: Arc<WorkerContext>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl JobProcessor {
    /// Build a processor. The breaker, if configured, wraps `generator`.
    pub fn new(
        config: ProcessorConfig,
        store: Arc<dyn JobStore>,
        records: Arc<dyn RecordStore>,
        generator: Arc<dyn Generator>,
    ) -> Result<Self, ProcessorError> {
        config.validate()?;

        let breaker = match &config.circuit_breaker {
            Some(c) => Some(Arc::new(CircuitBreaker::new("generation", c.clone())?)),
            None => None,
        };
        let limiter = match &config.rate_limit {
            Some(c) => Some(Arc::new(RateLimiter::new(c.clone())?)),
            None => None,
        };
        let generator: Arc<dyn Generator> = match &breaker {
            Some(breaker) => Arc::new(BreakerGuardedGenerator::new(generator, breaker.clone())),
            None => generator,
        };

        let ctx = Arc::new(WorkerContext {
            store: store.clone(),
            records,
            generator,
            limiter,
            breaker: breaker.clone(),
            in_flight: InFlight::default(),
            stats: Mutex::new(RuntimeStats::default()),
        });

        Ok(Self {
            config,
            store,
            breaker,
            ctx,
            running: tokio::sync::Mutex::new(None),
        })
    }

    /// Recover stuck jobs, then launch the dispatcher and the worker pool.
    pub async fn start(&self) -> Result<(), ProcessorError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ProcessorError::AlreadyRunning);
        }

        recover_stuck_jobs(self.store.as_ref(), self.config.stuck_job_timeout).await?;

        // Leftovers from an aborted shutdown are no longer queued anywhere.
        self.ctx.in_flight.clear();

        let (tx, rx) = mpsc::channel(self.config.batch_size);
        let queue: SharedQueue = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..self.config.worker_count)
            .map(|id| tokio::spawn(run_worker(id, self.ctx.clone(), queue.clone())))
            .collect();

        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            self.store.clone(),
            self.ctx.in_flight.clone(),
            self.config.poll_interval,
            self.config.batch_size,
        );
        let dispatcher = tokio::spawn(dispatcher.run(tx, cancel.clone()));

        *running = Some(Running {
            cancel,
            dispatcher,
            workers,
        });

        info!(workers = self.config.worker_count, "job processor started");
        Ok(())
    }

    /// Stop the dispatcher, then let workers drain the queue.
    ///
    /// Both phases share `timeout`. On expiry the remaining tasks are aborted;
    /// any job left `processing` is recovered by the next `start`.
    pub async fn stop(&self, timeout: Duration) -> Result<(), ProcessorError> {
        let mut running = self.running.lock().await;
        let Some(Running {
            cancel,
            dispatcher,
            workers,
        }) = running.take()
        else {
            return Err(ProcessorError::NotRunning);
        };

        let deadline = Instant::now() + timeout;
        info!("stopping job processor");

        cancel.cancel();
        let mut dispatcher = dispatcher;
        if tokio::time::timeout_at(deadline, &mut dispatcher).await.is_err() {
            dispatcher.abort();
            workers.iter().for_each(JoinHandle::abort);
            warn!("dispatcher did not stop before deadline");
            return Err(ProcessorError::ShutdownTimeout { phase: "dispatcher" });
        }

        // The dispatcher held the only sender; workers now drain and exit.
        let mut workers = workers.into_iter();
        while let Some(mut worker) = workers.next() {
            if tokio::time::timeout_at(deadline, &mut worker).await.is_err() {
                worker.abort();
                workers.for_each(|w| w.abort());
                warn!("workers did not drain before deadline");
                return Err(ProcessorError::ShutdownTimeout { phase: "workers" });
            }
        }

        info!("job processor stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Create a job for `work_key`, or return the active one.
    ///
    /// A key whose last job is terminal gets a fresh job.
    pub async fn enqueue(&self, work_key: &str) -> Result<Job, ProcessorError> {
        if let Some(existing) = self.store.get_by_work_key(work_key).await? {
            if !existing.is_terminal() {
                return Ok(existing);
            }
        }

        let job = Job::new(work_key, Utc::now())?.with_max_attempts(self.config.max_attempts);
        match self.store.create(&job).await {
            Ok(()) => {
                info!(job_id = %job.id, work_key, "job enqueued");
                Ok(job)
            }
            // Lost a race with a concurrent enqueue of the same key.
            Err(JobStoreError::ActiveJobExists(key)) => {
                match self.store.get_by_work_key(work_key).await? {
                    Some(existing) => Ok(existing),
                    None => Err(JobStoreError::ActiveJobExists(key).into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_job_status(&self, job_id: JobId) -> Result<Option<Job>, ProcessorError> {
        Ok(self.store.get_by_id(job_id).await?)
    }

    pub async fn get_job_by_work_key(&self, work_key: &str) -> Result<Option<Job>, ProcessorError> {
        Ok(self.store.get_by_work_key(work_key).await?)
    }

    pub async fn get_stats(&self) -> Result<JobCounts, ProcessorError> {
        Ok(self.store.count_by_status().await?)
    }

    pub fn get_rate_limiter_stats(&self) -> Option<RateLimiterStats> {
        self.ctx.limiter.as_ref().map(|l| l.stats())
    }

    pub fn get_circuit_breaker_stats(&self) -> Option<BreakerStats> {
        self.breaker.as_ref().map(|b| b.stats())
    }

    pub fn runtime_stats(&self) -> RuntimeStats {
        self.ctx.stats()
    }

    /// Put a permanently failed job back in the queue with fresh attempts.
    pub async fn retry_failed(&self, job_id: JobId) -> Result<Job, ProcessorError> {
        let mut job = self
            .store
            .get_by_id(job_id)
            .await?
            .ok_or(ProcessorError::JobNotFound(job_id))?;

        job.reopen(Utc::now())?;

        // The key lookup surfaces the active job when one exists; the store
        // also refuses the write if another one appeared since.
        if let Some(active) = self.store.get_by_work_key(&job.work_key).await? {
            if active.id != job.id && !active.is_terminal() {
                return Err(JobStoreError::ActiveJobExists(job.work_key).into());
            }
        }

        self.store.update(&job).await?;
        info!(job_id = %job.id, work_key = %job.work_key, "failed job reopened");
        Ok(job)
    }
}

impl Drop for JobProcessor {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.try_lock() {
            if let Some(running) = running.take() {
                running.cancel.cancel();
                running.dispatcher.abort();
                running.workers.iter().for_each(JoinHandle::abort);
            }
        }
    }
}
