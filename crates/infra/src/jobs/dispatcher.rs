//! Periodic dispatcher feeding the worker queue, plus crash recovery.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use genq_core::{FailureOutcome, Job, JobId};

use super::error::ProcessorError;
use super::store::JobStore;

/// Error recorded on jobs found holding a stale processing lease.
pub const INTERRUPTED_BY_RESTART: &str = "interrupted by restart";

/// Jobs sitting in the worker queue or owned by a worker.
#[derive(Debug, Clone, Default)]
pub(crate) struct InFlight(Arc<Mutex<HashSet<JobId>>>);

impl InFlight {
    /// Returns `false` if the job is already in flight.
    pub(crate) fn claim(&self, id: JobId) -> bool {
        self.lock().insert(id)
    }

    pub(crate) fn release(&self, id: JobId) {
        self.lock().remove(&id);
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<JobId>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Outcome of a recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub rescheduled: usize,
    pub failed: usize,
}

/// Force-fail every job whose processing lease is older than `timeout`.
///
/// Recovered jobs go through the ordinary backoff-or-fail transition.
pub async fn recover_stuck_jobs(
    store: &dyn JobStore,
    timeout: Duration,
) -> Result<RecoveryReport, ProcessorError> {
    let stuck = store.get_processing_jobs(timeout).await?;
    let mut report = RecoveryReport::default();

    for mut job in stuck {
        match job.mark_failed(INTERRUPTED_BY_RESTART, Utc::now())? {
            FailureOutcome::Rescheduled { retry_at } => {
                debug!(job_id = %job.id, attempt = job.attempts, %retry_at, "stuck job rescheduled");
                report.rescheduled += 1;
            }
            FailureOutcome::Exhausted => {
                warn!(job_id = %job.id, attempts = job.attempts, "stuck job failed permanently");
                report.failed += 1;
            }
        }
        store.update(&job).await?;
    }

    if report.rescheduled + report.failed > 0 {
        info!(
            rescheduled = report.rescheduled,
            failed = report.failed,
            "recovered stuck jobs"
        );
    }
    Ok(report)
}

/// Polls the store for ready jobs and hands them to the worker pool.
pub(crate) struct Dispatcher {
    store: Arc<dyn JobStore>,
    in_flight: InFlight,
    poll_interval: Duration,
    batch_size: usize,
}

impl Dispatcher {
    pub(crate) fn new(
        store: Arc<dyn JobStore>,
        in_flight: InFlight,
        poll_interval: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            in_flight,
            poll_interval,
            batch_size,
        }
    }

    /// Tick until cancelled. Dropping `tx` on return closes the worker queue.
    pub(crate) async fn run(self, tx: mpsc::Sender<Job>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            batch_size = self.batch_size,
            "dispatcher started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if !self.dispatch_batch(&tx, &cancel).await {
                        break;
                    }
                }
            }
        }

        info!("dispatcher stopped");
    }

    /// One tick. Returns `false` once the dispatcher should stop.
    async fn dispatch_batch(&self, tx: &mpsc::Sender<Job>, cancel: &CancellationToken) -> bool {
        let jobs = match self.store.get_pending_jobs(self.batch_size).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "failed to fetch pending jobs, skipping tick");
                return true;
            }
        };

        let mut sent = 0usize;
        for job in jobs {
            let id = job.id;
            if !self.in_flight.claim(id) {
                continue;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // The rest of the batch stays pending in the store.
                    self.in_flight.release(id);
                    debug!(sent, "stop requested mid-batch");
                    return false;
                }
                res = tx.send(job) => {
                    if res.is_err() {
                        self.in_flight.release(id);
                        warn!("worker queue closed, dispatcher exiting");
                        return false;
                    }
                    sent += 1;
                }
            }
        }

        if sent > 0 {
            debug!(sent, "dispatched jobs");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genq_core::JobStatus;

    use crate::jobs::store::InMemoryJobStore;

    async fn seed(store: &InMemoryJobStore, key: &str) -> Job {
        let job = Job::new(key, Utc::now()).unwrap();
        store.create(&job).await.unwrap();
        job
    }

    async fn stale_processing(store: &InMemoryJobStore, key: &str, attempts: u32) -> Job {
        let mut job = seed(store, key).await;
        job.status = JobStatus::Processing;
        job.attempts = attempts;
        job.started_at = Some(Utc::now() - chrono::Duration::minutes(10));
        store.update(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn recovery_reschedules_or_fails_stale_leases() {
        let store = InMemoryJobStore::new();
        let retryable = stale_processing(&store, "call-1", 1).await;
        let exhausted = stale_processing(&store, "call-2", 3).await;

        let mut fresh = seed(&store, "call-3").await;
        fresh.mark_processing(Utc::now()).unwrap();
        store.update(&fresh).await.unwrap();

        let report = recover_stuck_jobs(&store, Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(report, RecoveryReport { rescheduled: 1, failed: 1 });

        let r = store.get_by_id(retryable.id).await.unwrap().unwrap();
        assert_eq!(r.status, JobStatus::Pending);
        assert_eq!(r.last_error.as_deref(), Some(INTERRUPTED_BY_RESTART));

        let e = store.get_by_id(exhausted.id).await.unwrap().unwrap();
        assert_eq!(e.status, JobStatus::Failed);

        let f = store.get_by_id(fresh.id).await.unwrap().unwrap();
        assert_eq!(f.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn batch_skips_jobs_already_in_flight() {
        let store = Arc::new(InMemoryJobStore::new());
        let a = seed(&store, "call-a").await;
        let b = seed(&store, "call-b").await;

        let in_flight = InFlight::default();
        assert!(in_flight.claim(a.id));

        let dispatcher = Dispatcher::new(store.clone(), in_flight.clone(), Duration::from_secs(1), 10);
        let (tx, mut rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        assert!(dispatcher.dispatch_batch(&tx, &cancel).await);
        // Second tick finds both still pending but both already in flight.
        assert!(dispatcher.dispatch_batch(&tx, &cancel).await);
        drop(tx);

        let mut received = Vec::new();
        while let Some(job) = rx.recv().await {
            received.push(job.id);
        }
        assert_eq!(received, vec![b.id]);
    }

    #[tokio::test]
    async fn cancel_mid_batch_leaves_rest_pending() {
        let store = Arc::new(InMemoryJobStore::new());
        for i in 0..3 {
            seed(&store, &format!("call-{i}")).await;
        }

        let in_flight = InFlight::default();
        let dispatcher = Dispatcher::new(store.clone(), in_flight.clone(), Duration::from_secs(1), 10);
        // Capacity 1 and nobody receiving: the second send blocks.
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { dispatcher.dispatch_batch(&tx, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert!(!task.await.unwrap());
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.pending, 3);
    }

    #[tokio::test]
    async fn store_outage_skips_tick() {
        let store = Arc::new(InMemoryJobStore::new());
        store.set_unavailable(true);

        let dispatcher = Dispatcher::new(store, InFlight::default(), Duration::from_secs(1), 10);
        let (tx, _rx) = mpsc::channel(1);

        assert!(dispatcher.dispatch_batch(&tx, &CancellationToken::new()).await);
    }

    #[tokio::test]
    async fn run_returns_on_cancel_and_closes_queue() {
        let store = Arc::new(InMemoryJobStore::new());
        let dispatcher = Dispatcher::new(store, InFlight::default(), Duration::from_millis(10), 4);
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(dispatcher.run(tx, cancel.clone()));
        cancel.cancel();
        handle.await.unwrap();

        assert!(rx.recv().await.is_none());
    }
}
