//! Job storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;

use genq_core::{Job, JobId, JobStatus};

/// Durable job persistence.
///
/// The store is the single source of truth for job state. Callers always get
/// owned copies back; nothing hands out live references.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job.
    ///
    /// Fails with [`JobStoreError::ActiveJobExists`] if a non-terminal job
    /// already exists for the same work-key.
    async fn create(&self, job: &Job) -> Result<(), JobStoreError>;

    async fn get_by_id(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// The active job for the work-key if there is one, otherwise the most
    /// recently created job.
    async fn get_by_work_key(&self, work_key: &str) -> Result<Option<Job>, JobStoreError>;

    /// Overwrite a job. Fails if the id is unknown, or with
    /// [`JobStoreError::ActiveJobExists`] if the write would leave two
    /// non-terminal jobs for one work-key.
    async fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Up to `limit` jobs that are `pending` and due now.
    async fn get_pending_jobs(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Jobs `processing` whose lease was taken more than `older_than` ago.
    async fn get_processing_jobs(&self, older_than: Duration) -> Result<Vec<Job>, JobStoreError>;

    async fn count_by_status(&self) -> Result<JobCounts, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("an active job already exists for work key {0}")]
    ActiveJobExists(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobCounts {
    pub fn get(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Processing => self.processing,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }

    fn bump(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    unavailable: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a storage error, to simulate an outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), JobStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(JobStoreError::Storage("store unavailable".to_string()));
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.check_available()?;
        Ok(self.jobs.read().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.check_available()?;
        Ok(self.jobs.write().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        if !job.is_terminal()
            && jobs
                .values()
                .any(|j| j.work_key == job.work_key && !j.is_terminal())
        {
            return Err(JobStoreError::ActiveJobExists(job.work_key.clone()));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_by_id(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.get(&job_id).cloned())
    }

    async fn get_by_work_key(&self, work_key: &str) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.read()?;
        // At most one job per key is active; it wins over any newer terminal job.
        Ok(jobs
            .values()
            .filter(|j| j.work_key == work_key)
            .max_by_key(|j| (!j.is_terminal(), j.created_at, j.id))
            .cloned())
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        if !jobs.contains_key(&job.id) {
            return Err(JobStoreError::NotFound(job.id));
        }
        if !job.is_terminal()
            && jobs
                .values()
                .any(|j| j.id != job.id && j.work_key == job.work_key && !j.is_terminal())
        {
            return Err(JobStoreError::ActiveJobExists(job.work_key.clone()));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_pending_jobs(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read()?;
        let now = Utc::now();

        let mut ready: Vec<_> = jobs.values().filter(|j| j.is_ready(now)).cloned().collect();

        // Longest-waiting first keeps a backlog from starving its oldest jobs.
        ready.sort_by_key(|j| (j.scheduled_at, j.id));
        ready.truncate(limit);
        Ok(ready)
    }

    async fn get_processing_jobs(&self, older_than: Duration) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read()?;
        let now = Utc::now();

        let mut stuck: Vec<_> = jobs
            .values()
            .filter(|j| j.is_stuck(now, older_than))
            .cloned()
            .collect();
        stuck.sort_by_key(|j| j.started_at);
        Ok(stuck)
    }

    async fn count_by_status(&self) -> Result<JobCounts, JobStoreError> {
        let jobs = self.read()?;
        let mut counts = JobCounts::default();
        for job in jobs.values() {
            counts.bump(job.status);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(key: &str) -> Job {
        Job::new(key, Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn create_and_get() {
        let store = InMemoryJobStore::new();
        let job = job("call-1");
        store.create(&job).await.unwrap();

        assert_eq!(store.get_by_id(job.id).await.unwrap(), Some(job.clone()));
        assert_eq!(store.get_by_work_key("call-1").await.unwrap(), Some(job));
        assert!(store.get_by_work_key("call-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_id_and_active_key_are_rejected() {
        let store = InMemoryJobStore::new();
        let first = job("call-1");
        store.create(&first).await.unwrap();

        assert!(matches!(
            store.create(&first).await,
            Err(JobStoreError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.create(&job("call-1")).await,
            Err(JobStoreError::ActiveJobExists(key)) if key == "call-1"
        ));
    }

    #[tokio::test]
    async fn new_job_allowed_once_previous_is_terminal() {
        let store = InMemoryJobStore::new();
        let mut first = job("call-1");
        first.mark_processing(Utc::now()).unwrap();
        first.mark_completed(Utc::now()).unwrap();
        store.create(&first).await.unwrap();

        let second = job("call-1");
        store.create(&second).await.unwrap();

        let latest = store.get_by_work_key("call-1").await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
    }

    fn failed(key: &str) -> Job {
        let mut j = job(key);
        j.mark_processing(Utc::now()).unwrap();
        j.max_attempts = 1;
        j.mark_failed("boom", Utc::now()).unwrap();
        j
    }

    #[tokio::test]
    async fn work_key_lookup_prefers_active_job() {
        let store = InMemoryJobStore::new();
        let mut older = failed("call-1");
        store.create(&older).await.unwrap();

        let mut newer = job("call-1");
        newer.mark_processing(Utc::now()).unwrap();
        newer.mark_completed(Utc::now()).unwrap();
        store.create(&newer).await.unwrap();
        assert_eq!(store.get_by_work_key("call-1").await.unwrap().unwrap().id, newer.id);

        older.reopen(Utc::now()).unwrap();
        store.update(&older).await.unwrap();
        assert_eq!(store.get_by_work_key("call-1").await.unwrap().unwrap().id, older.id);
    }

    #[tokio::test]
    async fn update_cannot_make_a_second_active_job() {
        let store = InMemoryJobStore::new();
        let mut a = failed("call-1");
        let mut b = failed("call-1");
        store.create(&a).await.unwrap();
        store.create(&b).await.unwrap();

        a.reopen(Utc::now()).unwrap();
        store.update(&a).await.unwrap();

        b.reopen(Utc::now()).unwrap();
        assert!(matches!(
            store.update(&b).await,
            Err(JobStoreError::ActiveJobExists(key)) if key == "call-1"
        ));
        let stored = store.get_by_id(b.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn update_unknown_job_fails() {
        let store = InMemoryJobStore::new();
        assert!(matches!(
            store.update(&job("call-1")).await,
            Err(JobStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn pending_query_respects_schedule_and_limit() {
        let store = InMemoryJobStore::new();
        for i in 0..5 {
            store.create(&job(&format!("call-{i}"))).await.unwrap();
        }
        let mut later = job("call-later");
        later.scheduled_at = Utc::now() + chrono::Duration::minutes(5);
        store.create(&later).await.unwrap();

        let mut processing = job("call-busy");
        processing.mark_processing(Utc::now()).unwrap();
        store.create(&processing).await.unwrap();

        let ready = store.get_pending_jobs(10).await.unwrap();
        assert_eq!(ready.len(), 5);
        assert!(ready.iter().all(|j| j.status == JobStatus::Pending));
        assert!(ready.iter().all(|j| j.id != later.id));

        assert_eq!(store.get_pending_jobs(2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn processing_query_finds_only_stale_leases() {
        let store = InMemoryJobStore::new();

        let mut stale = job("call-stale");
        stale
            .mark_processing(Utc::now() - chrono::Duration::minutes(10))
            .unwrap();
        store.create(&stale).await.unwrap();

        let mut fresh = job("call-fresh");
        fresh.mark_processing(Utc::now()).unwrap();
        store.create(&fresh).await.unwrap();

        let stuck = store
            .get_processing_jobs(Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, stale.id);
    }

    #[tokio::test]
    async fn counts_by_status() {
        let store = InMemoryJobStore::new();
        store.create(&job("a")).await.unwrap();
        store.create(&job("b")).await.unwrap();
        let mut c = job("c");
        c.mark_processing(Utc::now()).unwrap();
        store.create(&c).await.unwrap();

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.processing, 1);
        assert_eq!(counts.get(JobStatus::Completed), 0);
        assert_eq!(counts.total(), 3);
    }

    #[tokio::test]
    async fn outage_fails_every_operation() {
        let store = InMemoryJobStore::new();
        store.set_unavailable(true);

        assert!(matches!(
            store.create(&job("a")).await,
            Err(JobStoreError::Storage(_))
        ));
        assert!(store.count_by_status().await.is_err());

        store.set_unavailable(false);
        assert!(store.create(&job("a")).await.is_ok());
    }
}
