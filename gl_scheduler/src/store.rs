//! ABOUTME: Job store trait and in-memory implementation
//! ABOUTME: Owns job definitions and append-only execution history with atomic claim

use crate::error::{Result, SchedulerError};
use crate::job::{Job, JobExecution, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Storage contract the dispatcher and scheduler facade rely on.
///
/// `claim_due_jobs` is the one operation whose atomicity is load-bearing:
/// the polling path and the cron path both call it (indirectly, via the
/// scheduler), and its "flip to Running and return" must be indivisible
/// with respect to every other caller, or the same job could be dispatched
/// twice.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn add_job(&self, job: Job) -> Result<()>;
    async fn update_job(&self, job: Job) -> Result<()>;
    async fn get_job(&self, id: &str) -> Result<Job>;
    async fn list_jobs(&self) -> Result<Vec<Job>>;
    async fn delete_job(&self, id: &str) -> Result<()>;

    /// Atomically claim every Pending job whose `next_run <= now`, flipping
    /// each to Running and stamping `updated_at` before returning.
    async fn claim_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>>;

    async fn add_execution(&self, exec: JobExecution) -> Result<()>;
    async fn update_execution(&self, exec: JobExecution) -> Result<()>;
    async fn get_executions(&self, job_id: &str) -> Result<Vec<JobExecution>>;

    /// Drop execution records with `start_time <= before`. Best-effort:
    /// callers log failures rather than propagate them.
    async fn cleanup_executions(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// In-memory job store. Two independent read-write locks (jobs, history)
/// keep metadata reads from contending with execution-history appends;
/// `claim_due_jobs` holds the jobs write lock for its entire body so the
/// claim is atomic by construction.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
    executions: RwLock<HashMap<String, Vec<JobExecution>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn add_job(&self, job: Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(SchedulerError::DuplicateJobId(job.id));
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn update_job(&self, job: Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if !jobs.contains_key(&job.id) {
            return Err(SchedulerError::JobNotFound(job.id));
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Job> {
        let jobs = self.jobs.read().await;
        jobs.get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;
        Ok(jobs.values().cloned().collect())
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        jobs.remove(id)
            .map(|_| ())
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))
    }

    async fn claim_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut jobs = self.jobs.write().await;
        let mut claimed = Vec::new();
        for job in jobs.values_mut() {
            if job.is_due(now) {
                job.status = JobStatus::Running;
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed due jobs");
        }
        Ok(claimed)
    }

    async fn add_execution(&self, exec: JobExecution) -> Result<()> {
        let mut executions = self.executions.write().await;
        executions.entry(exec.job_id.clone()).or_default().push(exec);
        Ok(())
    }

    async fn update_execution(&self, exec: JobExecution) -> Result<()> {
        let mut executions = self.executions.write().await;
        let history = executions
            .get_mut(&exec.job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(exec.job_id.clone()))?;
        let slot = history
            .iter_mut()
            .find(|e| e.start_time == exec.start_time)
            .ok_or_else(|| SchedulerError::JobNotFound(exec.job_id.clone()))?;
        *slot = exec;
        Ok(())
    }

    async fn get_executions(&self, job_id: &str) -> Result<Vec<JobExecution>> {
        let executions = self.executions.read().await;
        Ok(executions.get(job_id).cloned().unwrap_or_default())
    }

    async fn cleanup_executions(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut executions = self.executions.write().await;
        let mut removed = 0u64;
        for history in executions.values_mut() {
            let before_len = history.len();
            history.retain(|e| e.start_time > before);
            removed += (before_len - history.len()) as u64;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobExecution;

    #[tokio::test]
    async fn add_job_rejects_duplicates() {
        let store = MemoryJobStore::new();
        let job = Job::one_shot("a", Utc::now());
        store.add_job(job.clone()).await.unwrap();
        let err = store.add_job(job).await.unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateJobId(_)));
    }

    #[tokio::test]
    async fn claim_due_jobs_is_atomic_across_concurrent_callers() {
        let store = Arc::new(MemoryJobStore::new());
        let now = Utc::now();
        for _ in 0..20 {
            store
                .add_job(Job::one_shot("t", now - chrono::Duration::seconds(1)))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.claim_due_jobs(now).await.unwrap() }));
        }

        let mut all_claimed = Vec::new();
        for handle in handles {
            all_claimed.extend(handle.await.unwrap());
        }

        // Union across all callers is disjoint and covers every due job exactly once.
        let mut ids: Vec<_> = all_claimed.iter().map(|j| j.id.clone()).collect();
        ids.sort();
        let mut dedup = ids.clone();
        dedup.dedup();
        assert_eq!(ids.len(), dedup.len());
        assert_eq!(ids.len(), 20);

        for job in store.list_jobs().await.unwrap() {
            assert_eq!(job.status, JobStatus::Running);
        }
    }

    #[tokio::test]
    async fn update_execution_requires_matching_start_time() {
        let store = MemoryJobStore::new();
        let start = Utc::now();
        store
            .add_execution(JobExecution::start("job-1", start))
            .await
            .unwrap();
        let mut exec = JobExecution::start("job-1", start);
        exec.finish_success(start + chrono::Duration::seconds(1));
        store.update_execution(exec).await.unwrap();

        let history = store.get_executions("job-1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, crate::job::ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn cleanup_executions_drops_old_records() {
        let store = MemoryJobStore::new();
        let old = Utc::now() - chrono::Duration::days(10);
        let recent = Utc::now();
        store.add_execution(JobExecution::start("job-1", old)).await.unwrap();
        store.add_execution(JobExecution::start("job-1", recent)).await.unwrap();

        let removed = store
            .cleanup_executions(Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let remaining = store.get_executions("job-1").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].start_time, recent);
    }
}
