//! ABOUTME: Scheduler facade — lifecycle, public scheduling API, dispatch and backfill
//! ABOUTME: Owns the worker pool, dispatcher tasks and per-job concurrency accounting

use crate::config::SchedulerConfig;
use crate::cron::{self, CronSchedule};
use crate::error::{Result, SchedulerError};
use crate::events::EventSink;
use crate::job::{BackfillStrategy, Job, JobExecution, JobStatus};
use crate::logger::{Logger, TracingLogger};
use crate::persistence;
use crate::pool::{JobExecutor, WorkerPool};
use crate::store::{JobStore, MemoryJobStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The cancellation-aware context passed to a job body.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub cancellation: CancellationToken,
}

/// A job body: an opaque, non-serializable async callable. Kept separate
/// from `Job` itself (see `job::Job` doc comment) and threaded through the
/// scheduler's own handler map, keyed by job id.
pub type JobBody =
    Arc<dyn Fn(JobContext) -> Pin<Box<dyn Future<Output = gl_core::Result<()>> + Send>> + Send + Sync>;

/// Shared state reachable from the worker pool, dispatcher and cron tasks
/// without needing the scheduler's own lifecycle lock.
struct Inner {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    logger: Arc<dyn Logger>,
    events: Arc<dyn EventSink>,
    bodies: RwLock<HashMap<String, JobBody>>,
    running_counts: AsyncMutex<HashMap<String, u32>>,
    cron_entries: RwLock<HashMap<String, CronSchedule>>,
    root_cancel: AsyncMutex<CancellationToken>,
}

#[async_trait]
impl JobExecutor for Inner {
    async fn execute(&self, mut job: Job) {
        self.execute_job(&mut job).await;
    }
}

impl Inner {
    async fn execute_job(&self, job: &mut Job) {
        if job.max_concurrency > 0 {
            let mut counts = self.running_counts.lock().await;
            let count = counts.entry(job.id.clone()).or_insert(0);
            if *count >= job.max_concurrency {
                self.events.emit(
                    "job.max_concurrency_reached",
                    json!({ "job_id": job.id, "max_concurrency": job.max_concurrency }),
                );
                return;
            }
            *count += 1;
        }

        let start = Utc::now();
        self.events.emit(
            "job.started",
            json!({ "job_id": job.id, "timestamp": start.to_rfc3339() }),
        );

        let mut execution = JobExecution::start(job.id.clone(), start);
        if let Err(e) = self.store.add_execution(execution.clone()).await {
            self.logger.warn(
                "failed to record execution start",
                &[("job_id", job.id.as_str()), ("error", &e.to_string())],
            );
        }

        let ctx = JobContext {
            job_id: job.id.clone(),
            cancellation: self.root_cancel.lock().await.child_token(),
        };

        let body = self.bodies.read().await.get(&job.id).cloned();
        // A resumed job without a re-registered body runs as a successful
        // no-op; see the persisted-body open question resolved in DESIGN.md.
        let result: gl_core::Result<()> = match body {
            Some(body) => body(ctx).await,
            None => Ok(()),
        };

        let end = Utc::now();
        match &result {
            Ok(()) => execution.finish_success(end),
            Err(e) => execution.finish_failure(end, e.to_string()),
        }
        if let Err(e) = self.store.update_execution(execution).await {
            self.logger.warn(
                "failed to record execution end",
                &[("job_id", job.id.as_str()), ("error", &e.to_string())],
            );
        }

        job.last_run = Some(end);
        job.updated_at = end;

        // `job` was captured at claim time and may be stale: a concurrent
        // `cancel_job` call can have moved the stored record to Cancelled
        // while the body was running. Cancelled is terminal and must not be
        // clobbered back to Pending/Completed/Failed by this write.
        let stored_status = self.store.get_job(&job.id).await.ok().map(|j| j.status);
        if stored_status == Some(JobStatus::Cancelled) {
            job.status = JobStatus::Cancelled;
        } else if job.is_recurring {
            if let Ok(schedule) = CronSchedule::parse(&job.schedule) {
                job.next_run = schedule.next(end);
            }
            job.status = JobStatus::Pending;
        } else {
            job.status = if result.is_ok() {
                JobStatus::Completed
            } else {
                JobStatus::Failed
            };
        }

        if let Err(e) = self.store.update_job(job.clone()).await {
            self.logger.error(
                "failed to persist job state after execution",
                &[("job_id", job.id.as_str()), ("error", &e.to_string())],
            );
        }

        let duration_ms = (end - start).num_milliseconds();
        match &result {
            Ok(()) => self.events.emit(
                "job.completed",
                json!({ "job_id": job.id, "duration_ms": duration_ms }),
            ),
            Err(e) => self.events.emit(
                "job.failed",
                json!({ "job_id": job.id, "duration_ms": duration_ms, "error": e.to_string() }),
            ),
        }

        if job.max_concurrency > 0 {
            let mut counts = self.running_counts.lock().await;
            if let Some(count) = counts.get_mut(&job.id) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

#[derive(Default)]
struct RunState {
    started: bool,
    cancel: CancellationToken,
    pool: Option<WorkerPool>,
    dispatcher: Option<JoinHandle<()>>,
    retention_sweeper: Option<JoinHandle<()>>,
    cron_tasks: Vec<JoinHandle<()>>,
}

/// The public scheduler service. Always used behind an `Arc` since
/// lifecycle and scheduling calls spawn tasks that outlive the call that
/// created them.
pub struct Scheduler {
    inner: Arc<Inner>,
    state: AsyncMutex<RunState>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        logger: Arc<dyn Logger>,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Inner {
                config,
                store,
                logger,
                events,
                bodies: RwLock::new(HashMap::new()),
                running_counts: AsyncMutex::new(HashMap::new()),
                cron_entries: RwLock::new(HashMap::new()),
                root_cancel: AsyncMutex::new(CancellationToken::new()),
            }),
            state: AsyncMutex::new(RunState::default()),
        })
    }

    /// Convenience constructor wiring an in-memory store and the default
    /// tracing-backed logger and event sink.
    pub fn with_memory_store(config: SchedulerConfig) -> Arc<Self> {
        Self::new(
            config,
            MemoryJobStore::shared(),
            Arc::new(TracingLogger),
            Arc::new(crate::events::TracingEventSink),
        )
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.started {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        *self.inner.root_cancel.lock().await = cancel.clone();

        if self.inner.config.enable_persistence {
            drop(state);
            self.load_persisted_jobs().await;
            state = self.state.lock().await;
        }

        let executor: Arc<dyn JobExecutor> = self.inner.clone();
        let pool = WorkerPool::spawn(
            self.inner.config.worker_count,
            self.inner.config.queue_size,
            executor,
            self.inner.events.clone(),
            self.inner.logger.clone(),
            cancel.clone(),
        );
        state.pool = Some(pool);
        state.cancel = cancel.clone();
        state.started = true;
        drop(state);

        // Initial immediate claim scan catches jobs whose NextRun already
        // elapsed, e.g. recovered from persistence.
        self.claim_and_dispatch(Utc::now()).await;

        let jobs = self.inner.store.list_jobs().await?;
        for job in jobs
            .into_iter()
            .filter(|j| j.is_recurring && j.status == JobStatus::Pending)
        {
            self.register_cron_entry(job.clone(), cancel.clone()).await;
            self.evaluate_backfill(&job).await;
        }

        let mut state = self.state.lock().await;
        state.dispatcher = Some(spawn_dispatcher_task(self.clone(), cancel.clone()));
        state.retention_sweeper = Some(spawn_retention_task(self.inner.clone(), cancel));
        drop(state);

        self.inner.events.emit(
            "scheduler.started",
            json!({
                "worker_count": self.inner.config.worker_count,
                "queue_size": self.inner.config.queue_size,
                "check_interval_secs": self.inner.config.check_interval_secs,
            }),
        );

        Ok(())
    }

    pub async fn stop(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.started {
            return Ok(());
        }
        state.cancel.cancel();
        let pool = state.pool.take();
        let dispatcher = state.dispatcher.take();
        let retention = state.retention_sweeper.take();
        let cron_tasks = std::mem::take(&mut state.cron_tasks);
        state.started = false;
        drop(state);

        let timeout = self.inner.config.shutdown_timeout();
        let shutdown = async {
            if let Some(pool) = pool {
                let _ = pool.join(timeout).await;
            }
            if let Some(handle) = dispatcher {
                let _ = handle.await;
            }
            if let Some(handle) = retention {
                let _ = handle.await;
            }
            for handle in cron_tasks {
                let _ = handle.await;
            }
        };
        let timed_out = tokio::time::timeout(timeout, shutdown).await.is_err();

        if self.inner.config.enable_persistence {
            if let Ok(jobs) = self.inner.store.list_jobs().await {
                persistence::save_best_effort(&self.inner.config.persistence_file, &jobs);
            }
        }

        self.inner.events.emit("scheduler.stopped", json!({}));

        if timed_out {
            Err(SchedulerError::SchedulerShutdownTimeout)
        } else {
            Ok(())
        }
    }

    pub async fn schedule_job(self: &Arc<Self>, mut job: Job, body: JobBody) -> Result<String> {
        if job.is_recurring {
            if job.schedule.is_empty() {
                return Err(SchedulerError::RecurringJobNeedsSchedule);
            }
            cron::validate(&job.schedule)?;
        } else if job.run_at.is_none() {
            return Err(SchedulerError::InvalidSchedule);
        }

        if job.id.is_empty() {
            job.id = gl_core::Id::new().to_string();
        }

        let now = Utc::now();
        if job.is_recurring {
            let schedule = CronSchedule::parse(&job.schedule)?;
            job.next_run = schedule.next(now);
            if job.next_run.is_none() {
                return Err(SchedulerError::JobNoValidNextRunTime);
            }
        } else {
            job.next_run = job.run_at;
        }

        self.inner.store.add_job(job.clone()).await?;
        self.inner.bodies.write().await.insert(job.id.clone(), body);

        self.inner.events.emit(
            "job.scheduled",
            json!({
                "job_id": job.id,
                "schedule": job.schedule,
                "next_run": job.next_run.map(|t| t.to_rfc3339()),
            }),
        );

        let (started, cancel) = {
            let state = self.state.lock().await;
            (state.started, state.cancel.clone())
        };
        if started && job.is_recurring {
            self.register_cron_entry(job.clone(), cancel).await;
            self.evaluate_backfill(&job).await;
        }

        Ok(job.id)
    }

    pub async fn schedule_recurring(
        self: &Arc<Self>,
        name: impl Into<String>,
        cron_expr: &str,
        body: JobBody,
    ) -> Result<String> {
        self.schedule_job(Job::recurring(name, cron_expr), body).await
    }

    pub async fn cancel_job(&self, id: &str) -> Result<()> {
        let mut job = self.inner.store.get_job(id).await?;
        job.status = JobStatus::Cancelled;
        job.updated_at = Utc::now();
        self.inner.store.update_job(job).await?;
        self.inner.cron_entries.write().await.remove(id);
        self.inner.bodies.write().await.remove(id);
        self.inner.events.emit("job.cancelled", json!({ "job_id": id }));
        Ok(())
    }

    pub async fn get_job(&self, id: &str) -> Result<Job> {
        self.inner.store.get_job(id).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.inner.store.list_jobs().await
    }

    pub async fn get_job_history(&self, id: &str) -> Result<Vec<JobExecution>> {
        self.inner.store.get_executions(id).await
    }

    pub async fn resume_job(&self, mut job: Job, body: Option<JobBody>) -> Result<String> {
        if job.id.is_empty() {
            return Err(SchedulerError::JobIdRequired);
        }
        if job.is_recurring {
            return Err(SchedulerError::InvalidSchedule);
        }
        let now = Utc::now();
        let next_run = job
            .next_run
            .filter(|t| *t > now)
            .or_else(|| job.run_at.filter(|t| *t > now));
        let Some(next_run) = next_run else {
            return Err(SchedulerError::JobNoValidNextRunTime);
        };
        job.next_run = Some(next_run);
        job.status = JobStatus::Pending;
        let id = job.id.clone();
        match self.inner.store.add_job(job.clone()).await {
            Ok(()) => {}
            Err(SchedulerError::DuplicateJobId(_)) => self.inner.store.update_job(job).await?,
            Err(e) => return Err(e),
        }
        if let Some(body) = body {
            self.inner.bodies.write().await.insert(id.clone(), body);
        }
        Ok(id)
    }

    pub async fn resume_recurring(
        self: &Arc<Self>,
        mut job: Job,
        body: Option<JobBody>,
    ) -> Result<String> {
        if job.id.is_empty() {
            return Err(SchedulerError::RecurringJobIdRequired);
        }
        if !job.is_recurring || job.schedule.is_empty() {
            return Err(SchedulerError::RecurringJobNeedsSchedule);
        }
        let schedule = CronSchedule::parse(&job.schedule)?;
        let now = Utc::now();
        let next_run = schedule.next(now).ok_or(SchedulerError::JobNoValidNextRunTime)?;
        job.next_run = Some(next_run);
        job.status = JobStatus::Pending;
        let id = job.id.clone();
        match self.inner.store.add_job(job.clone()).await {
            Ok(()) => {}
            Err(SchedulerError::DuplicateJobId(_)) => {
                self.inner.store.update_job(job.clone()).await?
            }
            Err(e) => return Err(e),
        }
        if let Some(body) = body {
            self.inner.bodies.write().await.insert(id.clone(), body);
        }

        let (started, cancel) = {
            let state = self.state.lock().await;
            (state.started, state.cancel.clone())
        };
        if started {
            self.register_cron_entry(job.clone(), cancel).await;
            self.evaluate_backfill(&job).await;
        }
        Ok(id)
    }

    async fn register_cron_entry(self: &Arc<Self>, job: Job, cancel: CancellationToken) {
        let schedule = match CronSchedule::parse(&job.schedule) {
            Ok(s) => s,
            Err(e) => {
                self.inner.logger.error(
                    "failed to register cron entry",
                    &[("job_id", job.id.as_str()), ("error", &e.to_string())],
                );
                return;
            }
        };
        self.inner
            .cron_entries
            .write()
            .await
            .insert(job.id.clone(), schedule.clone());
        let handle = spawn_cron_task(self.clone(), job.id, schedule, cancel);
        self.state.lock().await.cron_tasks.push(handle);
    }

    async fn claim_and_dispatch(&self, now: DateTime<Utc>) {
        let claimed = match self.inner.store.claim_due_jobs(now).await {
            Ok(c) => c,
            Err(e) => {
                self.inner
                    .logger
                    .error("claim_due_jobs failed", &[("error", &e.to_string())]);
                return;
            }
        };
        if claimed.is_empty() {
            return;
        }

        let mut overflow = Vec::new();
        {
            let state = self.state.lock().await;
            match state.pool.as_ref() {
                Some(pool) => {
                    for job in claimed {
                        if !pool.try_enqueue(job.clone()) {
                            overflow.push(job);
                        }
                    }
                }
                None => overflow = claimed,
            }
        }

        for mut job in overflow {
            self.inner.logger.warn(
                "dispatch queue full, leaving job pending",
                &[("job_id", job.id.as_str())],
            );
            job.status = JobStatus::Pending;
            if let Err(e) = self.inner.store.update_job(job.clone()).await {
                self.inner.logger.error(
                    "failed to revert job to pending after full queue",
                    &[("job_id", job.id.as_str()), ("error", &e.to_string())],
                );
            }
        }
    }

    async fn load_persisted_jobs(&self) {
        let path = self.inner.config.persistence_file.clone();
        match persistence::load(&path) {
            Ok(jobs) => {
                for mut job in jobs {
                    if matches!(job.status, JobStatus::Completed | JobStatus::Cancelled) {
                        continue;
                    }
                    let now = Utc::now();
                    // Non-recurring jobs keep whatever next-run they had,
                    // even if it's already past: Load only re-inserts what
                    // was there, and the immediate claim scan that Start
                    // runs right after Load is what actually fires anything
                    // overdue. Requiring a future next-run here is the
                    // explicit ResumeJob API's job, not Load's.
                    let next_run = if job.is_recurring {
                        CronSchedule::parse(&job.schedule)
                            .ok()
                            .and_then(|s| s.next(now))
                    } else {
                        job.next_run.or(job.run_at)
                    };
                    let Some(next_run) = next_run else {
                        self.inner.logger.warn(
                            "skipping persisted job with no next-run information",
                            &[("job_id", job.id.as_str())],
                        );
                        continue;
                    };
                    job.next_run = Some(next_run);
                    job.status = JobStatus::Pending;
                    if let Err(e) = self.inner.store.add_job(job.clone()).await {
                        if !matches!(e, SchedulerError::DuplicateJobId(_)) {
                            self.inner.logger.error(
                                "failed to resume persisted job",
                                &[("job_id", job.id.as_str()), ("error", &e.to_string())],
                            );
                        }
                    }
                }
            }
            Err(e) => {
                self.inner.logger.error(
                    "failed to load persisted jobs",
                    &[("path", &path.display().to_string()), ("error", &e.to_string())],
                );
            }
        }
    }

    async fn evaluate_backfill(&self, job: &Job) {
        let Some(policy) = job.backfill_policy.clone() else {
            return;
        };
        if policy.strategy == BackfillStrategy::None {
            return;
        }
        let Ok(schedule) = CronSchedule::parse(&job.schedule) else {
            return;
        };

        let now = Utc::now();
        let mut window_start = job.last_run.unwrap_or(job.created_at);
        if let Some(max_duration) = policy.max_duration {
            window_start = window_start.max(now - max_duration);
        }
        let grace_cutoff = now - chrono::Duration::minutes(5);

        let firings: Vec<DateTime<Utc>> = schedule
            .firings_between(window_start, now)
            .into_iter()
            .filter(|t| *t <= grace_cutoff)
            .collect();
        let missed_count = firings.len();

        let selected: Vec<DateTime<Utc>> = match policy.strategy {
            BackfillStrategy::None => Vec::new(),
            BackfillStrategy::All | BackfillStrategy::TimeWindow => firings,
            BackfillStrategy::Last => firings.last().copied().into_iter().collect(),
            BackfillStrategy::Bounded => {
                let max = policy.max_missed.unwrap_or(5) as usize;
                let skip = firings.len().saturating_sub(max);
                firings[skip..].to_vec()
            }
        };

        if selected.is_empty() {
            return;
        }

        let mut backfilled = 0u32;
        for fire_time in &selected {
            let backfill_id = format!("{}-backfill-{}", job.id, fire_time.timestamp());
            let mut backfill_job = job.clone();
            backfill_job.id = backfill_id.clone();
            backfill_job.is_recurring = false;
            backfill_job.schedule = String::new();
            backfill_job.run_at = Some(now);
            backfill_job.next_run = Some(now);
            backfill_job.status = JobStatus::Pending;
            backfill_job.backfill_policy = None;
            backfill_job.created_at = now;
            backfill_job.updated_at = now;
            backfill_job
                .metadata
                .insert("is_backfill".to_string(), serde_json::Value::Bool(true));
            backfill_job.metadata.insert(
                "original_schedule_time".to_string(),
                serde_json::Value::String(fire_time.to_rfc3339()),
            );
            backfill_job
                .metadata
                .insert("backfill_priority".to_string(), json!(policy.priority));

            if let Err(e) = self.inner.store.add_job(backfill_job.clone()).await {
                self.inner.logger.warn(
                    "failed to store backfill job",
                    &[("job_id", backfill_id.as_str()), ("error", &e.to_string())],
                );
                continue;
            }
            if let Some(body) = self.inner.bodies.read().await.get(&job.id).cloned() {
                self.inner.bodies.write().await.insert(backfill_id, body);
            }
            backfilled += 1;
        }

        self.claim_and_dispatch(now).await;

        self.inner.events.emit(
            "job.backfill_processed",
            json!({ "job_id": job.id, "missed_count": missed_count, "backfilled_count": backfilled }),
        );
    }
}

fn spawn_dispatcher_task(scheduler: Arc<Scheduler>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(scheduler.inner.config.check_interval());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    scheduler.claim_and_dispatch(Utc::now()).await;
                }
            }
        }
    })
}

fn spawn_retention_task(inner: Arc<Inner>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(inner.config.retention_sweep_interval());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let before = Utc::now() - inner.config.retention_duration();
                    match inner.store.cleanup_executions(before).await {
                        Ok(0) => {}
                        Ok(n) => inner
                            .logger
                            .debug("retention sweep removed executions", &[("count", &n.to_string())]),
                        Err(e) => inner
                            .logger
                            .error("retention sweep failed", &[("error", &e.to_string())]),
                    }
                }
            }
        }
    })
}

fn spawn_cron_task(
    scheduler: Arc<Scheduler>,
    job_id: String,
    schedule: CronSchedule,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut from = Utc::now();
        loop {
            let Some(next_fire) = schedule.next(from) else {
                break;
            };
            let sleep_for = (next_fire - Utc::now()).to_std().unwrap_or(std::time::Duration::ZERO);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep_for) => {}
            }

            let still_registered = scheduler.inner.cron_entries.read().await.contains_key(&job_id);
            if !still_registered {
                break;
            }
            // The cron path's role is to wake the queue promptly; the
            // shared atomic claim is what actually prevents double-dispatch
            // against the polling path.
            scheduler.claim_and_dispatch(Utc::now()).await;
            from = next_fire;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    fn noop_body() -> JobBody {
        Arc::new(|_ctx| Box::pin(async { Ok(()) }))
    }

    fn failing_body(message: &'static str) -> JobBody {
        Arc::new(move |_ctx| Box::pin(async move { Err(gl_core::Error::External(message.to_string())) }))
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            worker_count: 2,
            queue_size: 16,
            check_interval_secs: 1,
            ..SchedulerConfig::default()
        }
    }

    #[tokio::test]
    async fn immediate_one_shot_completes() {
        let scheduler = Scheduler::with_memory_store(fast_config());
        scheduler.start().await.unwrap();

        let id = scheduler
            .schedule_job(Job::one_shot("a", Utc::now()), noop_body())
            .await
            .unwrap();

        let mut completed = false;
        for _ in 0..50 {
            if scheduler.get_job(&id).await.unwrap().status == JobStatus::Completed {
                completed = true;
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        assert!(completed);

        let history = scheduler.get_job_history(&id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, crate::job::ExecutionStatus::Completed);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failing_body_marks_job_failed() {
        let scheduler = Scheduler::with_memory_store(fast_config());
        scheduler.start().await.unwrap();

        let id = scheduler
            .schedule_job(Job::one_shot("b", Utc::now()), failing_body("intentional failure"))
            .await
            .unwrap();

        let mut job = scheduler.get_job(&id).await.unwrap();
        for _ in 0..50 {
            if job.status == JobStatus::Failed {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            job = scheduler.get_job(&id).await.unwrap();
        }
        assert_eq!(job.status, JobStatus::Failed);

        let history = scheduler.get_job_history(&id).await.unwrap();
        assert_eq!(history[0].status, crate::job::ExecutionStatus::Failed);
        assert!(history[0].error.as_deref().unwrap().contains("intentional failure"));

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failed_job_emits_job_failed_event_with_error_text() {
        use crate::events::test_support::RecordingEventSink;

        let events = Arc::new(RecordingEventSink::default());
        let scheduler = Scheduler::new(
            fast_config(),
            MemoryJobStore::shared(),
            Arc::new(TracingLogger),
            events.clone(),
        );
        scheduler.start().await.unwrap();

        let id = scheduler
            .schedule_job(Job::one_shot("c", Utc::now()), failing_body("boom"))
            .await
            .unwrap();

        let mut failed = false;
        for _ in 0..50 {
            if scheduler.get_job(&id).await.unwrap().status == JobStatus::Failed {
                failed = true;
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        assert!(failed);

        let recorded = events.events.lock().unwrap();
        let payload = recorded
            .iter()
            .find(|(event_type, _)| event_type == "job.failed")
            .map(|(_, payload)| payload.clone())
            .expect("job.failed event recorded");
        drop(recorded);
        assert!(payload["error"].as_str().unwrap().contains("boom"));

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_prevents_further_dispatch() {
        let scheduler = Scheduler::with_memory_store(fast_config());
        scheduler.start().await.unwrap();

        let id = scheduler
            .schedule_recurring("hb", "* * * * *", noop_body())
            .await
            .unwrap();

        scheduler.cancel_job(&id).await.unwrap();
        let job = scheduler.get_job(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        let history_len = scheduler.get_job_history(&id).await.unwrap().len();
        assert_eq!(history_len, 0);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn cancelling_a_running_job_is_not_clobbered_by_its_own_completion() {
        // Regression test: `Inner::execute_job` captures its `Job` at claim
        // time. If `cancel_job` flips the stored record to Cancelled while
        // the body is still running, the eventual completion write must not
        // resurrect it to Completed/Pending.
        let mut job = Job::one_shot("will-be-cancelled", Utc::now());
        job.id = "cancel-race-job".to_string();
        job.status = JobStatus::Running;

        let scheduler = Scheduler::with_memory_store(fast_config());
        scheduler.inner.store.add_job(job.clone()).await.unwrap();

        let started = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let body: JobBody = {
            let started = started.clone();
            let release = release.clone();
            Arc::new(move |_ctx| {
                let started = started.clone();
                let release = release.clone();
                Box::pin(async move {
                    started.notify_one();
                    release.notified().await;
                    Ok(())
                })
            })
        };
        scheduler
            .inner
            .bodies
            .write()
            .await
            .insert(job.id.clone(), body);

        let inner = scheduler.inner.clone();
        let mut running_job = job.clone();
        let handle = tokio::spawn(async move {
            inner.execute_job(&mut running_job).await;
        });

        started.notified().await;
        scheduler.cancel_job(&job.id).await.unwrap();
        release.notify_one();
        handle.await.unwrap();

        let stored = scheduler.get_job(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn max_concurrency_gate_limits_simultaneous_runs() {
        // Drives `Inner::execute_job` directly, bypassing the worker pool
        // entirely, so the assertion exercises the per-job counter in
        // `running_counts` rather than the pool's own worker count.
        let scheduler = Scheduler::with_memory_store(fast_config());

        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut job = Job::one_shot("capped", Utc::now()).with_max_concurrency(2);
        job.id = "capped-job".to_string();
        scheduler.inner.store.add_job(job.clone()).await.unwrap();

        let body: JobBody = {
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            Arc::new(move |_ctx| {
                let concurrent = concurrent.clone();
                let peak = peak.clone();
                Box::pin(async move {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(StdDuration::from_millis(50)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
        };
        scheduler
            .inner
            .bodies
            .write()
            .await
            .insert(job.id.clone(), body);

        let mut handles = Vec::new();
        for _ in 0..5 {
            let inner = scheduler.inner.clone();
            let mut job = job.clone();
            handles.push(tokio::spawn(async move {
                inner.execute_job(&mut job).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let scheduler = Scheduler::with_memory_store(fast_config());
        scheduler.start().await.unwrap();
        scheduler.stop().await.unwrap();
        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn scheduling_without_run_at_or_schedule_fails() {
        let scheduler = Scheduler::with_memory_store(fast_config());
        let mut job = Job::one_shot("bad", Utc::now());
        job.run_at = None;
        job.next_run = None;
        let err = scheduler.schedule_job(job, noop_body()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule));
    }

    #[tokio::test]
    async fn invalid_cron_rejected_before_store_mutation() {
        let scheduler = Scheduler::with_memory_store(fast_config());
        let job = Job::recurring("bad", "not a cron");
        let err = scheduler.schedule_job(job, noop_body()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidCronExpression { .. }));
        assert!(scheduler.list_jobs().await.unwrap().is_empty());
    }
}
