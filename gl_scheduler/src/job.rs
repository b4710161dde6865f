//! ABOUTME: Core data types for the job scheduling system
//! ABOUTME: Defines job definitions, execution history and backfill policy

use chrono::{DateTime, Utc};
use gl_core::Id;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle state of a job.
///
/// `Running` is set the moment the store's atomic claim succeeds, not when
/// the job body actually starts executing — the `job.started` event marks
/// the latter. A reader that only watches `Status` therefore sees "claimed"
/// slightly before "body running".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Backfill strategy for a recurring job's missed firings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStrategy {
    /// Never backfill missed firings.
    None,
    /// Backfill every missed firing inside the scan window.
    All,
    /// Backfill only the most recent missed firing.
    Last,
    /// Backfill up to `max_missed` of the most recent missed firings.
    Bounded,
    /// Backfill every missed firing, bounded only by the time window.
    TimeWindow,
}

/// Policy controlling how a recurring job's missed firings are backfilled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillPolicy {
    pub strategy: BackfillStrategy,
    /// Used by `Bounded`; defaults to 5 when unset.
    pub max_missed: Option<u32>,
    /// Clamps the scan window to `[now - max_duration, now]` when set.
    pub max_duration: Option<chrono::Duration>,
    pub priority: i32,
}

impl BackfillPolicy {
    pub fn none() -> Self {
        Self {
            strategy: BackfillStrategy::None,
            max_missed: None,
            max_duration: None,
            priority: 0,
        }
    }

    pub fn bounded(max_missed: u32) -> Self {
        Self {
            strategy: BackfillStrategy::Bounded,
            max_missed: Some(max_missed),
            max_duration: None,
            priority: 0,
        }
    }
}

impl Default for BackfillPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// A scheduled unit of work.
///
/// `body` is intentionally absent from this struct: it cannot be
/// serialized, so it is threaded separately through the scheduler's
/// in-memory handler map (see `scheduler::Scheduler`), keyed by job id.
/// Persisted/reloaded jobs therefore come back without a body until the
/// caller re-registers one; see `spec.md` §9 and `DESIGN.md` for the
/// resulting no-op semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    /// Cron expression; empty for non-recurring jobs.
    pub schedule: String,
    /// Absolute fire instant; only meaningful for non-recurring jobs.
    pub run_at: Option<DateTime<Utc>>,
    pub is_recurring: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: JobStatus,
    pub last_run: Option<DateTime<Utc>>,
    /// Authoritative "when to fire next" field used by the dispatcher.
    pub next_run: Option<DateTime<Utc>>,
    /// Zero means unlimited concurrent executions of this job.
    pub max_concurrency: u32,
    pub backfill_policy: Option<BackfillPolicy>,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Job {
    /// Build a non-recurring job definition. `next_run` is set to `run_at`.
    pub fn one_shot(name: impl Into<String>, run_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: Id::new().to_string(),
            name: name.into(),
            schedule: String::new(),
            run_at: Some(run_at),
            is_recurring: false,
            created_at: now,
            updated_at: now,
            status: JobStatus::Pending,
            last_run: None,
            next_run: Some(run_at),
            max_concurrency: 0,
            backfill_policy: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Build a recurring job definition. `next_run` is computed by the
    /// caller (the scheduler facade) since it requires the cron evaluator.
    pub fn recurring(name: impl Into<String>, schedule: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Id::new().to_string(),
            name: name.into(),
            schedule: schedule.into(),
            run_at: None,
            is_recurring: true,
            created_at: now,
            updated_at: now,
            status: JobStatus::Pending,
            last_run: None,
            next_run: None,
            max_concurrency: 0,
            backfill_policy: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: u32) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_backfill_policy(mut self, policy: BackfillPolicy) -> Self {
        self.backfill_policy = Some(policy);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_run.is_some_and(|t| t <= now)
    }
}

/// A record of one attempted run of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub job_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    /// Best-effort hostname this execution ran on.
    pub executed_on: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl JobExecution {
    pub fn start(job_id: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            start_time,
            end_time: None,
            status: ExecutionStatus::Running,
            error: None,
            executed_on: hostname::get().ok().and_then(|h| h.into_string().ok()),
        }
    }

    pub fn finish_success(&mut self, end_time: DateTime<Utc>) {
        self.end_time = Some(end_time);
        self.status = ExecutionStatus::Completed;
    }

    pub fn finish_failure(&mut self, end_time: DateTime<Utc>, error: String) {
        self.end_time = Some(end_time);
        self.status = ExecutionStatus::Failed;
        self.error = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_job_sets_next_run_to_run_at() {
        let run_at = Utc::now() + chrono::Duration::seconds(30);
        let job = Job::one_shot("test", run_at);
        assert_eq!(job.next_run, Some(run_at));
        assert!(!job.is_recurring);
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn recurring_job_has_no_run_at() {
        let job = Job::recurring("heartbeat", "* * * * *");
        assert!(job.is_recurring);
        assert!(job.run_at.is_none());
        assert!(job.next_run.is_none());
    }

    #[test]
    fn is_due_requires_pending_and_elapsed_next_run() {
        let now = Utc::now();
        let mut job = Job::one_shot("t", now - chrono::Duration::seconds(1));
        assert!(job.is_due(now));
        job.status = JobStatus::Running;
        assert!(!job.is_due(now));
    }

    #[test]
    fn execution_lifecycle() {
        let start = Utc::now();
        let mut exec = JobExecution::start("job-1", start);
        assert_eq!(exec.status, ExecutionStatus::Running);
        exec.finish_success(start + chrono::Duration::seconds(1));
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert!(exec.error.is_none());
    }
}
