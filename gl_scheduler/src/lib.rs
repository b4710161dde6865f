//! ABOUTME: In-process job scheduler: one-shot and recurring cron jobs
//! ABOUTME: Bounded worker pool, atomic claim dispatch, backfill and optional file persistence

pub mod config;
pub mod cron;
pub mod error;
pub mod events;
pub mod job;
pub mod logger;
pub mod persistence;
pub mod pool;
pub mod scheduler;
pub mod store;

pub use config::{SchedulerConfig, StorageType};
pub use error::{Result, SchedulerError};
pub use events::{EventSink, NullEventSink, TracingEventSink};
pub use job::{BackfillPolicy, BackfillStrategy, ExecutionStatus, Job, JobExecution, JobStatus};
pub use logger::{Logger, TracingLogger};
pub use pool::JobExecutor;
pub use scheduler::{JobBody, JobContext, Scheduler};
pub use store::{JobStore, MemoryJobStore};
