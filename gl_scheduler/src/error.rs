//! ABOUTME: Error taxonomy for the job scheduler
//! ABOUTME: Crate-local errors that map onto gl_core::Error at the boundary

/// Errors produced by the scheduler's store, cron evaluator and facade.
///
/// Every public operation in this crate returns `Result<T, SchedulerError>`
/// rather than `gl_core::Result` so callers can match on the precise
/// variant; `From<SchedulerError> for gl_core::Error` is provided for code
/// that needs to cross into the rest of the workspace's shared error type.
#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("job with id {0} already exists")]
    DuplicateJobId(String),

    #[error("job with id {0} not found")]
    JobNotFound(String),

    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCronExpression { expr: String, reason: String },

    #[error("job must set exactly one of run_at or schedule")]
    InvalidSchedule,

    #[error("recurring job requires a non-empty schedule")]
    RecurringJobNeedsSchedule,

    #[error("job id is required to resume a job")]
    JobIdRequired,

    #[error("recurring job id is required to resume a job")]
    RecurringJobIdRequired,

    #[error("job has no valid future next-run time")]
    JobNoValidNextRunTime,

    #[error("scheduler shutdown exceeded its deadline")]
    SchedulerShutdownTimeout,

    #[error("persistence operation failed: {0}")]
    PersistenceFailed(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

impl From<SchedulerError> for gl_core::Error {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::JobNotFound(_) => gl_core::Error::NotFound(err.to_string()),
            SchedulerError::DuplicateJobId(_)
            | SchedulerError::InvalidCronExpression { .. }
            | SchedulerError::InvalidSchedule
            | SchedulerError::RecurringJobNeedsSchedule
            | SchedulerError::JobIdRequired
            | SchedulerError::RecurringJobIdRequired
            | SchedulerError::JobNoValidNextRunTime => gl_core::Error::Validation(err.to_string()),
            SchedulerError::SchedulerShutdownTimeout => gl_core::Error::External(err.to_string()),
            SchedulerError::PersistenceFailed(_) => gl_core::Error::Storage(err.to_string()),
        }
    }
}
