//! Scheduler error types.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("Unknown maintenance job: {0}")]
    UnknownJob(String),

    /// Runs never overlap; the request was recorded as skipped.
    #[error("Cannot run {requested}: {running} is already running")]
    JobAlreadyRunning { requested: String, running: String },

    #[error("Invalid schedule for {job}: {reason}")]
    InvalidSchedule { job: String, reason: String },

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Scheduler is already running")]
    AlreadyRunning,
}
