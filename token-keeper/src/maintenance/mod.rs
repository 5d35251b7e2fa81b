//! Periodic maintenance: retention cleanup, key rotation and the token refresh sweep.

pub mod error;
pub mod history;
pub mod jobs;
pub mod scheduler;

pub use error::SchedulerError;
pub use history::{DEFAULT_HISTORY_CAPACITY, JobHistory, JobRun, JobTrigger};
pub use jobs::{CredentialMaintenance, JobExecutor, JobName, MaintenanceConfig};
pub use scheduler::{MaintenanceScheduler, SchedulerHealth, SchedulerStatus};
