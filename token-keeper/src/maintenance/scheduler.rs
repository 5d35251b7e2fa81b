//! Cron-driven maintenance scheduler.
//!
//! Every job has its own timer task, but at most one job executes at a
//! time. A trigger that fires while another job is running is skipped and
//! recorded in the history; it is never queued.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use cron::Schedule;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::error::SchedulerError;
use super::history::{JobHistory, JobRun, JobTrigger};
use super::jobs::{JobExecutor, JobName, MaintenanceConfig};
use crate::clock::SharedClock;

/// Snapshot returned by [`MaintenanceScheduler::status`].
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub current_job: Option<JobName>,
    /// Newest first.
    pub recent_jobs: Vec<JobRun>,
    pub next_runs: BTreeMap<JobName, DateTime<Utc>>,
}

/// Result of [`MaintenanceScheduler::health_check`].
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerHealth {
    pub healthy: bool,
    pub is_running: bool,
    pub failing_jobs: Vec<JobName>,
    pub consecutive_failures: BTreeMap<JobName, u32>,
}

/// Runs maintenance jobs on their cron schedules without overlap.
pub struct MaintenanceScheduler {
    config: MaintenanceConfig,
    schedules: Vec<(JobName, Schedule)>,
    executor: Arc<dyn JobExecutor>,
    clock: SharedClock,
    running: AtomicBool,
    job_running: AtomicBool,
    current_job: Mutex<Option<JobName>>,
    history: JobHistory,
    consecutive_failures: Mutex<HashMap<JobName, u32>>,
    cancel: Mutex<CancellationToken>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Runs started by the timers.
    runs: TaskTracker,
}

impl MaintenanceScheduler {
    /// Create a stopped scheduler. Fails if any cron expression is invalid.
    pub fn new(
        config: MaintenanceConfig,
        executor: Arc<dyn JobExecutor>,
        clock: SharedClock,
    ) -> Result<Self, SchedulerError> {
        let schedules = JobName::ALL
            .into_iter()
            .map(|job| {
                Schedule::from_str(config.cron_for(job))
                    .map(|schedule| (job, schedule))
                    .map_err(|e| SchedulerError::InvalidSchedule {
                        job: job.to_string(),
                        reason: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            history: JobHistory::new(config.history_capacity),
            config,
            schedules,
            executor,
            clock,
            running: AtomicBool::new(false),
            job_running: AtomicBool::new(false),
            current_job: Mutex::new(None),
            consecutive_failures: Mutex::new(HashMap::new()),
            cancel: Mutex::new(CancellationToken::new()),
            handles: Mutex::new(Vec::new()),
            runs: TaskTracker::new(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn one timer task per job.
    pub fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();
        self.runs.reopen();

        let mut handles = self.handles.lock();
        for (job, schedule) in &self.schedules {
            let scheduler = Arc::clone(self);
            let schedule = schedule.clone();
            let cancel = cancel.clone();
            let job = *job;
            handles.push(tokio::spawn(async move {
                scheduler.run_job_loop(job, schedule, cancel).await;
            }));
        }

        info!(jobs = self.schedules.len(), "Maintenance scheduler started");
        Ok(())
    }

    /// Stop the timers. A job already executing runs to completion.
    pub fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }
        self.cancel.lock().cancel();
        info!("Maintenance scheduler stopped");
        Ok(())
    }

    /// Stop and wait for the timer tasks and any job they started to finish.
    pub async fn shutdown(&self) {
        let _ = self.stop();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduler task ended abnormally");
            }
        }
        self.runs.close();
        self.runs.wait().await;
    }

    /// Fires `job` at each occurrence of `schedule`. Runs are spawned so the
    /// timer keeps ticking, and a tick that lands during a run is skipped.
    async fn run_job_loop(
        self: Arc<Self>,
        job: JobName,
        schedule: Schedule,
        cancel: CancellationToken,
    ) {
        let mut after = self.clock.now();
        loop {
            let Some(next) = schedule.after(&after).next() else {
                warn!(job = %job, "Schedule has no upcoming runs");
                return;
            };
            let wait = (next - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
            debug!(job = %job, next = %next, wait_secs = wait.as_secs(), "Next run scheduled");

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }

            // Never compute the next occurrence from before the one just fired.
            after = next.max(self.clock.now());

            let scheduler = Arc::clone(&self);
            self.runs.spawn(async move {
                if let Err(e) = scheduler.fire(job, JobTrigger::Scheduled).await {
                    debug!(job = %job, error = %e, "Scheduled run skipped");
                }
            });
        }
    }

    /// Run `job` now unless another job is running.
    ///
    /// Every trigger goes through here. A rejected trigger is recorded in
    /// the history as skipped.
    pub async fn fire(&self, job: JobName, trigger: JobTrigger) -> Result<JobRun, SchedulerError> {
        let slot = self.try_begin(job, trigger)?;
        Ok(self.execute(slot).await)
    }

    /// Run a job by name (`vault_cleanup`, `key_rotation`, `token_refresh_sweep`).
    pub async fn manual_run(&self, name: &str) -> Result<JobRun, SchedulerError> {
        let job = JobName::from_str(name)?;
        self.fire(job, JobTrigger::Manual).await
    }

    fn try_begin(&self, job: JobName, trigger: JobTrigger) -> Result<RunSlot<'_>, SchedulerError> {
        let mut current = self.current_job.lock();
        if self
            .job_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let running = current.unwrap_or(job);
            drop(current);
            warn!(
                job = %job,
                running = %running,
                trigger = %trigger,
                "Skipping maintenance job, another job is running"
            );
            self.history
                .push(JobRun::skipped(job, trigger, self.clock.now_ms(), running));
            return Err(SchedulerError::JobAlreadyRunning {
                requested: job.to_string(),
                running: running.to_string(),
            });
        }
        *current = Some(job);

        Ok(RunSlot {
            scheduler: self,
            job,
            trigger,
        })
    }

    async fn execute(&self, slot: RunSlot<'_>) -> JobRun {
        let job = slot.job;
        let trigger = slot.trigger;
        let job_id = uuid::Uuid::new_v4().to_string();
        let start_time = self.clock.now_ms();
        let started = Instant::now();

        info!(job = %job, job_id = %job_id, trigger = %trigger, "Maintenance job started");
        let result = self.executor.execute(job).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let run = JobRun {
            job_id,
            job,
            trigger,
            start_time,
            end_time: Some(self.clock.now_ms()),
            success: result.is_ok(),
            skipped: false,
            summary: result.as_ref().ok().cloned(),
            error: result.as_ref().err().map(|e| e.to_string()),
            duration_ms,
        };

        {
            let mut failures = self.consecutive_failures.lock();
            let count = failures.entry(job).or_default();
            match &result {
                Ok(summary) => {
                    *count = 0;
                    info!(job = %job, duration_ms, summary = %summary, "Maintenance job finished");
                }
                Err(e) => {
                    *count += 1;
                    error!(
                        job = %job,
                        duration_ms,
                        consecutive_failures = *count,
                        error = %e,
                        "Maintenance job failed"
                    );
                }
            }
        }

        self.history.push(run.clone());
        drop(slot);
        run
    }

    fn release(&self) {
        let mut current = self.current_job.lock();
        *current = None;
        self.job_running.store(false, Ordering::SeqCst);
    }

    pub fn current_job(&self) -> Option<JobName> {
        *self.current_job.lock()
    }

    pub fn recent_runs(&self, limit: usize) -> Vec<JobRun> {
        self.history.recent(limit)
    }

    /// Next fire time for each job, computed from the injected clock.
    pub fn next_runs(&self) -> BTreeMap<JobName, DateTime<Utc>> {
        let now = self.clock.now();
        self.schedules
            .iter()
            .filter_map(|(job, schedule)| schedule.after(&now).next().map(|next| (*job, next)))
            .collect()
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            is_running: self.is_running(),
            current_job: self.current_job(),
            recent_jobs: self.history.recent(self.config.history_capacity),
            next_runs: self.next_runs(),
        }
    }

    /// Unhealthy when stopped or when any job has failed too many times in a row.
    pub fn health_check(&self) -> SchedulerHealth {
        let is_running = self.is_running();
        let consecutive_failures: BTreeMap<JobName, u32> = self
            .consecutive_failures
            .lock()
            .iter()
            .map(|(job, count)| (*job, *count))
            .collect();
        let failing_jobs: Vec<JobName> = consecutive_failures
            .iter()
            .filter(|(_, count)| **count >= self.config.unhealthy_after_failures)
            .map(|(job, _)| *job)
            .collect();

        SchedulerHealth {
            healthy: is_running && failing_jobs.is_empty(),
            is_running,
            failing_jobs,
            consecutive_failures,
        }
    }
}

/// Holds the single execution slot. Releasing on drop keeps the flag
/// consistent if the running future is cancelled.
struct RunSlot<'a> {
    scheduler: &'a MaintenanceScheduler,
    job: JobName,
    trigger: JobTrigger,
}

impl Drop for RunSlot<'_> {
    fn drop(&mut self) {
        self.scheduler.release();
    }
}
