//! Bounded run history. Observability only.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;

use super::jobs::JobName;

/// Default number of runs kept.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// What caused a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTrigger {
    Scheduled,
    Manual,
}

impl fmt::Display for JobTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        })
    }
}

/// One execution (or skipped trigger) of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRun {
    pub job_id: String,
    pub job: JobName,
    pub trigger: JobTrigger,
    /// Unix epoch milliseconds.
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub success: bool,
    /// Set when the trigger fired while another job was running.
    pub skipped: bool,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl JobRun {
    pub(crate) fn skipped(job: JobName, trigger: JobTrigger, at_ms: i64, running: JobName) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            job,
            trigger,
            start_time: at_ms,
            end_time: Some(at_ms),
            success: false,
            skipped: true,
            summary: None,
            error: Some(format!("skipped: {running} was running")),
            duration_ms: 0,
        }
    }
}

/// Ring buffer of recent runs, newest last.
#[derive(Debug)]
pub struct JobHistory {
    capacity: usize,
    runs: Mutex<VecDeque<JobRun>>,
}

impl JobHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            runs: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, run: JobRun) {
        let mut runs = self.runs.lock();
        if runs.len() == self.capacity {
            runs.pop_front();
        }
        runs.push_back(run);
    }

    /// Up to `limit` most recent runs, newest first.
    pub fn recent(&self, limit: usize) -> Vec<JobRun> {
        self.runs.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.lock().is_empty()
    }
}

impl Default for JobHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(start: i64) -> JobRun {
        JobRun {
            job_id: start.to_string(),
            job: JobName::VaultCleanup,
            trigger: JobTrigger::Scheduled,
            start_time: start,
            end_time: Some(start + 1),
            success: true,
            skipped: false,
            summary: None,
            error: None,
            duration_ms: 1,
        }
    }

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let history = JobHistory::new(3);
        for i in 0..5 {
            history.push(run(i));
        }
        assert_eq!(history.len(), 3);
        let starts: Vec<i64> = history.recent(10).iter().map(|r| r.start_time).collect();
        assert_eq!(starts, vec![4, 3, 2]);
    }

    #[test]
    fn test_skipped_run() {
        let skipped = JobRun::skipped(
            JobName::VaultCleanup,
            JobTrigger::Scheduled,
            10,
            JobName::KeyRotation,
        );
        assert!(skipped.skipped && !skipped.success);
        assert_eq!(skipped.error.as_deref(), Some("skipped: key_rotation was running"));
    }
}
