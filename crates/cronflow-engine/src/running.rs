//! Per-job mutual exclusion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A job that currently holds its run lock.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunningState {
    pub job_id: String,
    /// ID of the execution record collecting live output.
    pub log_id: String,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub retry_attempt: u32,
}

/// The set of running jobs. Presence of a key is the lock.
#[derive(Debug, Default)]
pub struct RunningJobs {
    inner: Mutex<HashMap<String, RunningState>>,
}

impl RunningJobs {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RunningState>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check-and-insert in one critical section. `None` if the job is
    /// already running.
    pub fn try_acquire(self: &Arc<Self>, state: RunningState) -> Option<RunningGuard> {
        let mut map = self.lock();
        if map.contains_key(&state.job_id) {
            return None;
        }
        let job_id = state.job_id.clone();
        map.insert(job_id.clone(), state);
        Some(RunningGuard {
            jobs: Arc::clone(self),
            job_id,
        })
    }

    pub fn get(&self, job_id: &str) -> Option<RunningState> {
        self.lock().get(job_id).cloned()
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.lock().contains_key(job_id)
    }

    /// Snapshot ordered by start time.
    pub fn list(&self) -> Vec<RunningState> {
        let mut states: Vec<_> = self.lock().values().cloned().collect();
        states.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        states
    }
}

/// Releases the job's lock when dropped.
#[derive(Debug)]
pub struct RunningGuard {
    jobs: Arc<RunningJobs>,
    job_id: String,
}

impl RunningGuard {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Point the lock at a new attempt.
    pub fn update(&self, log_id: &str, command: &str, retry_attempt: u32) {
        if let Some(state) = self.jobs.lock().get_mut(&self.job_id) {
            state.log_id = log_id.to_string();
            state.command = command.to_string();
            state.retry_attempt = retry_attempt;
        }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.jobs.lock().remove(&self.job_id);
    }
}
