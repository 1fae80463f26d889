//! Cron and one-shot triggers.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Local, Utc};
use cron::Schedule;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use cronflow_types::{Job, TriggerKind};

use crate::engine::{CronHandle, Engine, OneShotHandle};
use crate::error::{EngineError, Result};
use crate::executor::RunRequest;
use crate::schedule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Cron,
    Once,
}

/// An armed trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleInfo {
    pub job_id: String,
    pub kind: ScheduleKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    pub next_run: Option<DateTime<Utc>>,
}

impl Engine {
    /// Arm the job's recurring trigger, replacing any previous one.
    ///
    /// Returns `false` when the job is disabled or has no schedule.
    pub fn schedule(self: &Arc<Self>, job: &Job) -> Result<bool> {
        let parsed = if job.has_schedule() {
            Some(schedule::parse(&job.schedule)?)
        } else {
            None
        };

        self.unschedule(&job.id);
        let Some(parsed) = parsed else {
            return Ok(false);
        };
        if !job.enabled {
            debug!(job_id = %job.id, "Job disabled, not scheduling");
            return Ok(false);
        }

        let task = tokio::spawn(cron_loop(Arc::downgrade(self), job.id.clone(), parsed));
        self.cron_handles().insert(
            job.id.clone(),
            CronHandle {
                expression: job.schedule.clone(),
                task,
            },
        );
        info!(job_id = %job.id, schedule = %job.schedule, "Job scheduled");
        Ok(true)
    }

    /// Cancel the job's recurring trigger.
    pub fn unschedule(&self, job_id: &str) -> bool {
        match self.cron_handles().remove(job_id) {
            Some(handle) => {
                handle.task.abort();
                debug!(job_id = %job_id, "Job unscheduled");
                true
            }
            None => false,
        }
    }

    /// Arm every stored job. Invalid schedules are logged and skipped.
    pub async fn schedule_all(self: &Arc<Self>) -> Result<usize> {
        let mut armed = 0;
        for job in self.store.list_jobs().await? {
            match self.schedule(&job) {
                Ok(true) => armed += 1,
                Ok(false) => {}
                Err(e) => error!(job_id = %job.id, "Failed to schedule job: {e}"),
            }
        }
        info!("Scheduled {armed} jobs");
        Ok(armed)
    }

    /// Run the job once at `at` (RFC 3339). A later call for the same job
    /// replaces the earlier one; past timestamps fire immediately.
    pub async fn schedule_once(self: &Arc<Self>, job_id: &str, at: &str) -> Result<DateTime<Utc>> {
        let at = DateTime::parse_from_rfc3339(at.trim())
            .map_err(|_| EngineError::InvalidTimestamp(at.to_string()))?
            .with_timezone(&Utc);
        if self.store.get_job(job_id).await?.is_none() {
            return Err(EngineError::JobNotFound(job_id.to_string()));
        }

        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        let generation = self.one_shot_generation.fetch_add(1, Ordering::Relaxed);
        let engine = Arc::downgrade(self);
        let id = job_id.to_string();

        // Spawn and register under one lock so the timer cannot fire and
        // deregister before it is registered.
        let mut one_shots = self.one_shots();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(engine) = engine.upgrade() else {
                return;
            };
            {
                let mut one_shots = engine.one_shots();
                if one_shots.get(&id).is_some_and(|h| h.generation == generation) {
                    one_shots.remove(&id);
                }
            }
            engine.fire(&id, TriggerKind::Scheduled).await;
        });
        if let Some(previous) = one_shots.insert(
            job_id.to_string(),
            OneShotHandle {
                generation,
                at,
                task,
            },
        ) {
            previous.task.abort();
            debug!(job_id = %job_id, "Replaced pending one-shot run");
        }
        drop(one_shots);

        info!(job_id = %job_id, at = %at, "One-shot run armed");
        Ok(at)
    }

    /// Cancel a pending one-shot run.
    pub fn cancel_once(&self, job_id: &str) -> bool {
        match self.one_shots().remove(job_id) {
            Some(handle) => {
                handle.task.abort();
                true
            }
            None => false,
        }
    }

    /// Armed triggers with their next fire time.
    pub fn scheduled(&self) -> Vec<ScheduleInfo> {
        let now = Local::now();
        let mut infos: Vec<ScheduleInfo> = self
            .cron_handles()
            .iter()
            .map(|(job_id, handle)| ScheduleInfo {
                job_id: job_id.clone(),
                kind: ScheduleKind::Cron,
                expression: Some(handle.expression.clone()),
                next_run: schedule::next_after(&handle.expression, &now)
                    .ok()
                    .map(|next| next.with_timezone(&Utc)),
            })
            .collect();
        infos.extend(self.one_shots().iter().map(|(job_id, handle)| ScheduleInfo {
            job_id: job_id.clone(),
            kind: ScheduleKind::Once,
            expression: None,
            next_run: Some(handle.at),
        }));
        infos.sort_by(|a, b| a.next_run.cmp(&b.next_run).then_with(|| a.job_id.cmp(&b.job_id)));
        infos
    }

    /// Start a timer-driven run. Overlapping fires are dropped.
    async fn fire(self: &Arc<Self>, job_id: &str, trigger: TriggerKind) {
        match self.start_job(job_id, RunRequest::new(trigger)).await {
            Ok(_) => {}
            Err(EngineError::AlreadyRunning(_)) => {
                warn!(job_id = %job_id, "Previous run still active, skipping this fire");
            }
            Err(e) => error!(job_id = %job_id, "Scheduled run failed to start: {e}"),
        }
    }
}

/// Fires once per schedule slot. Each slot is derived from the previous one
/// and waited on as a monotonic deadline, so a slot can never be seen twice.
async fn cron_loop(engine: Weak<Engine>, job_id: String, schedule: Schedule) {
    let Some(mut slot) = schedule.upcoming(Local).next() else {
        warn!(job_id = %job_id, "Schedule has no future occurrences");
        return;
    };
    let mut deadline =
        tokio::time::Instant::now() + (slot - Local::now()).to_std().unwrap_or_default();

    loop {
        tokio::time::sleep_until(deadline).await;

        let Some(engine) = engine.upgrade() else {
            return;
        };
        debug!(job_id = %job_id, slot = %slot, "Cron fired");
        engine.fire(&job_id, TriggerKind::Scheduled).await;
        drop(engine);

        let Some(following) = schedule.after(&slot).next() else {
            warn!(job_id = %job_id, "Schedule has no future occurrences");
            return;
        };
        deadline += (following - slot).to_std().unwrap_or_default();
        slot = following;
    }
}
