//! Run lifecycle: lock, execute, auto-fix, retry, finalize, chain.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use cronflow_events::events::{JOB_COMPLETED, JOB_OUTPUT, JOB_STARTED};
use cronflow_types::{AutoFixReport, ExecutionRecord, Job, RunStatus, TriggerKind};

use crate::autofix::AutoFixMatch;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::history::{Completion, new_record_id};
use crate::notify::NotificationRequest;
use crate::options::{self, CommandPlan};
use crate::retry;
use crate::runner::{CommandSpec, OutputChunk, ProcessOutcome};
use crate::running::{RunningGuard, RunningState};

/// Stand-in for "no timeout".
const UNBOUNDED_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// How and why a run is started.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub trigger: TriggerKind,
    /// Option values overriding the job's declared defaults.
    pub overrides: Map<String, Value>,
    pub chain_depth: u32,
}

impl RunRequest {
    pub fn new(trigger: TriggerKind) -> Self {
        Self {
            trigger,
            overrides: Map::new(),
            chain_depth: 0,
        }
    }

    pub fn manual() -> Self {
        Self::new(TriggerKind::Manual)
    }

    pub fn with_overrides(mut self, overrides: Map<String, Value>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn chained(depth: u32) -> Self {
        Self {
            chain_depth: depth,
            ..Self::new(TriggerKind::Chained)
        }
    }
}

/// Result of a whole lifecycle, retries and auto-fix included.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub job_id: String,
    pub status: RunStatus,
    /// Record of the last attempt.
    pub log_id: String,
    /// Number of times the job's command was executed.
    pub invocations: u32,
    pub auto_fixed: bool,
}

impl Engine {
    /// Take the job's run lock and start its lifecycle in the background.
    ///
    /// Validation and lock errors are returned before anything executes.
    pub async fn start_job(
        self: &Arc<Self>,
        job_id: &str,
        request: RunRequest,
    ) -> Result<JoinHandle<RunSummary>> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
        let plan = options::build_command(&job, &request.overrides)?;

        let log_id = new_record_id();
        let guard = self
            .running
            .try_acquire(RunningState {
                job_id: job.id.clone(),
                log_id: log_id.clone(),
                command: plan.command.clone(),
                started_at: Utc::now(),
                retry_attempt: 0,
            })
            .ok_or_else(|| EngineError::AlreadyRunning(job.id.clone()))?;

        info!(
            job_id = %job.id,
            trigger = %request.trigger,
            depth = request.chain_depth,
            "Starting job"
        );
        Ok(tokio::spawn(drive(
            Arc::clone(self),
            job,
            plan,
            request,
            guard,
            log_id,
        )))
    }

    /// Run a job to completion, retries and auto-fix included.
    pub async fn run_job(self: &Arc<Self>, job_id: &str, request: RunRequest) -> Result<RunSummary> {
        let handle = self.start_job(job_id, request).await?;
        Ok(handle.await?)
    }

    async fn lifecycle(
        self: Arc<Self>,
        job: Job,
        plan: CommandPlan,
        request: RunRequest,
        guard: RunningGuard,
        first_log_id: String,
    ) -> RunSummary {
        let settings = &job.execution;
        let timeout = match settings.timeout_secs {
            0 => UNBOUNDED_TIMEOUT,
            secs => Duration::from_secs(secs),
        };

        let mut log_id = first_log_id;
        let mut trigger = request.trigger;
        let mut attempt = 0u32;
        let mut invocations = 0u32;
        let mut auto_fix_spent = false;
        let mut auto_fixed = false;

        let (status, last) = loop {
            invocations += 1;
            guard.update(&log_id, &plan.command, attempt);
            self.history
                .begin(ExecutionRecord {
                    id: log_id.clone(),
                    job_id: job.id.clone(),
                    job_name: job.name.clone(),
                    trigger,
                    start_time: Utc::now(),
                    end_time: None,
                    duration_ms: None,
                    status: RunStatus::Running,
                    stdout: String::new(),
                    stderr: String::new(),
                    error: None,
                    exit_code: None,
                    command: plan.command.clone(),
                    options: plan.options.clone(),
                    retry_attempt: attempt,
                    chain_depth: request.chain_depth,
                    auto_fix: None,
                })
                .await;
            self.events
                .publish(
                    None,
                    JOB_STARTED,
                    json!({
                        "job_id": job.id,
                        "job_name": job.name,
                        "log_id": log_id,
                        "trigger": trigger,
                        "retry_attempt": attempt,
                        "chain_depth": request.chain_depth,
                    }),
                )
                .await;

            let outcome = self.invoke(&job.id, &log_id, &plan.command, timeout).await;
            let error = outcome.failure_message(timeout);
            let status = if error.is_none() {
                RunStatus::Success
            } else {
                RunStatus::Failed
            };
            let record = self
                .history
                .finish(
                    &log_id,
                    Completion {
                        status,
                        exit_code: outcome.exit_code,
                        error: error.clone(),
                    },
                )
                .await;
            self.events
                .publish(
                    None,
                    JOB_COMPLETED,
                    json!({
                        "job_id": job.id,
                        "log_id": log_id,
                        "status": status,
                        "exit_code": outcome.exit_code,
                        "error": error,
                        "retry_attempt": attempt,
                    }),
                )
                .await;

            let Some(record) = record else {
                error!(job_id = %job.id, log_id = %log_id, "Execution record vanished before it was finalized");
                break (status, None);
            };
            if status == RunStatus::Success {
                info!(job_id = %job.id, log_id = %log_id, "Job succeeded");
                break (status, Some(record));
            }
            warn!(
                job_id = %job.id,
                log_id = %log_id,
                attempt,
                error = %record.error.as_deref().unwrap_or_default(),
                "Job failed"
            );

            if attempt == 0 && !auto_fix_spent {
                if let Some(fix) = self.match_auto_fix(&record).await {
                    auto_fix_spent = true;
                    let report = self.apply_auto_fix(&job.id, &fix).await;
                    let fixed = report.success;
                    self.history.attach_auto_fix(&log_id, report).await;
                    if fixed {
                        auto_fixed = true;
                        trigger = TriggerKind::AutoFix;
                        log_id = new_record_id();
                        continue;
                    }
                }
            }

            if attempt < settings.max_retries {
                attempt += 1;
                let delay = retry::delay(
                    settings.backoff,
                    Duration::from_millis(settings.retry_delay_ms),
                    attempt,
                );
                info!(
                    job_id = %job.id,
                    attempt,
                    max_retries = settings.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying job"
                );
                tokio::time::sleep(delay).await;
                trigger = TriggerKind::Retry(attempt);
                log_id = new_record_id();
                continue;
            }

            break (status, Some(record));
        };

        drop(guard);

        if let Some(record) = &last {
            self.request_notification(&plan, record).await;
        }
        self.on_job_completed(&job.id, status, request.chain_depth)
            .await;

        RunSummary {
            job_id: job.id,
            status,
            log_id,
            invocations,
            auto_fixed,
        }
    }

    /// Execute one attempt, streaming output into the live record.
    async fn invoke(
        &self,
        job_id: &str,
        log_id: &str,
        command: &str,
        timeout: Duration,
    ) -> ProcessOutcome {
        let spec = CommandSpec {
            command: command.to_string(),
            timeout,
            path_env: self.path_env.clone(),
            working_dir: self.config.working_dir.clone(),
        };
        let (tx, mut rx) = mpsc::unbounded_channel::<OutputChunk>();

        let consume = async {
            while let Some(chunk) = rx.recv().await {
                self.history.append_output(log_id, &chunk).await;
                self.events
                    .publish(
                        None,
                        JOB_OUTPUT,
                        json!({
                            "job_id": job_id,
                            "log_id": log_id,
                            "stream": chunk.stream.as_str(),
                            "data": chunk.text,
                        }),
                    )
                    .await;
            }
        };

        let (outcome, ()) = tokio::join!(self.runner.run(spec, tx), consume);
        outcome
    }

    async fn match_auto_fix(&self, record: &ExecutionRecord) -> Option<AutoFixMatch> {
        let auto_fix = {
            let active = self.active.read().await;
            if !active.settings.auto_fix_enabled {
                return None;
            }
            Arc::clone(&active.auto_fix)
        };
        auto_fix.find_fix(&record.stdout, &record.stderr)
    }

    async fn apply_auto_fix(&self, job_id: &str, fix: &AutoFixMatch) -> AutoFixReport {
        info!(
            job_id = %job_id,
            rule = %fix.rule.id,
            command = %fix.command,
            "Applying auto-fix"
        );
        let spec_timeout = Duration::from_secs(self.config.auto_fix_timeout_secs);
        let spec = CommandSpec {
            command: fix.command.clone(),
            timeout: spec_timeout,
            path_env: self.path_env.clone(),
            working_dir: self.config.working_dir.clone(),
        };
        let (tx, mut rx) = mpsc::unbounded_channel::<OutputChunk>();
        let collect = async {
            let mut output = String::new();
            while let Some(chunk) = rx.recv().await {
                output.push_str(&chunk.text);
            }
            output
        };
        let (outcome, output) = tokio::join!(self.runner.run(spec, tx), collect);

        let success = outcome.success();
        if success {
            info!(job_id = %job_id, rule = %fix.rule.id, "Auto-fix succeeded");
        } else {
            warn!(
                job_id = %job_id,
                rule = %fix.rule.id,
                error = %outcome
                    .failure_message(spec_timeout)
                    .unwrap_or_default(),
                "Auto-fix failed"
            );
        }

        AutoFixReport {
            rule_id: fix.rule.id.clone(),
            rule_name: fix.rule.name.clone(),
            parameter: fix.parameter.clone(),
            command: fix.command.clone(),
            success,
            output,
        }
    }

    /// Hand a finished run to the notifier if the job opted in.
    async fn request_notification(&self, plan: &CommandPlan, record: &ExecutionRecord) {
        let enabled = match plan.notify() {
            Some(enabled) => enabled,
            None => self.active.read().await.settings.notify_by_default,
        };
        if !enabled {
            return;
        }

        let notifier = Arc::clone(&self.notifier);
        let request = NotificationRequest::from_record(record);
        tokio::spawn(async move {
            match notifier.notify(&request).await {
                Ok(()) => debug!(job_id = %request.job_id, "Notification sent"),
                Err(e) => warn!(job_id = %request.job_id, "Notification failed: {e:#}"),
            }
        });
    }
}

/// Boxed so that chaining, which re-enters `start_job`, has a nameable
/// future type.
fn drive(
    engine: Arc<Engine>,
    job: Job,
    plan: CommandPlan,
    request: RunRequest,
    guard: RunningGuard,
    log_id: String,
) -> BoxFuture<'static, RunSummary> {
    engine.lifecycle(job, plan, request, guard, log_id).boxed()
}
