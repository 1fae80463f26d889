//! Test doubles shared by the engine's unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use cronflow_events::EventBus;
use cronflow_storage::JobStore;
use cronflow_types::{ExecutionSettings, Job};

use crate::engine::Engine;
use crate::notify::{NotificationRequest, Notifier};
use crate::runner::{CommandRunner, CommandSpec, OutputChunk, ProcessOutcome};

/// One scripted process execution.
#[derive(Debug, Clone)]
pub struct Step {
    delay: Duration,
    stdout: String,
    stderr: String,
    exit_code: i32,
    timed_out: bool,
}

impl Step {
    pub fn ok(stdout: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
            timed_out: false,
        }
    }

    pub fn fail(exit_code: i32, stderr: &str) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
            ..Self::ok("")
        }
    }

    /// Hangs until the caller's timeout.
    pub fn timeout() -> Self {
        Self {
            timed_out: true,
            ..Self::ok("")
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Call {
    pub command: String,
    pub timeout: Duration,
    pub at: Instant,
}

/// Plays back scripted outcomes per exact command. Unscripted commands
/// succeed with no output.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedRunner {
    pub fn script(&self, command: &str, steps: impl IntoIterator<Item = Step>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(command.to_string())
            .or_default()
            .extend(steps);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.command == command)
            .count()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        spec: CommandSpec,
        output: mpsc::UnboundedSender<OutputChunk>,
    ) -> ProcessOutcome {
        self.calls.lock().unwrap().push(Call {
            command: spec.command.clone(),
            timeout: spec.timeout,
            at: Instant::now(),
        });
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&spec.command)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Step::ok(""));

        if step.timed_out {
            tokio::time::sleep(spec.timeout).await;
            return ProcessOutcome::timed_out();
        }
        if !step.delay.is_zero() {
            tokio::time::sleep(step.delay).await;
        }
        if !step.stdout.is_empty() {
            let _ = output.send(OutputChunk::stdout(step.stdout));
        }
        if !step.stderr.is_empty() {
            let _ = output.send(OutputChunk::stderr(step.stderr));
        }
        ProcessOutcome::exited(step.exit_code)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<NotificationRequest>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<NotificationRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, request: &NotificationRequest) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(request.clone());
        Ok(())
    }
}

pub struct TestHarness {
    pub engine: Arc<Engine>,
    pub runner: Arc<ScriptedRunner>,
    pub notifier: Arc<RecordingNotifier>,
}

impl TestHarness {
    pub async fn new() -> Self {
        let runner = Arc::new(ScriptedRunner::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = Engine::builder(
            Arc::new(JobStore::open_in_memory().unwrap()),
            Arc::new(EventBus::new()),
        )
        .runner(runner.clone())
        .notifier(notifier.clone())
        .build()
        .await
        .unwrap();
        Self {
            engine,
            runner,
            notifier,
        }
    }

    pub async fn add_job(&self, job: Job) {
        self.engine.create_job(job).await.unwrap();
    }

    /// Let spawned runs make progress until `done` holds or time runs out.
    pub async fn settle_until(&self, done: impl Fn(&Self) -> bool) {
        for _ in 0..1000 {
            if done(self) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Give any straggling chained starts a chance to show up.
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// An enabled, unscheduled job.
pub fn job(id: &str, command: &str) -> Job {
    Job {
        id: id.into(),
        name: id.into(),
        command: command.into(),
        schedule: String::new(),
        enabled: true,
        options: Vec::new(),
        execution: ExecutionSettings::default(),
        category: None,
        tags: Vec::new(),
        description: None,
    }
}
