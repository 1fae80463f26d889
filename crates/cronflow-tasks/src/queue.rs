//! In-memory queue of asynchronous tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cronflow_events::EventBus;
use cronflow_events::events::{TASK_COMPLETED, TASK_FAILED, TASK_PROGRESS, TASK_STARTED};
use cronflow_types::{Task, TaskLogEntry, TaskStatus};

use crate::context::TaskContext;
use crate::error::TaskError;
use crate::handler::TaskHandler;

struct TaskEntry {
    task: Task,
    cancel: CancellationToken,
}

/// Accepts tasks, runs them through their type's handler and keeps finished
/// tasks readable for the retention window.
pub struct TaskQueue {
    tasks: RwLock<HashMap<String, TaskEntry>>,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    events: Arc<EventBus>,
    retention: Duration,
}

impl TaskQueue {
    pub fn new(events: Arc<EventBus>, retention: Duration) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            handlers: HashMap::new(),
            events,
            retention,
        }
    }

    /// Register the handler for its task type, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        let task_type = handler.task_type().to_string();
        if self.handlers.insert(task_type.clone(), handler).is_some() {
            warn!(task_type = %task_type, "Replaced task handler");
        }
    }

    pub fn handler_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Accept a task and return it immediately. Unknown types come back
    /// already failed.
    pub async fn submit(
        self: &Arc<Self>,
        task_type: &str,
        payload: Value,
        client_id: Option<String>,
    ) -> Task {
        let now = Utc::now();
        let mut task = Task {
            id: format!("task-{}", uuid::Uuid::new_v4().simple()),
            task_type: task_type.to_string(),
            payload,
            status: TaskStatus::Pending,
            progress: 0,
            progress_message: String::new(),
            result: None,
            error: None,
            logs: Vec::new(),
            created_at: now,
            started_at: None,
            completed_at: None,
            client_id,
        };

        let Some(handler) = self.handlers.get(task_type).cloned() else {
            warn!(task_id = %task.id, task_type = %task_type, "No handler for task type");
            task.status = TaskStatus::Failed;
            task.error = Some(format!("Unknown task type: {task_type}"));
            task.completed_at = Some(now);
            self.tasks.write().await.insert(
                task.id.clone(),
                TaskEntry {
                    task: task.clone(),
                    cancel: CancellationToken::new(),
                },
            );
            self.publish(&task, TASK_FAILED, json!({ "error": task.error }))
                .await;
            return task;
        };

        let cancel = CancellationToken::new();
        self.tasks.write().await.insert(
            task.id.clone(),
            TaskEntry {
                task: task.clone(),
                cancel: cancel.clone(),
            },
        );
        info!(task_id = %task.id, task_type = %task_type, "Task submitted");

        let queue = Arc::clone(self);
        let task_id = task.id.clone();
        tokio::spawn(async move { queue.execute(task_id, handler, cancel).await });
        task
    }

    async fn execute(
        self: Arc<Self>,
        task_id: String,
        handler: Arc<dyn TaskHandler>,
        cancel: CancellationToken,
    ) {
        let Some(started) = self
            .mutate(&task_id, |task| {
                task.status = TaskStatus::Running;
                task.started_at = Some(Utc::now());
            })
            .await
        else {
            return;
        };
        self.publish(&started, TASK_STARTED, json!({})).await;

        let ctx = TaskContext::new(Arc::clone(&self), &started, cancel.clone());
        let outcome = handler.run(ctx).await;
        if cancel.is_cancelled() {
            debug!(task_id = %task_id, "Task finished after cancellation");
            return;
        }

        match outcome {
            Ok(result) => {
                let done = self
                    .mutate(&task_id, |task| {
                        task.status = TaskStatus::Completed;
                        task.progress = 100;
                        task.result = Some(result.clone());
                        task.completed_at = Some(Utc::now());
                    })
                    .await;
                if let Some(task) = done {
                    info!(task_id = %task_id, "Task completed");
                    self.publish(&task, TASK_COMPLETED, json!({ "result": result }))
                        .await;
                }
            }
            Err(e) => {
                let error = format!("{e:#}");
                let failed = self
                    .mutate(&task_id, |task| {
                        task.status = TaskStatus::Failed;
                        task.error = Some(error.clone());
                        task.completed_at = Some(Utc::now());
                    })
                    .await;
                if let Some(task) = failed {
                    warn!(task_id = %task_id, "Task failed: {error}");
                    self.publish(&task, TASK_FAILED, json!({ "error": error }))
                        .await;
                }
            }
        }
    }

    /// Update progress of a running task and push it to the submitter.
    pub async fn report_progress(&self, task_id: &str, percent: u8, message: &str) {
        let updated = self
            .mutate(task_id, |task| {
                if task.status == TaskStatus::Running {
                    task.progress = percent.min(100);
                    task.progress_message = message.to_string();
                }
            })
            .await;
        if let Some(task) = updated {
            self.publish(
                &task,
                TASK_PROGRESS,
                json!({
                    "progress": task.progress,
                    "message": task.progress_message,
                }),
            )
            .await;
        }
    }

    /// Append a line to a task's log.
    pub async fn log(&self, task_id: &str, message: &str) {
        self.mutate(task_id, |task| {
            task.logs.push(TaskLogEntry {
                at: Utc::now(),
                message: message.to_string(),
            });
        })
        .await;
    }

    pub async fn get(&self, task_id: &str) -> Option<Task> {
        self.tasks.read().await.get(task_id).map(|e| e.task.clone())
    }

    /// All known tasks, newest first.
    pub async fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .map(|e| e.task.clone())
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    /// Cancel a task's handler and forget the task.
    pub async fn cancel(&self, task_id: &str) -> Result<Task, TaskError> {
        let entry = self
            .tasks
            .write()
            .await
            .remove(task_id)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        entry.cancel.cancel();
        info!(task_id = %task_id, "Task cancelled");
        Ok(entry.task)
    }

    /// Drop finished tasks older than the retention window.
    pub async fn purge_expired(&self) -> usize {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return 0;
        };
        let cutoff = Utc::now() - retention;
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, entry| {
            !(entry.task.status.is_terminal()
                && entry.task.completed_at.is_some_and(|at| at < cutoff))
        });
        let purged = before - tasks.len();
        if purged > 0 {
            debug!("Purged {purged} expired tasks");
        }
        purged
    }

    /// Periodically purge expired tasks until the queue is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let queue = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(queue) = queue.upgrade() else {
                    break;
                };
                queue.purge_expired().await;
            }
        })
    }

    async fn mutate(&self, task_id: &str, f: impl FnOnce(&mut Task)) -> Option<Task> {
        let mut tasks = self.tasks.write().await;
        let entry = tasks.get_mut(task_id)?;
        f(&mut entry.task);
        Some(entry.task.clone())
    }

    async fn publish(&self, task: &Task, event: &str, extra: Value) {
        let mut payload = json!({
            "task_id": task.id,
            "type": task.task_type,
            "status": task.status,
        });
        if let (Some(payload), Value::Object(extra)) = (payload.as_object_mut(), extra) {
            payload.extend(extra);
        }
        self.events
            .publish(task.client_id.as_deref(), event, payload)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        fn task_type(&self) -> &str {
            "echo"
        }

        async fn run(&self, ctx: TaskContext) -> anyhow::Result<Value> {
            ctx.progress(50, "halfway").await;
            ctx.log("echoing").await;
            Ok(ctx.payload().clone())
        }
    }

    struct Boom;

    #[async_trait]
    impl TaskHandler for Boom {
        fn task_type(&self) -> &str {
            "boom"
        }

        async fn run(&self, _ctx: TaskContext) -> anyhow::Result<Value> {
            anyhow::bail!("exploded")
        }
    }

    struct Forever;

    #[async_trait]
    impl TaskHandler for Forever {
        fn task_type(&self) -> &str {
            "forever"
        }

        async fn run(&self, ctx: TaskContext) -> anyhow::Result<Value> {
            ctx.cancelled().await;
            anyhow::bail!("cancelled")
        }
    }

    fn queue(events: Arc<EventBus>) -> Arc<TaskQueue> {
        let mut queue = TaskQueue::new(events, Duration::from_secs(3600));
        queue.register(Arc::new(Echo));
        queue.register(Arc::new(Boom));
        queue.register(Arc::new(Forever));
        Arc::new(queue)
    }

    async fn wait_terminal(queue: &TaskQueue, id: &str) -> Task {
        for _ in 0..100 {
            if let Some(task) = queue.get(id).await {
                if task.status.is_terminal() {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never finished");
    }

    #[tokio::test]
    async fn test_unknown_type_fails_immediately() {
        let queue = queue(Arc::new(EventBus::new()));
        let task = queue.submit("nope", json!({}), None).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("Unknown task type: nope"));
        assert!(task.completed_at.is_some());
        assert_eq!(queue.get(&task.id).await.unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_submit_returns_before_completion() {
        let queue = queue(Arc::new(EventBus::new()));
        let task = queue.submit("echo", json!({"x": 1}), None).await;
        assert_eq!(task.status, TaskStatus::Pending);

        let done = wait_terminal(&queue, &task.id).await;
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress, 100);
        assert_eq!(done.result, Some(json!({"x": 1})));
        assert_eq!(done.progress_message, "halfway");
        assert_eq!(done.logs.len(), 1);
        assert!(done.started_at.is_some());
    }

    #[tokio::test]
    async fn test_handler_error_marks_failed() {
        let queue = queue(Arc::new(EventBus::new()));
        let task = queue.submit("boom", Value::Null, None).await;
        let done = wait_terminal(&queue, &task.id).await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.error.as_deref(), Some("exploded"));
    }

    #[tokio::test]
    async fn test_progress_targets_submitting_client() {
        let events = Arc::new(EventBus::new());
        let mut mine = events.subscribe_as("client-a").await;
        let mut other = events.subscribe_as("client-b").await;
        let queue = queue(Arc::clone(&events));

        let task = queue
            .submit("echo", json!({}), Some("client-a".into()))
            .await;
        wait_terminal(&queue, &task.id).await;

        let mut names = Vec::new();
        while let Ok(event) = mine.receiver.try_recv() {
            assert_eq!(event.payload["task_id"], task.id.as_str());
            names.push(event.event);
        }
        assert_eq!(names, vec![TASK_STARTED, TASK_PROGRESS, TASK_COMPLETED]);
        assert!(other.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_removes_task() {
        let queue = queue(Arc::new(EventBus::new()));
        let task = queue.submit("forever", Value::Null, None).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let cancelled = queue.cancel(&task.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Running);
        assert!(queue.get(&task.id).await.is_none());
        assert!(matches!(
            queue.cancel(&task.id).await,
            Err(TaskError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let mut queue = TaskQueue::new(Arc::new(EventBus::new()), Duration::ZERO);
        queue.register(Arc::new(Echo));
        let queue = Arc::new(queue);

        let failed = queue.submit("nope", Value::Null, None).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(queue.purge_expired().await, 1);
        assert!(queue.get(&failed.id).await.is_none());
    }
}
