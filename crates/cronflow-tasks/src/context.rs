//! What a handler sees of its task.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use cronflow_types::{MAX_OUTPUT_CHARS, TRUNCATION_MARKER, Task};

use crate::queue::TaskQueue;

/// Captured result of a finished subprocess.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Handle passed to a [`TaskHandler`](crate::TaskHandler) for one task.
pub struct TaskContext {
    queue: Arc<TaskQueue>,
    task_id: String,
    payload: Value,
    client_id: Option<String>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub(crate) fn new(queue: Arc<TaskQueue>, task: &Task, cancel: CancellationToken) -> Self {
        Self {
            queue,
            task_id: task.id.clone(),
            payload: task.payload.clone(),
            client_id: task.client_id.clone(),
            cancel,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Report progress (0-100) to the submitting client.
    pub async fn progress(&self, percent: u8, message: &str) {
        self.queue
            .report_progress(&self.task_id, percent, message)
            .await;
    }

    pub async fn log(&self, message: &str) {
        self.queue.log(&self.task_id, message).await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the task has been cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Run `command` through `sh -c`. The child is killed when the task is
    /// cancelled or `timeout` elapses. Each stream keeps at most
    /// [`MAX_OUTPUT_CHARS`] bytes.
    pub async fn run_command(&self, command: &str, timeout: Duration) -> anyhow::Result<CommandOutput> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn `{command}`"))?;
        debug!(task_id = %self.task_id, pid = ?child.id(), "Task command spawned");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let finished = async {
            tokio::join!(read_capped(stdout), read_capped(stderr), child.wait())
        };

        let (stdout, stderr, status) = tokio::select! {
            _ = self.cancel.cancelled() => bail!("cancelled"),
            _ = tokio::time::sleep(timeout) => {
                bail!("command timed out after {}s", timeout.as_secs())
            }
            finished = finished => finished,
        };
        let status = status.context("failed to wait for command")?;

        Ok(CommandOutput {
            exit_code: status.code(),
            stdout: stdout.context("failed to read stdout")?,
            stderr: stderr.context("failed to read stderr")?,
        })
    }
}

/// Read a pipe to the end, keeping the first [`MAX_OUTPUT_CHARS`] bytes.
/// The rest is drained so the child never blocks on a full pipe.
async fn read_capped<R>(pipe: Option<R>) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else {
        return Ok(String::new());
    };
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        let n = pipe.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = MAX_OUTPUT_CHARS.saturating_sub(kept.len());
        kept.extend_from_slice(&buf[..n.min(room)]);
        truncated |= n > room;
    }
    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::TaskHandler;
    use async_trait::async_trait;
    use cronflow_events::EventBus;
    use cronflow_types::TaskStatus;
    use serde_json::json;

    struct Sleeper;

    #[async_trait]
    impl TaskHandler for Sleeper {
        fn task_type(&self) -> &str {
            "sleeper"
        }

        async fn run(&self, ctx: TaskContext) -> anyhow::Result<Value> {
            let out = ctx.run_command("sleep 30", Duration::from_secs(60)).await?;
            Ok(json!({ "exit_code": out.exit_code }))
        }
    }

    #[tokio::test]
    async fn test_run_command_timeout() {
        let mut queue = TaskQueue::new(Arc::new(EventBus::new()), Duration::from_secs(60));
        queue.register(Arc::new(Sleeper));
        let queue = Arc::new(queue);
        let task = queue.submit("sleeper", Value::Null, None).await;

        let ctx = TaskContext::new(Arc::clone(&queue), &task, CancellationToken::new());
        let err = ctx
            .run_command("sleep 5", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));

        let out = ctx
            .run_command("echo out; echo err >&2; exit 4", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(4));
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert!(!out.success());

        queue.cancel(&task.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_command_caps_output() {
        let queue = Arc::new(TaskQueue::new(Arc::new(EventBus::new()), Duration::from_secs(60)));
        let task = queue.submit("sleeper", Value::Null, None).await;
        let ctx = TaskContext::new(Arc::clone(&queue), &task, CancellationToken::new());

        let out = ctx
            .run_command(
                "head -c 300000 /dev/zero | tr '\\0' a; echo done >&2",
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.len(), MAX_OUTPUT_CHARS + TRUNCATION_MARKER.len());
        assert!(out.stdout.ends_with(TRUNCATION_MARKER));
        assert_eq!(out.stderr, "done\n");
    }

    #[tokio::test]
    async fn test_cancel_kills_running_command() {
        let mut queue = TaskQueue::new(Arc::new(EventBus::new()), Duration::from_secs(60));
        queue.register(Arc::new(Sleeper));
        let queue = Arc::new(queue);

        let task = queue.submit("sleeper", Value::Null, None).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.get(&task.id).await.unwrap().status, TaskStatus::Running);

        let started = std::time::Instant::now();
        queue.cancel(&task.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(queue.get(&task.id).await.is_none());
    }
}
