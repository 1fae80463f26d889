//! `command` tasks: run a shell command and return its output, optionally
//! filing stdout into a daily-note section.

use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use chrono::Local;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::context::TaskContext;
use crate::handler::TaskHandler;
use crate::vault::DailyNoteVault;

const DEFAULT_TIMEOUT_SECS: u64 = 600;
/// Characters of stderr quoted in a failure message.
const ERROR_TAIL_CHARS: usize = 500;

#[derive(Debug, Deserialize)]
struct CommandPayload {
    command: String,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
    /// Write stdout into this daily-note section on success.
    #[serde(default)]
    vault_section: Option<String>,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

pub struct CommandHandler {
    vault: Option<DailyNoteVault>,
}

impl CommandHandler {
    pub fn new(vault: Option<DailyNoteVault>) -> Self {
        Self { vault }
    }
}

#[async_trait]
impl TaskHandler for CommandHandler {
    fn task_type(&self) -> &str {
        "command"
    }

    async fn run(&self, ctx: TaskContext) -> anyhow::Result<Value> {
        let payload: CommandPayload =
            serde_json::from_value(ctx.payload().clone()).context("invalid command payload")?;
        if payload.command.trim().is_empty() {
            bail!("command must not be empty");
        }

        ctx.progress(10, "Running command").await;
        ctx.log(&format!("$ {}", payload.command)).await;
        let output = ctx
            .run_command(&payload.command, Duration::from_secs(payload.timeout_secs))
            .await?;

        if !output.success() {
            let stderr = output.stderr.trim();
            let start = stderr
                .char_indices()
                .rev()
                .nth(ERROR_TAIL_CHARS)
                .map_or(0, |(i, _)| i);
            bail!(
                "command exited with {}: {}",
                output
                    .exit_code
                    .map_or_else(|| "signal".to_string(), |c| c.to_string()),
                &stderr[start..]
            );
        }

        let mut note = None;
        if let Some(section) = &payload.vault_section {
            let vault = self
                .vault
                .as_ref()
                .context("vault_section requested but no vault is configured")?;
            ctx.progress(80, "Writing daily note").await;
            let path = vault
                .write_section(Local::now().date_naive(), section, &output.stdout)
                .await
                .context("failed to write daily note")?;
            note = Some(path.display().to_string());
        }

        Ok(json!({
            "exit_code": output.exit_code,
            "stdout": output.stdout,
            "stderr": output.stderr,
            "note": note,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::TaskQueue;
    use cronflow_events::EventBus;
    use cronflow_types::{Task, TaskStatus};
    use std::sync::Arc;

    async fn run_task(handler: CommandHandler, payload: Value) -> Task {
        let mut queue = TaskQueue::new(Arc::new(EventBus::new()), Duration::from_secs(60));
        queue.register(Arc::new(handler));
        let queue = Arc::new(queue);
        let task = queue.submit("command", payload, None).await;
        for _ in 0..200 {
            let current = queue.get(&task.id).await.unwrap();
            if current.status.is_terminal() {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task never finished");
    }

    #[tokio::test]
    async fn test_command_success() {
        let task = run_task(CommandHandler::new(None), json!({"command": "echo hi"})).await;
        assert_eq!(task.status, TaskStatus::Completed);
        let result = task.result.unwrap();
        assert_eq!(result["stdout"], "hi\n");
        assert_eq!(result["exit_code"], 0);
    }

    #[tokio::test]
    async fn test_command_failure_message() {
        let task = run_task(
            CommandHandler::new(None),
            json!({"command": "echo broken >&2; exit 2"}),
        )
        .await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("command exited with 2: broken"));
    }

    #[tokio::test]
    async fn test_invalid_payload() {
        let task = run_task(CommandHandler::new(None), json!({"cmd": "x"})).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().starts_with("invalid command payload"));
    }

    #[tokio::test]
    async fn test_stdout_filed_into_vault() {
        let dir = tempfile::tempdir().unwrap();
        let vault = DailyNoteVault::new(dir.path(), "DAILY");
        let task = run_task(
            CommandHandler::new(Some(vault.clone())),
            json!({"command": "echo '- shipped'", "vault_section": "Summary"}),
        )
        .await;
        assert_eq!(task.status, TaskStatus::Completed);

        let path = vault.note_path(Local::now().date_naive());
        let doc = std::fs::read_to_string(path).unwrap();
        assert!(doc.contains("## Summary\n- shipped\n"));
    }
}
