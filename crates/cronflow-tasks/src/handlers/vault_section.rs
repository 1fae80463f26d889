//! `vault.section` tasks: write a section into a daily note.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::context::TaskContext;
use crate::handler::TaskHandler;
use crate::vault::DailyNoteVault;

#[derive(Debug, Deserialize)]
struct SectionPayload {
    section: String,
    content: String,
    /// Defaults to today.
    #[serde(default)]
    date: Option<NaiveDate>,
}

pub struct VaultSectionHandler {
    vault: DailyNoteVault,
}

impl VaultSectionHandler {
    pub fn new(vault: DailyNoteVault) -> Self {
        Self { vault }
    }
}

#[async_trait]
impl TaskHandler for VaultSectionHandler {
    fn task_type(&self) -> &str {
        "vault.section"
    }

    async fn run(&self, ctx: TaskContext) -> anyhow::Result<Value> {
        let payload: SectionPayload =
            serde_json::from_value(ctx.payload().clone()).context("invalid vault.section payload")?;
        let date = payload.date.unwrap_or_else(|| Local::now().date_naive());

        ctx.progress(50, "Writing daily note").await;
        let path = self
            .vault
            .write_section(date, &payload.section, &payload.content)
            .await
            .with_context(|| format!("failed to write section '{}'", payload.section))?;

        Ok(json!({ "path": path.display().to_string(), "date": date }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::TaskQueue;
    use cronflow_events::EventBus;
    use cronflow_types::TaskStatus;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_writes_dated_section() {
        let dir = tempfile::tempdir().unwrap();
        let vault = DailyNoteVault::new(dir.path(), "Journal");
        let mut queue = TaskQueue::new(Arc::new(EventBus::new()), Duration::from_secs(60));
        queue.register(Arc::new(VaultSectionHandler::new(vault)));
        let queue = Arc::new(queue);

        let task = queue
            .submit(
                "vault.section",
                json!({"section": "Retro", "content": "went well", "date": "2026-02-03"}),
                None,
            )
            .await;
        let mut done = None;
        for _ in 0..100 {
            let current = queue.get(&task.id).await.unwrap();
            if current.status.is_terminal() {
                done = Some(current);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let done = done.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);

        let doc = std::fs::read_to_string(dir.path().join("Journal/2026-02-03.md")).unwrap();
        assert!(doc.contains("## Retro\nwent well\n"));
    }
}
