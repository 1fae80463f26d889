use async_trait::async_trait;
use serde_json::Value;

use crate::context::TaskContext;

/// Processes every task of one type.
///
/// The returned value becomes the task's `result`; an error fails the task
/// with its message.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_type(&self) -> &str;

    async fn run(&self, ctx: TaskContext) -> anyhow::Result<Value>;
}
