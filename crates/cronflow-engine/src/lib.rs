//! cronflow-engine: job orchestration.
//!
//! Provides:
//! - Cron and one-shot scheduling
//! - A per-job execution state machine with timeout, retry and backoff
//! - Data-driven auto-fix of known failures
//! - Chained runs along trigger edges, bounded by depth
//! - Execution history and run notifications

pub mod autofix;
pub mod catalog;
pub mod chain;
pub mod engine;
pub mod error;
pub mod executor;
pub mod history;
pub mod notify;
pub mod options;
pub mod retry;
pub mod runner;
pub mod running;
pub mod schedule;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use autofix::{AutoFixEngine, AutoFixMatch};
pub use engine::{Engine, EngineBuilder, notifier_from_config};
pub use error::{EngineError, Result};
pub use executor::{RunRequest, RunSummary};
pub use notify::{NoopNotifier, NotificationRequest, Notifier, WebhookNotifier};
pub use runner::{CommandRunner, CommandSpec, OutputChunk, OutputStream, ProcessOutcome, ShellRunner};
pub use running::RunningState;
pub use scheduler::{ScheduleInfo, ScheduleKind};
