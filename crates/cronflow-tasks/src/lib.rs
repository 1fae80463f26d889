//! cronflow-tasks: fire-and-forget background tasks with progress reporting.
//!
//! Tasks are typed; each type is served by one registered [`TaskHandler`].
//! Lifecycle updates are published on the event bus to the submitting client.

pub mod context;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod queue;
pub mod vault;

pub use context::{CommandOutput, TaskContext};
pub use error::TaskError;
pub use handler::TaskHandler;
pub use handlers::{CommandHandler, VaultSectionHandler};
pub use queue::TaskQueue;
pub use vault::DailyNoteVault;
