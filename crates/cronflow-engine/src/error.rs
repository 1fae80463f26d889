use cronflow_storage::StorageError;

/// Errors surfaced by the job engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Job not found: {0}")]
    JobNotFound(String),
    #[error("Edge not found: {0}")]
    EdgeNotFound(String),
    #[error("Job already exists: {0}")]
    DuplicateJob(String),
    #[error("Invalid job definition: {0}")]
    InvalidJob(String),
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },
    #[error("Invalid value for option '{option}': {reason}")]
    InvalidOption { option: String, reason: String },
    #[error("Job already running: {0}")]
    AlreadyRunning(String),
    #[error("Invalid timestamp '{0}'")]
    InvalidTimestamp(String),
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Run task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl EngineError {
    /// Errors caused by bad input, rejected before anything executes.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidJob(_)
                | EngineError::InvalidSchedule { .. }
                | EngineError::InvalidOption { .. }
                | EngineError::InvalidTimestamp(_)
                | EngineError::InvalidSettings(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
