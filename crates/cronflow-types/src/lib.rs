use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ──────────────────── Job Types ────────────────────

/// A schedulable/triggerable unit of work wrapping one subprocess invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Unique job ID. Derived from the name when left empty on creation.
    #[serde(default)]
    pub id: String,
    /// Display name.
    pub name: String,
    /// Base shell command; option-derived flags are appended to it.
    pub command: String,
    /// Cron expression (e.g. "0 9 * * 1-5"). Empty means manual only.
    #[serde(default)]
    pub schedule: String,
    /// Disabled jobs are never scheduled but can still be run manually.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Declared options that shape the final command line.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<JobOption>,
    /// Timeout and retry behavior.
    #[serde(default)]
    pub execution: ExecutionSettings,
    /// Category ID used for grouping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Job {
    /// Whether this job has a recurring schedule.
    pub fn has_schedule(&self) -> bool {
        !self.schedule.trim().is_empty()
    }
}

/// Timeout and retry settings for a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionSettings {
    /// Seconds before the subprocess is killed. `0` disables the timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries after the first failed attempt.
    #[serde(default)]
    pub max_retries: u32,
    /// Base delay between retries, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub backoff: BackoffStrategy,
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: 0,
            retry_delay_ms: default_retry_delay_ms(),
            backoff: BackoffStrategy::default(),
        }
    }
}

/// How the delay between retries grows.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

/// A declared option of a job.
///
/// Non-system options are rendered onto the command line; system options are
/// consumed by the engine itself (e.g. `notify`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobOption {
    /// Key used for overrides (e.g. `{"dry_run": true}`).
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// CLI flag (e.g. `--dry-run`). Without a flag, values are positional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag: Option<String>,
    /// Handled by the engine, never appended to the command.
    #[serde(default)]
    pub system: bool,
    #[serde(flatten)]
    pub kind: OptionKind,
}

/// The value shape of a job option.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptionKind {
    Boolean {
        #[serde(default)]
        default: bool,
    },
    #[serde(rename = "string")]
    Text {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    Select {
        choices: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    Array {
        #[serde(default)]
        default: Vec<String>,
    },
}

/// A directed dependency between two jobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Edge {
    #[serde(default)]
    pub id: String,
    pub from: String,
    pub to: String,
    /// `false` means display-only: no execution semantics.
    #[serde(default)]
    pub trigger: bool,
    /// Only fire when the upstream job succeeded.
    #[serde(default)]
    pub on_success: bool,
}

/// A named job grouping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Category {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

// ──────────────────── Execution Types ────────────────────

/// The reason a given run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TriggerKind {
    Scheduled,
    Manual,
    Chained,
    Retry(u32),
    AutoFix,
    Webhook,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::Scheduled => f.write_str("scheduled"),
            TriggerKind::Manual => f.write_str("manual"),
            TriggerKind::Chained => f.write_str("chained"),
            TriggerKind::Retry(n) => write!(f, "retry({n})"),
            TriggerKind::AutoFix => f.write_str("auto-fix"),
            TriggerKind::Webhook => f.write_str("webhook"),
        }
    }
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(TriggerKind::Scheduled),
            "manual" => Ok(TriggerKind::Manual),
            "chained" => Ok(TriggerKind::Chained),
            "auto-fix" => Ok(TriggerKind::AutoFix),
            "webhook" => Ok(TriggerKind::Webhook),
            other => other
                .strip_prefix("retry(")
                .and_then(|rest| rest.strip_suffix(')'))
                .and_then(|n| n.parse().ok())
                .map(TriggerKind::Retry)
                .ok_or_else(|| format!("unknown trigger kind: {other}")),
        }
    }
}

impl From<TriggerKind> for String {
    fn from(kind: TriggerKind) -> Self {
        kind.to_string()
    }
}

impl TryFrom<String> for TriggerKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Status of an execution record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

/// One entry of the execution history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    /// Timestamp-based ID (`<unix millis>-<suffix>`).
    pub id: String,
    pub job_id: String,
    pub job_name: String,
    pub trigger: TriggerKind,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub status: RunStatus,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Final command line handed to the shell.
    pub command: String,
    /// Effective option values for this run.
    #[serde(default)]
    pub options: Map<String, Value>,
    #[serde(default)]
    pub retry_attempt: u32,
    #[serde(default)]
    pub chain_depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_fix: Option<AutoFixReport>,
}

impl ExecutionRecord {
    pub fn is_finished(&self) -> bool {
        self.status != RunStatus::Running
    }
}

/// Outcome of a remediation command attached to the failed record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoFixReport {
    pub rule_id: String,
    pub rule_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
    pub command: String,
    pub success: bool,
    #[serde(default)]
    pub output: String,
}

/// A pattern-matched recovery action applied once before ordinary retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoFixRule {
    pub id: String,
    pub name: String,
    /// Regex tested against combined stdout + stderr.
    pub pattern: String,
    /// Regex whose first capture group yields the `{package}` parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extract_package: Option<String>,
    /// Command template; `{package}` is replaced by the extracted parameter.
    pub fix: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Recovery rules shipped with a fresh install.
pub fn builtin_auto_fix_rules() -> Vec<AutoFixRule> {
    vec![
        AutoFixRule {
            id: "python-module".into(),
            name: "Install missing Python module".into(),
            pattern: r"ModuleNotFoundError: No module named".into(),
            extract_package: Some(r"No module named '([A-Za-z0-9_\-]+)".into()),
            fix: "python3 -m pip install {package}".into(),
            enabled: true,
        },
        AutoFixRule {
            id: "node-module".into(),
            name: "Install missing Node module".into(),
            pattern: r"Cannot find module '".into(),
            extract_package: Some(r"Cannot find module '([@A-Za-z0-9_\-/]+)'".into()),
            fix: "npm install {package}".into(),
            enabled: true,
        },
    ]
}

/// Engine-wide settings persisted next to the jobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalSettings {
    /// Number of execution records retained.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_true")]
    pub auto_fix_enabled: bool,
    #[serde(default = "builtin_auto_fix_rules")]
    pub auto_fix_rules: Vec<AutoFixRule>,
    /// Notify for jobs that do not declare a `notify` system option.
    #[serde(default)]
    pub notify_by_default: bool,
}

fn default_history_limit() -> usize {
    100
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            auto_fix_enabled: true,
            auto_fix_rules: builtin_auto_fix_rules(),
            notify_by_default: false,
        }
    }
}

// ──────────────────── Task Types ────────────────────

/// Status of an asynchronous task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// A timestamped line in a task's log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskLogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// An asynchronous, non-scheduled unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub payload: Value,
    pub status: TaskStatus,
    /// 0..=100
    pub progress: u8,
    #[serde(default)]
    pub progress_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub logs: Vec<TaskLogEntry>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

// ──────────────────── Output Limits ────────────────────

/// Upper bound on captured stdout or stderr, in bytes.
pub const MAX_OUTPUT_CHARS: usize = 200_000;

/// Appended once when captured output hits [`MAX_OUTPUT_CHARS`].
pub const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Append `text` to captured output, keeping at most [`MAX_OUTPUT_CHARS`] of
/// it. The first append that overflows ends with [`TRUNCATION_MARKER`]; later
/// ones are dropped. Returns whether anything was dropped.
pub fn push_capped(out: &mut String, text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    if out.len() >= MAX_OUTPUT_CHARS {
        if !out.ends_with(TRUNCATION_MARKER) {
            out.push_str(TRUNCATION_MARKER);
        }
        return true;
    }
    let room = MAX_OUTPUT_CHARS - out.len();
    if text.len() <= room {
        out.push_str(text);
        return false;
    }
    let mut end = room;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    out.push_str(&text[..end]);
    out.push_str(TRUNCATION_MARKER);
    true
}

fn default_true() -> bool {
    true
}
