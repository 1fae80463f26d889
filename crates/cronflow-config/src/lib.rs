use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },
    #[error("Config directory not found")]
    NoDirFound,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bearer token required by the API and webhook routes (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

fn default_port() -> u16 {
    3030
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            auth_token: None,
        }
    }
}

/// Job engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Chained propagation stops once this depth is reached.
    #[serde(default = "default_max_chain_depth")]
    pub max_chain_depth: u32,
    /// Timeout for a single auto-fix remediation command.
    #[serde(default = "default_auto_fix_timeout_secs")]
    pub auto_fix_timeout_secs: u64,
    /// Directories prepended to `PATH` for job subprocesses.
    #[serde(default)]
    pub extra_paths: Vec<String>,
    /// Working directory for job subprocesses (defaults to the process cwd).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

fn default_max_chain_depth() -> u32 {
    10
}

fn default_auto_fix_timeout_secs() -> u64 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_chain_depth: default_max_chain_depth(),
            auto_fix_timeout_secs: default_auto_fix_timeout_secs(),
            extra_paths: Vec::new(),
            working_dir: None,
        }
    }
}

/// Asynchronous task queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Seconds a finished task stays readable before it is purged.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Interval of the purge loop.
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_reap_interval_secs() -> u64 {
    60
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            reap_interval_secs: default_reap_interval_secs(),
        }
    }
}

/// Outbound notification webhook.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// Base URL linked from messages (e.g. "http://localhost:3030").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
}

/// Markdown vault used by the daily-note writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default = "default_daily_folder")]
    pub daily_folder: String,
}

fn default_daily_folder() -> String {
    "DAILY".to_string()
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            path: None,
            daily_folder: default_daily_folder(),
        }
    }
}

/// Top-level cronflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronflowConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    /// Directory holding the SQLite database (defaults to the config dir).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl CronflowConfig {
    /// Resolve the database file path.
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        let dir = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => config_dir()?,
        };
        Ok(dir.join("cronflow.db"))
    }
}

/// Resolve the cronflow config directory (~/.cronflow/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".cronflow"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path (~/.cronflow/config.json5).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json5"))
}

/// Load configuration from the default path, then apply environment overrides.
pub fn load_config() -> Result<CronflowConfig, ConfigError> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let path = config_file_path()?;
    let config = load_config_from(&path)?;
    let config = apply_env_overrides(config, |key| std::env::var(key).ok())?;
    Ok(expand_paths(config))
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<CronflowConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(CronflowConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: CronflowConfig = json5::from_str(&content)?;
    Ok(config)
}

/// Overlay `CRONFLOW_*` variables on top of the file configuration.
///
/// `lookup` abstracts the environment so overrides can be tested without
/// mutating process state.
pub fn apply_env_overrides<F>(
    mut config: CronflowConfig,
    lookup: F,
) -> Result<CronflowConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(host) = get("CRONFLOW_HOST") {
        config.server.host = host;
    }
    if let Some(port) = get("CRONFLOW_PORT") {
        config.server.port = port.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            key: "CRONFLOW_PORT".into(),
            value: port.clone(),
        })?;
    }
    if let Some(token) = get("CRONFLOW_AUTH_TOKEN") {
        config.server.auth_token = Some(token);
    }
    if let Some(url) = get("CRONFLOW_WEBHOOK_URL") {
        config.notifications.webhook_url = Some(url);
    }
    if let Some(dir) = get("CRONFLOW_DATA_DIR") {
        config.data_dir = Some(PathBuf::from(dir));
    }
    if let Some(path) = get("CRONFLOW_VAULT_PATH") {
        config.vault.path = Some(PathBuf::from(path));
    }
    if let Some(folder) = get("CRONFLOW_DAILY_FOLDER") {
        config.vault.daily_folder = folder;
    }
    if let Some(paths) = get("CRONFLOW_EXTRA_PATHS") {
        config.engine.extra_paths = paths
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect();
    }

    Ok(config)
}

/// Expand a leading `~` in every configured path.
pub fn expand_paths(mut config: CronflowConfig) -> CronflowConfig {
    config.data_dir = config.data_dir.map(|p| expand_tilde(&p));
    config.vault.path = config.vault.path.map(|p| expand_tilde(&p));
    config.engine.working_dir = config.engine.working_dir.map(|p| expand_tilde(&p));
    config.engine.extra_paths = config
        .engine
        .extra_paths
        .iter()
        .map(|p| expand_tilde(Path::new(p)).to_string_lossy().into_owned())
        .collect();
    config
}

fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Ensure the config directory exists.
pub fn ensure_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = config_dir()?;
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

/// Save configuration to the default path.
pub fn save_config(config: &CronflowConfig) -> Result<(), ConfigError> {
    let dir = ensure_config_dir()?;
    let path = dir.join("config.json5");
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| ConfigError::Io(std::io::Error::other(e)))?;
    std::fs::write(path, content)?;
    Ok(())
}
