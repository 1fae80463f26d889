//! The engine: shared state behind every job operation.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use cronflow_config::{EngineConfig, NotificationConfig};
use cronflow_events::EventBus;
use cronflow_storage::JobStore;
use cronflow_types::GlobalSettings;

use crate::autofix::AutoFixEngine;
use crate::error::Result;
use crate::history::ExecutionHistory;
use crate::notify::{NoopNotifier, Notifier, WebhookNotifier};
use crate::runner::{CommandRunner, ShellRunner, augmented_path};
use crate::running::{RunningJobs, RunningState};

/// Settings plus the rules compiled from them.
pub(crate) struct ActiveSettings {
    pub(crate) settings: GlobalSettings,
    pub(crate) auto_fix: Arc<AutoFixEngine>,
}

impl ActiveSettings {
    pub(crate) fn new(settings: GlobalSettings) -> Self {
        let auto_fix = Arc::new(AutoFixEngine::new(&settings.auto_fix_rules));
        Self { settings, auto_fix }
    }
}

/// A registered recurring trigger.
pub(crate) struct CronHandle {
    pub(crate) expression: String,
    pub(crate) task: JoinHandle<()>,
}

/// A registered single delayed trigger.
pub(crate) struct OneShotHandle {
    pub(crate) generation: u64,
    pub(crate) at: DateTime<Utc>,
    pub(crate) task: JoinHandle<()>,
}

/// Job orchestration engine.
///
/// Always used behind an `Arc`: runs, chains and timers hold clones (or weak
/// references) of it.
pub struct Engine {
    pub(crate) store: Arc<JobStore>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) history: ExecutionHistory,
    pub(crate) running: Arc<RunningJobs>,
    pub(crate) active: RwLock<ActiveSettings>,
    pub(crate) cron_handles: Mutex<HashMap<String, CronHandle>>,
    pub(crate) one_shots: Mutex<HashMap<String, OneShotHandle>>,
    pub(crate) one_shot_generation: AtomicU64,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) runner: Arc<dyn CommandRunner>,
    pub(crate) config: EngineConfig,
    pub(crate) path_env: String,
}

impl Engine {
    pub fn builder(store: Arc<JobStore>, events: Arc<EventBus>) -> EngineBuilder {
        EngineBuilder {
            store,
            events,
            config: EngineConfig::default(),
            runner: None,
            notifier: None,
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn history(&self) -> &ExecutionHistory {
        &self.history
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Jobs currently holding their run lock.
    pub fn running(&self) -> Vec<RunningState> {
        self.running.list()
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.running.is_running(job_id)
    }

    pub(crate) fn cron_handles(&self) -> MutexGuard<'_, HashMap<String, CronHandle>> {
        self.cron_handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn one_shots(&self) -> MutexGuard<'_, HashMap<String, OneShotHandle>> {
        self.one_shots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for (_, handle) in self.cron_handles().drain() {
            handle.task.abort();
        }
        for (_, handle) in self.one_shots().drain() {
            handle.task.abort();
        }
    }
}

/// Builds an [`Engine`], loading persisted settings and history.
pub struct EngineBuilder {
    store: Arc<JobStore>,
    events: Arc<EventBus>,
    config: EngineConfig,
    runner: Option<Arc<dyn CommandRunner>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Recover interrupted runs, load settings and history, and assemble the
    /// engine. Schedules are not armed; call [`Engine::schedule_all`].
    pub async fn build(self) -> Result<Arc<Engine>> {
        let recovered = self.store.recover_interrupted().await?;
        if recovered > 0 {
            warn!("Marked {recovered} interrupted runs as failed");
        }

        let settings = self.store.load_settings().await?;
        let history = ExecutionHistory::new(Arc::clone(&self.store), settings.history_limit);
        let loaded = history.load().await?;
        info!(
            records = loaded,
            rules = settings.auto_fix_rules.len(),
            "Engine state loaded"
        );

        let path_env = augmented_path(
            std::env::var("PATH").ok().as_deref(),
            &self.config.extra_paths,
        );

        Ok(Arc::new(Engine {
            store: self.store,
            events: self.events,
            history,
            running: Arc::new(RunningJobs::new()),
            active: RwLock::new(ActiveSettings::new(settings)),
            cron_handles: Mutex::new(HashMap::new()),
            one_shots: Mutex::new(HashMap::new()),
            one_shot_generation: AtomicU64::new(0),
            notifier: self.notifier.unwrap_or_else(|| Arc::new(NoopNotifier)),
            runner: self.runner.unwrap_or_else(|| Arc::new(ShellRunner)),
            config: self.config,
            path_env,
        }))
    }
}

/// Webhook notifier when a URL is configured, otherwise a no-op.
pub fn notifier_from_config(config: &NotificationConfig) -> Arc<dyn Notifier> {
    match &config.webhook_url {
        Some(url) => {
            info!("Run notifications enabled");
            Arc::new(WebhookNotifier::new(url.clone(), config.dashboard_url.clone()))
        }
        None => Arc::new(NoopNotifier),
    }
}
