//! Job, edge, category and settings management.
//!
//! Every mutation validates before it persists and keeps the scheduler in
//! step with the stored definition.

use std::sync::Arc;

use regex::Regex;
use tracing::info;

use cronflow_types::{Category, Edge, ExecutionRecord, GlobalSettings, Job};

use crate::engine::{ActiveSettings, Engine};
use crate::error::{EngineError, Result};
use crate::options;
use crate::schedule;

/// Check a job definition before it is stored.
pub fn validate_job(job: &Job) -> Result<()> {
    if job.id.trim().is_empty() {
        return Err(EngineError::InvalidJob("id must not be empty".into()));
    }
    if !job
        .id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(EngineError::InvalidJob(format!(
            "id '{}' may only contain letters, digits, '-', '_' and '.'",
            job.id
        )));
    }
    if job.name.trim().is_empty() {
        return Err(EngineError::InvalidJob("name must not be empty".into()));
    }
    if job.command.trim().is_empty() {
        return Err(EngineError::InvalidJob("command must not be empty".into()));
    }
    if job.has_schedule() {
        schedule::validate(&job.schedule)?;
    }
    options::validate_options(&job.options)
}

/// Derive an ID from a display name.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

impl Engine {
    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.store.list_jobs().await?)
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.store.get_job(id).await?)
    }

    /// Store a new job and arm its schedule. An empty ID is derived from the
    /// name.
    pub async fn create_job(self: &Arc<Self>, mut job: Job) -> Result<Job> {
        if job.id.trim().is_empty() {
            job.id = slugify(&job.name);
        }
        validate_job(&job)?;
        if self.store.get_job(&job.id).await?.is_some() {
            return Err(EngineError::DuplicateJob(job.id));
        }

        self.store.save_job(&job).await?;
        self.schedule(&job)?;
        info!(job_id = %job.id, "Job created");
        Ok(job)
    }

    /// Replace a stored job definition and re-arm its schedule.
    pub async fn update_job(self: &Arc<Self>, id: &str, mut job: Job) -> Result<Job> {
        if self.store.get_job(id).await?.is_none() {
            return Err(EngineError::JobNotFound(id.to_string()));
        }
        job.id = id.to_string();
        validate_job(&job)?;

        self.store.save_job(&job).await?;
        self.schedule(&job)?;
        info!(job_id = %job.id, "Job updated");
        Ok(job)
    }

    /// Remove a job and its triggers. Edges referencing it are left alone.
    pub async fn delete_job(&self, id: &str) -> Result<()> {
        if !self.store.delete_job(id).await? {
            return Err(EngineError::JobNotFound(id.to_string()));
        }
        self.unschedule(id);
        self.cancel_once(id);
        info!(job_id = %id, "Job deleted");
        Ok(())
    }

    pub async fn set_job_enabled(self: &Arc<Self>, id: &str, enabled: bool) -> Result<Job> {
        let mut job = self
            .store
            .get_job(id)
            .await?
            .ok_or_else(|| EngineError::JobNotFound(id.to_string()))?;
        job.enabled = enabled;
        self.store.save_job(&job).await?;
        self.schedule(&job)?;
        Ok(job)
    }

    pub async fn list_edges(&self) -> Result<Vec<Edge>> {
        Ok(self.store.list_edges().await?)
    }

    /// Store an edge after checking both ends exist. An empty ID is
    /// generated.
    pub async fn add_edge(&self, mut edge: Edge) -> Result<Edge> {
        for end in [&edge.from, &edge.to] {
            if self.store.get_job(end).await?.is_none() {
                return Err(EngineError::JobNotFound(end.clone()));
            }
        }
        if edge.id.trim().is_empty() {
            edge.id = format!("edge-{}", uuid::Uuid::new_v4().simple());
        }
        self.store.save_edge(&edge).await?;
        info!(edge = %edge.id, from = %edge.from, to = %edge.to, "Edge added");
        Ok(edge)
    }

    pub async fn remove_edge(&self, id: &str) -> Result<()> {
        if !self.store.delete_edge(id).await? {
            return Err(EngineError::EdgeNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn list_categories(&self) -> Result<Vec<Category>> {
        Ok(self.store.list_categories().await?)
    }

    pub async fn save_category(&self, mut category: Category) -> Result<Category> {
        if category.name.trim().is_empty() {
            return Err(EngineError::InvalidJob("category name must not be empty".into()));
        }
        if category.id.trim().is_empty() {
            category.id = slugify(&category.name);
        }
        self.store.save_category(&category).await?;
        Ok(category)
    }

    /// Returns whether the category existed.
    pub async fn delete_category(&self, id: &str) -> Result<bool> {
        Ok(self.store.delete_category(id).await?)
    }

    pub async fn settings(&self) -> GlobalSettings {
        self.active.read().await.settings.clone()
    }

    /// Persist new settings, recompile auto-fix rules and resize history.
    pub async fn update_settings(&self, settings: GlobalSettings) -> Result<GlobalSettings> {
        if settings.history_limit == 0 {
            return Err(EngineError::InvalidSettings(
                "history_limit must be at least 1".into(),
            ));
        }
        for rule in &settings.auto_fix_rules {
            let patterns = std::iter::once(&rule.pattern).chain(rule.extract_package.as_ref());
            for pattern in patterns {
                if let Err(e) = Regex::new(pattern) {
                    return Err(EngineError::InvalidSettings(format!(
                        "rule '{}' has an invalid pattern: {e}",
                        rule.id
                    )));
                }
            }
        }

        self.store.save_settings(&settings).await?;
        self.history.set_limit(settings.history_limit).await;
        *self.active.write().await = ActiveSettings::new(settings.clone());
        info!(
            history_limit = settings.history_limit,
            rules = settings.auto_fix_rules.len(),
            "Settings updated"
        );
        Ok(settings)
    }

    pub async fn get_execution(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        self.history.get(id).await
    }

    pub async fn list_executions(&self, job_id: Option<&str>, limit: usize) -> Vec<ExecutionRecord> {
        self.history.list(job_id, limit).await
    }
}
