//! cronflow-storage: SQLite-backed job store.
//!
//! Holds job definitions, dependency edges, categories, global settings and
//! finalized execution history. Every call is an independent
//! read-modify-write; there is no optimistic concurrency check.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::Mutex;

use cronflow_types::{Category, Edge, ExecutionRecord, GlobalSettings, Job, RunStatus};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, StorageError>;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        definition TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS edges (
        id TEXT PRIMARY KEY,
        from_job TEXT NOT NULL,
        to_job TEXT NOT NULL,
        is_trigger INTEGER NOT NULL DEFAULT 0,
        on_success INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS categories (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        color TEXT
    );

    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS executions (
        id TEXT PRIMARY KEY,
        job_id TEXT NOT NULL,
        started_at INTEGER NOT NULL,
        status TEXT NOT NULL,
        record TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_executions_job ON executions(job_id, started_at);
";

const SETTINGS_KEY: &str = "global";

/// SQLite-based storage for cronflow state.
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
}

impl JobStore {
    /// Open (or create) the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        tracing::info!("Job store opened: {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking closure against the connection off the async runtime.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await?
    }

    // ─── Jobs ───────────────────────────────────────────────

    /// List all jobs in creation order.
    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT definition FROM jobs ORDER BY created_at, rowid")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.iter()
                .map(|json| serde_json::from_str(json).map_err(StorageError::from))
                .collect()
        })
        .await
    }

    /// Get a job by ID.
    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT definition FROM jobs WHERE id = ?1",
                    rusqlite::params![id],
                    |row| row.get(0),
                )
                .optional()?;
            json.map(|j| serde_json::from_str(&j).map_err(StorageError::from))
                .transpose()
        })
        .await
    }

    /// Insert or update a job definition.
    pub async fn save_job(&self, job: &Job) -> Result<()> {
        let id = job.id.clone();
        let definition = serde_json::to_string(job)?;
        let now = Utc::now().timestamp_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO jobs (id, definition, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    definition = excluded.definition,
                    updated_at = excluded.updated_at",
                rusqlite::params![id, definition, now],
            )?;
            Ok(())
        })
        .await
    }

    /// Delete a job. Edges referencing it are left in place.
    pub async fn delete_job(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let count = conn.execute("DELETE FROM jobs WHERE id = ?1", rusqlite::params![id])?;
            Ok(count > 0)
        })
        .await
    }

    // ─── Edges ──────────────────────────────────────────────

    /// List all edges in insertion order.
    pub async fn list_edges(&self) -> Result<Vec<Edge>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, from_job, to_job, is_trigger, on_success FROM edges ORDER BY rowid",
            )?;
            let edges = stmt
                .query_map([], |row| {
                    Ok(Edge {
                        id: row.get(0)?,
                        from: row.get(1)?,
                        to: row.get(2)?,
                        trigger: row.get::<_, i64>(3)? != 0,
                        on_success: row.get::<_, i64>(4)? != 0,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(edges)
        })
        .await
    }

    /// Insert or update an edge.
    pub async fn save_edge(&self, edge: &Edge) -> Result<()> {
        let edge = edge.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO edges (id, from_job, to_job, is_trigger, on_success)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    from_job = excluded.from_job,
                    to_job = excluded.to_job,
                    is_trigger = excluded.is_trigger,
                    on_success = excluded.on_success",
                rusqlite::params![
                    edge.id,
                    edge.from,
                    edge.to,
                    edge.trigger as i64,
                    edge.on_success as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Delete an edge.
    pub async fn delete_edge(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let count = conn.execute("DELETE FROM edges WHERE id = ?1", rusqlite::params![id])?;
            Ok(count > 0)
        })
        .await
    }

    // ─── Categories ─────────────────────────────────────────

    pub async fn list_categories(&self) -> Result<Vec<Category>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, name, color FROM categories ORDER BY rowid")?;
            let categories = stmt
                .query_map([], |row| {
                    Ok(Category {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        color: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(categories)
        })
        .await
    }

    pub async fn save_category(&self, category: &Category) -> Result<()> {
        let category = category.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO categories (id, name, color) VALUES (?1, ?2, ?3)",
                rusqlite::params![category.id, category.name, category.color],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete_category(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let count =
                conn.execute("DELETE FROM categories WHERE id = ?1", rusqlite::params![id])?;
            Ok(count > 0)
        })
        .await
    }

    // ─── Settings ───────────────────────────────────────────

    /// Load global settings, falling back to defaults when none were saved.
    pub async fn load_settings(&self) -> Result<GlobalSettings> {
        self.with_conn(|conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    rusqlite::params![SETTINGS_KEY],
                    |row| row.get(0),
                )
                .optional()?;
            match json {
                Some(json) => Ok(serde_json::from_str(&json)?),
                None => Ok(GlobalSettings::default()),
            }
        })
        .await
    }

    pub async fn save_settings(&self, settings: &GlobalSettings) -> Result<()> {
        let value = serde_json::to_string(settings)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                rusqlite::params![SETTINGS_KEY, value],
            )?;
            Ok(())
        })
        .await
    }

    // ─── Execution History ──────────────────────────────────

    /// Insert or update an execution record.
    pub async fn save_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let id = record.id.clone();
        let job_id = record.job_id.clone();
        let started_at = record.start_time.timestamp_millis();
        let status = record.status.as_str();
        let json = serde_json::to_string(record)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO executions (id, job_id, started_at, status, record)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id, job_id, started_at, status, json],
            )?;
            Ok(())
        })
        .await
    }

    /// Get an execution record by ID.
    pub async fn get_execution(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT record FROM executions WHERE id = ?1",
                    rusqlite::params![id],
                    |row| row.get(0),
                )
                .optional()?;
            json.map(|j| serde_json::from_str(&j).map_err(StorageError::from))
                .transpose()
        })
        .await
    }

    /// List the most recent execution records, newest first.
    pub async fn list_executions(
        &self,
        job_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        let job_id = job_id.map(String::from);
        let limit = limit as i64;
        self.with_conn(move |conn| {
            let rows = match &job_id {
                Some(job_id) => {
                    let mut stmt = conn.prepare(
                        "SELECT record FROM executions WHERE job_id = ?1
                         ORDER BY started_at DESC, id DESC LIMIT ?2",
                    )?;
                    let rows = stmt
                        .query_map(rusqlite::params![job_id, limit], |row| {
                            row.get::<_, String>(0)
                        })?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT record FROM executions ORDER BY started_at DESC, id DESC LIMIT ?1",
                    )?;
                    let rows = stmt
                        .query_map(rusqlite::params![limit], |row| row.get::<_, String>(0))?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows
                }
            };
            rows.iter()
                .map(|json| serde_json::from_str(json).map_err(StorageError::from))
                .collect()
        })
        .await
    }

    /// Drop everything but the `keep` most recent records.
    pub async fn trim_executions(&self, keep: usize) -> Result<usize> {
        let keep = keep as i64;
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM executions WHERE id NOT IN (
                    SELECT id FROM executions ORDER BY started_at DESC, id DESC LIMIT ?1
                 )",
                rusqlite::params![keep],
            )?;
            Ok(removed)
        })
        .await
    }

    /// Mark records left `running` by a previous process as failed.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let now = Utc::now();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT record FROM executions WHERE status = ?1")?;
            let rows = stmt
                .query_map(rusqlite::params![RunStatus::Running.as_str()], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut recovered = 0;
            for json in rows {
                let mut record: ExecutionRecord = serde_json::from_str(&json)?;
                record.status = RunStatus::Failed;
                record.error = Some("Interrupted: process exited before the run finished".into());
                record.end_time = Some(now);
                record.duration_ms = Some(
                    (now - record.start_time)
                        .num_milliseconds()
                        .max(0) as u64,
                );
                conn.execute(
                    "UPDATE executions SET status = ?1, record = ?2 WHERE id = ?3",
                    rusqlite::params![
                        record.status.as_str(),
                        serde_json::to_string(&record)?,
                        record.id
                    ],
                )?;
                recovered += 1;
            }
            Ok(recovered)
        })
        .await
    }
}
