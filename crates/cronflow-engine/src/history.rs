//! Bounded window of recent execution records, mirrored to the store.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::warn;

use cronflow_storage::JobStore;
use cronflow_types::{AutoFixReport, ExecutionRecord, RunStatus, push_capped};

use crate::error::Result;
use crate::runner::{OutputChunk, OutputStream};

/// How a record is finalized.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

/// Newest records first. Live records are mutated in memory and persisted
/// when they start and when they finish.
pub struct ExecutionHistory {
    records: RwLock<VecDeque<ExecutionRecord>>,
    limit: AtomicUsize,
    store: Arc<JobStore>,
}

impl ExecutionHistory {
    pub fn new(store: Arc<JobStore>, limit: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
            limit: AtomicUsize::new(limit.max(1)),
            store,
        }
    }

    /// Fill the window from the store.
    pub async fn load(&self) -> Result<usize> {
        let records = self
            .store
            .list_executions(None, self.limit.load(Ordering::Relaxed))
            .await?;
        let count = records.len();
        *self.records.write().await = records.into();
        Ok(count)
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    pub async fn set_limit(&self, limit: usize) {
        let limit = limit.max(1);
        self.limit.store(limit, Ordering::Relaxed);
        evict_finished(&mut *self.records.write().await, limit);
        if let Err(e) = self.store.trim_executions(limit).await {
            warn!("Failed to trim execution history: {e}");
        }
    }

    /// Record a run that just started. Only finished records are evicted to
    /// make room, so a live record stays addressable until it is finalized.
    pub async fn begin(&self, record: ExecutionRecord) {
        self.persist(&record).await;
        let mut records = self.records.write().await;
        records.push_front(record);
        evict_finished(&mut records, self.limit());
    }

    /// Append live output to a running record. Each stream keeps at most
    /// [`MAX_OUTPUT_CHARS`](cronflow_types::MAX_OUTPUT_CHARS) bytes.
    pub async fn append_output(&self, log_id: &str, chunk: &OutputChunk) {
        let mut records = self.records.write().await;
        if let Some(record) = records
            .iter_mut()
            .find(|r| r.id == log_id && !r.is_finished())
        {
            let out = match chunk.stream {
                OutputStream::Stdout => &mut record.stdout,
                OutputStream::Stderr => &mut record.stderr,
            };
            push_capped(out, &chunk.text);
        }
    }

    /// Attach the outcome of the remediation run for a failed record.
    ///
    /// Remediation is chosen from the final output, so this is the one
    /// annotation made after [`finish`](Self::finish). Only a failed record
    /// without a report accepts it; everything else about the record stays
    /// as finalized. Returns whether the report was attached.
    pub async fn attach_auto_fix(&self, log_id: &str, report: AutoFixReport) -> bool {
        let record = {
            let mut records = self.records.write().await;
            let Some(record) = records.iter_mut().find(|r| {
                r.id == log_id && r.status == RunStatus::Failed && r.auto_fix.is_none()
            }) else {
                return false;
            };
            record.auto_fix = Some(report);
            record.clone()
        };
        self.persist(&record).await;
        true
    }

    /// Finalize a running record exactly once. Returns `None` if the record
    /// is unknown or already final.
    pub async fn finish(&self, log_id: &str, completion: Completion) -> Option<ExecutionRecord> {
        let record = {
            let mut records = self.records.write().await;
            let record = records
                .iter_mut()
                .find(|r| r.id == log_id && !r.is_finished())?;
            let now = Utc::now();
            record.status = completion.status;
            record.exit_code = completion.exit_code;
            record.error = completion.error;
            record.end_time = Some(now);
            record.duration_ms = Some((now - record.start_time).num_milliseconds().max(0) as u64);
            record.clone()
        };

        self.persist(&record).await;
        if let Err(e) = self.store.trim_executions(self.limit()).await {
            warn!("Failed to trim execution history: {e}");
        }
        Some(record)
    }

    async fn persist(&self, record: &ExecutionRecord) {
        if let Err(e) = self.store.save_execution(record).await {
            warn!(job_id = %record.job_id, log_id = %record.id, "Failed to persist execution record: {e}");
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        if let Some(record) = self.records.read().await.iter().find(|r| r.id == id) {
            return Ok(Some(record.clone()));
        }
        Ok(self.store.get_execution(id).await?)
    }

    /// Most recent records, optionally for one job.
    pub async fn list(&self, job_id: Option<&str>, limit: usize) -> Vec<ExecutionRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| job_id.is_none_or(|id| r.job_id == id))
            .take(limit)
            .cloned()
            .collect()
    }
}

fn evict_finished(records: &mut VecDeque<ExecutionRecord>, limit: usize) {
    while records.len() > limit {
        match records.iter().rposition(ExecutionRecord::is_finished) {
            Some(oldest) => {
                records.remove(oldest);
            }
            None => break,
        }
    }
}

/// Timestamp-based record ID, sortable by start time.
pub fn new_record_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp_millis(), &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use cronflow_types::TriggerKind;
    use serde_json::Map;

    fn record(job_id: &str) -> ExecutionRecord {
        ExecutionRecord {
            id: new_record_id(),
            job_id: job_id.into(),
            job_name: job_id.into(),
            trigger: TriggerKind::Manual,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            status: RunStatus::Running,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
            exit_code: None,
            command: "true".into(),
            options: Map::new(),
            retry_attempt: 0,
            chain_depth: 0,
            auto_fix: None,
        }
    }

    fn history(limit: usize) -> ExecutionHistory {
        ExecutionHistory::new(Arc::new(JobStore::open_in_memory().unwrap()), limit)
    }

    #[tokio::test]
    async fn test_live_output_then_finish_once() {
        let history = history(10);
        let rec = record("a");
        let id = rec.id.clone();
        history.begin(rec).await;

        history.append_output(&id, &OutputChunk::stdout("line 1\n")).await;
        history.append_output(&id, &OutputChunk::stderr("warn\n")).await;

        let done = history
            .finish(
                &id,
                Completion {
                    status: RunStatus::Success,
                    exit_code: Some(0),
                    error: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(done.stdout, "line 1\n");
        assert_eq!(done.stderr, "warn\n");
        assert!(done.end_time.is_some());

        // Immutable once final.
        history.append_output(&id, &OutputChunk::stdout("late\n")).await;
        let again = history
            .finish(
                &id,
                Completion {
                    status: RunStatus::Failed,
                    exit_code: Some(1),
                    error: None,
                },
            )
            .await;
        assert!(again.is_none());

        let stored = history.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Success);
        assert_eq!(stored.stdout, "line 1\n");
    }

    #[tokio::test]
    async fn test_output_capped_per_stream() {
        use cronflow_types::{MAX_OUTPUT_CHARS, TRUNCATION_MARKER};

        let history = history(10);
        let rec = record("noisy");
        let id = rec.id.clone();
        history.begin(rec).await;

        let line = format!("{}\n", "y".repeat(1023));
        for _ in 0..300 {
            history.append_output(&id, &OutputChunk::stdout(line.as_str())).await;
        }
        history.append_output(&id, &OutputChunk::stderr("boom\n")).await;

        let live = history.get(&id).await.unwrap().unwrap();
        assert_eq!(live.stdout.len(), MAX_OUTPUT_CHARS + TRUNCATION_MARKER.len());
        assert!(live.stdout.ends_with(TRUNCATION_MARKER));
        assert_eq!(live.stderr, "boom\n");
    }

    #[tokio::test]
    async fn test_auto_fix_report_only_on_failed_record() {
        let history = history(10);
        let rec = record("fixme");
        let id = rec.id.clone();
        history.begin(rec).await;

        let report = AutoFixReport {
            rule_id: "python-module".into(),
            rule_name: "Install missing Python module".into(),
            parameter: Some("requests".into()),
            command: "python3 -m pip install requests".into(),
            success: true,
            output: String::new(),
        };
        assert!(!history.attach_auto_fix(&id, report.clone()).await);

        history
            .finish(
                &id,
                Completion {
                    status: RunStatus::Failed,
                    exit_code: Some(1),
                    error: Some("Exited with code 1".into()),
                },
            )
            .await
            .unwrap();
        assert!(history.attach_auto_fix(&id, report.clone()).await);
        assert!(!history.attach_auto_fix(&id, report).await);

        let stored = history.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.auto_fix.unwrap().parameter.as_deref(), Some("requests"));
    }

    #[tokio::test]
    async fn test_window_is_bounded() {
        let history = history(3);
        for i in 0..5 {
            let mut rec = record(&format!("job-{i}"));
            rec.status = RunStatus::Success;
            history.begin(rec).await;
        }
        let all = history.list(None, 100).await;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].job_id, "job-4");
        assert_eq!(history.list(Some("job-3"), 10).await.len(), 1);
    }

    #[tokio::test]
    async fn test_load_from_store() {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let first = ExecutionHistory::new(Arc::clone(&store), 10);
        first.begin(record("a")).await;

        let second = ExecutionHistory::new(store, 10);
        assert_eq!(second.load().await.unwrap(), 1);
        assert_eq!(second.list(Some("a"), 10).await.len(), 1);
    }
}
