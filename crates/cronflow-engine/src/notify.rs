//! Run notifications.

use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;

use cronflow_types::{ExecutionRecord, RunStatus};

/// Lines of output kept in a message.
const OUTPUT_TAIL_LINES: usize = 15;

/// What a notifier is told about a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationRequest {
    pub job_id: String,
    pub job_name: String,
    pub status: RunStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub log_id: String,
}

impl NotificationRequest {
    pub fn from_record(record: &ExecutionRecord) -> Self {
        let non_empty = |s: &str| (!s.trim().is_empty()).then(|| s.to_string());
        Self {
            job_id: record.job_id.clone(),
            job_name: record.job_name.clone(),
            status: record.status,
            duration_ms: record.duration_ms.unwrap_or_default(),
            stdout: non_empty(&record.stdout),
            stderr: non_empty(&record.stderr),
            error: record.error.clone(),
            log_id: record.id.clone(),
        }
    }
}

/// Delivers run notifications. Failures are reported, never retried.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, request: &NotificationRequest) -> anyhow::Result<()>;
}

/// Discards every notification.
#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _request: &NotificationRequest) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Posts `{"text": ...}` to an incoming-webhook URL.
pub struct WebhookNotifier {
    client: Client,
    url: String,
    dashboard_url: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, dashboard_url: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
            dashboard_url,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, request: &NotificationRequest) -> anyhow::Result<()> {
        let text = format_message(request, self.dashboard_url.as_deref());
        let resp = self
            .client
            .post(&self.url)
            .json(&json!({ "text": text }))
            .send()
            .await
            .context("notification request failed")?;
        if !resp.status().is_success() {
            bail!("notification webhook returned {}", resp.status());
        }
        Ok(())
    }
}

/// Render a plain-text message for a finished run.
pub fn format_message(request: &NotificationRequest, dashboard_url: Option<&str>) -> String {
    let (icon, verb) = match request.status {
        RunStatus::Success => ("✅", "succeeded"),
        RunStatus::Failed => ("❌", "failed"),
        RunStatus::Running => ("⏳", "is running"),
    };
    let mut text = format!(
        "{icon} {} {verb} in {}",
        request.job_name,
        format_duration(request.duration_ms)
    );

    if let Some(error) = &request.error {
        text.push_str(&format!("\nError: {error}"));
    }
    let output = match request.status {
        RunStatus::Failed => request.stderr.as_deref().or(request.stdout.as_deref()),
        _ => request.stdout.as_deref(),
    };
    if let Some(output) = output {
        text.push_str(&format!("\n```\n{}\n```", tail(output, OUTPUT_TAIL_LINES)));
    }
    if let Some(base) = dashboard_url {
        text.push_str(&format!(
            "\n{}/history/{}",
            base.trim_end_matches('/'),
            request.log_id
        ));
    }
    text
}

fn format_duration(ms: u64) -> String {
    match ms {
        0..1_000 => format!("{ms}ms"),
        1_000..60_000 => format!("{:.1}s", ms as f64 / 1000.0),
        _ => format!("{}m {}s", ms / 60_000, (ms % 60_000) / 1000),
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(status: RunStatus) -> NotificationRequest {
        NotificationRequest {
            job_id: "backup".into(),
            job_name: "Nightly backup".into(),
            status,
            duration_ms: 2_500,
            stdout: Some("copied 3 files\n".into()),
            stderr: None,
            error: None,
            log_id: "1700000000000-abcd1234".into(),
        }
    }

    #[test]
    fn test_success_message() {
        let text = format_message(&request(RunStatus::Success), Some("http://localhost:3030/"));
        assert!(text.starts_with("✅ Nightly backup succeeded in 2.5s"));
        assert!(text.contains("copied 3 files"));
        assert!(text.ends_with("http://localhost:3030/history/1700000000000-abcd1234"));
    }

    #[test]
    fn test_failure_prefers_stderr() {
        let mut req = request(RunStatus::Failed);
        req.stderr = Some("boom\n".into());
        req.error = Some("Exited with code 1".into());
        let text = format_message(&req, None);
        assert!(text.contains("failed"));
        assert!(text.contains("Error: Exited with code 1"));
        assert!(text.contains("boom"));
        assert!(!text.contains("copied"));
    }

    #[test]
    fn test_tail_and_duration() {
        let long: String = (0..40).map(|i| format!("line {i}\n")).collect();
        let t = tail(&long, 3);
        assert_eq!(t, "line 37\nline 38\nline 39");
        assert_eq!(format_duration(250), "250ms");
        assert_eq!(format_duration(125_000), "2m 5s");
    }
}
