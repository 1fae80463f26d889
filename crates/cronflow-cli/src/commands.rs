//! One-shot subcommands that work against the local database.

use anyhow::Context;
use chrono::Local;
use serde_json::{Map, Value};

use cronflow_config::load_config;
use cronflow_engine::{RunRequest, schedule};
use cronflow_events::BusEvent;
use cronflow_events::events::{JOB_COMPLETED, JOB_OUTPUT, JOB_STARTED};
use cronflow_gateway::GatewayState;
use cronflow_types::RunStatus;

/// Number of upcoming fire times shown by `check-cron`.
const PREVIEW_RUNS: usize = 5;

/// Parse a `name=value` option override.
pub fn parse_override(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected name=value, got '{raw}'")),
    }
}

async fn open_state() -> anyhow::Result<GatewayState> {
    let config = load_config().context("failed to load config")?;
    GatewayState::from_config(&config).await
}

/// Run `job_id` to completion, streaming its output. Downstream chained jobs
/// are started but not awaited.
pub async fn run_job(job_id: &str, options: Vec<(String, String)>) -> anyhow::Result<bool> {
    let state = open_state().await?;
    let overrides: Map<String, Value> = options
        .into_iter()
        .map(|(name, value)| (name, Value::String(value)))
        .collect();

    let mut subscription = state.events.subscribe().await;
    let run = state
        .engine
        .run_job(job_id, RunRequest::manual().with_overrides(overrides));
    tokio::pin!(run);

    let summary = loop {
        tokio::select! {
            summary = &mut run => break summary?,
            Some(event) = subscription.receiver.recv() => print_event(job_id, &event),
        }
    };
    while let Ok(event) = subscription.receiver.try_recv() {
        print_event(job_id, &event);
    }

    println!(
        "{} {} after {} invocation(s){} [log {}]",
        summary.job_id,
        summary.status.as_str(),
        summary.invocations,
        if summary.auto_fixed { ", auto-fixed" } else { "" },
        summary.log_id,
    );
    Ok(summary.status == RunStatus::Success)
}

fn print_event(job_id: &str, event: &BusEvent) {
    if event.payload["job_id"].as_str() != Some(job_id) {
        return;
    }
    match event.event.as_str() {
        JOB_STARTED => {
            let trigger = event.payload["trigger"].as_str().unwrap_or("manual");
            println!("--- started ({trigger})");
        }
        JOB_OUTPUT => {
            let data = event.payload["data"].as_str().unwrap_or_default();
            if event.payload["stream"] == "stderr" {
                eprint!("{data}");
            } else {
                print!("{data}");
            }
        }
        JOB_COMPLETED => {
            let status = event.payload["status"].as_str().unwrap_or("unknown");
            println!("--- {status}");
        }
        _ => {}
    }
}

pub async fn list_jobs() -> anyhow::Result<()> {
    let state = open_state().await?;
    let jobs = state.engine.list_jobs().await?;
    if jobs.is_empty() {
        println!("No jobs configured");
        return Ok(());
    }

    let now = Local::now();
    for job in jobs {
        let next = if job.enabled && job.has_schedule() {
            schedule::next_after(&job.schedule, &now)
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|e| format!("invalid ({e})"))
        } else {
            "-".to_string()
        };
        println!(
            "{:<24} {:<8} {:<16} next: {:<18} {}",
            job.id,
            if job.enabled { "enabled" } else { "disabled" },
            if job.has_schedule() { job.schedule.as_str() } else { "manual" },
            next,
            job.command,
        );
    }
    Ok(())
}

pub async fn history(job_id: Option<&str>, limit: usize) -> anyhow::Result<()> {
    let state = open_state().await?;
    let records = state.engine.list_executions(job_id, limit).await;
    if records.is_empty() {
        println!("No executions recorded");
        return Ok(());
    }

    for record in records {
        let duration = record
            .duration_ms
            .map(|ms| format!("{:.1}s", ms as f64 / 1000.0))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:<20} {:<8} {:<10} {} {:>8}",
            record.id,
            record.job_id,
            record.status.as_str(),
            record.trigger.to_string(),
            record.start_time.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
            duration,
        );
    }
    Ok(())
}

pub fn check_cron(expression: &str) -> anyhow::Result<()> {
    schedule::validate(expression)?;
    println!("'{expression}' is valid. Next runs:");

    let mut after = Local::now();
    for _ in 0..PREVIEW_RUNS {
        after = schedule::next_after(expression, &after)?;
        println!("  {}", after.format("%a %Y-%m-%d %H:%M"));
    }
    Ok(())
}
