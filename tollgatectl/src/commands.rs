use std::sync::Arc;

use anyhow::{Context, bail};
use serde::Serialize;
use serde_json::{Map, Value};
use tollgate_config::{ConfigWarnings, TollgateConfig};
use tollgate_core::{EnqueueRequest, LeaseReaper};
use tollgate_model::{Task, TaskPayload};
use tracing::info;

use crate::cli::{Command, EnqueueArgs, LimitCommand};
use crate::runtime::Runtime;

pub async fn dispatch(runtime: &Runtime, command: Command, json: bool) -> anyhow::Result<()> {
    match command {
        Command::Stats => stats(runtime, json).await,
        Command::Pending { limit } => pending(runtime, limit, json).await,
        Command::Failed { limit } => failed(runtime, limit, json).await,
        Command::Enqueue(args) => enqueue(runtime, args, json).await,
        Command::Reap { watch, interval } => {
            if watch {
                reap_watch(runtime, interval).await
            } else {
                reap_once(runtime, json).await
            }
        }
        Command::Workers => workers(runtime, json).await,
        Command::Limit(command) => limit(runtime, command, json).await,
        // Handled before a store is connected.
        Command::Config(_) => Ok(()),
    }
}

async fn stats(runtime: &Runtime, json: bool) -> anyhow::Result<()> {
    let stats = runtime
        .queue
        .stats()
        .await
        .context("failed to read queue stats")?;
    if json {
        return print_json(&stats);
    }
    println!("queue:      {}", runtime.queue.name());
    println!("pending:    {}", stats.pending);
    println!("processing: {}", stats.processing);
    println!("failed:     {}", stats.failed);
    Ok(())
}

async fn pending(runtime: &Runtime, limit: usize, json: bool) -> anyhow::Result<()> {
    let mut tasks = runtime
        .queue
        .pending_tasks()
        .await
        .context("failed to list pending tasks")?;
    tasks.truncate(limit);
    if json {
        return print_json(&tasks);
    }
    if tasks.is_empty() {
        println!("no pending tasks on '{}'", runtime.queue.name());
        return Ok(());
    }
    for task in &tasks {
        println!(
            "{}  {:<20} priority={:<5} attempts={}/{}  created={}",
            task.id,
            task.task_type(),
            task.priority,
            task.attempts,
            task.max_attempts,
            task.created_at.to_rfc3339(),
        );
    }
    Ok(())
}

async fn failed(runtime: &Runtime, limit: usize, json: bool) -> anyhow::Result<()> {
    let mut tasks = runtime
        .queue
        .failed_tasks()
        .await
        .context("failed to list failed tasks")?;
    tasks.truncate(limit);
    if json {
        return print_json(&tasks);
    }
    if tasks.is_empty() {
        println!("no failed tasks on '{}'", runtime.queue.name());
        return Ok(());
    }
    for task in &tasks {
        print_failed(task);
    }
    Ok(())
}

fn print_failed(task: &Task) {
    let failed_at = task
        .failed_at
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{}  {:<20} attempts={}/{}  failed={}",
        task.id,
        task.task_type(),
        task.attempts,
        task.max_attempts,
        failed_at,
    );
    if let Some(error) = &task.last_error {
        println!("    {error}");
    }
}

async fn enqueue(runtime: &Runtime, args: EnqueueArgs, json: bool) -> anyhow::Result<()> {
    let mut payload = TaskPayload::new(args.task_type);
    if let Some(raw) = &args.data {
        let data: Map<String, Value> =
            serde_json::from_str(raw).context("--data must be a JSON object")?;
        for (key, value) in data {
            if key == "type" {
                bail!("--data may not override the task type");
            }
            payload = payload.with(key, value);
        }
    }

    let mut request = EnqueueRequest::new(payload).priority(args.priority);
    if let Some(max_attempts) = args.max_attempts {
        if max_attempts == 0 {
            bail!("--max-attempts must be at least 1");
        }
        request = request.max_attempts(max_attempts);
    }

    let id = runtime
        .queue
        .enqueue_request(request)
        .await
        .context("failed to enqueue task")?;
    if json {
        return print_json(&serde_json::json!({ "id": id }));
    }
    println!("{id}");
    Ok(())
}

async fn reap_once(runtime: &Runtime, json: bool) -> anyhow::Result<()> {
    let report = runtime
        .queue
        .reap_expired()
        .await
        .context("failed to reap expired leases")?;
    if json {
        return print_json(&report);
    }
    println!(
        "requeued={} failed={} stale={}",
        report.requeued, report.failed, report.stale
    );
    Ok(())
}

async fn reap_watch(
    runtime: &Runtime,
    interval: Option<std::time::Duration>,
) -> anyhow::Result<()> {
    let interval = interval.unwrap_or(runtime.config.reaper.interval);
    if interval.is_zero() {
        bail!("--interval must be greater than zero");
    }
    let reaper = Arc::new(LeaseReaper::new(Arc::clone(&runtime.queue), interval));
    let handle = reaper.handle();

    let task = tokio::spawn({
        let reaper = Arc::clone(&reaper);
        async move { reaper.run().await }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("interrupt received; stopping reaper");
    handle.stop();
    task.await.context("reaper task panicked")?;
    Ok(())
}

async fn workers(runtime: &Runtime, json: bool) -> anyhow::Result<()> {
    let beats = runtime
        .queue
        .active_workers()
        .await
        .context("failed to list workers")?;
    if json {
        return print_json(&beats);
    }
    if beats.is_empty() {
        println!("no live workers on '{}'", runtime.queue.name());
        return Ok(());
    }
    for beat in &beats {
        println!(
            "{}  started={}  last_seen={}  completed={} failed={}",
            beat.worker_id,
            beat.started_at.to_rfc3339(),
            beat.last_seen.to_rfc3339(),
            beat.completed,
            beat.failed,
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct LimitStatus<'a> {
    limiter: &'a str,
    identifier: &'a str,
    rate: u32,
    window: String,
    remaining: u32,
    reset_at: Option<String>,
}

async fn limit(runtime: &Runtime, command: LimitCommand, json: bool) -> anyhow::Result<()> {
    match command {
        LimitCommand::List => {
            let rows: Vec<_> = runtime
                .limiters
                .names()
                .into_iter()
                .filter_map(|name| runtime.limiters.get(name))
                .map(|limiter| {
                    let rule = limiter.rule();
                    serde_json::json!({
                        "name": rule.name(),
                        "rate": rule.rate,
                        "per": humantime::format_duration(rule.per).to_string(),
                        "degraded": rule.degraded.as_str(),
                    })
                })
                .collect();
            if json {
                return print_json(&rows);
            }
            for row in &rows {
                println!(
                    "{:<16} {} per {} (degraded: {})",
                    row["name"].as_str().unwrap_or_default(),
                    row["rate"],
                    row["per"].as_str().unwrap_or_default(),
                    row["degraded"].as_str().unwrap_or_default(),
                );
            }
            Ok(())
        }
        LimitCommand::Status {
            limiter,
            identifier,
        } => {
            let limiter = runtime.limiter(&limiter)?;
            let rule = limiter.rule();
            let status = LimitStatus {
                limiter: rule.name(),
                identifier: &identifier,
                rate: rule.rate,
                window: humantime::format_duration(rule.per).to_string(),
                remaining: limiter.remaining(&identifier).await,
                reset_at: limiter
                    .reset_time(&identifier)
                    .await
                    .map(|at| at.to_rfc3339()),
            };
            if json {
                return print_json(&status);
            }
            println!(
                "{}/{}: {} of {} remaining per {}",
                status.limiter, status.identifier, status.remaining, status.rate, status.window
            );
            if let Some(reset_at) = &status.reset_at {
                println!("window frees a slot at {reset_at}");
            }
            Ok(())
        }
        LimitCommand::Reset {
            limiter,
            identifier,
        } => {
            let removed = runtime
                .limiter(&limiter)?
                .reset(&identifier)
                .await
                .context("failed to reset rate limit window")?;
            if json {
                return print_json(&serde_json::json!({ "reset": removed }));
            }
            if removed {
                println!("reset {limiter}/{identifier}");
            } else {
                println!("{limiter}/{identifier} had no recorded requests");
            }
            Ok(())
        }
        LimitCommand::ResetAll { limiter } => {
            let removed = runtime
                .limiter(&limiter)?
                .reset_all()
                .await
                .context("failed to reset rate limit windows")?;
            if json {
                return print_json(&serde_json::json!({ "windows": removed }));
            }
            println!("cleared {removed} windows for {limiter}");
            Ok(())
        }
    }
}

pub fn config_show(config: &TollgateConfig) -> anyhow::Result<()> {
    let rendered = config.to_toml().context("failed to render configuration")?;
    print!("{rendered}");
    Ok(())
}

pub fn config_check(
    config: &TollgateConfig,
    warnings: &ConfigWarnings,
    json: bool,
) -> anyhow::Result<()> {
    if json {
        let items: Vec<String> = warnings.iter().map(ToString::to_string).collect();
        return print_json(&serde_json::json!({
            "valid": true,
            "config_path": config.metadata.config_path,
            "warnings": items,
        }));
    }
    match &config.metadata.config_path {
        Some(path) => println!("configuration OK ({})", path.display()),
        None => println!("configuration OK (defaults and environment)"),
    }
    for warning in warnings.iter() {
        println!("warning: {warning}");
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to encode JSON")?;
    println!("{rendered}");
    Ok(())
}
