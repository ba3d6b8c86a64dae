//! Status, cancel and resubmit commands.

use crate::cli::output::format_age;
use crate::cli::Output;
use crate::config::Settings;
use crate::orchestrator::Orchestrator;
use crate::source::VideoMetadata;
use crate::task::{Stage, TaskStatus};
use anyhow::{anyhow, Result};
use console::style;

/// Show queue overview, or one task's detail.
pub async fn run_status(id: Option<&str>, settings: Settings) -> Result<()> {
    let orchestrator = Orchestrator::new(settings)?;
    match id {
        Some(id) => show_task(&orchestrator, id).await,
        None => show_queue(&orchestrator).await,
    }
}

async fn show_queue(orchestrator: &Orchestrator) -> Result<()> {
    let store = orchestrator.store();
    let stats = store.stats().await?;

    if stats.total == 0 {
        Output::info("Queue is empty. Use 'vidwiki discover' or 'vidwiki enqueue' to add videos.");
        return Ok(());
    }

    Output::header(&format!("Tasks ({})", stats.total));
    for status in TaskStatus::ALL {
        let count = stats.count(status);
        if count > 0 {
            Output::kv(status.as_str(), &count.to_string());
        }
    }

    if !stats.by_stage.is_empty() {
        Output::header("Unfinished by stage");
        for stage in Stage::ALL {
            if let Some(count) = stats.by_stage.get(&stage) {
                Output::kv(stage.as_str(), &count.to_string());
            }
        }
    }

    let mut active = Vec::new();
    for status in [TaskStatus::Running, TaskStatus::Pending, TaskStatus::Failed] {
        active.extend(store.list(Some(status)).await?);
    }
    if !active.is_empty() {
        Output::header("Active and failed");
        for task in active.iter().take(50) {
            Output::task_row(task);
        }
        if active.len() > 50 {
            println!("  {}", style(format!("... and {} more", active.len() - 50)).dim());
        }
    }
    Ok(())
}

async fn show_task(orchestrator: &Orchestrator, id: &str) -> Result<()> {
    let store = orchestrator.store();
    let task = store
        .get(id)
        .await?
        .ok_or_else(|| anyhow!("No task for video {}", id))?;

    Output::header(&task.metadata.title);
    Output::kv("Video", &task.id);
    Output::kv("Source", &task.metadata.source_url);
    if let Some(duration) = task.metadata.duration_seconds {
        Output::kv("Duration", &VideoMetadata::format_timestamp(f64::from(duration)));
    }
    Output::kv("Stage", task.stage.as_str());
    Output::kv("Status", task.status.as_str());
    Output::kv("Priority", &task.priority.to_string());
    Output::kv("Retries", &task.retry_count.to_string());
    Output::kv("Updated", &format_age(task.last_update));
    if let Some(until) = task.not_before {
        Output::kv("Next attempt", &until.format("%Y-%m-%d %H:%M:%S UTC").to_string());
    }
    if let Some(error) = &task.error_message {
        Output::kv("Error", error);
    }
    for dep in &task.dependencies {
        Output::kv("Depends on", &format!("{} past {}", dep.video_id, dep.stage));
    }

    let history = store.history(id).await?;
    if !history.is_empty() {
        Output::header("History");
        for event in history {
            let error = event.error.map(|e| format!(" - {}", e)).unwrap_or_default();
            println!(
                "  {} {:<16} {:<15}{}",
                style(event.recorded_at.format("%Y-%m-%d %H:%M:%S")).dim(),
                event.stage.as_str(),
                event.kind.as_str(),
                error
            );
        }
    }
    Ok(())
}

/// Cancel a task. A running scheduler observes the cancel on its next pass
/// and releases the task's files.
pub async fn run_cancel(id: &str, settings: Settings) -> Result<()> {
    let orchestrator = Orchestrator::new(settings)?;
    orchestrator.request_cancel(id).await?;
    Output::success(&format!("Cancelled {}", id));
    Ok(())
}

/// Resubmit a failed or cancelled task.
pub async fn run_resubmit(id: &str, settings: Settings) -> Result<()> {
    let orchestrator = Orchestrator::new(settings)?;
    orchestrator.scheduler().resubmit(id).await?;
    Output::success(&format!("Resubmitted {}", id));
    Ok(())
}
