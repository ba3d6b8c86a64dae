//! Discover and enqueue commands.

use crate::cli::preflight::{self, Operation};
use crate::cli::Output;
use crate::config::Settings;
use crate::orchestrator::{EnqueueResult, Orchestrator};
use crate::task::Priority;
use anyhow::{anyhow, Result};

/// List a channel and enqueue what passes the filter.
pub async fn run_discover(
    channel: Option<String>,
    limit: Option<usize>,
    priority: Priority,
    settings: Settings,
) -> Result<()> {
    preflight::check(Operation::Discover, &settings)?;

    let channel = channel
        .or_else(|| settings.source.channel.clone())
        .ok_or_else(|| anyhow!("No channel given and source.channel is not configured"))?;

    let orchestrator = Orchestrator::new(settings)?;
    let spinner = Output::spinner(&format!("Listing {}", channel));
    let result = orchestrator.discover(&channel, limit, priority).await;
    spinner.finish_and_clear();
    let result = result?;

    Output::header(&format!("Discovered {} video(s)", result.listed));
    Output::kv("Enqueued", &result.enqueued.len().to_string());
    Output::kv("Already known", &result.already_known.to_string());
    Output::kv("Rejected by filter", &result.rejected.to_string());
    for id in &result.enqueued {
        println!("  + {}", id);
    }
    Ok(())
}

/// Enqueue one video.
pub async fn run_enqueue(
    video: &str,
    priority: Priority,
    force: bool,
    settings: Settings,
) -> Result<()> {
    preflight::check(Operation::Discover, &settings)?;

    let orchestrator = Orchestrator::new(settings)?;
    match orchestrator.enqueue_video(video, priority, force).await? {
        EnqueueResult::Enqueued(id) => {
            Output::success(&format!("Enqueued {} ({} priority)", id, priority))
        }
        EnqueueResult::AlreadyKnown(id) => Output::info(&format!("{} is already queued", id)),
        EnqueueResult::Rejected { id, reason } => {
            Output::warning(&format!("{} rejected by filter: {}", id, reason));
            Output::info("Use --force to enqueue it anyway.");
        }
    }
    Ok(())
}
