//! Storage command - ledger usage and manual sweeps.

use crate::cli::output::{format_age, format_size};
use crate::cli::Output;
use crate::config::Settings;
use crate::orchestrator::Orchestrator;
use crate::storage::{SweepReport, Tier};
use anyhow::Result;
use console::style;

/// Show storage usage, optionally running a sweep first.
pub async fn run_storage(sweep: bool, settings: Settings) -> Result<()> {
    let orchestrator = Orchestrator::new(settings)?;
    let ledger = orchestrator.ledger();

    if sweep {
        let report = ledger.sweep()?;
        print_sweep(&report);
    }

    let stats = ledger.stats()?;
    Output::header("Storage");
    Output::kv(
        "Budget",
        &format!(
            "{} of {} ({:.0}%)",
            format_size(stats.hot_bytes + stats.warm_bytes + stats.reserved_bytes),
            format_size(stats.budget_bytes),
            stats.usage_ratio() * 100.0
        ),
    );
    Output::kv("Hot", &format_size(stats.hot_bytes));
    Output::kv("Warm", &format_size(stats.warm_bytes));
    Output::kv("Cold", &format_size(stats.cold_bytes));
    Output::kv("Reserved", &format_size(stats.reserved_bytes));
    Output::kv("Artifacts", &format!("{} ({} pinned)", stats.entries, stats.pinned));

    let mut entries = ledger.entries()?;
    if entries.is_empty() {
        return Ok(());
    }
    entries.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes));

    Output::header("Largest artifacts");
    for entry in entries.iter().take(20) {
        let label = format!("{:<4}", entry.tier.as_str());
        let tier = match entry.tier {
            Tier::Hot => style(label).red(),
            Tier::Warm => style(label).yellow(),
            Tier::Cold => style(label).cyan(),
        };
        println!(
            "  {} {:>10}  {:<10} {:<14} {}{}",
            tier,
            format_size(entry.size_bytes),
            entry.artifact_type.as_str(),
            entry.video_id,
            style(format_age(entry.last_access)).dim(),
            if entry.pinned { " [pinned]" } else { "" }
        );
    }
    Ok(())
}

fn print_sweep(report: &SweepReport) {
    if report.is_empty() {
        Output::info("Sweep found nothing to move or delete.");
        return;
    }
    Output::success(&format!(
        "Sweep freed {}: {} warmed, {} cooled, {} deleted",
        format_size(report.freed_bytes),
        report.warmed.len(),
        report.cooled.len(),
        report.deleted.len()
    ));
}
