//! Run command - drive the scheduler.

use crate::cli::preflight::{self, Operation};
use crate::cli::Output;
use crate::config::Settings;
use crate::orchestrator::Orchestrator;
use crate::scheduler::RunReport;
use anyhow::Result;
use tokio_util::sync::CancellationToken;

/// Run the scheduler until Ctrl-C, or until idle with `once`.
pub async fn run_scheduler(once: bool, settings: Settings) -> Result<()> {
    preflight::check(Operation::Run, &settings)?;

    let orchestrator = Orchestrator::new(settings)?;
    let scheduler = orchestrator.scheduler();

    let recovered = scheduler.recover().await?;
    if !recovered.is_empty() {
        Output::warning(&format!(
            "Resumed {} task(s) interrupted by a previous run",
            recovered.len()
        ));
    }

    let report = if once {
        Output::info("Processing until the queue is idle...");
        scheduler.run_until_idle().await?
    } else {
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                trigger.cancel();
            }
        });

        Output::info("Scheduler running. Press Ctrl-C to stop.");
        scheduler.run(shutdown).await?
    };

    print_report(&report);
    Ok(())
}

fn print_report(report: &RunReport) {
    Output::header("Run summary");
    Output::kv("Stage attempts", &report.dispatched.to_string());
    Output::kv("Videos completed", &report.completed.to_string());
    Output::kv("Retries scheduled", &report.retried.to_string());
    Output::kv("Failed", &report.failed.to_string());
    if report.interrupted > 0 {
        Output::kv("Interrupted", &report.interrupted.to_string());
    }
    if report.admission_denials > 0 {
        Output::kv("Waits for storage", &report.admission_denials.to_string());
    }

    if report.failed > 0 {
        Output::warning("Some videos failed. See `vidwiki status` for details.");
    } else {
        Output::success("Done.");
    }
}
