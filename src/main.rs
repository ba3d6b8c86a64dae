//! vidwiki CLI entry point.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vidwiki::cli::{commands, Cli, Commands};
use vidwiki::config::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_ref().map(PathBuf::from);

    let settings = Settings::load_from(config_path.as_ref())?;

    // -v flags win over general.log_level
    let log_level = match cli.verbose {
        0 => settings.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| format!("vidwiki={}", log_level)),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    std::fs::create_dir_all(settings.data_dir())?;

    match &cli.command {
        Commands::Run { once } => {
            commands::run_scheduler(*once, settings).await?;
        }

        Commands::Discover { channel, limit, priority } => {
            commands::run_discover(channel.clone(), *limit, *priority, settings).await?;
        }

        Commands::Enqueue { video, priority, force } => {
            commands::run_enqueue(video, *priority, *force, settings).await?;
        }

        Commands::Status { id } => {
            commands::run_status(id.as_deref(), settings).await?;
        }

        Commands::Cancel { id } => {
            commands::run_cancel(id, settings).await?;
        }

        Commands::Resubmit { id } => {
            commands::run_resubmit(id, settings).await?;
        }

        Commands::Storage { sweep } => {
            commands::run_storage(*sweep, settings).await?;
        }

        Commands::Doctor => {
            commands::run_doctor(&settings)?;
        }

        Commands::Config { action } => {
            commands::run_config(action, config_path.as_ref(), settings)?;
        }
    }

    Ok(())
}
