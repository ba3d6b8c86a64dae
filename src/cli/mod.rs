//! CLI module for vidwiki.

pub mod commands;
mod output;
pub mod preflight;

pub use output::Output;

use crate::task::Priority;
use clap::{Parser, Subcommand};

/// vidwiki - turn a video catalog into knowledge-base documents
///
/// Discovers a creator's videos, downloads and transcribes them under a
/// storage budget, and publishes one Markdown document per video.
#[derive(Parser, Debug)]
#[command(name = "vidwiki")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the scheduler until interrupted
    Run {
        /// Stop once nothing is left to do instead of waiting for new work
        #[arg(long)]
        once: bool,
    },

    /// List a channel and enqueue the videos that pass the filter
    Discover {
        /// Channel or playlist URL (defaults to source.channel)
        channel: Option<String>,

        /// Maximum number of videos to list
        #[arg(short, long)]
        limit: Option<usize>,

        /// Priority for the new tasks
        #[arg(short, long, value_enum, default_value_t = Priority::Normal)]
        priority: Priority,
    },

    /// Enqueue a single video by URL or id
    Enqueue {
        /// Video URL or id
        video: String,

        /// Priority for the task
        #[arg(short, long, value_enum, default_value_t = Priority::Normal)]
        priority: Priority,

        /// Enqueue even if the filter rejects the video
        #[arg(short, long)]
        force: bool,
    },

    /// Show queue status, or one task with its history
    Status {
        /// Video id
        id: Option<String>,
    },

    /// Cancel a pending or running task
    Cancel {
        /// Video id
        id: String,
    },

    /// Put a failed or cancelled task back in the queue
    Resubmit {
        /// Video id
        id: String,
    },

    /// Show storage usage by tier
    Storage {
        /// Run a sweep before reporting
        #[arg(long)]
        sweep: bool,
    },

    /// Check system requirements and configuration
    Doctor,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Write the default configuration file if none exists
    Init,

    /// Show configuration file path
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_enqueue_with_priority() {
        let cli = Cli::try_parse_from([
            "vidwiki",
            "-vv",
            "enqueue",
            "BV1xx411c7mD",
            "--priority",
            "high",
            "--force",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Enqueue { video, priority, force } => {
                assert_eq!(video, "BV1xx411c7mD");
                assert_eq!(priority, Priority::High);
                assert!(force);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_run_once() {
        let cli = Cli::try_parse_from(["vidwiki", "run", "--once"]).unwrap();
        assert!(matches!(cli.command, Commands::Run { once: true }));
    }
}
