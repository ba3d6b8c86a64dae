//! vidwiki - video catalog to knowledge base
//!
//! Turns a creator's video catalog into Markdown documents in a knowledge
//! base. Each video moves through a fixed pipeline of stages:
//!
//! ```text
//! Discovered -> Downloading -> ExtractingAudio -> Transcribing
//!            -> Generating -> Cleanup -> Completed
//! ```
//!
//! # Architecture
//!
//! - `task` - Video tasks, their lifecycle, and durable task stores
//! - `scheduler` - Priority dispatch with per-stage worker pools, retries and cancellation
//! - `storage` - Disk budget ledger with hot/warm/cold tiers and retention sweeps
//! - `retry` - Retry classification and exponential backoff
//! - `filter` - Video selection by date, duration, popularity, keywords and tags
//! - `source` - Video catalogs (yt-dlp)
//! - `pipeline` - Stage collaborators: download, audio extraction, transcription,
//!   Markdown rendering and knowledge-base upload
//! - `orchestrator` - Wires settings, store, ledger and collaborators together
//! - `config` - Configuration management
//!
//! # Example
//!
//! ```rust,no_run
//! use vidwiki::config::Settings;
//! use vidwiki::orchestrator::Orchestrator;
//! use vidwiki::task::Priority;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load()?;
//!     let orchestrator = Orchestrator::new(settings)?;
//!
//!     orchestrator.enqueue_video("dQw4w9WgXcQ", Priority::High, false).await?;
//!     let report = orchestrator.scheduler().run_until_idle().await?;
//!     println!("Completed {} video(s)", report.completed);
//!
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod filter;
pub mod openai;
pub mod orchestrator;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod source;
pub mod storage;
pub mod task;

pub use error::{Result, VidwikiError};
