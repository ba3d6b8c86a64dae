//! Video source abstraction for vidwiki.
//!
//! A source lists a creator's catalog and resolves single videos to metadata.
//! Discovery feeds its results through the video filter into the scheduler.

mod youtube;

pub use youtube::YoutubeSource;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata about a video as reported by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    /// Unique platform identifier.
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Duration in seconds (if known).
    pub duration_seconds: Option<u32>,
    pub view_count: Option<u64>,
    pub like_count: Option<u64>,
    /// Publication time (if known).
    pub published_at: Option<DateTime<Utc>>,
    /// Channel or uploader name.
    pub channel: Option<String>,
    /// URL the downloader fetches from.
    pub source_url: String,
}

impl VideoMetadata {
    /// Minimal metadata for a video known only by id and URL.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        source_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            tags: Vec::new(),
            duration_seconds: None,
            view_count: None,
            like_count: None,
            published_at: None,
            channel: None,
            source_url: source_url.into(),
        }
    }

    /// Title and description joined, as searched by keyword criteria.
    pub fn searchable_text(&self) -> String {
        match &self.description {
            Some(description) => format!("{} {}", self.title, description),
            None => self.title.clone(),
        }
    }

    /// Format seconds as MM:SS or HH:MM:SS.
    pub fn format_timestamp(seconds: f64) -> String {
        let total_seconds = seconds as u32;
        let hours = total_seconds / 3600;
        let minutes = (total_seconds % 3600) / 60;
        let secs = total_seconds % 60;

        if hours > 0 {
            format!("{:02}:{:02}:{:02}", hours, minutes, secs)
        } else {
            format!("{:02}:{:02}", minutes, secs)
        }
    }
}

/// Trait for video catalog providers.
#[async_trait]
pub trait VideoSource: Send + Sync {
    /// Fetch full metadata for a single video (id or URL).
    async fn fetch_video(&self, input: &str) -> Result<VideoMetadata>;

    /// List videos of a channel or playlist, newest first.
    async fn list_videos(&self, channel: &str, limit: Option<usize>) -> Result<Vec<VideoMetadata>>;
}
