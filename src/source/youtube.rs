//! yt-dlp backed video source.
//!
//! yt-dlp understands both YouTube and Bilibili URLs, so a single source
//! covers the platforms vidwiki is pointed at.

use super::{VideoMetadata, VideoSource};
use crate::error::{Result, VidwikiError};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use tracing::{debug, instrument, warn};

/// Video source that shells out to yt-dlp.
pub struct YoutubeSource {
    yt_dlp: String,
    video_id_regex: Regex,
}

impl YoutubeSource {
    pub fn new(yt_dlp: impl Into<String>) -> Self {
        // Matches YouTube URL formats, bare YouTube ids and Bilibili BV ids
        let video_id_regex = Regex::new(
            r"(?x)
            (?:
                (?:https?://)?
                (?:www\.)?
                (?:youtube\.com/watch\?v=|youtu\.be/|youtube\.com/embed/|youtube\.com/v/)
                ([a-zA-Z0-9_-]{11})
            )
            |
            ^([a-zA-Z0-9_-]{11})$
            |
            (BV[a-zA-Z0-9]{10})
        ",
        )
        .expect("Invalid regex");

        Self {
            yt_dlp: yt_dlp.into(),
            video_id_regex,
        }
    }

    /// Extract a video ID from a URL or bare ID.
    pub fn extract_video_id(&self, input: &str) -> Option<String> {
        let caps = self.video_id_regex.captures(input.trim())?;
        caps.get(1)
            .or_else(|| caps.get(2))
            .or_else(|| caps.get(3))
            .map(|m| m.as_str().to_string())
    }

    /// Canonical watch URL for a bare id; URLs pass through unchanged.
    fn watch_url(&self, input: &str) -> String {
        let input = input.trim();
        if input.contains("://") {
            return input.to_string();
        }
        if input.starts_with("BV") {
            format!("https://www.bilibili.com/video/{}", input)
        } else {
            format!("https://www.youtube.com/watch?v={}", input)
        }
    }

    async fn run_yt_dlp(&self, args: &[&str]) -> Result<String> {
        let output = tokio::process::Command::new(&self.yt_dlp)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    VidwikiError::ToolNotFound(self.yt_dlp.clone())
                } else {
                    VidwikiError::VideoSource(format!("Failed to run yt-dlp: {}", e))
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VidwikiError::VideoNotFound(stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for YoutubeSource {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

/// Convert one yt-dlp JSON document into metadata.
pub(crate) fn parse_video_json(json: &serde_json::Value) -> Option<VideoMetadata> {
    let id = json["id"].as_str()?.to_string();

    let title = json["title"].as_str().unwrap_or("Unknown Title").to_string();

    let description = json["description"]
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string());

    let tags = json["tags"]
        .as_array()
        .map(|tags| {
            tags.iter()
                .filter_map(|t| t.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    // Bilibili reports publication as a unix timestamp, YouTube as YYYYMMDD
    let published_at = json["timestamp"]
        .as_i64()
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
        .or_else(|| {
            json["upload_date"].as_str().and_then(|date_str| {
                NaiveDate::parse_from_str(date_str, "%Y%m%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|dt| dt.and_utc())
            })
        });

    let source_url = json["webpage_url"]
        .as_str()
        .or_else(|| json["url"].as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={}", id));

    Some(VideoMetadata {
        id,
        title,
        description,
        tags,
        duration_seconds: json["duration"].as_f64().map(|d| d as u32),
        view_count: json["view_count"].as_u64(),
        like_count: json["like_count"].as_u64(),
        published_at,
        channel: json["channel"]
            .as_str()
            .or_else(|| json["uploader"].as_str())
            .map(|s| s.to_string()),
        source_url,
    })
}

#[async_trait]
impl VideoSource for YoutubeSource {
    #[instrument(skip(self))]
    async fn fetch_video(&self, input: &str) -> Result<VideoMetadata> {
        if self.extract_video_id(input).is_none() && !input.contains("://") {
            return Err(VidwikiError::InvalidInput(format!(
                "Not a video ID or URL: {}",
                input
            )));
        }

        let url = self.watch_url(input);
        let stdout = self
            .run_yt_dlp(&["--dump-json", "--no-download", "--no-warnings", "--no-playlist", &url])
            .await?;

        let json: serde_json::Value = serde_json::from_str(stdout.trim()).map_err(|e| {
            VidwikiError::VideoSource(format!("Failed to parse yt-dlp output: {}", e))
        })?;

        parse_video_json(&json).ok_or_else(|| {
            VidwikiError::VideoSource(format!("yt-dlp returned no id for {}", url))
        })
    }

    #[instrument(skip(self))]
    async fn list_videos(&self, channel: &str, limit: Option<usize>) -> Result<Vec<VideoMetadata>> {
        let limit_str = limit.map(|l| l.to_string()).unwrap_or_else(|| "50".to_string());

        // Full (non-flat) entries carry the counters and tags the filter needs.
        let stdout = self
            .run_yt_dlp(&[
                "--dump-json",
                "--no-download",
                "--no-warnings",
                "--ignore-errors",
                "--playlist-end",
                &limit_str,
                channel,
            ])
            .await?;

        let mut videos = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<serde_json::Value>(line) {
                Ok(json) => match parse_video_json(&json) {
                    Some(meta) => videos.push(meta),
                    None => warn!("Skipping catalog entry without an id"),
                },
                Err(e) => warn!("Skipping unparseable catalog entry: {}", e),
            }
        }

        debug!("Listed {} videos from {}", videos.len(), channel);
        Ok(videos)
    }
}
