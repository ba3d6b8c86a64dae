//! Video downloads through yt-dlp.

use super::{run_tool, Downloader, FetchedFile};
use crate::error::{Result, VidwikiError};
use crate::source::VideoMetadata;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// yt-dlp messages for videos that will never become downloadable.
const PERMANENT_MARKERS: &[&str] = &[
    "Private video",
    "Video unavailable",
    "has been removed",
    "is not available",
    "HTTP Error 404",
    "members-only",
];

/// Downloads the video file itself, merged into one container.
#[derive(Debug, Clone)]
pub struct YtDlpDownloader {
    yt_dlp: String,
    format: String,
}

impl YtDlpDownloader {
    pub fn new(yt_dlp: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            yt_dlp: yt_dlp.into(),
            format: format.into(),
        }
    }
}

#[async_trait]
impl Downloader for YtDlpDownloader {
    #[instrument(skip(self, metadata, dir, cancel), fields(video_id = %metadata.id))]
    async fn fetch(
        &self,
        metadata: &VideoMetadata,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchedFile> {
        tokio::fs::create_dir_all(dir).await?;

        if let Some(existing) = find_video_file(dir, &metadata.id)? {
            info!("Using cached video file");
            return FetchedFile::from_path(existing);
        }

        info!("Downloading {}", metadata.source_url);
        let template = dir.join(format!("{}.%(ext)s", metadata.id));

        let mut command = Command::new(&self.yt_dlp);
        command
            .arg("--format").arg(&self.format)
            .arg("--merge-output-format").arg("mp4")
            .arg("--output").arg(&template)
            .arg("--no-playlist")
            .arg("--quiet")
            .arg("--no-warnings")
            .arg(&metadata.source_url);

        let output = match run_tool(command, &self.yt_dlp, cancel).await {
            Ok(output) => output,
            Err(e) => {
                if matches!(e, VidwikiError::Cancelled(_)) {
                    remove_partials(dir, &metadata.id);
                }
                return Err(e);
            }
        };

        if !output.status.success() {
            remove_partials(dir, &metadata.id);
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_stderr(stderr.trim()));
        }

        let path = find_video_file(dir, &metadata.id)?
            .ok_or_else(|| VidwikiError::Download("video file not found after download".into()))?;
        FetchedFile::from_path(path)
    }
}

/// Map yt-dlp stderr to an error the retry policy can act on.
pub(crate) fn classify_stderr(stderr: &str) -> VidwikiError {
    if PERMANENT_MARKERS.iter().any(|marker| stderr.contains(marker)) {
        VidwikiError::Permanent(format!("yt-dlp: {stderr}"))
    } else {
        VidwikiError::Download(format!("yt-dlp failed: {stderr}"))
    }
}

/// Completed download for a video id, ignoring in-progress fragments.
fn find_video_file(dir: &Path, video_id: &str) -> Result<Option<PathBuf>> {
    for ext in &["mp4", "mkv", "webm", "flv"] {
        let candidate = dir.join(format!("{}.{}", video_id, ext));
        if candidate.exists() {
            return Ok(Some(candidate));
        }
    }

    let prefix = format!("{}.", video_id);
    for entry in std::fs::read_dir(dir)?.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(&prefix) && !is_partial(&name) {
            return Ok(Some(entry.path()));
        }
    }

    Ok(None)
}

fn is_partial(name: &str) -> bool {
    name.ends_with(".part")
        || name.ends_with(".ytdl")
        || name.contains(".part-Frag")
        || name.contains(".temp.")
}

/// Remove whatever an interrupted download left behind.
fn remove_partials(dir: &Path, video_id: &str) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let prefix = format!("{}.", video_id);
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => debug!("Removed partial {:?}", entry.path()),
                Err(e) => warn!("Could not remove partial {:?}: {}", entry.path(), e),
            }
        }
    }
}
