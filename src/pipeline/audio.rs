//! Audio extraction and segmentation with ffmpeg.
//!
//! The extracted track is 16 kHz mono MP3, which is what the speech model
//! expects and keeps upload sizes small.

use super::{checkpoint, run_tool, AudioExtractor, FetchedFile};
use crate::error::{Result, VidwikiError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Extracts the audio track of a video with ffmpeg.
#[derive(Debug, Clone, Default)]
pub struct FfmpegExtractor;

impl FfmpegExtractor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AudioExtractor for FfmpegExtractor {
    #[instrument(skip(self, dir, cancel))]
    async fn extract(
        &self,
        video_path: &Path,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchedFile> {
        tokio::fs::create_dir_all(dir).await?;

        let stem = video_path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                VidwikiError::InvalidInput(format!("no file name in {:?}", video_path))
            })?;
        let target = dir.join(format!("{}.mp3", stem));

        if target.exists() {
            info!("Using cached audio file");
            return FetchedFile::from_path(target);
        }

        // Write under a temporary name so a killed run never looks complete.
        let partial = dir.join(format!("{}.partial.mp3", stem));

        let mut command = Command::new("ffmpeg");
        command
            .arg("-i").arg(video_path)
            .arg("-vn")
            .arg("-ac").arg("1")
            .arg("-ar").arg("16000")
            .arg("-codec:a").arg("libmp3lame")
            .arg("-qscale:a").arg("4")
            .arg("-y")
            .arg("-loglevel").arg("error")
            .arg(&partial);

        let output = match run_tool(command, "ffmpeg", cancel).await {
            Ok(output) => output,
            Err(e) => {
                discard(&partial);
                return Err(e);
            }
        };

        if !output.status.success() {
            discard(&partial);
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_stderr(stderr.trim()));
        }

        tokio::fs::rename(&partial, &target).await?;
        FetchedFile::from_path(target)
    }
}

/// ffmpeg reports inputs it cannot decode with these phrases.
fn classify_stderr(stderr: &str) -> VidwikiError {
    let unreadable = [
        "Invalid data found",
        "does not contain any stream",
        "Output file #0 does not contain",
    ];
    if unreadable.iter().any(|marker| stderr.contains(marker)) {
        VidwikiError::Permanent(format!("ffmpeg: {stderr}"))
    } else {
        VidwikiError::AudioExtraction(format!("ffmpeg failed: {stderr}"))
    }
}

fn discard(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not remove {:?}: {}", path, e);
        }
    }
}

/// Segments a long audio file into chunks of about `chunk_seconds`.
///
/// Returns `(chunk_path, offset_seconds)` for each segment. Audio that fits
/// in one chunk is returned as-is with offset zero.
#[instrument(skip_all)]
pub async fn split_audio(
    source: &Path,
    output_dir: &Path,
    chunk_seconds: u32,
    cancel: &CancellationToken,
) -> Result<Vec<(PathBuf, f64)>> {
    let total_duration = probe_duration(source, cancel).await?;
    info!("Total audio duration: {:.1}s", total_duration);

    let chunk_len = chunk_seconds as f64;
    if total_duration <= chunk_len {
        return Ok(vec![(source.to_path_buf(), 0.0)]);
    }

    tokio::fs::create_dir_all(output_dir).await?;
    let base_name = source.file_stem().and_then(|s| s.to_str()).unwrap_or("audio");

    let mut segments = Vec::new();
    for (idx, offset) in segment_offsets(total_duration, chunk_len).into_iter().enumerate() {
        checkpoint(cancel)?;
        let segment_path = output_dir.join(format!("{}_{:04}.mp3", base_name, idx));
        let segment_len = chunk_len.min(total_duration - offset);

        extract_segment(source, &segment_path, offset, segment_len, cancel).await?;
        debug!("Created segment {} at offset {:.1}s", idx, offset);
        segments.push((segment_path, offset));
    }

    info!("Created {} audio segments", segments.len());
    Ok(segments)
}

fn segment_offsets(total: f64, chunk_len: f64) -> Vec<f64> {
    let mut offsets = Vec::new();
    let mut offset = 0.0;
    while offset < total {
        offsets.push(offset);
        offset += chunk_len;
    }
    offsets
}

/// Cuts one segment, stream-copying when possible and re-encoding otherwise.
async fn extract_segment(
    source: &Path,
    dest: &Path,
    start: f64,
    length: f64,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut copy = Command::new("ffmpeg");
    copy.arg("-ss").arg(format!("{:.3}", start))
        .arg("-i").arg(source)
        .arg("-t").arg(format!("{:.3}", length))
        .arg("-c").arg("copy")
        .arg("-y")
        .arg("-loglevel").arg("warning")
        .arg(dest);

    let copied = run_tool(copy, "ffmpeg", cancel).await?;
    if copied.status.success() && dest.exists() {
        return Ok(());
    }

    warn!("Stream copy failed, re-encoding segment");

    let mut encode = Command::new("ffmpeg");
    encode.arg("-ss").arg(format!("{:.3}", start))
        .arg("-i").arg(source)
        .arg("-t").arg(format!("{:.3}", length))
        .arg("-codec:a").arg("libmp3lame")
        .arg("-qscale:a").arg("4")
        .arg("-y")
        .arg("-loglevel").arg("error")
        .arg(dest);

    let encoded = run_tool(encode, "ffmpeg", cancel).await?;
    if encoded.status.success() {
        Ok(())
    } else {
        let err = String::from_utf8_lossy(&encoded.stderr);
        Err(VidwikiError::AudioExtraction(format!("Segment extraction failed: {err}")))
    }
}

/// Duration of a media file, from ffprobe's JSON output.
async fn probe_duration(path: &Path, cancel: &CancellationToken) -> Result<f64> {
    let mut command = Command::new("ffprobe");
    command
        .arg("-v").arg("quiet")
        .arg("-print_format").arg("json")
        .arg("-show_format")
        .arg(path);

    let output = run_tool(command, "ffprobe", cancel).await?;
    if !output.status.success() {
        return Err(VidwikiError::AudioExtraction("ffprobe returned error".into()));
    }

    parse_probe_duration(&output.stdout)
}

fn parse_probe_duration(stdout: &[u8]) -> Result<f64> {
    let parsed: serde_json::Value = serde_json::from_slice(stdout)
        .map_err(|_| VidwikiError::AudioExtraction("Invalid ffprobe output".into()))?;

    parsed["format"]["duration"]
        .as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or_else(|| VidwikiError::AudioExtraction("Could not determine audio duration".into()))
}
