//! Stage collaborators and the runner that drives them.
//!
//! Each work stage delegates to one collaborator behind a trait, so the
//! scheduler can be exercised with fakes and the concrete tools swapped out.
//! Long-running collaborators receive a cancellation token and must stop at
//! their next checkpoint once it fires, removing any partially written file.

mod audio;
mod download;
mod knowledge_base;
mod markdown;
mod whisper;

pub use audio::{split_audio, FfmpegExtractor};
pub use download::YtDlpDownloader;
pub use knowledge_base::{HttpKnowledgeBase, KB_API_KEY_ENV};
pub use markdown::{safe_filename, MarkdownRenderer, INDEX_FILE};
pub use whisper::WhisperTranscriber;

use crate::config::Settings;
use crate::error::{Result, VidwikiError};
use crate::source::VideoMetadata;
use crate::storage::{ArtifactType, NewArtifact, StorageEntry, StorageLedger, Tier};
use crate::task::{Stage, VideoTask};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// A file produced by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl FetchedFile {
    /// Describe an existing file, reading its size from disk.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let size_bytes = std::fs::metadata(&path)?.len();
        Ok(Self { path, size_bytes })
    }
}

/// One timed line of a transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtitle {
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub text: String,
}

impl Subtitle {
    pub fn new(start_seconds: f64, end_seconds: f64, text: impl Into<String>) -> Self {
        Self {
            start_seconds,
            end_seconds,
            text: text.into(),
        }
    }
}

/// Time-ordered transcript of a video.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubtitleSequence {
    pub language: Option<String>,
    pub subtitles: Vec<Subtitle>,
}

impl SubtitleSequence {
    pub fn new(subtitles: Vec<Subtitle>) -> Self {
        Self {
            language: None,
            subtitles,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subtitles.is_empty()
    }

    /// End of the last subtitle.
    pub fn duration_seconds(&self) -> f64 {
        self.subtitles.last().map(|s| s.end_seconds).unwrap_or(0.0)
    }

    /// All subtitle text joined with spaces.
    pub fn full_text(&self) -> String {
        self.subtitles
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Join subtitles separated by less than `max_gap_seconds` of silence.
    ///
    /// A merged subtitle never spans more than `max_span_seconds`, so long
    /// stretches of continuous speech keep usable timestamps.
    pub fn merge_short_gaps(self, max_gap_seconds: f64, max_span_seconds: f64) -> Self {
        let mut merged: Vec<Subtitle> = Vec::with_capacity(self.subtitles.len());

        for subtitle in self.subtitles {
            match merged.last_mut() {
                Some(current)
                    if subtitle.start_seconds - current.end_seconds < max_gap_seconds
                        && subtitle.end_seconds - current.start_seconds <= max_span_seconds =>
                {
                    if !subtitle.text.is_empty() {
                        if !current.text.is_empty() {
                            current.text.push(' ');
                        }
                        current.text.push_str(&subtitle.text);
                    }
                    current.end_seconds = current.end_seconds.max(subtitle.end_seconds);
                }
                _ => merged.push(subtitle),
            }
        }

        Self {
            language: self.language,
            subtitles: merged,
        }
    }
}

/// Receipt from the knowledge base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadAck {
    pub document_id: String,
}

/// Fetches a video file from the platform.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn fetch(
        &self,
        metadata: &VideoMetadata,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchedFile>;
}

/// Extracts a speech-ready audio track from a video file.
#[async_trait]
pub trait AudioExtractor: Send + Sync {
    async fn extract(
        &self,
        video_path: &Path,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchedFile>;
}

/// Converts audio to timed text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        audio_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<SubtitleSequence>;
}

/// Renders the document published for a video.
pub trait DocumentRenderer: Send + Sync {
    fn render(&self, metadata: &VideoMetadata, subtitles: &SubtitleSequence) -> Result<String>;

    /// Overview document listing every processed video.
    fn render_index(&self, videos: &[VideoMetadata]) -> Result<String>;
}

/// Publishes documents to the downstream knowledge base.
#[async_trait]
pub trait KnowledgeBaseClient: Send + Sync {
    async fn upload(&self, document: &str, metadata: &VideoMetadata) -> Result<UploadAck>;
}

/// The collaborators one runner drives.
#[derive(Clone)]
pub struct Collaborators {
    pub downloader: Arc<dyn Downloader>,
    pub extractor: Arc<dyn AudioExtractor>,
    pub transcriber: Arc<dyn Transcriber>,
    pub renderer: Arc<dyn DocumentRenderer>,
    pub knowledge_base: Arc<dyn KnowledgeBaseClient>,
}

/// Where each artifact type is written.
#[derive(Debug, Clone)]
pub struct ArtifactDirs {
    pub video: PathBuf,
    pub audio: PathBuf,
    pub transcript: PathBuf,
    pub temp: PathBuf,
}

impl ArtifactDirs {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            video: settings.artifact_dir(ArtifactType::Video),
            audio: settings.artifact_dir(ArtifactType::Audio),
            transcript: settings.artifact_dir(ArtifactType::Transcript),
            temp: settings.artifact_dir(ArtifactType::Temp),
        }
    }

    /// All directories under one root, for tests and dry runs.
    pub fn under(root: &Path) -> Self {
        Self {
            video: root.join("videos"),
            audio: root.join("audio"),
            transcript: root.join("transcripts"),
            temp: root.join("temp"),
        }
    }

    pub fn for_type(&self, artifact_type: ArtifactType) -> &Path {
        match artifact_type {
            ArtifactType::Video => &self.video,
            ArtifactType::Audio => &self.audio,
            ArtifactType::Transcript => &self.transcript,
            ArtifactType::Temp => &self.temp,
        }
    }
}

/// Files a successful stage produced, registered by the scheduler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    pub artifacts: Vec<NewArtifact>,
    /// Inputs this stage was the last reader of; the scheduler unpins them.
    pub consumed: Vec<PathBuf>,
}

impl StageOutput {
    fn none() -> Self {
        Self::default()
    }

    fn artifact(artifact: NewArtifact) -> Self {
        Self {
            artifacts: vec![artifact],
            consumed: Vec::new(),
        }
    }

    fn consuming(mut self, input: &StorageEntry) -> Self {
        self.consumed.push(input.path.clone());
        self
    }
}

/// Runs one stage of one task against the collaborators.
pub struct StageRunner {
    collaborators: Collaborators,
    ledger: Arc<StorageLedger>,
    dirs: ArtifactDirs,
}

impl StageRunner {
    pub fn new(
        collaborators: Collaborators,
        ledger: Arc<StorageLedger>,
        dirs: ArtifactDirs,
    ) -> Self {
        Self {
            collaborators,
            ledger,
            dirs,
        }
    }

    /// Execute the task's current stage.
    ///
    /// Inputs are looked up in the ledger by video id; outputs are returned
    /// unregistered so the scheduler can drop them if the result is discarded.
    #[instrument(skip(self, task, cancel), fields(id = %task.id, stage = %task.stage))]
    pub async fn run(&self, task: &VideoTask, cancel: &CancellationToken) -> Result<StageOutput> {
        let meta = &task.metadata;

        match task.stage {
            Stage::Downloading => {
                let file = self
                    .collaborators
                    .downloader
                    .fetch(meta, &self.dirs.video, cancel)
                    .await?;
                info!("Downloaded {} bytes to {:?}", file.size_bytes, file.path);
                let video =
                    NewArtifact::new(file.path, &task.id, ArtifactType::Video, file.size_bytes);
                Ok(StageOutput::artifact(video.pinned()))
            }

            Stage::ExtractingAudio => {
                let video = self.input(task, ArtifactType::Video)?;
                let file = self
                    .collaborators
                    .extractor
                    .extract(&video.path, &self.dirs.audio, cancel)
                    .await?;
                info!("Extracted audio to {:?}", file.path);
                let audio =
                    NewArtifact::new(file.path, &task.id, ArtifactType::Audio, file.size_bytes);
                Ok(StageOutput::artifact(audio.pinned()).consuming(&video))
            }

            Stage::Transcribing => {
                let audio = self.input(task, ArtifactType::Audio)?;
                let subtitles = self
                    .collaborators
                    .transcriber
                    .transcribe(&audio.path, cancel)
                    .await?;
                checkpoint(cancel)?;

                tokio::fs::create_dir_all(&self.dirs.transcript).await?;
                let path = self.dirs.transcript.join(format!("{}.json", task.id));
                let json = serde_json::to_vec_pretty(&subtitles)?;
                tokio::fs::write(&path, &json).await?;
                info!("Transcribed {} subtitles", subtitles.subtitles.len());

                let size = json.len() as u64;
                let transcript = NewArtifact::new(path, &task.id, ArtifactType::Transcript, size);
                Ok(StageOutput::artifact(transcript.pinned()).consuming(&audio))
            }

            Stage::Generating => {
                let transcript = self.transcript_json(task)?;
                let raw = tokio::fs::read(&transcript.path).await?;
                let subtitles: SubtitleSequence = serde_json::from_slice(&raw)?;

                let document = self.collaborators.renderer.render(meta, &subtitles)?;
                checkpoint(cancel)?;

                // The local copy exists before anything is published.
                tokio::fs::create_dir_all(&self.dirs.transcript).await?;
                let path = self.dirs.transcript.join(safe_filename(&task.id, &meta.title));
                tokio::fs::write(&path, document.as_bytes()).await?;

                let ack = self.collaborators.knowledge_base.upload(&document, meta).await?;
                info!("Uploaded document {}", ack.document_id);

                Ok(StageOutput::artifact(NewArtifact::new(
                    path,
                    &task.id,
                    ArtifactType::Transcript,
                    document.len() as u64,
                ))
                .consuming(&transcript))
            }

            Stage::Cleanup => {
                for entry in self.ledger.artifacts_for(&task.id)? {
                    match entry.artifact_type {
                        ArtifactType::Video | ArtifactType::Audio | ArtifactType::Temp => {
                            self.ledger.release(&entry.path)?;
                        }
                        ArtifactType::Transcript => {
                            self.ledger.unpin(&entry.path)?;
                        }
                    }
                }
                debug!("Released raw artifacts");
                Ok(StageOutput::none())
            }

            Stage::Discovered | Stage::Completed => Err(VidwikiError::InvalidTransition {
                id: task.id.clone(),
                reason: format!("stage {} has no worker", task.stage),
            }),
        }
    }

    /// Input artifact of the previous stage, marked as used.
    fn input(&self, task: &VideoTask, artifact_type: ArtifactType) -> Result<StorageEntry> {
        let entry = self
            .ledger
            .artifact(&task.id, artifact_type)?
            .ok_or_else(|| {
                VidwikiError::MissingArtifact(format!("{} for {}", artifact_type, task.id))
            })?;
        self.open(entry)
    }

    /// The structured transcript, never the rendered document beside it.
    fn transcript_json(&self, task: &VideoTask) -> Result<StorageEntry> {
        let entry = self
            .ledger
            .artifacts_for(&task.id)?
            .into_iter()
            .filter(|e| e.artifact_type == ArtifactType::Transcript)
            .filter(|e| e.path.extension().is_some_and(|ext| ext == "json"))
            .max_by_key(|e| e.last_access)
            .ok_or_else(|| VidwikiError::MissingArtifact(format!("transcript for {}", task.id)))?;
        self.open(entry)
    }

    /// Make a tracked input readable: cold files are restored into the
    /// budget first, everything else is touched.
    fn open(&self, entry: StorageEntry) -> Result<StorageEntry> {
        if !entry.path.exists() {
            return Err(VidwikiError::MissingArtifact(format!("{:?}", entry.path)));
        }
        if entry.tier == Tier::Cold {
            return self
                .ledger
                .restore(&entry.path, self.dirs.for_type(entry.artifact_type));
        }
        self.ledger.touch(&entry.path)?;
        Ok(entry)
    }

    /// Write the index of processed videos next to their documents.
    pub async fn write_index(&self, videos: &[VideoMetadata]) -> Result<PathBuf> {
        let index = self.collaborators.renderer.render_index(videos)?;
        tokio::fs::create_dir_all(&self.dirs.transcript).await?;
        let path = self.dirs.transcript.join(INDEX_FILE);
        tokio::fs::write(&path, index.as_bytes()).await?;
        debug!("Wrote index of {} video(s) to {:?}", videos.len(), path);
        Ok(path)
    }
}

/// Run an external tool to completion, killing it if `cancel` fires first.
///
/// Spawn failures map to `ToolNotFound` when the binary is missing.
pub(crate) async fn run_tool(
    mut command: Command,
    tool: &str,
    cancel: &CancellationToken,
) -> Result<std::process::Output> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tokio::select! {
        result = command.output() => match result {
            Ok(output) => Ok(output),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(VidwikiError::ToolNotFound(tool.to_string()))
            }
            Err(e) => Err(VidwikiError::ToolFailed(format!("{tool}: {e}"))),
        },
        _ = cancel.cancelled() => {
            debug!("{} killed on cancellation", tool);
            Err(VidwikiError::Cancelled(format!("{tool} interrupted")))
        }
    }
}

/// Fail with `Cancelled` once the token has fired.
pub(crate) fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(VidwikiError::Cancelled("stage cancelled".into()));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::fakes::{collaborators, FakeTools};
    use super::*;
    use crate::config::RetentionSettings;
    use crate::storage::LedgerConfig;
    use crate::task::Priority;

    fn ledger() -> Arc<StorageLedger> {
        Arc::new(StorageLedger::new(LedgerConfig {
            budget_bytes: 1_000_000,
            cleanup_threshold: 0.8,
            cold_budget_bytes: None,
            cold_dir: None,
            retention: RetentionSettings::default(),
        }))
    }

    fn task_at(stage: Stage) -> VideoTask {
        let mut task = VideoTask::new(
            VideoMetadata::new("BV1", "Ownership: a tour", "https://example.com/BV1"),
            Priority::Normal,
        );
        task.stage = stage;
        task
    }

    #[tokio::test]
    async fn test_stages_hand_artifacts_forward() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(FakeTools::default());
        let ledger = ledger();
        let dirs = ArtifactDirs::under(dir.path());
        let runner = StageRunner::new(collaborators(&tools), ledger.clone(), dirs);
        let cancel = CancellationToken::new();

        let stages = [
            Stage::Downloading,
            Stage::ExtractingAudio,
            Stage::Transcribing,
            Stage::Generating,
        ];
        for stage in stages {
            let output = runner.run(&task_at(stage), &cancel).await.unwrap();
            for artifact in output.artifacts {
                ledger.register(artifact).unwrap();
            }
        }

        let entries = ledger.artifacts_for("BV1").unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(tools.uploads.lock().unwrap().len(), 1);
        assert!(tools.uploads.lock().unwrap()[0].contains("Hello world"));

        runner.run(&task_at(Stage::Cleanup), &cancel).await.unwrap();
        let remaining = ledger.artifacts_for("BV1").unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|e| e.artifact_type == ArtifactType::Transcript && !e.pinned));
        assert!(!dir.path().join("videos").join("BV1.mp4").exists());
    }

    #[tokio::test]
    async fn test_missing_input_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(FakeTools::default());
        let runner =
            StageRunner::new(collaborators(&tools), ledger(), ArtifactDirs::under(dir.path()));

        let err = runner
            .run(&task_at(Stage::ExtractingAudio), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VidwikiError::MissingArtifact(_)));
        assert_eq!(err.class(), crate::error::ErrorClass::Permanent);
    }

    #[tokio::test]
    async fn test_document_is_written_before_upload() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(FakeTools::default());
        let ledger = ledger();
        let dirs = ArtifactDirs::under(dir.path());
        let runner = StageRunner::new(collaborators(&tools), ledger.clone(), dirs.clone());
        let cancel = CancellationToken::new();
        for stage in [Stage::Downloading, Stage::ExtractingAudio, Stage::Transcribing] {
            let output = runner.run(&task_at(stage), &cancel).await.unwrap();
            for artifact in output.artifacts {
                ledger.register(artifact).unwrap();
            }
        }
        let document = dirs.transcript.join(safe_filename("BV1", "Ownership: a tour"));

        // A failed upload leaves the local document in place.
        tools.fail("BV1", Stage::Generating, VidwikiError::Transient("503".into()));
        runner.run(&task_at(Stage::Generating), &cancel).await.unwrap_err();
        assert!(document.is_file());
        std::fs::remove_file(&document).unwrap();

        // A failed write publishes nothing.
        std::fs::create_dir_all(&document).unwrap();
        let uploads_before = tools.calls_for("BV1").len();
        runner.run(&task_at(Stage::Generating), &cancel).await.unwrap_err();
        assert!(tools.uploads.lock().unwrap().is_empty());
        assert_eq!(tools.calls_for("BV1").len(), uploads_before);
    }

    #[tokio::test]
    async fn test_cold_input_is_restored_and_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let cold_dir = dir.path().join("cold");
        let ledger = Arc::new(StorageLedger::new(LedgerConfig {
            budget_bytes: 1_000_000,
            cleanup_threshold: 0.8,
            cold_budget_bytes: None,
            cold_dir: Some(cold_dir.clone()),
            retention: RetentionSettings::default(),
        }));
        let tools = Arc::new(FakeTools::default());
        let dirs = ArtifactDirs::under(dir.path());
        let runner = StageRunner::new(collaborators(&tools), ledger.clone(), dirs.clone());
        let cancel = CancellationToken::new();

        let output = runner.run(&task_at(Stage::Downloading), &cancel).await.unwrap();
        for mut artifact in output.artifacts {
            artifact.pinned = false;
            ledger.register(artifact).unwrap();
        }
        let now = chrono::Utc::now();
        let day = chrono::Duration::days(1);
        ledger.sweep_at(now + day * 8).unwrap();
        ledger.sweep_at(now + day * 16).unwrap();
        let video = ledger.artifact("BV1", ArtifactType::Video).unwrap().unwrap();
        assert_eq!(video.tier, Tier::Cold);
        assert!(video.path.starts_with(&cold_dir));

        let output = runner.run(&task_at(Stage::ExtractingAudio), &cancel).await.unwrap();
        let hot_path = dirs.video.join("BV1.mp4");
        assert_eq!(output.consumed, vec![hot_path.clone()]);
        assert!(hot_path.is_file());
        let video = ledger.artifact("BV1", ArtifactType::Video).unwrap().unwrap();
        assert_eq!((video.path, video.tier), (hot_path, Tier::Hot));
    }

    #[tokio::test]
    async fn test_write_index() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(FakeTools::default());
        let dirs = ArtifactDirs::under(dir.path());
        let runner = StageRunner::new(collaborators(&tools), ledger(), dirs.clone());

        let videos = vec![
            VideoMetadata::new("BV1", "One", "https://example.com/BV1"),
            VideoMetadata::new("BV2", "Two", "https://example.com/BV2"),
        ];
        let path = runner.write_index(&videos).await.unwrap();
        assert_eq!(path, dirs.transcript.join(INDEX_FILE));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "BV1\nBV2");
    }

    #[test]
    fn test_subtitle_sequence_helpers() {
        let subs = SubtitleSequence::new(vec![
            Subtitle::new(0.0, 1.5, "a"),
            Subtitle::new(1.5, 3.0, "b"),
        ]);
        assert_eq!(subs.full_text(), "a b");
        assert_eq!(subs.duration_seconds(), 3.0);
        assert!(SubtitleSequence::default().is_empty());
    }

    #[test]
    fn test_merge_short_gaps() {
        let mut subs = SubtitleSequence::new(vec![
            Subtitle::new(0.0, 2.0, "Hello"),
            Subtitle::new(2.4, 4.0, "world."),
            Subtitle::new(6.0, 8.0, "After a pause"),
            Subtitle::new(8.5, 9.0, "it goes on."),
        ]);
        subs.language = Some("en".into());

        let merged = subs.merge_short_gaps(1.0, 30.0);
        assert_eq!(merged.language.as_deref(), Some("en"));
        assert_eq!(
            merged.subtitles,
            vec![
                Subtitle::new(0.0, 4.0, "Hello world."),
                Subtitle::new(6.0, 9.0, "After a pause it goes on."),
            ]
        );
        assert_eq!(merged.full_text(), "Hello world. After a pause it goes on.");
    }

    #[test]
    fn test_merge_short_gaps_caps_span() {
        let subs = SubtitleSequence::new(
            (0..10)
                .map(|i| Subtitle::new(i as f64 * 5.0, i as f64 * 5.0 + 5.0, "x"))
                .collect(),
        );

        let merged = subs.merge_short_gaps(1.0, 20.0);
        let spans: Vec<(f64, f64)> = merged
            .subtitles
            .iter()
            .map(|s| (s.start_seconds, s.end_seconds))
            .collect();
        assert_eq!(spans, vec![(0.0, 20.0), (20.0, 40.0), (40.0, 50.0)]);
        assert_eq!(merged.subtitles[0].text, "x x x x");
    }
}
