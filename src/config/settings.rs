//! Configuration settings for vidwiki.

use crate::error::{Result, VidwikiError};
use crate::storage::ArtifactType;
use crate::task::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const GIB: u64 = 1024 * 1024 * 1024;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Settings {
    pub general: GeneralSettings,
    pub storage: StorageSettings,
    pub scheduler: SchedulerSettings,
    pub filter: FilterSettings,
    pub source: SourceSettings,
    pub transcription: TranscriptionSettings,
    pub knowledge_base: KnowledgeBaseSettings,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// Directory for the task database and downloaded artifacts.
    pub data_dir: String,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            data_dir: "~/.vidwiki".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Storage budget and retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Maximum bytes held in the Hot and Warm tiers together.
    pub budget_bytes: u64,
    /// Usage ratio above which admission triggers a sweep.
    pub cleanup_threshold: f64,
    /// Maximum bytes held in the Cold tier. `None` = unbounded, `Some(0)` = no cold tier.
    pub cold_budget_bytes: Option<u64>,
    /// Directory cold artifacts are moved into (kept in place when unset).
    pub cold_dir: Option<String>,
    /// Days of inactivity an artifact spends in each tier, per artifact type.
    pub retention: RetentionSettings,
    /// Size estimates used for admission before a file exists.
    pub estimates: SizeEstimates,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            budget_bytes: 100 * GIB,
            cleanup_threshold: 0.8,
            cold_budget_bytes: None,
            cold_dir: None,
            retention: RetentionSettings::default(),
            estimates: SizeEstimates::default(),
        }
    }
}

/// Per-artifact-type retention, in days.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub video_days: u32,
    pub audio_days: u32,
    pub transcript_days: u32,
    pub temp_days: u32,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            video_days: 7,
            audio_days: 7,
            transcript_days: 30,
            temp_days: 1,
        }
    }
}

impl RetentionSettings {
    /// Retention days for an artifact type.
    pub fn days_for(&self, artifact_type: ArtifactType) -> u32 {
        match artifact_type {
            ArtifactType::Video => self.video_days,
            ArtifactType::Audio => self.audio_days,
            ArtifactType::Transcript => self.transcript_days,
            ArtifactType::Temp => self.temp_days,
        }
    }
}

/// Byte-rate estimates for storage admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizeEstimates {
    /// Expected video bytes per second of runtime.
    pub video_bytes_per_second: u64,
    /// Expected audio bytes per second of runtime (16 kHz mono MP3).
    pub audio_bytes_per_second: u64,
    /// Estimate used when a video's duration is unknown.
    pub default_video_bytes: u64,
}

impl Default for SizeEstimates {
    fn default() -> Self {
        Self {
            video_bytes_per_second: 250_000,
            audio_bytes_per_second: 8_000,
            default_video_bytes: 512 * 1024 * 1024,
        }
    }
}

impl SizeEstimates {
    /// Bytes a stage is expected to write for a video of the given duration.
    pub fn for_stage(&self, stage: Stage, duration_seconds: Option<u32>) -> u64 {
        match (stage, duration_seconds) {
            (Stage::Downloading, Some(d)) => self.video_bytes_per_second.saturating_mul(d as u64),
            (Stage::Downloading, None) => self.default_video_bytes,
            (Stage::ExtractingAudio, Some(d)) => {
                self.audio_bytes_per_second.saturating_mul(d as u64)
            }
            (Stage::ExtractingAudio, None) => self
                .default_video_bytes
                .saturating_mul(self.audio_bytes_per_second)
                / self.video_bytes_per_second.max(1),
            _ => 0,
        }
    }
}

/// Worker pool size per stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConcurrency {
    pub downloading: usize,
    pub extracting_audio: usize,
    pub transcribing: usize,
    pub generating: usize,
    pub cleanup: usize,
}

impl Default for StageConcurrency {
    fn default() -> Self {
        Self {
            downloading: 3,
            extracting_audio: 2,
            transcribing: 2,
            generating: 4,
            cleanup: 4,
        }
    }
}

impl StageConcurrency {
    /// Pool size for a work stage; `None` for Discovered and Completed.
    pub fn get(&self, stage: Stage) -> Option<usize> {
        match stage {
            Stage::Downloading => Some(self.downloading),
            Stage::ExtractingAudio => Some(self.extracting_audio),
            Stage::Transcribing => Some(self.transcribing),
            Stage::Generating => Some(self.generating),
            Stage::Cleanup => Some(self.cleanup),
            Stage::Discovered | Stage::Completed => None,
        }
    }
}

/// Retry budget per stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageRetries {
    pub downloading: u32,
    pub extracting_audio: u32,
    pub transcribing: u32,
    pub generating: u32,
    pub cleanup: u32,
}

impl Default for StageRetries {
    fn default() -> Self {
        Self {
            downloading: 3,
            extracting_audio: 2,
            transcribing: 3,
            generating: 3,
            cleanup: 1,
        }
    }
}

impl StageRetries {
    /// Retry budget for a work stage; `None` for Discovered and Completed.
    pub fn get(&self, stage: Stage) -> Option<u32> {
        match stage {
            Stage::Downloading => Some(self.downloading),
            Stage::ExtractingAudio => Some(self.extracting_audio),
            Stage::Transcribing => Some(self.transcribing),
            Stage::Generating => Some(self.generating),
            Stage::Cleanup => Some(self.cleanup),
            Stage::Discovered | Stage::Completed => None,
        }
    }
}

/// Scheduler concurrency and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub concurrency: StageConcurrency,
    pub max_retries: StageRetries,
    /// Base delay of the exponential backoff, in milliseconds.
    pub backoff_base_ms: u64,
    /// Maximum backoff delay, in milliseconds.
    pub backoff_cap_ms: u64,
    /// How often the loop re-polls when nothing is dispatchable.
    pub poll_interval_ms: u64,
    /// Pause after the storage ledger denies an admission.
    pub admission_backoff_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            concurrency: StageConcurrency::default(),
            max_retries: StageRetries::default(),
            backoff_base_ms: 30_000,
            backoff_cap_ms: 30 * 60 * 1000,
            poll_interval_ms: 2_000,
            admission_backoff_ms: 10_000,
        }
    }
}

impl SchedulerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn admission_backoff(&self) -> Duration {
        Duration::from_millis(self.admission_backoff_ms)
    }

    /// Retry budget for a stage (0 for stages without a worker).
    pub fn max_retries_for(&self, stage: Stage) -> u32 {
        self.max_retries.get(stage).unwrap_or(0)
    }
}

/// Video filter criteria. Every field is optional; an unset criterion does not constrain.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FilterSettings {
    /// Earliest accepted publish time.
    pub start: Option<DateTime<Utc>>,
    /// Latest accepted publish time.
    pub end: Option<DateTime<Utc>>,
    pub min_duration_seconds: Option<u32>,
    pub max_duration_seconds: Option<u32>,
    pub min_views: Option<u64>,
    pub min_likes: Option<u64>,
    /// At least one must appear in the title or description.
    pub include_keywords: Vec<String>,
    /// None may appear in the title or description.
    pub exclude_keywords: Vec<String>,
    /// At least one must be among the video's tags.
    pub include_tags: Vec<String>,
    /// None may be among the video's tags.
    pub exclude_tags: Vec<String>,
    /// Names of registered custom predicates, all of which must hold.
    pub custom: Vec<String>,
}

/// Video platform settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    /// yt-dlp executable.
    pub yt_dlp: String,
    /// yt-dlp format selector for video downloads.
    pub format: String,
    /// Default channel or playlist URL for `discover`.
    pub channel: Option<String>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            yt_dlp: "yt-dlp".to_string(),
            format: "bv*[height<=720]+ba/b[height<=720]/b".to_string(),
            channel: None,
        }
    }
}

/// Speech-to-text settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionSettings {
    /// Whisper model to use.
    pub model: String,
    /// Language hint (ISO-639-1), auto-detected when unset.
    pub language: Option<String>,
    /// Duration in seconds for splitting long audio files.
    pub chunk_duration_seconds: u32,
    /// Maximum concurrent chunk requests.
    pub max_concurrent_chunks: usize,
}

impl Default for TranscriptionSettings {
    fn default() -> Self {
        Self {
            model: "whisper-1".to_string(),
            language: None,
            chunk_duration_seconds: 600,
            max_concurrent_chunks: 3,
        }
    }
}

/// Knowledge-base ingestion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeBaseSettings {
    /// Base URL of the ingestion API.
    pub endpoint: String,
    /// Bearer token (falls back to `VIDWIKI_KB_API_KEY`).
    pub api_key: Option<String>,
    /// Target collection for uploaded documents.
    pub collection: String,
    /// Request timeout in seconds.
    pub timeout_seconds: u64,
}

impl Default for KnowledgeBaseSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/api".to_string(),
            api_key: None,
            collection: "videos".to_string(),
            timeout_seconds: 60,
        }
    }
}

impl Settings {
    /// Load settings from the default configuration file.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load settings from a specific path, or default location if None.
    pub fn load_from(path: Option<&PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.clone(),
            None => Self::default_config_path(),
        };

        let settings = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str::<Settings>(&content)?
        } else {
            Settings::default()
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Save settings to a specific path.
    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| VidwikiError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the scheduler and ledger cannot work with.
    pub fn validate(&self) -> Result<()> {
        let storage = &self.storage;
        if storage.budget_bytes == 0 {
            return Err(VidwikiError::Config("storage.budget_bytes must be positive".into()));
        }
        if !(storage.cleanup_threshold > 0.0 && storage.cleanup_threshold <= 1.0) {
            return Err(VidwikiError::Config(format!(
                "storage.cleanup_threshold must be in (0, 1], got {}",
                storage.cleanup_threshold
            )));
        }

        for stage in Stage::WORK_STAGES {
            if self.scheduler.concurrency.get(stage) == Some(0) {
                return Err(VidwikiError::Config(format!(
                    "scheduler.concurrency for {} must be at least 1",
                    stage
                )));
            }
        }
        if self.scheduler.backoff_cap_ms < self.scheduler.backoff_base_ms {
            return Err(VidwikiError::Config(
                "scheduler.backoff_cap_ms must not be below backoff_base_ms".into(),
            ));
        }

        if let (Some(start), Some(end)) = (self.filter.start, self.filter.end) {
            if start > end {
                return Err(VidwikiError::Config(
                    "filter.start must not be after filter.end".into(),
                ));
            }
        }
        let durations = (
            self.filter.min_duration_seconds,
            self.filter.max_duration_seconds,
        );
        if let (Some(min), Some(max)) = durations {
            if min > max {
                return Err(VidwikiError::Config(
                    "filter.min_duration_seconds must not exceed max_duration_seconds".into(),
                ));
            }
        }

        url::Url::parse(&self.knowledge_base.endpoint).map_err(|e| {
            VidwikiError::Config(format!("knowledge_base.endpoint is not a valid URL: {}", e))
        })?;

        Ok(())
    }

    /// Get the default configuration file path.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vidwiki")
            .join("config.toml")
    }

    /// Expand shell variables in paths (e.g., ~).
    pub fn expand_path(path: &str) -> PathBuf {
        PathBuf::from(shellexpand::tilde(path).to_string())
    }

    /// Get the expanded data directory path.
    pub fn data_dir(&self) -> PathBuf {
        Self::expand_path(&self.general.data_dir)
    }

    /// Path of the SQLite task database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("vidwiki.db")
    }

    /// Directory stage workers write artifacts of the given type into.
    pub fn artifact_dir(&self, artifact_type: ArtifactType) -> PathBuf {
        let name = match artifact_type {
            ArtifactType::Video => "videos",
            ArtifactType::Audio => "audio",
            ArtifactType::Transcript => "transcripts",
            ArtifactType::Temp => "temp",
        };
        self.data_dir().join(name)
    }

    /// Expanded cold tier directory, if configured.
    pub fn cold_dir(&self) -> Option<PathBuf> {
        self.storage.cold_dir.as_deref().map(Self::expand_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.storage.cleanup_threshold, 0.8);
        assert_eq!(settings.scheduler.concurrency.get(Stage::Downloading), Some(3));
        assert_eq!(settings.scheduler.concurrency.get(Stage::Completed), None);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            [storage]
            budget_bytes = 1000

            [scheduler.max_retries]
            downloading = 5

            [filter]
            min_views = 1000
            include_keywords = ["tutorial"]
            "#,
        )
        .unwrap();

        assert_eq!(settings.storage.budget_bytes, 1000);
        assert_eq!(settings.storage.cleanup_threshold, 0.8);
        assert_eq!(settings.scheduler.max_retries_for(Stage::Downloading), 5);
        assert_eq!(settings.scheduler.max_retries_for(Stage::ExtractingAudio), 2);
        assert_eq!(settings.filter.min_views, Some(1000));
        assert!(settings.filter.exclude_tags.is_empty());
    }

    #[test]
    fn test_validate_rejects_inverted_ranges() {
        let mut settings = Settings::default();
        settings.filter.min_duration_seconds = Some(600);
        settings.filter.max_duration_seconds = Some(60);
        assert!(matches!(settings.validate(), Err(VidwikiError::Config(_))));

        let mut settings = Settings::default();
        settings.storage.cleanup_threshold = 1.5;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.scheduler.concurrency.transcribing = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_size_estimates() {
        let estimates = SizeEstimates::default();
        assert_eq!(estimates.for_stage(Stage::Downloading, Some(100)), 25_000_000);
        assert_eq!(estimates.for_stage(Stage::ExtractingAudio, Some(100)), 800_000);
        assert_eq!(estimates.for_stage(Stage::Downloading, None), estimates.default_video_bytes);
        assert_eq!(estimates.for_stage(Stage::Transcribing, Some(100)), 0);
    }
}
