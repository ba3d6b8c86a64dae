//! Error types for vidwiki.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Library-level error type for vidwiki operations.
#[derive(Error, Debug)]
pub enum VidwikiError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task already exists: {0}")]
    DuplicateTask(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid task transition for {id}: {reason}")]
    InvalidTransition { id: String, reason: String },

    #[error("Dependency cycle detected: {0}")]
    DependencyCycle(String),

    #[error("Dependencies not satisfied for {0}")]
    DependencyUnsatisfied(String),

    #[error("Storage budget exhausted: requested {requested} bytes, {available} available")]
    StorageExhausted { requested: u64, available: u64 },

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Video source error: {0}")]
    VideoSource(String),

    #[error("Video not found: {0}")]
    VideoNotFound(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Audio extraction failed: {0}")]
    AudioExtraction(String),

    #[error("Transcription failed: {0}")]
    Transcription(String),

    #[error("Knowledge base rejected upload ({status}): {message}")]
    KnowledgeBase { status: u16, message: String },

    #[error("Missing artifact: {0}")]
    MissingArtifact(String),

    #[error("Task store error: {0}")]
    Store(String),

    #[error("Storage ledger error: {0}")]
    Ledger(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("OpenAI API error: {0}")]
    OpenAI(String),

    #[error("External tool not found: {0}. Please install it and ensure it's in your PATH.")]
    ToolNotFound(String),

    #[error("External tool failed: {0}")]
    ToolFailed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// How a stage failure should be treated by the retry machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Network timeouts, rate limiting, temporary resource exhaustion.
    Transient,
    /// Deleted/private videos, unsupported formats, malformed metadata.
    Permanent,
    /// The worker observed its cancellation token and stopped.
    Cancelled,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Permanent => write!(f, "permanent"),
            ErrorClass::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl VidwikiError {
    /// Classify this error for the retry policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            VidwikiError::Cancelled(_) => ErrorClass::Cancelled,

            VidwikiError::Transient(_)
            | VidwikiError::StorageExhausted { .. }
            | VidwikiError::Io(_)
            | VidwikiError::Database(_)
            | VidwikiError::Store(_)
            | VidwikiError::Ledger(_)
            | VidwikiError::OpenAI(_)
            | VidwikiError::Transcription(_)
            | VidwikiError::ToolFailed(_) => ErrorClass::Transient,

            VidwikiError::Http(e) => classify_http(e),
            VidwikiError::KnowledgeBase { status, .. } => classify_status(*status),

            // yt-dlp and ffmpeg failures are flagged permanent at the call site
            // when stderr names a cause that will not go away.
            VidwikiError::Download(_) | VidwikiError::AudioExtraction(_) => ErrorClass::Transient,

            VidwikiError::Permanent(_)
            | VidwikiError::Config(_)
            | VidwikiError::DuplicateTask(_)
            | VidwikiError::TaskNotFound(_)
            | VidwikiError::InvalidTransition { .. }
            | VidwikiError::DependencyCycle(_)
            | VidwikiError::DependencyUnsatisfied(_)
            | VidwikiError::VideoSource(_)
            | VidwikiError::VideoNotFound(_)
            | VidwikiError::MissingArtifact(_)
            | VidwikiError::Json(_)
            | VidwikiError::TomlParse(_)
            | VidwikiError::ToolNotFound(_)
            | VidwikiError::InvalidInput(_) => ErrorClass::Permanent,
        }
    }

    /// Whether the retry policy may retry this error.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

fn classify_http(e: &reqwest::Error) -> ErrorClass {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        return ErrorClass::Transient;
    }
    match e.status() {
        Some(status) => classify_status(status.as_u16()),
        None if e.is_decode() || e.is_builder() => ErrorClass::Permanent,
        None => ErrorClass::Transient,
    }
}

fn classify_status(status: u16) -> ErrorClass {
    match status {
        408 | 425 | 429 => ErrorClass::Transient,
        500..=599 => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

/// A classified failure returned by a stage worker to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub class: ErrorClass,
    pub message: String,
}

impl StageFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            class: ErrorClass::Cancelled,
            message: "stage cancelled".to_string(),
        }
    }
}

impl From<VidwikiError> for StageFailure {
    fn from(e: VidwikiError) -> Self {
        Self {
            class: e.class(),
            message: e.to_string(),
        }
    }
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.class)
    }
}

/// Result type alias for vidwiki operations.
pub type Result<T> = std::result::Result<T, VidwikiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(VidwikiError::Transient("timeout".into()).class(), ErrorClass::Transient);
        assert_eq!(VidwikiError::VideoNotFound("BV1".into()).class(), ErrorClass::Permanent);
        assert_eq!(VidwikiError::ToolNotFound("yt-dlp".into()).class(), ErrorClass::Permanent);
        assert_eq!(VidwikiError::Cancelled("stop".into()).class(), ErrorClass::Cancelled);
        assert!(VidwikiError::Io(std::io::Error::other("disk")).is_transient());
    }

    #[test]
    fn test_knowledge_base_status_classification() {
        let kb_error = |status: u16, message: &str| VidwikiError::KnowledgeBase {
            status,
            message: message.into(),
        };
        let rate_limited = kb_error(429, "slow down");
        let rejected = kb_error(422, "bad document");
        let unavailable = kb_error(503, "maintenance");

        assert_eq!(rate_limited.class(), ErrorClass::Transient);
        assert_eq!(rejected.class(), ErrorClass::Permanent);
        assert_eq!(unavailable.class(), ErrorClass::Transient);
    }

    #[test]
    fn test_stage_failure_from_error() {
        let failure = StageFailure::from(VidwikiError::Permanent("video is private".into()));
        assert_eq!(failure.class, ErrorClass::Permanent);
        assert!(failure.message.contains("video is private"));
    }
}
