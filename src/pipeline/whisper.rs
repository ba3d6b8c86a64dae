//! OpenAI Whisper transcription.

use super::audio::split_audio;
use super::{checkpoint, Subtitle, SubtitleSequence, Transcriber};
use crate::config::TranscriptionSettings;
use crate::error::{Result, VidwikiError};
use crate::openai::create_client;
use async_openai::error::OpenAIError;
use async_openai::types::{AudioInput, AudioResponseFormat, CreateTranscriptionRequestArgs};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Segments closer than this are joined into one subtitle.
const MERGE_GAP_SECONDS: f64 = 1.0;

/// Upper bound on the span of a joined subtitle.
const MERGE_SPAN_SECONDS: f64 = 30.0;

/// Whisper-based transcriber that splits long audio into chunks.
pub struct WhisperTranscriber {
    client: async_openai::Client<async_openai::config::OpenAIConfig>,
    model: String,
    language: Option<String>,
    chunk_duration_seconds: u32,
    max_concurrent_chunks: usize,
}

impl WhisperTranscriber {
    pub fn new(settings: &TranscriptionSettings) -> Result<Self> {
        Ok(Self {
            client: create_client()?,
            model: settings.model.clone(),
            language: settings.language.clone(),
            chunk_duration_seconds: settings.chunk_duration_seconds.max(1),
            max_concurrent_chunks: settings.max_concurrent_chunks.max(1),
        })
    }

    /// Transcribe a single audio file without splitting.
    #[instrument(skip(self), fields(audio_path = %audio_path.display()))]
    async fn transcribe_single(&self, audio_path: &Path) -> Result<SubtitleSequence> {
        let file_bytes = tokio::fs::read(audio_path).await?;
        let file_name = audio_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio.mp3")
            .to_string();

        let mut request_builder = CreateTranscriptionRequestArgs::default();
        request_builder
            .file(AudioInput::from_vec_u8(file_name, file_bytes))
            .model(&self.model)
            .response_format(AudioResponseFormat::VerboseJson);

        if let Some(lang) = &self.language {
            request_builder.language(lang);
        }

        let request = request_builder
            .build()
            .map_err(|e| VidwikiError::Transcription(format!("Failed to build request: {}", e)))?;

        let response = self
            .client
            .audio()
            .transcribe_verbose_json(request)
            .await
            .map_err(map_openai_error)?;

        let subtitles = match response.segments {
            Some(segments) => segments
                .iter()
                .map(|s| Subtitle::new(s.start as f64, s.end as f64, s.text.trim()))
                .filter(|s| !s.text.is_empty())
                .collect(),
            None => vec![Subtitle::new(0.0, response.duration as f64, response.text.trim())],
        };

        debug!("Transcribed {} segments", subtitles.len());
        Ok(SubtitleSequence {
            language: Some(response.language),
            subtitles,
        })
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    #[instrument(skip(self, cancel), fields(audio_path = %audio_path.display()))]
    async fn transcribe(
        &self,
        audio_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<SubtitleSequence> {
        let temp_dir = tempfile::tempdir()?;
        let chunk_seconds = self.chunk_duration_seconds;
        let chunks = split_audio(audio_path, temp_dir.path(), chunk_seconds, cancel).await?;

        if chunks.len() == 1 {
            let sequence = tokio::select! {
                result = self.transcribe_single(audio_path) => result?,
                _ = cancel.cancelled() => {
                    return Err(VidwikiError::Cancelled("transcription interrupted".into()));
                }
            };
            return Ok(sequence.merge_short_gaps(MERGE_GAP_SECONDS, MERGE_SPAN_SECONDS));
        }

        info!("Processing {} audio chunks with {}", chunks.len(), self.model);

        let mut results: Vec<(usize, f64, SubtitleSequence)> = Vec::with_capacity(chunks.len());
        let mut stream = stream::iter(chunks.into_iter().enumerate())
            .map(|(idx, (chunk_path, offset))| async move {
                let result = self.transcribe_single(&chunk_path).await;
                (idx, offset, result)
            })
            .buffer_unordered(self.max_concurrent_chunks);

        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = cancel.cancelled() => None,
            };
            let Some((idx, offset, result)) = next else {
                break;
            };
            match result {
                Ok(sequence) => results.push((idx, offset, sequence)),
                // The chunk error keeps its class so rate limits stay retryable.
                Err(e) => return Err(e),
            }
        }
        checkpoint(cancel)?;

        Ok(merge_chunks(results).merge_short_gaps(MERGE_GAP_SECONDS, MERGE_SPAN_SECONDS))
    }
}

/// Order chunk results and shift each chunk's timestamps by its offset.
fn merge_chunks(mut results: Vec<(usize, f64, SubtitleSequence)>) -> SubtitleSequence {
    results.sort_by_key(|(idx, _, _)| *idx);

    let mut merged = SubtitleSequence::default();
    for (_, offset, sequence) in results {
        if merged.language.is_none() {
            merged.language = sequence.language;
        }
        merged.subtitles.extend(sequence.subtitles.into_iter().map(|mut s| {
            s.start_seconds += offset;
            s.end_seconds += offset;
            s
        }));
    }
    merged
}

fn map_openai_error(e: OpenAIError) -> VidwikiError {
    match e {
        OpenAIError::Reqwest(err) => VidwikiError::Http(err),
        OpenAIError::ApiError(api) if api.r#type.as_deref() == Some("invalid_request_error") => {
            VidwikiError::Permanent(format!("Whisper rejected audio: {}", api.message))
        }
        other => VidwikiError::OpenAI(format!("Whisper API error: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_chunks_applies_offsets_in_order() {
        let chunk = |text: &str| SubtitleSequence {
            language: Some("en".into()),
            subtitles: vec![Subtitle::new(1.0, 2.5, text)],
        };
        let merged = merge_chunks(vec![(1, 600.0, chunk("second")), (0, 0.0, chunk("first"))]);

        assert_eq!(merged.language.as_deref(), Some("en"));
        assert_eq!(merged.subtitles[0].text, "first");
        assert_eq!(merged.subtitles[1].start_seconds, 601.0);
        assert_eq!(merged.subtitles[1].end_seconds, 602.5);
    }
}
