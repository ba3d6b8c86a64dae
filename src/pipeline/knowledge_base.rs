//! Knowledge-base ingestion over HTTP.

use super::{KnowledgeBaseClient, UploadAck};
use crate::config::KnowledgeBaseSettings;
use crate::error::{Result, VidwikiError};
use crate::source::VideoMetadata;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

/// Environment variable consulted when no API key is configured.
pub const KB_API_KEY_ENV: &str = "VIDWIKI_KB_API_KEY";

#[derive(Debug, Serialize)]
struct UploadRequest<'a> {
    external_id: &'a str,
    title: &'a str,
    source_url: &'a str,
    content: &'a str,
    content_type: &'static str,
    tags: &'a [String],
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(alias = "document_id")]
    id: String,
}

/// Posts documents to `{endpoint}/collections/{collection}/documents`.
pub struct HttpKnowledgeBase {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpKnowledgeBase {
    pub fn new(settings: &KnowledgeBaseSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()
            .map_err(|e| VidwikiError::Config(format!("Failed to create HTTP client: {e}")))?;

        let api_key = settings
            .api_key
            .clone()
            .or_else(|| std::env::var(KB_API_KEY_ENV).ok())
            .filter(|key| !key.trim().is_empty());

        Ok(Self {
            client,
            url: documents_url(&settings.endpoint, &settings.collection),
            api_key,
        })
    }
}

fn documents_url(endpoint: &str, collection: &str) -> String {
    format!("{}/collections/{}/documents", endpoint.trim_end_matches('/'), collection)
}

#[async_trait]
impl KnowledgeBaseClient for HttpKnowledgeBase {
    #[instrument(skip(self, document, metadata), fields(video_id = %metadata.id))]
    async fn upload(&self, document: &str, metadata: &VideoMetadata) -> Result<UploadAck> {
        let body = UploadRequest {
            external_id: &metadata.id,
            title: &metadata.title,
            source_url: &metadata.source_url,
            content: document,
            content_type: "text/markdown",
            tags: &metadata.tags,
        };

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(VidwikiError::KnowledgeBase {
                status: status.as_u16(),
                message: message.trim().to_string(),
            });
        }

        let parsed: UploadResponse = response.json().await?;
        debug!("Knowledge base accepted document {}", parsed.id);
        Ok(UploadAck { document_id: parsed.id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_documents_url() {
        assert_eq!(
            documents_url("http://kb.local/api/", "videos"),
            "http://kb.local/api/collections/videos/documents"
        );
    }

    #[test]
    fn test_upload_response_accepts_either_key() {
        let a: UploadResponse = serde_json::from_str(r#"{"id": "doc-1"}"#).unwrap();
        let b: UploadResponse = serde_json::from_str(r#"{"document_id": "doc-2"}"#).unwrap();
        assert_eq!(a.id, "doc-1");
        assert_eq!(b.id, "doc-2");
    }

    #[test]
    fn test_request_shape() {
        let tags = vec!["rust".to_string()];
        let body = UploadRequest {
            external_id: "BV1",
            title: "t",
            source_url: "u",
            content: "# t",
            content_type: "text/markdown",
            tags: &tags,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["external_id"], "BV1");
        assert_eq!(json["tags"][0], "rust");
    }
}
