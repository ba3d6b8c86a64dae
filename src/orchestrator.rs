//! Wiring for vidwiki.
//!
//! Builds the task store, storage ledger, collaborators and scheduler from
//! settings, and feeds discovered videos through the filter into the queue.

use crate::config::Settings;
use crate::error::{Result, VidwikiError};
use crate::filter::{PredicateRegistry, VideoFilter};
use crate::pipeline::{
    ArtifactDirs, Collaborators, FfmpegExtractor, HttpKnowledgeBase, MarkdownRenderer, StageRunner,
    WhisperTranscriber, YtDlpDownloader,
};
use crate::scheduler::{cancel_in_store, Scheduler};
use crate::source::{VideoMetadata, VideoSource, YoutubeSource};
use crate::storage::{LedgerConfig, StorageLedger};
use crate::task::{Priority, SqliteTaskStore, TaskStore, VideoTask};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Outcome of a discovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoverResult {
    /// Videos the source listed.
    pub listed: usize,
    /// Videos rejected by the filter.
    pub rejected: usize,
    pub enqueued: Vec<String>,
    /// Videos already known to the store.
    pub already_known: usize,
}

/// Outcome of enqueueing a single video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EnqueueResult {
    Enqueued(String),
    AlreadyKnown(String),
    Rejected { id: String, reason: String },
}

/// The assembled vidwiki pipeline.
pub struct Orchestrator {
    settings: Settings,
    scheduler: Scheduler,
    source: Arc<dyn VideoSource>,
    filter: VideoFilter,
}

impl Orchestrator {
    /// Build the pipeline with SQLite persistence and the external tools.
    pub fn new(settings: Settings) -> Result<Self> {
        let store = Arc::new(SqliteTaskStore::new(&settings.database_path())?);
        let ledger = Arc::new(StorageLedger::with_journal(
            LedgerConfig::from_settings(&settings),
            store.clone(),
        )?);

        let collaborators = Collaborators {
            downloader: Arc::new(YtDlpDownloader::new(
                &settings.source.yt_dlp,
                &settings.source.format,
            )),
            extractor: Arc::new(FfmpegExtractor::new()),
            transcriber: Arc::new(WhisperTranscriber::new(&settings.transcription)?),
            renderer: Arc::new(MarkdownRenderer::new()),
            knowledge_base: Arc::new(HttpKnowledgeBase::new(&settings.knowledge_base)?),
        };
        let source = Arc::new(YoutubeSource::new(&settings.source.yt_dlp));

        Self::with_components(settings, store, ledger, collaborators, source)
    }

    /// Build the pipeline from caller-supplied parts.
    pub fn with_components(
        settings: Settings,
        store: Arc<dyn TaskStore>,
        ledger: Arc<StorageLedger>,
        collaborators: Collaborators,
        source: Arc<dyn VideoSource>,
    ) -> Result<Self> {
        let registry = PredicateRegistry::with_builtins();
        let filter = VideoFilter::from_settings(&settings.filter, &registry)?;
        let runner = Arc::new(StageRunner::new(
            collaborators,
            ledger.clone(),
            ArtifactDirs::from_settings(&settings),
        ));
        let scheduler = Scheduler::new(
            store,
            ledger,
            runner,
            settings.scheduler.clone(),
            settings.storage.estimates.clone(),
        );

        Ok(Self {
            settings,
            scheduler,
            source,
            filter,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        self.scheduler.store()
    }

    /// Cancel a task from outside the scheduler process. Only the store is
    /// written; the running scheduler stops the worker and unpins the files.
    pub async fn request_cancel(&self, id: &str) -> Result<VideoTask> {
        cancel_in_store(self.store().as_ref(), id).await
    }

    pub fn ledger(&self) -> &Arc<StorageLedger> {
        self.scheduler.ledger()
    }

    /// List a channel, filter its videos and enqueue the ones that pass.
    #[instrument(skip(self))]
    pub async fn discover(
        &self,
        channel: &str,
        limit: Option<usize>,
        priority: Priority,
    ) -> Result<DiscoverResult> {
        let videos = self.source.list_videos(channel, limit).await?;
        let mut result = DiscoverResult {
            listed: videos.len(),
            ..DiscoverResult::default()
        };

        let accepted = self.filter.filter_batch(videos);
        result.rejected = result.listed - accepted.len();

        for metadata in accepted {
            match self.enqueue_metadata(metadata, priority).await? {
                Some(id) => result.enqueued.push(id),
                None => result.already_known += 1,
            }
        }

        info!(
            "Discovered {} video(s): {} enqueued, {} already known, {} rejected",
            result.listed,
            result.enqueued.len(),
            result.already_known,
            result.rejected
        );
        Ok(result)
    }

    /// Resolve one video and enqueue it. `force` skips the filter.
    #[instrument(skip(self))]
    pub async fn enqueue_video(
        &self,
        input: &str,
        priority: Priority,
        force: bool,
    ) -> Result<EnqueueResult> {
        let metadata = self.source.fetch_video(input).await?;

        if !force {
            if let Err(rejection) = self.filter.evaluate(&metadata) {
                return Ok(EnqueueResult::Rejected {
                    id: metadata.id,
                    reason: rejection.to_string(),
                });
            }
        }

        let id = metadata.id.clone();
        match self.enqueue_metadata(metadata, priority).await? {
            Some(id) => Ok(EnqueueResult::Enqueued(id)),
            None => Ok(EnqueueResult::AlreadyKnown(id)),
        }
    }

    /// Enqueue, treating a known id as already done rather than an error.
    async fn enqueue_metadata(
        &self,
        metadata: VideoMetadata,
        priority: Priority,
    ) -> Result<Option<String>> {
        let id = metadata.id.clone();
        match self.scheduler.enqueue(VideoTask::new(metadata, priority)).await {
            Ok(()) => Ok(Some(id)),
            Err(VidwikiError::DuplicateTask(_)) => Ok(None),
            Err(e) => {
                warn!(id, "Could not enqueue: {}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fakes::{collaborators, FakeTools};
    use crate::storage::{ArtifactType, NewArtifact};
    use crate::task::{MemoryTaskStore, Stage, TaskStatus};
    use async_trait::async_trait;

    struct FakeSource {
        videos: Vec<VideoMetadata>,
    }

    #[async_trait]
    impl VideoSource for FakeSource {
        async fn fetch_video(&self, input: &str) -> Result<VideoMetadata> {
            self.videos
                .iter()
                .find(|v| v.id == input)
                .cloned()
                .ok_or_else(|| VidwikiError::VideoNotFound(input.to_string()))
        }

        async fn list_videos(
            &self,
            _channel: &str,
            limit: Option<usize>,
        ) -> Result<Vec<VideoMetadata>> {
            let n = limit.unwrap_or(self.videos.len());
            Ok(self.videos.iter().take(n).cloned().collect())
        }
    }

    fn video(id: &str, views: u64) -> VideoMetadata {
        let mut v = VideoMetadata::new(
            id,
            format!("Video {}", id),
            format!("https://example.com/{}", id),
        );
        v.view_count = Some(views);
        v
    }

    fn orchestrator(dir: &std::path::Path) -> (Orchestrator, Arc<MemoryTaskStore>) {
        let mut settings = Settings::default();
        settings.general.data_dir = dir.to_string_lossy().to_string();
        settings.filter.min_views = Some(1000);

        let store = Arc::new(MemoryTaskStore::new());
        let ledger = Arc::new(StorageLedger::new(LedgerConfig::from_settings(&settings)));
        let tools = Arc::new(FakeTools::default());
        let source = Arc::new(FakeSource {
            videos: vec![video("a", 5000), video("b", 500), video("c", 1200)],
        });

        let orchestrator = Orchestrator::with_components(
            settings,
            store.clone(),
            ledger,
            collaborators(&tools),
            source,
        )
        .unwrap();
        (orchestrator, store)
    }

    #[tokio::test]
    async fn test_discover_filters_and_skips_known() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, store) = orchestrator(dir.path());

        let first = orchestrator.discover("chan", None, Priority::Normal).await.unwrap();
        assert_eq!(first.listed, 3);
        assert_eq!(first.rejected, 1);
        assert_eq!(first.enqueued, vec!["a".to_string(), "c".to_string()]);

        let second = orchestrator.discover("chan", None, Priority::Normal).await.unwrap();
        assert!(second.enqueued.is_empty());
        assert_eq!(second.already_known, 2);

        let task = store.get("a").await.unwrap().unwrap();
        assert_eq!((task.stage, task.status), (Stage::Discovered, TaskStatus::Pending));
        assert!(store.get("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_video_respects_filter_unless_forced() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, _) = orchestrator(dir.path());

        let rejected = orchestrator.enqueue_video("b", Priority::High, false).await.unwrap();
        assert!(matches!(rejected, EnqueueResult::Rejected { ref id, .. } if id == "b"));

        let forced = orchestrator.enqueue_video("b", Priority::High, true).await.unwrap();
        assert_eq!(forced, EnqueueResult::Enqueued("b".into()));

        let again = orchestrator.enqueue_video("b", Priority::High, true).await.unwrap();
        assert_eq!(again, EnqueueResult::AlreadyKnown("b".into()));
    }

    #[tokio::test]
    async fn test_request_cancel_leaves_ledger_to_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, store) = orchestrator(dir.path());
        orchestrator.enqueue_video("a", Priority::Normal, false).await.unwrap();
        let video = NewArtifact::new(dir.path().join("a.mp4"), "a", ArtifactType::Video, 10);
        orchestrator.ledger().register(video.pinned()).unwrap();

        let task = orchestrator.request_cancel("a").await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(store.get("a").await.unwrap().unwrap().status, TaskStatus::Cancelled);
        assert_eq!(orchestrator.ledger().stats().unwrap().pinned, 1);

        orchestrator.scheduler().run_once().await.unwrap();
        assert_eq!(orchestrator.ledger().stats().unwrap().pinned, 0);

        assert!(matches!(
            orchestrator.request_cancel("a").await,
            Err(VidwikiError::InvalidTransition { .. })
        ));
    }
}
