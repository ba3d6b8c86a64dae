//! Video tasks and their durable store.
//!
//! A task tracks one video through the processing stages. Stores persist tasks
//! together with an append-only processing history.

mod memory;
mod sqlite;

pub use memory::MemoryTaskStore;
pub use sqlite::SqliteTaskStore;

use crate::error::{Result, VidwikiError};
use crate::source::VideoMetadata;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Processing stage of a video, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovered,
    Downloading,
    ExtractingAudio,
    Transcribing,
    Generating,
    Cleanup,
    Completed,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Discovered,
        Stage::Downloading,
        Stage::ExtractingAudio,
        Stage::Transcribing,
        Stage::Generating,
        Stage::Cleanup,
        Stage::Completed,
    ];

    /// Stages that are executed by a worker pool.
    pub const WORK_STAGES: [Stage; 5] = [
        Stage::Downloading,
        Stage::ExtractingAudio,
        Stage::Transcribing,
        Stage::Generating,
        Stage::Cleanup,
    ];

    /// The stage that follows this one. Completed is its own successor.
    pub fn next(self) -> Stage {
        match self {
            Stage::Discovered => Stage::Downloading,
            Stage::Downloading => Stage::ExtractingAudio,
            Stage::ExtractingAudio => Stage::Transcribing,
            Stage::Transcribing => Stage::Generating,
            Stage::Generating => Stage::Cleanup,
            Stage::Cleanup | Stage::Completed => Stage::Completed,
        }
    }

    /// Whether the stage writes large artifacts and must pass storage admission.
    pub fn consumes_storage(self) -> bool {
        matches!(self, Stage::Downloading | Stage::ExtractingAudio)
    }

    pub fn is_work_stage(self) -> bool {
        !matches!(self, Stage::Discovered | Stage::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Discovered => "discovered",
            Stage::Downloading => "downloading",
            Stage::ExtractingAudio => "extracting_audio",
            Stage::Transcribing => "transcribing",
            Stage::Generating => "generating",
            Stage::Cleanup => "cleanup",
            Stage::Completed => "completed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = VidwikiError;

    fn from_str(s: &str) -> Result<Self> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| VidwikiError::InvalidInput(format!("Unknown stage: {}", s)))
    }
}

/// Lifecycle status of a task within its current stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Failed,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Failed,
        TaskStatus::Completed,
        TaskStatus::Cancelled,
    ];

    /// Terminal statuses only change through an explicit resubmit.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Completed | TaskStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Failed => "failed",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = VidwikiError;

    fn from_str(s: &str) -> Result<Self> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| VidwikiError::InvalidInput(format!("Unknown task status: {}", s)))
    }
}

/// Scheduling priority.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Numeric rank, higher is scheduled first.
    pub fn rank(self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
        }
    }

    pub fn from_rank(rank: i64) -> Priority {
        match rank {
            r if r >= 2 => Priority::High,
            1 => Priority::Normal,
            _ => Priority::Low,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// "Video `video_id` must have completed `stage`".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub video_id: String,
    pub stage: Stage,
}

impl Dependency {
    pub fn new(video_id: impl Into<String>, stage: Stage) -> Self {
        Self {
            video_id: video_id.into(),
            stage,
        }
    }

    /// Whether the given task state satisfies this dependency.
    pub fn satisfied_by(&self, task: Option<&VideoTask>) -> bool {
        match task {
            Some(task) => task.stage > self.stage || task.stage == Stage::Completed,
            None => false,
        }
    }
}

/// One video moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoTask {
    /// Video identifier, unique and immutable.
    pub id: String,
    pub stage: Stage,
    pub status: TaskStatus,
    pub priority: Priority,
    /// Failed attempts at the current stage.
    pub retry_count: u32,
    pub last_update: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Last error, present only while Failed.
    pub error_message: Option<String>,
    pub dependencies: Vec<Dependency>,
    /// Earliest time a retry may be dispatched.
    pub not_before: Option<DateTime<Utc>>,
    pub metadata: VideoMetadata,
}

impl VideoTask {
    /// A fresh task in `Discovered`, keyed by the metadata's video id.
    pub fn new(metadata: VideoMetadata, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            id: metadata.id.clone(),
            stage: Stage::Discovered,
            status: TaskStatus::Pending,
            priority,
            retry_count: 0,
            last_update: now,
            created_at: now,
            error_message: None,
            dependencies: Vec::new(),
            not_before: None,
            metadata,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Dependency>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Pending and past any retry backoff.
    pub fn is_dispatchable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.not_before.map_or(true, |t| t <= now)
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.not_before = None;
        self.last_update = now;
    }

    /// Move to the next stage with a fresh retry budget.
    pub fn advance(&mut self, now: DateTime<Utc>) {
        self.stage = self.stage.next();
        self.status = if self.stage == Stage::Completed {
            TaskStatus::Completed
        } else {
            TaskStatus::Pending
        };
        self.retry_count = 0;
        self.error_message = None;
        self.not_before = None;
        self.last_update = now;
    }

    /// Requeue at the same stage after a transient failure.
    pub fn schedule_retry(&mut self, delay: Duration, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.status = TaskStatus::Pending;
        self.error_message = None;
        let delay =
            chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365));
        self.not_before = Some(now + delay);
        self.last_update = now;
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.error_message = Some(error.into());
        self.not_before = None;
        self.last_update = now;
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Cancelled;
        self.error_message = None;
        self.not_before = None;
        self.last_update = now;
    }

    /// Back to Pending after an interrupted attempt, retry count unchanged.
    pub fn interrupt(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.last_update = now;
    }

    /// Back to Pending at the same stage with a fresh retry budget.
    pub fn resubmit(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.retry_count = 0;
        self.error_message = None;
        self.not_before = None;
        self.last_update = now;
    }
}

/// Ready-set order: priority descending, then oldest update, then id.
pub fn ready_order(a: &VideoTask, b: &VideoTask) -> Ordering {
    b.priority
        .rank()
        .cmp(&a.priority.rank())
        .then_with(|| a.last_update.cmp(&b.last_update))
        .then_with(|| a.id.cmp(&b.id))
}

/// What happened to a task, as recorded in the processing history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Enqueued,
    Promoted,
    Dispatched,
    Succeeded,
    Failed,
    RetryScheduled,
    Cancelled,
    Interrupted,
    Resubmitted,
}

impl HistoryKind {
    pub const ALL: [HistoryKind; 9] = [
        HistoryKind::Enqueued,
        HistoryKind::Promoted,
        HistoryKind::Dispatched,
        HistoryKind::Succeeded,
        HistoryKind::Failed,
        HistoryKind::RetryScheduled,
        HistoryKind::Cancelled,
        HistoryKind::Interrupted,
        HistoryKind::Resubmitted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HistoryKind::Enqueued => "enqueued",
            HistoryKind::Promoted => "promoted",
            HistoryKind::Dispatched => "dispatched",
            HistoryKind::Succeeded => "succeeded",
            HistoryKind::Failed => "failed",
            HistoryKind::RetryScheduled => "retry_scheduled",
            HistoryKind::Cancelled => "cancelled",
            HistoryKind::Interrupted => "interrupted",
            HistoryKind::Resubmitted => "resubmitted",
        }
    }
}

impl fmt::Display for HistoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HistoryKind {
    type Err = VidwikiError;

    fn from_str(s: &str) -> Result<Self> {
        HistoryKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| VidwikiError::InvalidInput(format!("Unknown history kind: {}", s)))
    }
}

/// A processing-history row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub video_id: String,
    pub stage: Stage,
    pub kind: HistoryKind,
    /// When the attempt this event concludes started.
    pub started_at: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl HistoryEvent {
    pub fn new(video_id: impl Into<String>, stage: Stage, kind: HistoryKind) -> Self {
        Self {
            video_id: video_id.into(),
            stage,
            kind,
            started_at: None,
            recorded_at: Utc::now(),
            error: None,
        }
    }

    pub fn started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Task counts by status and by stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    /// Unfinished tasks per stage.
    pub by_stage: BTreeMap<Stage, usize>,
}

impl TaskStats {
    pub fn record(&mut self, status: TaskStatus, stage: Stage, count: usize) {
        self.total += count;
        *self.by_status.entry(status.to_string()).or_default() += count;
        if !status.is_terminal() {
            *self.by_stage.entry(stage).or_default() += count;
        }
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

/// Durable map of video id to task, plus processing history.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<VideoTask>>;

    /// Insert a new task; fails with `DuplicateTask` if the id exists.
    async fn insert(&self, task: &VideoTask) -> Result<()>;

    /// Insert or replace a task.
    async fn upsert(&self, task: &VideoTask) -> Result<()>;

    /// All tasks, optionally restricted to one status, in ready-set order.
    async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<VideoTask>>;

    /// Dispatchable tasks of a stage whose dependencies are satisfied,
    /// in ready-set order, at most `limit`.
    async fn list_ready(
        &self,
        stage: Stage,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<VideoTask>>;

    async fn append_history(&self, event: &HistoryEvent) -> Result<()>;

    /// History of one video, oldest first.
    async fn history(&self, id: &str) -> Result<Vec<HistoryEvent>>;

    /// Return every Running task to Pending, retry count unchanged.
    /// Returns the ids of the recovered tasks.
    async fn recover_interrupted(&self) -> Result<Vec<String>>;

    async fn stats(&self) -> Result<TaskStats>;

    /// Earliest future `not_before` among Pending tasks.
    async fn earliest_backoff(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>>;
}
