//! In-memory task store.
//!
//! Useful for tests and dry runs.

use super::{
    ready_order, HistoryEvent, HistoryKind, Stage, TaskStats, TaskStatus, TaskStore, VideoTask,
};
use crate::error::{Result, VidwikiError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, VideoTask>,
    history: Vec<HistoryEvent>,
}

/// In-memory task store.
pub struct MemoryTaskStore {
    inner: RwLock<Inner>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|e| VidwikiError::Store(format!("Failed to acquire lock: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|e| VidwikiError::Store(format!("Failed to acquire lock: {}", e)))
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn get(&self, id: &str) -> Result<Option<VideoTask>> {
        Ok(self.read()?.tasks.get(id).cloned())
    }

    async fn insert(&self, task: &VideoTask) -> Result<()> {
        let mut inner = self.write()?;
        if inner.tasks.contains_key(&task.id) {
            return Err(VidwikiError::DuplicateTask(task.id.clone()));
        }
        inner.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn upsert(&self, task: &VideoTask) -> Result<()> {
        self.write()?.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<VideoTask>> {
        let inner = self.read()?;
        let mut tasks: Vec<VideoTask> = inner
            .tasks
            .values()
            .filter(|t| status.map_or(true, |s| s == t.status))
            .cloned()
            .collect();
        tasks.sort_by(ready_order);
        Ok(tasks)
    }

    async fn list_ready(
        &self,
        stage: Stage,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<VideoTask>> {
        let inner = self.read()?;
        let mut ready: Vec<VideoTask> = inner
            .tasks
            .values()
            .filter(|t| t.stage == stage && t.is_dispatchable_at(now))
            .filter(|t| {
                t.dependencies
                    .iter()
                    .all(|dep| dep.satisfied_by(inner.tasks.get(&dep.video_id)))
            })
            .cloned()
            .collect();
        ready.sort_by(ready_order);
        ready.truncate(limit);
        Ok(ready)
    }

    async fn append_history(&self, event: &HistoryEvent) -> Result<()> {
        self.write()?.history.push(event.clone());
        Ok(())
    }

    async fn history(&self, id: &str) -> Result<Vec<HistoryEvent>> {
        Ok(self
            .read()?
            .history
            .iter()
            .filter(|e| e.video_id == id)
            .cloned()
            .collect())
    }

    async fn recover_interrupted(&self) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut inner = self.write()?;
        let mut recovered = Vec::new();
        let mut events = Vec::new();

        for task in inner.tasks.values_mut().filter(|t| t.status == TaskStatus::Running) {
            task.interrupt(now);
            events.push(HistoryEvent::new(&task.id, task.stage, HistoryKind::Interrupted));
            recovered.push(task.id.clone());
        }
        inner.history.extend(events);

        recovered.sort();
        Ok(recovered)
    }

    async fn stats(&self) -> Result<TaskStats> {
        let mut stats = TaskStats::default();
        for task in self.read()?.tasks.values() {
            stats.record(task.status, task.stage, 1);
        }
        Ok(stats)
    }

    async fn earliest_backoff(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .read()?
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter_map(|t| t.not_before)
            .filter(|t| *t > now)
            .min())
    }
}
