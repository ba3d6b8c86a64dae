//! SQLite-backed task store.
//!
//! Timestamps are stored as integer microseconds so that ordering in SQL
//! matches ordering in Rust. The same database also journals storage ledger
//! entries.

use super::{
    Dependency, HistoryEvent, HistoryKind, Stage, TaskStats, TaskStatus, TaskStore, VideoTask,
};
use crate::error::{Result, VidwikiError};
use crate::source::VideoMetadata;
use crate::storage::{LedgerJournal, StorageEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    stage TEXT NOT NULL,
    status TEXT NOT NULL,
    priority INTEGER NOT NULL,
    retry_count INTEGER NOT NULL,
    last_update INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    error_message TEXT,
    dependencies TEXT NOT NULL,
    not_before INTEGER,
    metadata TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_ready ON tasks(stage, status, priority, last_update);

CREATE TABLE IF NOT EXISTS processing_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    video_id TEXT NOT NULL,
    stage TEXT NOT NULL,
    kind TEXT NOT NULL,
    started_at INTEGER,
    recorded_at INTEGER NOT NULL,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_history_video_id ON processing_history(video_id);

CREATE TABLE IF NOT EXISTS storage_entries (
    path TEXT PRIMARY KEY,
    video_id TEXT NOT NULL,
    artifact_type TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    tier TEXT NOT NULL,
    last_access INTEGER NOT NULL,
    tier_since INTEGER NOT NULL,
    retention_days INTEGER NOT NULL,
    pinned INTEGER NOT NULL
);
"#;

const TASK_COLUMNS: &str = "id, stage, status, priority, retry_count, last_update, created_at, \
                            error_message, dependencies, not_before, metadata";

/// SQLite-based task store.
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    /// Open (or create) a task database.
    #[instrument(skip_all)]
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL lets the CLI read status while the scheduler writes
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        info!("Initialized task store at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| VidwikiError::Store(format!("Failed to acquire lock: {}", e)))
    }

    fn load_task(conn: &Connection, id: &str) -> Result<Option<VideoTask>> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
        Ok(conn.query_row(&sql, params![id], read_task).optional()?)
    }

    fn write_task(conn: &Connection, task: &VideoTask) -> Result<()> {
        conn.execute(
            r#"
            INSERT OR REPLACE INTO tasks
            (id, stage, status, priority, retry_count, last_update, created_at,
             error_message, dependencies, not_before, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                task.id,
                task.stage.as_str(),
                task.status.as_str(),
                task.priority.rank(),
                task.retry_count,
                to_micros(task.last_update),
                to_micros(task.created_at),
                task.error_message,
                serde_json::to_string(&task.dependencies)?,
                task.not_before.map(to_micros),
                serde_json::to_string(&task.metadata)?,
            ],
        )?;
        Ok(())
    }

    fn write_history(conn: &Connection, event: &HistoryEvent) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO processing_history (video_id, stage, kind, started_at, recorded_at, error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                event.video_id,
                event.stage.as_str(),
                event.kind.as_str(),
                event.started_at.map(to_micros),
                to_micros(event.recorded_at),
                event.error,
            ],
        )?;
        Ok(())
    }
}

fn to_micros(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_micros()
}

fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = VidwikiError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn read_task(row: &Row<'_>) -> rusqlite::Result<VideoTask> {
    let dependencies: Vec<Dependency> = json_column(row, 8)?;
    let metadata: VideoMetadata = json_column(row, 10)?;
    let not_before: Option<i64> = row.get(9)?;

    Ok(VideoTask {
        id: row.get(0)?,
        stage: parse_column(row, 1)?,
        status: parse_column(row, 2)?,
        priority: super::Priority::from_rank(row.get(3)?),
        retry_count: row.get(4)?,
        last_update: from_micros(row.get(5)?),
        created_at: from_micros(row.get(6)?),
        error_message: row.get(7)?,
        dependencies,
        not_before: not_before.map(from_micros),
        metadata,
    })
}

fn read_history(row: &Row<'_>) -> rusqlite::Result<HistoryEvent> {
    let started_at: Option<i64> = row.get(3)?;
    Ok(HistoryEvent {
        video_id: row.get(0)?,
        stage: parse_column(row, 1)?,
        kind: parse_column::<HistoryKind>(row, 2)?,
        started_at: started_at.map(from_micros),
        recorded_at: from_micros(row.get(4)?),
        error: row.get(5)?,
    })
}

fn read_entry(row: &Row<'_>) -> rusqlite::Result<StorageEntry> {
    let path: String = row.get(0)?;
    let pinned: i64 = row.get(8)?;
    Ok(StorageEntry {
        path: PathBuf::from(path),
        video_id: row.get(1)?,
        artifact_type: parse_column(row, 2)?,
        size_bytes: row.get::<_, i64>(3)? as u64,
        tier: parse_column(row, 4)?,
        last_access: from_micros(row.get(5)?),
        tier_since: from_micros(row.get(6)?),
        retention_days: row.get(7)?,
        pinned: pinned != 0,
    })
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn get(&self, id: &str) -> Result<Option<VideoTask>> {
        let conn = self.lock()?;
        Self::load_task(&conn, id)
    }

    #[instrument(skip(self, task), fields(id = %task.id))]
    async fn insert(&self, task: &VideoTask) -> Result<()> {
        let conn = self.lock()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)",
            params![task.id],
            |row| row.get(0),
        )?;
        if exists {
            return Err(VidwikiError::DuplicateTask(task.id.clone()));
        }
        Self::write_task(&conn, task)?;
        debug!("Inserted task {}", task.id);
        Ok(())
    }

    async fn upsert(&self, task: &VideoTask) -> Result<()> {
        let conn = self.lock()?;
        Self::write_task(&conn, task)
    }

    async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<VideoTask>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM tasks WHERE (?1 IS NULL OR status = ?1) \
             ORDER BY priority DESC, last_update ASC, id ASC",
            TASK_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let tasks = stmt.query_map(params![status.map(|s| s.as_str())], read_task)?;
        Ok(tasks.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn list_ready(
        &self,
        stage: Stage,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<VideoTask>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM tasks \
             WHERE stage = ?1 AND status = 'pending' AND (not_before IS NULL OR not_before <= ?2) \
             ORDER BY priority DESC, last_update ASC, id ASC",
            TASK_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let candidates = stmt
            .query_map(params![stage.as_str(), to_micros(now)], read_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut ready = Vec::new();
        for task in candidates {
            if ready.len() >= limit {
                break;
            }
            let mut satisfied = true;
            for dep in &task.dependencies {
                let upstream = Self::load_task(&conn, &dep.video_id)?;
                if !dep.satisfied_by(upstream.as_ref()) {
                    satisfied = false;
                    break;
                }
            }
            if satisfied {
                ready.push(task);
            }
        }
        Ok(ready)
    }

    async fn append_history(&self, event: &HistoryEvent) -> Result<()> {
        let conn = self.lock()?;
        Self::write_history(&conn, event)
    }

    async fn history(&self, id: &str) -> Result<Vec<HistoryEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT video_id, stage, kind, started_at, recorded_at, error
            FROM processing_history
            WHERE video_id = ?1
            ORDER BY id ASC
            "#,
        )?;
        let events = stmt.query_map(params![id], read_history)?;
        Ok(events.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    #[instrument(skip(self))]
    async fn recover_interrupted(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let now = Utc::now();
        let tx = conn.unchecked_transaction()?;

        let interrupted: Vec<(String, String)> = {
            let mut stmt =
                tx.prepare("SELECT id, stage FROM tasks WHERE status = 'running' ORDER BY id")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        for (id, stage) in &interrupted {
            tx.execute(
                "UPDATE tasks SET status = 'pending', last_update = ?2 WHERE id = ?1",
                params![id, to_micros(now)],
            )?;
            let stage: Stage = stage.parse()?;
            let event = HistoryEvent::new(id.as_str(), stage, HistoryKind::Interrupted);
            Self::write_history(&tx, &event)?;
        }

        tx.commit()?;

        if !interrupted.is_empty() {
            warn!("Recovered {} interrupted tasks", interrupted.len());
        }
        Ok(interrupted.into_iter().map(|(id, _)| id).collect())
    }

    async fn stats(&self) -> Result<TaskStats> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT status, stage, COUNT(*) FROM tasks GROUP BY status, stage")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                parse_column::<TaskStatus>(row, 0)?,
                parse_column::<Stage>(row, 1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut stats = TaskStats::default();
        for row in rows {
            let (status, stage, count) = row?;
            stats.record(status, stage, count as usize);
        }
        Ok(stats)
    }

    async fn earliest_backoff(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let earliest: Option<i64> = conn.query_row(
            "SELECT MIN(not_before) FROM tasks WHERE status = 'pending' AND not_before > ?1",
            params![to_micros(now)],
            |row| row.get(0),
        )?;
        Ok(earliest.map(from_micros))
    }
}

impl LedgerJournal for SqliteTaskStore {
    fn save_entry(&self, entry: &StorageEntry) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO storage_entries
            (path, video_id, artifact_type, size_bytes, tier,
             last_access, tier_since, retention_days, pinned)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                entry.path.to_string_lossy(),
                entry.video_id,
                entry.artifact_type.as_str(),
                entry.size_bytes as i64,
                entry.tier.as_str(),
                to_micros(entry.last_access),
                to_micros(entry.tier_since),
                entry.retention_days,
                entry.pinned as i64,
            ],
        )?;
        Ok(())
    }

    fn record_access(&self, path: &Path, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE storage_entries SET last_access = ?2 WHERE path = ?1",
            params![path.to_string_lossy(), to_micros(at)],
        )?;
        Ok(())
    }

    fn remove_entry(&self, path: &Path) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM storage_entries WHERE path = ?1",
            params![path.to_string_lossy()],
        )?;
        Ok(())
    }

    fn load_entries(&self) -> Result<Vec<StorageEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT path, video_id, artifact_type, size_bytes, tier, last_access, tier_since,
                   retention_days, pinned
            FROM storage_entries
            ORDER BY path
            "#,
        )?;
        let entries = stmt.query_map([], read_entry)?;
        Ok(entries.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
