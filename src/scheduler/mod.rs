//! Task scheduler.
//!
//! One decision loop owns every state transition. Each pass applies finished
//! stage results, promotes discovered videos, and dispatches ready tasks to
//! per-stage worker pools, asking the storage ledger for admission before any
//! stage that writes large files. Workers run on tokio tasks and report back
//! over a channel; they never touch the task store themselves.
//!
//! Later stages are dispatched first so videos already holding storage can
//! finish and release it before new downloads compete for the budget.

mod graph;
mod pool;

pub use graph::check_acyclic;
pub use pool::WorkerPools;

use crate::config::{SchedulerSettings, SizeEstimates};
use crate::error::{ErrorClass, Result, VidwikiError};
use crate::pipeline::{StageOutput, StageRunner};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::source::VideoMetadata;
use crate::storage::{Reservation, StorageLedger};
use crate::task::{HistoryEvent, HistoryKind, Stage, TaskStatus, TaskStore, VideoTask};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Discovered tasks promoted per pass.
const PROMOTE_BATCH: usize = 256;

/// How long shutdown waits for a cancelled worker to report.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Result of a direct `dispatch` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A worker is running the task's stage.
    Started,
    /// The stage's pool has no free slot.
    PoolSaturated,
    /// The task is waiting out a retry backoff.
    BackingOff(DateTime<Utc>),
}

/// Counters for one pass or a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub passes: usize,
    pub promoted: usize,
    pub dispatched: usize,
    /// Stage attempts that succeeded without finishing the video.
    pub advanced: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    pub interrupted: usize,
    /// Results dropped because the task was cancelled meanwhile.
    pub discarded: usize,
    pub admission_denials: usize,
}

impl RunReport {
    fn record(&mut self, applied: Applied) {
        match applied {
            Applied::Advanced => self.advanced += 1,
            Applied::Completed => self.completed += 1,
            Applied::Retried => self.retried += 1,
            Applied::Failed => self.failed += 1,
            Applied::Interrupted => self.interrupted += 1,
            Applied::Discarded => self.discarded += 1,
        }
    }

    fn merge(&mut self, other: &RunReport) {
        self.passes += other.passes;
        self.promoted += other.promoted;
        self.dispatched += other.dispatched;
        self.advanced += other.advanced;
        self.completed += other.completed;
        self.retried += other.retried;
        self.failed += other.failed;
        self.interrupted += other.interrupted;
        self.discarded += other.discarded;
        self.admission_denials += other.admission_denials;
    }
}

/// What applying a stage result did to the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Advanced,
    Completed,
    Retried,
    Failed,
    Interrupted,
    Discarded,
}

enum Admission {
    Granted(Option<Reservation>),
    Denied(u64),
}

/// A worker's message back to the loop.
struct StageReport {
    video_id: String,
    stage: Stage,
    started_at: DateTime<Utc>,
    result: Result<StageOutput>,
}

struct InFlight {
    cancel: CancellationToken,
    reservation: Option<Reservation>,
}

/// Drives videos through the pipeline stages.
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    ledger: Arc<StorageLedger>,
    runner: Arc<StageRunner>,
    policy: RetryPolicy,
    settings: SchedulerSettings,
    estimates: SizeEstimates,
    pools: WorkerPools,
    running: Mutex<HashMap<String, InFlight>>,
    reports_tx: mpsc::UnboundedSender<StageReport>,
    reports_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<StageReport>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        ledger: Arc<StorageLedger>,
        runner: Arc<StageRunner>,
        settings: SchedulerSettings,
        estimates: SizeEstimates,
    ) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Self {
            store,
            ledger,
            runner,
            policy: RetryPolicy::from_settings(&settings),
            pools: WorkerPools::new(&settings.concurrency),
            settings,
            estimates,
            running: Mutex::new(HashMap::new()),
            reports_tx,
            reports_rx: tokio::sync::Mutex::new(reports_rx),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<StorageLedger> {
        &self.ledger
    }

    /// Number of stage attempts currently running.
    pub fn in_flight(&self) -> Result<usize> {
        Ok(self.lock_running()?.len())
    }

    /// Add a new task in `Pending`.
    ///
    /// Fails with `DuplicateTask` if the id is known and with
    /// `DependencyCycle` if its dependencies lead back to it.
    pub async fn enqueue(&self, mut task: VideoTask) -> Result<()> {
        if self.store.get(&task.id).await?.is_some() {
            return Err(VidwikiError::DuplicateTask(task.id));
        }
        let existing = self.store.list(None).await?;
        check_acyclic(&task, &existing)?;

        let now = Utc::now();
        task.status = TaskStatus::Pending;
        task.retry_count = 0;
        task.error_message = None;
        task.last_update = now;

        self.store.insert(&task).await?;
        self.record(HistoryEvent::new(&task.id, task.stage, HistoryKind::Enqueued))
            .await?;
        info!(id = %task.id, priority = %task.priority, "Enqueued {}", task.metadata.title);
        Ok(())
    }

    /// Reset tasks a previous process left `Running`. Call once at start-up.
    pub async fn recover(&self) -> Result<Vec<String>> {
        let ids = self.store.recover_interrupted().await?;
        if !ids.is_empty() {
            warn!("Recovered {} interrupted task(s): {}", ids.len(), ids.join(", "));
        }
        Ok(ids)
    }

    /// One scheduling pass. Never waits for a worker.
    pub async fn run_once(&self) -> Result<RunReport> {
        let mut report = RunReport {
            passes: 1,
            ..RunReport::default()
        };

        while let Some(stage_report) = self.try_next_report().await {
            if let Some(applied) = self.apply_logged(stage_report).await {
                report.record(applied);
            }
        }

        self.observe_cancellations().await?;

        let now = Utc::now();
        report.promoted = self.promote_discovered(now).await?;

        for stage in Stage::WORK_STAGES.into_iter().rev() {
            self.dispatch_stage(stage, now, &mut report).await?;
        }

        Ok(report)
    }

    /// Run until `shutdown` fires, then stop in-flight work.
    ///
    /// Workers stopped by shutdown put their tasks back to `Pending` with the
    /// retry count unchanged.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<RunReport> {
        let mut total = RunReport::default();
        info!("Scheduler started");

        while !shutdown.is_cancelled() {
            let pass = self.run_once().await?;
            let wait = self.next_wait(&pass).await?;
            if pass.dispatched > 0 || pass.promoted > 0 {
                debug!("Pass dispatched {}, promoted {}", pass.dispatched, pass.promoted);
            }
            total.merge(&pass);

            let received = tokio::select! {
                _ = shutdown.cancelled() => None,
                report = self.next_report(wait) => report,
            };
            if let Some(report) = received {
                if let Some(applied) = self.apply_logged(report).await {
                    total.record(applied);
                }
            }
        }

        info!("Shutting down, stopping {} worker(s)", self.in_flight()?);
        self.stop_in_flight(&mut total).await?;
        Ok(total)
    }

    /// Run passes until nothing is running and nothing can be dispatched,
    /// sleeping through retry backoffs.
    pub async fn run_until_idle(&self) -> Result<RunReport> {
        let mut total = RunReport::default();

        loop {
            let pass = self.run_once().await?;
            total.merge(&pass);
            let in_flight = self.in_flight()?;

            if in_flight == 0 && pass.dispatched == 0 && pass.promoted == 0 {
                if pass.admission_denials > 0 {
                    warn!("Stopping with tasks waiting for storage");
                    break;
                }
                let now = Utc::now();
                match self.store.earliest_backoff(now).await? {
                    Some(until) => {
                        let wait = (until - now).to_std().unwrap_or(Duration::ZERO);
                        debug!("Idle until backoff ends in {:?}", wait);
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    None => break,
                }
            }

            if in_flight > 0 {
                if let Some(report) = self.next_report(self.settings.poll_interval()).await {
                    if let Some(applied) = self.apply_logged(report).await {
                        total.record(applied);
                    }
                }
            }
        }

        Ok(total)
    }

    /// Try to start one task now, bypassing the ready-set order.
    ///
    /// Unsatisfied dependencies and a denied admission are errors here; the
    /// loop treats both as "not ready yet".
    pub async fn dispatch(&self, id: &str) -> Result<DispatchOutcome> {
        let now = Utc::now();
        let mut task = self.require(id).await?;

        if task.status != TaskStatus::Pending {
            return Err(VidwikiError::InvalidTransition {
                id: id.to_string(),
                reason: format!("task is {}", task.status),
            });
        }
        if self.lock_running()?.contains_key(id) {
            return Err(VidwikiError::InvalidTransition {
                id: id.to_string(),
                reason: "previous attempt is still stopping".into(),
            });
        }
        for dep in &task.dependencies {
            let other = self.store.get(&dep.video_id).await?;
            if !dep.satisfied_by(other.as_ref()) {
                return Err(VidwikiError::DependencyUnsatisfied(format!(
                    "{} needs {} past {}",
                    id, dep.video_id, dep.stage
                )));
            }
        }
        if let Some(until) = task.not_before.filter(|t| *t > now) {
            return Ok(DispatchOutcome::BackingOff(until));
        }

        if task.stage == Stage::Discovered {
            self.promote(&mut task, now).await?;
        }

        let backlog = match task.stage {
            Stage::Downloading => self.extraction_backlog().await?,
            _ => 0,
        };
        let reservation = match self.admit(&task, backlog)? {
            Admission::Granted(reservation) => reservation,
            Admission::Denied(requested) => {
                let stats = self.ledger.stats()?;
                let in_use = stats.hot_bytes + stats.warm_bytes + stats.reserved_bytes;
                return Err(VidwikiError::StorageExhausted {
                    requested,
                    available: stats.budget_bytes.saturating_sub(in_use),
                });
            }
        };

        let Some(permit) = self.pools.try_acquire(task.stage) else {
            self.settle(reservation)?;
            return Ok(DispatchOutcome::PoolSaturated);
        };

        self.start(task, reservation, permit).await?;
        Ok(DispatchOutcome::Started)
    }

    /// Cancel a pending or running task. Running work is signalled and its
    /// result discarded when it arrives.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let task = cancel_in_store(self.store.as_ref(), id).await?;

        if let Some(in_flight) = self.lock_running()?.get(id) {
            in_flight.cancel.cancel();
        }
        let unpinned = self.ledger.unpin_video(id)?;
        info!(id, stage = %task.stage, "Cancelled ({} artifact(s) released to sweeping)", unpinned);
        Ok(())
    }

    /// Put a failed or cancelled task back in line at its current stage.
    pub async fn resubmit(&self, id: &str) -> Result<()> {
        let mut task = self.require(id).await?;
        if !matches!(task.status, TaskStatus::Failed | TaskStatus::Cancelled) {
            return Err(VidwikiError::InvalidTransition {
                id: id.to_string(),
                reason: format!(
                    "only failed or cancelled tasks can be resubmitted, task is {}",
                    task.status
                ),
            });
        }
        if self.lock_running()?.contains_key(id) {
            return Err(VidwikiError::InvalidTransition {
                id: id.to_string(),
                reason: "previous attempt is still stopping".into(),
            });
        }

        task.resubmit(Utc::now());
        self.store.upsert(&task).await?;
        self.record(HistoryEvent::new(id, task.stage, HistoryKind::Resubmitted))
            .await?;
        info!(id, stage = %task.stage, "Resubmitted");
        Ok(())
    }

    async fn require(&self, id: &str) -> Result<VideoTask> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| VidwikiError::TaskNotFound(id.to_string()))
    }

    async fn record(&self, event: HistoryEvent) -> Result<()> {
        self.store.append_history(&event).await
    }

    fn lock_running(&self) -> Result<MutexGuard<'_, HashMap<String, InFlight>>> {
        self.running
            .lock()
            .map_err(|e| VidwikiError::Store(format!("Failed to acquire lock: {}", e)))
    }

    fn settle(&self, reservation: Option<Reservation>) -> Result<()> {
        match reservation {
            Some(reservation) => self.ledger.settle(reservation),
            None => Ok(()),
        }
    }

    /// Discovered has no worker; ready discovered tasks move straight on.
    async fn promote_discovered(&self, now: DateTime<Utc>) -> Result<usize> {
        let ready = self.store.list_ready(Stage::Discovered, PROMOTE_BATCH, now).await?;
        let count = ready.len();
        for mut task in ready {
            self.promote(&mut task, now).await?;
        }
        Ok(count)
    }

    async fn promote(&self, task: &mut VideoTask, now: DateTime<Utc>) -> Result<()> {
        task.advance(now);
        self.store.upsert(task).await?;
        self.record(HistoryEvent::new(&task.id, Stage::Discovered, HistoryKind::Promoted))
            .await?;
        debug!(id = %task.id, "Promoted to {}", task.stage);
        Ok(())
    }

    /// Fill the stage's free slots in ready order.
    async fn dispatch_stage(
        &self,
        stage: Stage,
        now: DateTime<Utc>,
        report: &mut RunReport,
    ) -> Result<()> {
        let free = self.pools.available(stage);
        if free == 0 {
            debug!("{} pool saturated", stage);
            return Ok(());
        }

        let candidates = self.store.list_ready(stage, free, now).await?;
        let mut backlog = match stage {
            Stage::Downloading if !candidates.is_empty() => self.extraction_backlog().await?,
            _ => 0,
        };
        for task in candidates {
            if self.lock_running()?.contains_key(&task.id) {
                continue;
            }

            // A denial stops the stage so nothing of lower priority overtakes.
            let reservation = match self.admit(&task, backlog)? {
                Admission::Granted(reservation) => reservation,
                Admission::Denied(requested) => {
                    debug!(id = %task.id, "Admission denied for {} bytes", requested);
                    report.admission_denials += 1;
                    break;
                }
            };

            let Some(permit) = self.pools.try_acquire(stage) else {
                self.settle(reservation)?;
                break;
            };

            if stage == Stage::Downloading {
                backlog += self.audio_estimate(&task);
            }
            self.start(task, reservation, permit).await?;
            report.dispatched += 1;
        }
        Ok(())
    }

    /// Ask the ledger for the stage's estimated bytes.
    ///
    /// A download must also leave room for its own audio track and for the
    /// audio of every `backlog` video that is downloading or waiting to
    /// extract, otherwise downloads can fill the budget and starve the
    /// extraction that would free it.
    fn admit(&self, task: &VideoTask, backlog: u64) -> Result<Admission> {
        if !task.stage.consumes_storage() {
            return Ok(Admission::Granted(None));
        }
        let estimate = self
            .estimates
            .for_stage(task.stage, task.metadata.duration_seconds);
        let headroom = match task.stage {
            Stage::Downloading => backlog.saturating_add(self.audio_estimate(task)),
            _ => 0,
        };
        match self.ledger.admit_with_headroom(estimate, headroom)? {
            Some(reservation) => Ok(Admission::Granted(Some(reservation))),
            None => Ok(Admission::Denied(estimate)),
        }
    }

    fn audio_estimate(&self, task: &VideoTask) -> u64 {
        self.estimates
            .for_stage(Stage::ExtractingAudio, task.metadata.duration_seconds)
    }

    /// Audio bytes still owed to videos that are downloading or waiting to
    /// extract. Running extractions already hold a reservation.
    async fn extraction_backlog(&self) -> Result<u64> {
        let mut owed = 0u64;
        for status in [TaskStatus::Running, TaskStatus::Pending] {
            for task in self.store.list(Some(status)).await? {
                let waiting = match task.stage {
                    Stage::Downloading => status == TaskStatus::Running,
                    Stage::ExtractingAudio => status == TaskStatus::Pending,
                    _ => false,
                };
                if waiting {
                    owed = owed.saturating_add(self.audio_estimate(&task));
                }
            }
        }
        Ok(owed)
    }

    async fn start(
        &self,
        mut task: VideoTask,
        reservation: Option<Reservation>,
        permit: OwnedSemaphorePermit,
    ) -> Result<()> {
        let started_at = Utc::now();
        task.mark_running(started_at);

        let marked = async {
            self.store.upsert(&task).await?;
            self.record(
                HistoryEvent::new(&task.id, task.stage, HistoryKind::Dispatched)
                    .started_at(started_at),
            )
            .await
        };
        if let Err(e) = marked.await {
            self.settle(reservation)?;
            return Err(e);
        }

        let cancel = CancellationToken::new();
        self.lock_running()?.insert(
            task.id.clone(),
            InFlight {
                cancel: cancel.clone(),
                reservation,
            },
        );
        info!(id = %task.id, stage = %task.stage, retry = task.retry_count, "Dispatched");

        let runner = self.runner.clone();
        let reports = self.reports_tx.clone();
        tokio::spawn(async move {
            let result = runner.run(&task, &cancel).await;
            drop(permit);
            let _ = reports.send(StageReport {
                video_id: task.id,
                stage: task.stage,
                started_at,
                result,
            });
        });
        Ok(())
    }

    /// Pick up changes other processes made through the shared store and
    /// journal: reload the ledger, signal workers whose task was cancelled,
    /// and unpin the files of tasks that were cancelled or failed while idle.
    async fn observe_cancellations(&self) -> Result<()> {
        self.ledger.refresh()?;

        let watched: Vec<(String, CancellationToken)> = self
            .lock_running()?
            .iter()
            .filter(|(_, in_flight)| !in_flight.cancel.is_cancelled())
            .map(|(id, in_flight)| (id.clone(), in_flight.cancel.clone()))
            .collect();

        for (id, token) in watched {
            let cancelled = self
                .store
                .get(&id)
                .await?
                .is_some_and(|task| task.status == TaskStatus::Cancelled);
            if cancelled {
                info!(id, "Cancelled externally, stopping worker");
                token.cancel();
            }
        }

        let pinned: BTreeSet<String> = self
            .ledger
            .entries()?
            .into_iter()
            .filter(|e| e.pinned)
            .map(|e| e.video_id)
            .collect();
        for id in pinned {
            if self.lock_running()?.contains_key(&id) {
                continue;
            }
            let settled = match self.store.get(&id).await? {
                Some(task) => matches!(task.status, TaskStatus::Cancelled | TaskStatus::Failed),
                None => true,
            };
            if settled {
                let unpinned = self.ledger.unpin_video(&id)?;
                info!(id, "Released {} artifact(s) of a stopped task", unpinned);
            }
        }
        Ok(())
    }

    async fn try_next_report(&self) -> Option<StageReport> {
        self.reports_rx.lock().await.try_recv().ok()
    }

    /// Wait up to `wait` for a worker to report.
    async fn next_report(&self, wait: Duration) -> Option<StageReport> {
        let mut reports = self.reports_rx.lock().await;
        tokio::time::timeout(wait, reports.recv()).await.ok().flatten()
    }

    async fn next_wait(&self, pass: &RunReport) -> Result<Duration> {
        if pass.admission_denials > 0 {
            return Ok(self.settings.admission_backoff());
        }
        let mut wait = self.settings.poll_interval();
        let now = Utc::now();
        if let Some(until) = self.store.earliest_backoff(now).await? {
            let remaining = (until - now).to_std().unwrap_or(Duration::ZERO);
            wait = wait.min(remaining.max(Duration::from_millis(10)));
        }
        Ok(wait)
    }

    /// Apply a report, logging instead of propagating so one video's
    /// bookkeeping problem does not stop the loop.
    async fn apply_logged(&self, report: StageReport) -> Option<Applied> {
        let id = report.video_id.clone();
        match self.apply(report).await {
            Ok(applied) => Some(applied),
            Err(e) => {
                warn!(id, "Failed to apply stage result: {}", e);
                None
            }
        }
    }

    async fn apply(&self, report: StageReport) -> Result<Applied> {
        let in_flight = self.lock_running()?.remove(&report.video_id);
        if let Some(in_flight) = in_flight {
            self.settle(in_flight.reservation)?;
        }

        let now = Utc::now();
        let current = self.store.get(&report.video_id).await?;
        let task = match current {
            Some(task) if task.status == TaskStatus::Running && task.stage == report.stage => task,
            other => {
                debug!(
                    id = %report.video_id,
                    stage = %report.stage,
                    "Discarding stale stage result"
                );
                discard_output(report.result);
                if other.is_some_and(|task| task.status.is_terminal()) {
                    self.ledger.unpin_video(&report.video_id)?;
                }
                return Ok(Applied::Discarded);
            }
        };

        let (stage, started_at) = (report.stage, report.started_at);
        match report.result {
            Ok(output) => self.apply_success(task, stage, started_at, output, now).await,
            Err(error) => self.apply_failure(task, stage, started_at, error, now).await,
        }
    }

    async fn apply_success(
        &self,
        mut task: VideoTask,
        stage: Stage,
        started_at: DateTime<Utc>,
        output: StageOutput,
        now: DateTime<Utc>,
    ) -> Result<Applied> {
        // Inputs first, so registering the outputs can evict them.
        for path in &output.consumed {
            self.ledger.unpin(path)?;
        }
        for artifact in output.artifacts {
            self.ledger.register(artifact)?;
        }

        task.advance(now);
        self.store.upsert(&task).await?;
        self.record(
            HistoryEvent::new(&task.id, stage, HistoryKind::Succeeded).started_at(started_at),
        )
        .await?;

        if task.status == TaskStatus::Completed {
            info!(id = %task.id, "Completed");
            let sweep = self.ledger.sweep()?;
            if !sweep.is_empty() {
                info!(
                    "Sweep after completion: {} warmed, {} cooled, {} deleted, {} bytes freed",
                    sweep.warmed.len(),
                    sweep.cooled.len(),
                    sweep.deleted.len(),
                    sweep.freed_bytes
                );
            }
            self.update_index().await;
            Ok(Applied::Completed)
        } else {
            info!(id = %task.id, "{} done, next {}", stage, task.stage);
            Ok(Applied::Advanced)
        }
    }

    async fn apply_failure(
        &self,
        mut task: VideoTask,
        stage: Stage,
        started_at: DateTime<Utc>,
        error: VidwikiError,
        now: DateTime<Utc>,
    ) -> Result<Applied> {
        let class = error.class();
        let message = error.to_string();

        // Stopped without a cancel in the store: shutdown, not a failure.
        if class == ErrorClass::Cancelled {
            task.interrupt(now);
            self.store.upsert(&task).await?;
            self.record(
                HistoryEvent::new(&task.id, stage, HistoryKind::Interrupted)
                    .started_at(started_at)
                    .with_error(&message),
            )
            .await?;
            info!(id = %task.id, "{} interrupted", stage);
            return Ok(Applied::Interrupted);
        }

        self.record(
            HistoryEvent::new(&task.id, stage, HistoryKind::Failed)
                .started_at(started_at)
                .with_error(&message),
        )
        .await?;

        let max_retries = self.settings.max_retries_for(stage);
        match self.policy.decide(class, task.retry_count, max_retries) {
            RetryDecision::RetryAfter(delay) => {
                task.schedule_retry(delay, now);
                self.store.upsert(&task).await?;
                let note = format!(
                    "retry {}/{} after {}ms",
                    task.retry_count,
                    max_retries,
                    delay.as_millis()
                );
                self.record(
                    HistoryEvent::new(&task.id, stage, HistoryKind::RetryScheduled)
                        .with_error(note),
                )
                .await?;
                warn!(
                    id = %task.id,
                    "{} failed ({}), retry {}/{} in {:?}",
                    stage,
                    message,
                    task.retry_count,
                    max_retries,
                    delay
                );
                Ok(Applied::Retried)
            }
            RetryDecision::Fail => {
                task.fail(&message, now);
                self.store.upsert(&task).await?;
                self.ledger.unpin_video(&task.id)?;
                warn!(id = %task.id, "{} failed permanently ({}): {}", stage, class, message);
                Ok(Applied::Failed)
            }
        }
    }

    /// Rewrite the index of completed videos. Failures are logged only; the
    /// next completion writes it again.
    async fn update_index(&self) {
        let written: Result<PathBuf> = async {
            let mut videos: Vec<VideoMetadata> = self
                .store
                .list(Some(TaskStatus::Completed))
                .await?
                .into_iter()
                .map(|task| task.metadata)
                .collect();
            videos.sort_by(|a, b| {
                b.published_at
                    .cmp(&a.published_at)
                    .then_with(|| a.id.cmp(&b.id))
            });
            self.runner.write_index(&videos).await
        }
        .await;

        match written {
            Ok(path) => debug!("Index updated at {:?}", path),
            Err(e) => warn!("Failed to update index: {}", e),
        }
    }

    /// Cancel every worker and wait for their reports.
    async fn stop_in_flight(&self, total: &mut RunReport) -> Result<()> {
        for in_flight in self.lock_running()?.values() {
            in_flight.cancel.cancel();
        }

        while self.in_flight()? > 0 {
            match self.next_report(SHUTDOWN_GRACE).await {
                Some(report) => {
                    if let Some(applied) = self.apply_logged(report).await {
                        total.record(applied);
                    }
                }
                None => {
                    warn!(
                        "{} worker(s) did not stop in time; they will be recovered on next start",
                        self.in_flight()?
                    );
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Mark a task cancelled in the store, without touching any worker or ledger.
///
/// This is all another process can do; a running scheduler observes the
/// status on its next pass, stops the worker and releases the files.
pub async fn cancel_in_store(store: &dyn TaskStore, id: &str) -> Result<VideoTask> {
    let mut task = store
        .get(id)
        .await?
        .ok_or_else(|| VidwikiError::TaskNotFound(id.to_string()))?;
    if task.status.is_terminal() {
        return Err(VidwikiError::InvalidTransition {
            id: id.to_string(),
            reason: format!("task is already {}", task.status),
        });
    }

    task.cancel(Utc::now());
    store.upsert(&task).await?;
    store
        .append_history(&HistoryEvent::new(id, task.stage, HistoryKind::Cancelled))
        .await?;
    Ok(task)
}

/// Remove files produced by a result nobody will register.
fn discard_output(result: Result<StageOutput>) {
    let Ok(output) = result else {
        return;
    };
    for artifact in output.artifacts {
        match std::fs::remove_file(&artifact.path) {
            Ok(()) => debug!("Removed discarded {:?}", artifact.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove discarded {:?}: {}", artifact.path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetentionSettings, StageConcurrency};
    use crate::pipeline::fakes::{collaborators, FakeTools};
    use crate::pipeline::{ArtifactDirs, INDEX_FILE};
    use crate::storage::{ArtifactType, LedgerConfig, LedgerJournal, NewArtifact};
    use crate::task::{MemoryTaskStore, SqliteTaskStore};
    use crate::task::tests::task;
    use crate::task::{Dependency, Priority};
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    struct Harness {
        scheduler: Scheduler,
        store: Arc<MemoryTaskStore>,
        ledger: Arc<StorageLedger>,
        tools: Arc<FakeTools>,
        dir: TempDir,
    }

    fn fast_settings() -> SchedulerSettings {
        SchedulerSettings {
            backoff_base_ms: 1,
            backoff_cap_ms: 1_000,
            poll_interval_ms: 50,
            admission_backoff_ms: 50,
            ..SchedulerSettings::default()
        }
    }

    fn ledger_config(budget_bytes: u64) -> LedgerConfig {
        LedgerConfig {
            budget_bytes,
            cleanup_threshold: 0.8,
            cold_budget_bytes: None,
            cold_dir: None,
            retention: RetentionSettings::default(),
        }
    }

    fn harness_with(settings: SchedulerSettings, budget_bytes: u64) -> Harness {
        let estimates = SizeEstimates {
            video_bytes_per_second: 10,
            audio_bytes_per_second: 1,
            default_video_bytes: 1_000,
        };
        harness_with_estimates(settings, budget_bytes, estimates)
    }

    fn harness_with_estimates(
        settings: SchedulerSettings,
        budget_bytes: u64,
        estimates: SizeEstimates,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryTaskStore::new());
        let ledger = Arc::new(StorageLedger::new(ledger_config(budget_bytes)));
        let tools = Arc::new(FakeTools::default());
        let runner = Arc::new(StageRunner::new(
            collaborators(&tools),
            ledger.clone(),
            ArtifactDirs::under(dir.path()),
        ));
        let scheduler = Scheduler::new(store.clone(), ledger.clone(), runner, settings, estimates);

        Harness {
            scheduler,
            store,
            ledger,
            tools,
            dir,
        }
    }

    fn harness() -> Harness {
        harness_with(fast_settings(), 1_000_000)
    }

    /// Wait for one worker report and apply it.
    async fn settle_one(scheduler: &Scheduler) -> Applied {
        let report = scheduler
            .next_report(Duration::from_secs(5))
            .await
            .expect("worker did not report");
        scheduler.apply(report).await.unwrap()
    }

    async fn get(h: &Harness, id: &str) -> VideoTask {
        h.store.get(id).await.unwrap().unwrap()
    }

    /// Drive a task until its transcription is running.
    async fn run_to_transcribing(h: &Harness, id: &str) {
        h.tools.hang_transcription.store(true, Ordering::SeqCst);
        h.scheduler.enqueue(task(id, Priority::Normal)).await.unwrap();
        for _ in 0..2 {
            h.scheduler.run_once().await.unwrap();
            assert_eq!(settle_one(&h.scheduler).await, Applied::Advanced);
        }
        h.scheduler.run_once().await.unwrap();
        let t = get(h, id).await;
        assert_eq!((t.stage, t.status), (Stage::Transcribing, TaskStatus::Running));
    }

    #[tokio::test]
    async fn test_videos_run_to_completion() {
        let h = harness();
        h.scheduler.enqueue(task("a", Priority::Normal)).await.unwrap();
        h.scheduler.enqueue(task("b", Priority::High)).await.unwrap();

        let report = h.scheduler.run_until_idle().await.unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 0);

        for id in ["a", "b"] {
            let t = get(&h, id).await;
            assert_eq!((t.stage, t.status), (Stage::Completed, TaskStatus::Completed));
            assert_eq!(
                h.tools.calls_for(id),
                vec![
                    Stage::Downloading,
                    Stage::ExtractingAudio,
                    Stage::Transcribing,
                    Stage::Generating
                ]
            );
        }

        let entries = h.ledger.entries().unwrap();
        assert_eq!(entries.len(), 4);
        assert!(entries.iter().all(|e| !e.pinned));
        assert_eq!(h.ledger.stats().unwrap().reserved_bytes, 0);

        let kinds: Vec<HistoryKind> = h
            .store
            .history("a")
            .await
            .unwrap()
            .iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds[0], HistoryKind::Enqueued);
        assert_eq!(kinds[1], HistoryKind::Promoted);
        assert_eq!(kinds.iter().filter(|k| **k == HistoryKind::Succeeded).count(), 5);

        let index = h.dir.path().join("transcripts").join(INDEX_FILE);
        assert_eq!(std::fs::read_to_string(index).unwrap(), "a\nb");
    }

    #[tokio::test]
    async fn test_tight_budget_drains_without_wedging() {
        // Estimates match what the fake tools write: 11-byte videos, 5-byte audio.
        let estimates = SizeEstimates {
            video_bytes_per_second: 11,
            audio_bytes_per_second: 5,
            default_video_bytes: 11,
        };
        let h = harness_with_estimates(fast_settings(), 25, estimates);
        for id in ["a", "b", "c"] {
            h.scheduler.enqueue(task(id, Priority::Normal)).await.unwrap();
        }

        let report = h.scheduler.run_until_idle().await.unwrap();
        assert_eq!(report.completed, 3);
        assert_eq!(report.failed, 0);
        assert!(report.admission_denials > 0);

        for id in ["a", "b", "c"] {
            let t = get(&h, id).await;
            assert_eq!((t.stage, t.status), (Stage::Completed, TaskStatus::Completed));
        }
        let stats = h.ledger.stats().unwrap();
        assert_eq!((stats.pinned, stats.reserved_bytes), (0, 0));
    }

    #[tokio::test]
    async fn test_stage_never_moves_backwards() {
        let h = harness();
        h.tools.fail("v", Stage::ExtractingAudio, VidwikiError::Transient("busy".into()));
        h.tools.fail("v", Stage::Generating, VidwikiError::Permanent("rejected".into()));
        h.scheduler.enqueue(task("v", Priority::Normal)).await.unwrap();

        let mut stages = vec![get(&h, "v").await.stage];
        let mut applied = Vec::new();

        async fn step(h: &Harness) -> Applied {
            if let Some(until) = get(h, "v").await.not_before {
                tokio::time::sleep((until - Utc::now()).to_std().unwrap_or_default()).await;
            }
            h.scheduler.run_once().await.unwrap();
            settle_one(&h.scheduler).await
        }

        // Download, a retried extraction, then a successful one.
        for _ in 0..3 {
            applied.push(step(&h).await);
            stages.push(get(&h, "v").await.stage);
        }

        // Transcription stopped by shutdown.
        h.tools.hang_transcription.store(true, Ordering::SeqCst);
        h.scheduler.run_once().await.unwrap();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert_eq!(h.scheduler.run(shutdown).await.unwrap().interrupted, 1);
        applied.push(Applied::Interrupted);
        stages.push(get(&h, "v").await.stage);
        h.tools.hang_transcription.store(false, Ordering::SeqCst);

        // Transcription, then a permanent generation failure.
        for _ in 0..2 {
            applied.push(step(&h).await);
            stages.push(get(&h, "v").await.stage);
        }

        h.scheduler.resubmit("v").await.unwrap();
        stages.push(get(&h, "v").await.stage);

        for _ in 0..2 {
            applied.push(step(&h).await);
            stages.push(get(&h, "v").await.stage);
        }

        assert_eq!(
            applied,
            vec![
                Applied::Advanced,
                Applied::Retried,
                Applied::Advanced,
                Applied::Interrupted,
                Applied::Advanced,
                Applied::Failed,
                Applied::Advanced,
                Applied::Completed,
            ]
        );
        assert!(stages.windows(2).all(|w| w[0] <= w[1]), "stages went backwards: {:?}", stages);
        assert_eq!(stages.last(), Some(&Stage::Completed));
    }

    #[tokio::test]
    async fn test_transient_failures_back_off_then_fail() {
        let h = harness();
        for _ in 0..4 {
            h.tools.fail("v", Stage::Downloading, VidwikiError::Transient("timed out".into()));
        }
        h.scheduler.enqueue(task("v", Priority::Normal)).await.unwrap();

        let mut delays = Vec::new();
        for attempt in 1..=4 {
            let t = get(&h, "v").await;
            if let Some(until) = t.not_before {
                tokio::time::sleep((until - Utc::now()).to_std().unwrap_or_default()).await;
            }
            let pass = h.scheduler.run_once().await.unwrap();
            assert_eq!(pass.dispatched, 1, "attempt {}", attempt);

            let applied = settle_one(&h.scheduler).await;
            let t = get(&h, "v").await;
            if attempt < 4 {
                assert_eq!(applied, Applied::Retried);
                assert_eq!(t.retry_count, attempt);
                delays.push((t.not_before.unwrap() - t.last_update).num_milliseconds());
            } else {
                assert_eq!(applied, Applied::Failed);
                assert_eq!(t.status, TaskStatus::Failed);
                assert_eq!(t.retry_count, 3);
                assert!(t.error_message.unwrap().contains("timed out"));
            }
        }
        assert_eq!(delays, vec![1, 2, 4]);

        let history = h.store.history("v").await.unwrap();
        assert_eq!(history.iter().filter(|e| e.kind == HistoryKind::Failed).count(), 4);
        assert_eq!(history.iter().filter(|e| e.kind == HistoryKind::RetryScheduled).count(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let h = harness();
        h.tools.fail("v", Stage::Downloading, VidwikiError::Permanent("Private video".into()));
        h.scheduler.enqueue(task("v", Priority::Normal)).await.unwrap();

        let report = h.scheduler.run_until_idle().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.retried, 0);
        assert_eq!(h.tools.calls_for("v"), vec![Stage::Downloading]);
        assert_eq!(get(&h, "v").await.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_ready_order_under_saturation() {
        let settings = SchedulerSettings {
            concurrency: StageConcurrency {
                downloading: 1,
                ..StageConcurrency::default()
            },
            ..fast_settings()
        };
        let h = harness_with(settings, 1_000_000);
        h.scheduler.enqueue(task("a", Priority::Low)).await.unwrap();
        h.scheduler.enqueue(task("b", Priority::High)).await.unwrap();
        h.scheduler.enqueue(task("c", Priority::Normal)).await.unwrap();

        h.scheduler.run_until_idle().await.unwrap();

        let downloads: Vec<String> = h
            .tools
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, stage)| *stage == Stage::Downloading)
            .map(|(id, _)| id.clone())
            .collect();
        assert_eq!(downloads, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn test_admission_denial_keeps_task_pending() {
        // Budget below the 1000-byte download estimate.
        let h = harness_with(fast_settings(), 500);
        h.scheduler.enqueue(task("v", Priority::Normal)).await.unwrap();

        let report = h.scheduler.run_until_idle().await.unwrap();
        assert!(report.admission_denials > 0);
        assert_eq!(report.dispatched, 0);

        let t = get(&h, "v").await;
        assert_eq!((t.stage, t.status), (Stage::Downloading, TaskStatus::Pending));

        let err = h.scheduler.dispatch("v").await.unwrap_err();
        assert!(matches!(err, VidwikiError::StorageExhausted { requested: 1_000, .. }));
    }

    #[tokio::test]
    async fn test_dependencies_gate_dispatch() {
        let h = harness();
        h.scheduler.enqueue(task("a", Priority::Low)).await.unwrap();
        let dependent = task("b", Priority::High)
            .with_dependencies(vec![Dependency::new("a", Stage::Generating)]);
        h.scheduler.enqueue(dependent).await.unwrap();

        let err = h.scheduler.dispatch("b").await.unwrap_err();
        assert!(matches!(err, VidwikiError::DependencyUnsatisfied(_)));

        h.scheduler.run_until_idle().await.unwrap();
        assert_eq!(get(&h, "b").await.status, TaskStatus::Completed);

        let calls = h.tools.calls.lock().unwrap().clone();
        let position = |id: &str, stage: Stage| {
            calls
                .iter()
                .position(|c| *c == (id.to_string(), stage))
                .unwrap()
        };
        let a_generated = position("a", Stage::Generating);
        let b_downloaded = position("b", Stage::Downloading);
        assert!(a_generated < b_downloaded);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_duplicates_and_cycles() {
        let h = harness();
        h.scheduler.enqueue(task("a", Priority::Normal)).await.unwrap();
        assert!(matches!(
            h.scheduler.enqueue(task("a", Priority::High)).await,
            Err(VidwikiError::DuplicateTask(_))
        ));

        let b = task("b", Priority::Normal)
            .with_dependencies(vec![Dependency::new("c", Stage::Completed)]);
        h.scheduler.enqueue(b).await.unwrap();
        let c = task("c", Priority::Normal)
            .with_dependencies(vec![Dependency::new("b", Stage::Completed)]);
        assert!(matches!(
            h.scheduler.enqueue(c).await,
            Err(VidwikiError::DependencyCycle(_))
        ));
        assert!(h.store.get("c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_running_task_discards_result() {
        let h = harness();
        run_to_transcribing(&h, "v").await;

        h.scheduler.cancel("v").await.unwrap();
        assert_eq!(get(&h, "v").await.status, TaskStatus::Cancelled);
        assert_eq!(settle_one(&h.scheduler).await, Applied::Discarded);

        let t = get(&h, "v").await;
        assert_eq!((t.stage, t.status), (Stage::Transcribing, TaskStatus::Cancelled));
        assert!(h.ledger.artifacts_for("v").unwrap().iter().all(|e| !e.pinned));
        assert!(matches!(
            h.scheduler.cancel("v").await,
            Err(VidwikiError::InvalidTransition { .. })
        ));

        h.tools.hang_transcription.store(false, Ordering::SeqCst);
        h.scheduler.resubmit("v").await.unwrap();
        let t = get(&h, "v").await;
        assert_eq!(
            (t.stage, t.status, t.retry_count),
            (Stage::Transcribing, TaskStatus::Pending, 0)
        );
    }

    #[tokio::test]
    async fn test_external_cancel_is_observed() {
        let h = harness();
        run_to_transcribing(&h, "v").await;

        // Another process cancels through the shared store.
        let mut t = get(&h, "v").await;
        t.cancel(Utc::now());
        h.store.upsert(&t).await.unwrap();

        h.scheduler.run_once().await.unwrap();
        assert_eq!(settle_one(&h.scheduler).await, Applied::Discarded);
        assert_eq!(h.scheduler.in_flight().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_from_another_process_releases_storage() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteTaskStore::in_memory().unwrap());
        let ledger =
            Arc::new(StorageLedger::with_journal(ledger_config(1_000), store.clone()).unwrap());
        let tools = Arc::new(FakeTools::default());
        let runner = Arc::new(StageRunner::new(
            collaborators(&tools),
            ledger.clone(),
            ArtifactDirs::under(dir.path()),
        ));
        let scheduler = Scheduler::new(
            store.clone(),
            ledger.clone(),
            runner,
            fast_settings(),
            SizeEstimates::default(),
        );

        scheduler.enqueue(task("v", Priority::Normal)).await.unwrap();
        ledger
            .register(NewArtifact::new("/data/v.mp4", "v", ArtifactType::Video, 900).pinned())
            .unwrap();
        assert!(ledger.admit(200).unwrap().is_none());

        // The other process only writes the task row.
        cancel_in_store(&*store, "v").await.unwrap();
        assert_eq!(ledger.stats().unwrap().pinned, 1);

        scheduler.run_once().await.unwrap();
        assert_eq!(ledger.stats().unwrap().pinned, 0);
        assert!(store.load_entries().unwrap().iter().all(|e| !e.pinned));
        assert!(ledger.admit(200).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_without_spending_retries() {
        let h = harness();
        run_to_transcribing(&h, "v").await;

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let report = h.scheduler.run(shutdown).await.unwrap();
        assert_eq!(report.interrupted, 1);

        let t = get(&h, "v").await;
        assert_eq!(
            (t.stage, t.status, t.retry_count),
            (Stage::Transcribing, TaskStatus::Pending, 0)
        );
        let last = h.store.history("v").await.unwrap().pop().unwrap();
        assert_eq!(last.kind, HistoryKind::Interrupted);
    }

    #[tokio::test]
    async fn test_resubmit_requires_terminal_failure() {
        let h = harness();
        h.scheduler.enqueue(task("v", Priority::Normal)).await.unwrap();
        assert!(matches!(
            h.scheduler.resubmit("v").await,
            Err(VidwikiError::InvalidTransition { .. })
        ));
        assert!(matches!(
            h.scheduler.resubmit("missing").await,
            Err(VidwikiError::TaskNotFound(_))
        ));
    }
}
