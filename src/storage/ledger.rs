//! The storage ledger: budget accounting, admission and tiered sweeps.

use super::{
    ArtifactType, LedgerJournal, NewArtifact, Reservation, StorageEntry, StorageStats, SweepReport,
    Tier,
};
use crate::config::{RetentionSettings, Settings};
use crate::error::{Result, VidwikiError};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Budget and retention parameters of a ledger.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Maximum Hot+Warm bytes.
    pub budget_bytes: u64,
    /// Usage ratio above which admission sweeps first.
    pub cleanup_threshold: f64,
    /// `None` = unbounded cold tier, `Some(0)` = no cold tier.
    pub cold_budget_bytes: Option<u64>,
    /// Directory cold files are moved into; kept in place when unset.
    pub cold_dir: Option<PathBuf>,
    pub retention: RetentionSettings,
}

impl LedgerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            budget_bytes: settings.storage.budget_bytes,
            cleanup_threshold: settings.storage.cleanup_threshold,
            cold_budget_bytes: settings.storage.cold_budget_bytes,
            cold_dir: settings.cold_dir(),
            retention: settings.storage.retention.clone(),
        }
    }

    fn threshold_bytes(&self) -> u64 {
        (self.budget_bytes as f64 * self.cleanup_threshold) as u64
    }

    fn cold_disabled(&self) -> bool {
        self.cold_budget_bytes == Some(0)
    }
}

#[derive(Default)]
struct LedgerState {
    entries: BTreeMap<PathBuf, StorageEntry>,
    reservations: HashMap<u64, u64>,
    next_reservation: u64,
}

impl LedgerState {
    fn tier_bytes(&self, tier: Tier) -> u64 {
        self.entries
            .values()
            .filter(|e| e.tier == tier)
            .map(|e| e.size_bytes)
            .sum()
    }

    fn budgeted_bytes(&self) -> u64 {
        self.entries
            .values()
            .filter(|e| e.tier.is_budgeted())
            .map(|e| e.size_bytes)
            .sum()
    }

    fn reserved_bytes(&self) -> u64 {
        self.reservations.values().sum()
    }

    fn in_use(&self) -> u64 {
        self.budgeted_bytes() + self.reserved_bytes()
    }
}

/// Pressure-eviction order: Warm before Hot, then least recently accessed, then path.
fn eviction_order(a: &StorageEntry, b: &StorageEntry) -> Ordering {
    b.tier
        .cmp(&a.tier)
        .then_with(|| a.last_access.cmp(&b.last_access))
        .then_with(|| a.path.cmp(&b.path))
}

/// Tracks every artifact file and defends the Hot+Warm budget.
///
/// All mutations go through one mutex, so admission, registration and sweeps
/// always observe a consistent total.
pub struct StorageLedger {
    config: LedgerConfig,
    state: Mutex<LedgerState>,
    journal: Option<Arc<dyn LedgerJournal>>,
}

impl StorageLedger {
    /// Create an empty, non-persistent ledger.
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LedgerState::default()),
            journal: None,
        }
    }

    /// Create a ledger backed by a journal, restoring its entries.
    pub fn with_journal(config: LedgerConfig, journal: Arc<dyn LedgerJournal>) -> Result<Self> {
        let mut state = LedgerState::default();
        for entry in journal.load_entries()? {
            state.entries.insert(entry.path.clone(), entry);
        }
        info!("Restored {} storage entries", state.entries.len());

        Ok(Self {
            config,
            state: Mutex::new(state),
            journal: Some(journal),
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerState>> {
        self.state
            .lock()
            .map_err(|e| VidwikiError::Ledger(format!("Failed to acquire lock: {}", e)))
    }

    fn journal_save(&self, entry: &StorageEntry) -> Result<()> {
        match &self.journal {
            Some(journal) => journal.save_entry(entry),
            None => Ok(()),
        }
    }

    fn journal_remove(&self, path: &Path) -> Result<()> {
        match &self.journal {
            Some(journal) => journal.remove_entry(path),
            None => Ok(()),
        }
    }

    /// Ask for room to write `estimated_bytes`.
    ///
    /// Sweeps first when usage is above the cleanup threshold or the bytes do
    /// not fit, cooling unpinned entries until they would. Returns a
    /// reservation that counts against the budget until settled, or `None`
    /// when the bytes do not fit.
    pub fn admit(&self, estimated_bytes: u64) -> Result<Option<Reservation>> {
        self.admit_at(estimated_bytes, 0, Utc::now())
    }

    /// Like `admit`, but also require `headroom_bytes` to stay free after the
    /// grant. Only `estimated_bytes` is reserved.
    pub fn admit_with_headroom(
        &self,
        estimated_bytes: u64,
        headroom_bytes: u64,
    ) -> Result<Option<Reservation>> {
        self.admit_at(estimated_bytes, headroom_bytes, Utc::now())
    }

    pub(crate) fn admit_at(
        &self,
        estimated_bytes: u64,
        headroom_bytes: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<Reservation>> {
        let mut state = self.lock()?;
        let needed = estimated_bytes.saturating_add(headroom_bytes);

        if self.above_threshold(&state) || !self.fits(&state, needed) {
            let target = self.room_for(needed);
            let report = self.sweep_to(&mut state, now, target)?;
            debug!("Admission sweep freed {} bytes", report.freed_bytes);
        }

        if !self.fits(&state, needed) {
            info!(
                "Admission denied for {} bytes (+{} headroom, {} of {} in use)",
                estimated_bytes,
                headroom_bytes,
                state.in_use(),
                self.config.budget_bytes
            );
            return Ok(None);
        }

        let id = state.next_reservation;
        state.next_reservation += 1;
        state.reservations.insert(id, estimated_bytes);
        debug!("Reserved {} bytes (reservation {})", estimated_bytes, id);

        Ok(Some(Reservation {
            id,
            bytes: estimated_bytes,
        }))
    }

    fn fits(&self, state: &LedgerState, bytes: u64) -> bool {
        state.in_use().saturating_add(bytes) <= self.config.budget_bytes
    }

    /// Pressure target that leaves `bytes` free, never above the threshold.
    fn room_for(&self, bytes: u64) -> u64 {
        self.config
            .threshold_bytes()
            .min(self.config.budget_bytes.saturating_sub(bytes))
    }

    fn above_threshold(&self, state: &LedgerState) -> bool {
        state.in_use() as f64 > self.config.cleanup_threshold * self.config.budget_bytes as f64
    }

    /// Return a reservation's bytes to the budget.
    pub fn settle(&self, reservation: Reservation) -> Result<()> {
        self.lock()?.reservations.remove(&reservation.id);
        Ok(())
    }

    /// Record a new artifact in the Hot tier, sweeping if the budget is exceeded.
    pub fn register(&self, artifact: NewArtifact) -> Result<StorageEntry> {
        self.register_at(artifact, Utc::now())
    }

    pub(crate) fn register_at(
        &self,
        artifact: NewArtifact,
        now: DateTime<Utc>,
    ) -> Result<StorageEntry> {
        let mut state = self.lock()?;

        let entry = StorageEntry {
            retention_days: self.config.retention.days_for(artifact.artifact_type),
            path: artifact.path,
            video_id: artifact.video_id,
            artifact_type: artifact.artifact_type,
            size_bytes: artifact.size_bytes,
            tier: Tier::Hot,
            last_access: now,
            tier_since: now,
            pinned: artifact.pinned,
        };
        self.journal_save(&entry)?;
        state.entries.insert(entry.path.clone(), entry.clone());
        debug!(
            "Registered {} {:?} ({} bytes)",
            entry.artifact_type, entry.path, entry.size_bytes
        );

        if state.budgeted_bytes() > self.config.budget_bytes {
            self.sweep_locked(&mut state, now)?;
        }

        Ok(entry)
    }

    /// Mark an artifact as just used. Returns false for unknown paths.
    pub fn touch(&self, path: &Path) -> Result<bool> {
        let mut state = self.lock()?;
        match state.entries.get_mut(path) {
            Some(entry) => {
                entry.last_access = Utc::now();
                if let Some(journal) = &self.journal {
                    journal.record_access(&entry.path, entry.last_access)?;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Bring a cold artifact back into the budgeted tier, moving it into
    /// `hot_dir` when the cold tier lives in its own directory.
    ///
    /// Fails with `StorageExhausted` when the file does not fit even after a
    /// sweep. Hot and Warm entries are only touched.
    pub fn restore(&self, path: &Path, hot_dir: &Path) -> Result<StorageEntry> {
        self.restore_at(path, hot_dir, Utc::now())
    }

    pub(crate) fn restore_at(
        &self,
        path: &Path,
        hot_dir: &Path,
        now: DateTime<Utc>,
    ) -> Result<StorageEntry> {
        let untracked = || VidwikiError::MissingArtifact(format!("{:?} is not tracked", path));
        let mut state = self.lock()?;
        let (tier, size_bytes) = match state.entries.get(path) {
            Some(entry) => (entry.tier, entry.size_bytes),
            None => return Err(untracked()),
        };

        if tier != Tier::Cold {
            let entry = state.entries.get_mut(path).ok_or_else(untracked)?;
            entry.last_access = now;
            if let Some(journal) = &self.journal {
                journal.record_access(&entry.path, now)?;
            }
            return Ok(entry.clone());
        }

        if !self.fits(&state, size_bytes) {
            let target = self.room_for(size_bytes);
            self.sweep_to(&mut state, now, target)?;
        }
        if !self.fits(&state, size_bytes) {
            let available = self.config.budget_bytes.saturating_sub(state.in_use());
            return Err(VidwikiError::StorageExhausted {
                requested: size_bytes,
                available,
            });
        }

        let Some(mut entry) = state.entries.remove(path) else {
            return Err(untracked());
        };
        let in_cold_dir = self
            .config
            .cold_dir
            .as_ref()
            .is_some_and(|cold| entry.path.starts_with(cold));
        if in_cold_dir {
            match move_into(&entry.path, hot_dir) {
                Ok(new_path) => {
                    self.journal_remove(&entry.path)?;
                    entry.path = new_path;
                }
                Err(e) => {
                    state.entries.insert(entry.path.clone(), entry);
                    return Err(e.into());
                }
            }
        }

        entry.tier = Tier::Hot;
        entry.tier_since = now;
        entry.last_access = now;
        self.journal_save(&entry)?;
        info!("Restored {:?} from cold storage", entry.path);
        state.entries.insert(entry.path.clone(), entry.clone());
        Ok(entry)
    }

    /// Reload entries from the journal so changes made by another process
    /// (a manual sweep, an unpin) become visible. Reservations are kept.
    ///
    /// Returns the number of entries loaded; a ledger without a journal is
    /// left unchanged.
    pub fn refresh(&self) -> Result<usize> {
        let Some(journal) = &self.journal else {
            return Ok(0);
        };
        let mut state = self.lock()?;
        let loaded = journal.load_entries()?;

        let mut entries = BTreeMap::new();
        for mut entry in loaded {
            if let Some(known) = state.entries.get(&entry.path) {
                entry.last_access = entry.last_access.max(known.last_access);
            }
            entries.insert(entry.path.clone(), entry);
        }
        state.entries = entries;
        Ok(state.entries.len())
    }

    /// Run the retention, pressure and cold-budget passes.
    pub fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now())
    }

    /// Sweep as if the current time were `now`.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut state = self.lock()?;
        self.sweep_locked(&mut state, now)
    }

    fn sweep_locked(&self, state: &mut LedgerState, now: DateTime<Utc>) -> Result<SweepReport> {
        self.sweep_to(state, now, self.config.threshold_bytes())
    }

    /// Retention pass, then cool budgeted entries until usage is at most `target`.
    fn sweep_to(
        &self,
        state: &mut LedgerState,
        now: DateTime<Utc>,
        target: u64,
    ) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        // Retention: one demotion step per expired entry.
        let expired: Vec<(PathBuf, Tier)> = state
            .entries
            .values()
            .filter(|e| {
                !e.pinned && e.idle_for(now) > chrono::Duration::days(e.retention_days as i64)
            })
            .map(|e| (e.path.clone(), e.tier))
            .collect();

        for (path, tier) in expired {
            match tier {
                Tier::Hot => {
                    if let Some(entry) = state.entries.get_mut(&path) {
                        entry.tier = Tier::Warm;
                        entry.tier_since = now;
                        self.journal_save(entry)?;
                    }
                    report.warmed.push(path);
                }
                Tier::Warm => self.demote_to_cold(state, &path, now, &mut report)?,
                Tier::Cold => self.delete_entry(state, &path, &mut report)?,
            }
        }

        // Pressure: cool the coldest eligible entries until under the target.
        while state.in_use() > target {
            let victim = state
                .entries
                .values()
                .filter(|e| !e.pinned && e.tier.is_budgeted())
                .min_by(|a, b| eviction_order(a, b))
                .map(|e| e.path.clone());

            match victim {
                Some(path) => self.demote_to_cold(state, &path, now, &mut report)?,
                None => {
                    if state.budgeted_bytes() > self.config.budget_bytes {
                        warn!(
                            "Storage over budget ({} of {} bytes) and every remaining entry \
                             is pinned",
                            state.budgeted_bytes(),
                            self.config.budget_bytes
                        );
                    }
                    break;
                }
            }
        }

        // Cold budget: drop the least recently used cold files.
        if let Some(cold_budget) = self.config.cold_budget_bytes.filter(|b| *b > 0) {
            while state.tier_bytes(Tier::Cold) > cold_budget {
                let victim = state
                    .entries
                    .values()
                    .filter(|e| !e.pinned && e.tier == Tier::Cold)
                    .min_by(|a, b| {
                        a.last_access
                            .cmp(&b.last_access)
                            .then_with(|| a.path.cmp(&b.path))
                    })
                    .map(|e| e.path.clone());

                match victim {
                    Some(path) => self.delete_entry(state, &path, &mut report)?,
                    None => break,
                }
            }
        }

        if !report.is_empty() {
            info!(
                "Sweep: {} warmed, {} cooled, {} deleted, {} bytes freed",
                report.warmed.len(),
                report.cooled.len(),
                report.deleted.len(),
                report.freed_bytes
            );
        }

        Ok(report)
    }

    fn demote_to_cold(
        &self,
        state: &mut LedgerState,
        path: &Path,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<()> {
        if self.config.cold_disabled() {
            return self.delete_entry(state, path, report);
        }

        let Some(mut entry) = state.entries.remove(path) else {
            return Ok(());
        };

        if let Some(cold_dir) = &self.config.cold_dir {
            if !entry.path.starts_with(cold_dir) {
                match move_into(&entry.path, cold_dir) {
                    Ok(new_path) => {
                        self.journal_remove(&entry.path)?;
                        entry.path = new_path;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        warn!("Artifact {:?} vanished before it could be moved", entry.path);
                        self.journal_remove(&entry.path)?;
                        if entry.tier.is_budgeted() {
                            report.freed_bytes += entry.size_bytes;
                        }
                        report.deleted.push(entry.path);
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(
                            "Failed to move {:?} to cold storage, keeping it in place: {}",
                            entry.path, e
                        );
                    }
                }
            }
        }

        if entry.tier.is_budgeted() {
            report.freed_bytes += entry.size_bytes;
        }
        entry.tier = Tier::Cold;
        entry.tier_since = now;
        self.journal_save(&entry)?;
        report.cooled.push(path.to_path_buf());
        state.entries.insert(entry.path.clone(), entry);
        Ok(())
    }

    fn delete_entry(
        &self,
        state: &mut LedgerState,
        path: &Path,
        report: &mut SweepReport,
    ) -> Result<()> {
        let Some(entry) = state.entries.remove(path) else {
            return Ok(());
        };

        if let Err(e) = remove_file_if_exists(&entry.path) {
            warn!("Failed to delete {:?}: {}", entry.path, e);
        }
        self.journal_remove(&entry.path)?;

        if entry.tier.is_budgeted() {
            report.freed_bytes += entry.size_bytes;
        }
        report.deleted.push(entry.path);
        Ok(())
    }

    /// Remove an artifact and delete its file.
    pub fn release(&self, path: &Path) -> Result<Option<StorageEntry>> {
        let mut state = self.lock()?;
        let Some(entry) = state.entries.remove(path) else {
            return Ok(None);
        };

        remove_file_if_exists(&entry.path)?;
        self.journal_remove(&entry.path)?;
        debug!("Released {:?}", entry.path);
        Ok(Some(entry))
    }

    /// Most recently used artifact of a type for a video.
    pub fn artifact(
        &self,
        video_id: &str,
        artifact_type: ArtifactType,
    ) -> Result<Option<StorageEntry>> {
        Ok(self
            .lock()?
            .entries
            .values()
            .filter(|e| e.video_id == video_id && e.artifact_type == artifact_type)
            .max_by_key(|e| e.last_access)
            .cloned())
    }

    /// All artifacts of a video.
    pub fn artifacts_for(&self, video_id: &str) -> Result<Vec<StorageEntry>> {
        Ok(self
            .lock()?
            .entries
            .values()
            .filter(|e| e.video_id == video_id)
            .cloned()
            .collect())
    }

    /// Make an artifact eligible for sweeping.
    pub fn unpin(&self, path: &Path) -> Result<bool> {
        let mut state = self.lock()?;
        match state.entries.get_mut(path) {
            Some(entry) => {
                entry.pinned = false;
                self.journal_save(entry)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Unpin every artifact of a video. Returns how many were pinned.
    pub fn unpin_video(&self, video_id: &str) -> Result<usize> {
        let mut state = self.lock()?;
        let mut count = 0;
        for entry in state
            .entries
            .values_mut()
            .filter(|e| e.video_id == video_id && e.pinned)
        {
            entry.pinned = false;
            self.journal_save(entry)?;
            count += 1;
        }
        Ok(count)
    }

    pub fn stats(&self) -> Result<StorageStats> {
        let state = self.lock()?;
        Ok(StorageStats {
            budget_bytes: self.config.budget_bytes,
            hot_bytes: state.tier_bytes(Tier::Hot),
            warm_bytes: state.tier_bytes(Tier::Warm),
            cold_bytes: state.tier_bytes(Tier::Cold),
            reserved_bytes: state.reserved_bytes(),
            entries: state.entries.len(),
            pinned: state.entries.values().filter(|e| e.pinned).count(),
        })
    }

    /// Snapshot of every entry, ordered by path.
    pub fn entries(&self) -> Result<Vec<StorageEntry>> {
        Ok(self.lock()?.entries.values().cloned().collect())
    }
}

fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Move a file into `dir`, falling back to copy and delete across filesystems.
fn move_into(path: &Path, dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let file_name = path
        .file_name()
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name")
        })?;
    let target = dir.join(file_name);

    match std::fs::rename(path, &target) {
        Ok(()) => Ok(target),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(e),
        Err(_) => {
            std::fs::copy(path, &target)?;
            std::fs::remove_file(path)?;
            Ok(target)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1_000_000_000;

    fn config(budget_bytes: u64) -> LedgerConfig {
        LedgerConfig {
            budget_bytes,
            cleanup_threshold: 0.8,
            cold_budget_bytes: None,
            cold_dir: None,
            retention: RetentionSettings::default(),
        }
    }

    fn artifact(name: &str, size: u64) -> NewArtifact {
        NewArtifact::new(format!("/data/{}", name), name, ArtifactType::Video, size)
    }

    #[test]
    fn test_admit_sweeps_before_answering() {
        let ledger = StorageLedger::new(config(100 * GB));
        let start = Utc::now() - chrono::Duration::hours(1);
        for i in 0..96 {
            let at = start + chrono::Duration::seconds(i);
            ledger.register_at(artifact(&format!("v{:02}", i), GB), at).unwrap();
        }
        assert_eq!(ledger.stats().unwrap().hot_bytes, 96 * GB);

        let reservation = ledger.admit(5 * GB).unwrap();
        assert!(reservation.is_some());

        let stats = ledger.stats().unwrap();
        assert!(stats.hot_bytes + stats.warm_bytes + stats.reserved_bytes <= 100 * GB);
        assert_eq!(stats.reserved_bytes, 5 * GB);
        // The oldest entries were cooled first.
        let cooled: Vec<_> = ledger
            .entries()
            .unwrap()
            .into_iter()
            .filter(|e| e.tier == Tier::Cold)
            .map(|e| e.video_id)
            .collect();
        assert!(cooled.contains(&"v00".to_string()));
        assert!(!cooled.contains(&"v95".to_string()));
    }

    #[test]
    fn test_admit_denied_when_everything_is_pinned() {
        let ledger = StorageLedger::new(config(100 * GB));
        for i in 0..96 {
            ledger.register(artifact(&format!("v{:02}", i), GB).pinned()).unwrap();
        }

        assert!(ledger.admit(5 * GB).unwrap().is_none());
        assert_eq!(ledger.stats().unwrap().cold_bytes, 0);

        ledger.unpin_video("v00").unwrap();
        ledger.unpin_video("v01").unwrap();
        assert!(ledger.admit(5 * GB).unwrap().is_some());
    }

    #[test]
    fn test_admit_below_threshold_makes_room() {
        let ledger = StorageLedger::new(config(10 * GB));
        let now = Utc::now();
        ledger.register_at(artifact("done", 7 * GB), now - chrono::Duration::hours(1)).unwrap();
        ledger.register_at(artifact("held", GB).pinned(), now).unwrap();

        // 8 GB in use is not above the threshold, but 5 GB does not fit.
        assert!(ledger.admit(5 * GB).unwrap().is_some());
        let done = ledger.artifact("done", ArtifactType::Video).unwrap().unwrap();
        assert_eq!(done.tier, Tier::Cold);
    }

    #[test]
    fn test_reservations_count_until_settled() {
        let ledger = StorageLedger::new(config(10 * GB));
        let first = ledger.admit(6 * GB).unwrap().unwrap();
        assert!(ledger.admit(6 * GB).unwrap().is_none());

        ledger.settle(first).unwrap();
        assert!(ledger.admit(6 * GB).unwrap().is_some());
    }

    #[test]
    fn test_pressure_evicts_warm_then_oldest_access() {
        let ledger = StorageLedger::new(config(10 * GB));
        let now = Utc::now();
        ledger.register_at(artifact("hot-old", 3 * GB), now - chrono::Duration::hours(3)).unwrap();
        ledger.register_at(artifact("hot-new", 3 * GB), now - chrono::Duration::hours(1)).unwrap();
        ledger.register_at(artifact("warm", 3 * GB), now - chrono::Duration::minutes(5)).unwrap();
        {
            let mut state = ledger.lock().unwrap();
            let warm = state.entries.get_mut(Path::new("/data/warm")).unwrap();
            warm.tier = Tier::Warm;
        }

        // 9 GB in use, threshold 8 GB: one eviction is enough.
        let report = ledger.sweep_at(now).unwrap();
        assert_eq!(report.cooled, vec![PathBuf::from("/data/warm")]);

        ledger.register_at(artifact("more", 3 * GB), now).unwrap();
        let report = ledger.sweep_at(now).unwrap();
        assert_eq!(report.cooled, vec![PathBuf::from("/data/hot-old")]);
    }

    #[test]
    fn test_retention_demotes_one_step_per_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let cold_dir = dir.path().join("cold");
        let file = dir.path().join("clip.mp4");
        std::fs::write(&file, b"video").unwrap();

        let mut cfg = config(100 * GB);
        cfg.cold_dir = Some(cold_dir.clone());
        let ledger = StorageLedger::new(cfg);

        let start = Utc::now();
        ledger
            .register_at(NewArtifact::new(&file, "clip", ArtifactType::Video, 5), start)
            .unwrap();

        let day = chrono::Duration::days(1);
        let report = ledger.sweep_at(start + day * 8).unwrap();
        assert_eq!(report.warmed, vec![file.clone()]);

        let report = ledger.sweep_at(start + day * 16).unwrap();
        assert_eq!(report.cooled, vec![file.clone()]);
        let moved = cold_dir.join("clip.mp4");
        assert!(!file.exists());
        assert!(moved.exists());
        let entry = ledger.artifact("clip", ArtifactType::Video).unwrap().unwrap();
        assert_eq!(entry.path, moved);
        assert_eq!(entry.tier, Tier::Cold);

        let report = ledger.sweep_at(start + day * 24).unwrap();
        assert_eq!(report.deleted, vec![moved.clone()]);
        assert!(!moved.exists());
        assert!(ledger.entries().unwrap().is_empty());
    }

    #[test]
    fn test_pinned_entries_are_not_retired() {
        let ledger = StorageLedger::new(config(100 * GB));
        let start = Utc::now();
        ledger.register_at(artifact("keep", GB).pinned(), start).unwrap();

        let report = ledger.sweep_at(start + chrono::Duration::days(60)).unwrap();
        assert!(report.is_empty());
    }

    #[test]
    fn test_disabled_cold_tier_deletes_pressure_victims() {
        let mut cfg = config(10 * GB);
        cfg.cold_budget_bytes = Some(0);
        let ledger = StorageLedger::new(cfg);
        let now = Utc::now();
        ledger.register_at(artifact("a", 5 * GB), now - chrono::Duration::hours(1)).unwrap();
        ledger.register_at(artifact("b", 4 * GB), now).unwrap();

        let report = ledger.sweep_at(now).unwrap();
        assert_eq!(report.deleted, vec![PathBuf::from("/data/a")]);
        assert_eq!(report.freed_bytes, 5 * GB);
        assert_eq!(ledger.stats().unwrap().entries, 1);
    }

    #[test]
    fn test_cold_budget_drops_oldest() {
        let mut cfg = config(10 * GB);
        cfg.cold_budget_bytes = Some(5 * GB);
        let ledger = StorageLedger::new(cfg);
        let now = Utc::now();
        ledger.register_at(artifact("a", 3 * GB), now - chrono::Duration::hours(2)).unwrap();
        ledger.register_at(artifact("b", 3 * GB), now - chrono::Duration::hours(1)).unwrap();
        {
            let mut state = ledger.lock().unwrap();
            for entry in state.entries.values_mut() {
                entry.tier = Tier::Cold;
            }
        }

        let report = ledger.sweep_at(now).unwrap();
        assert_eq!(report.deleted, vec![PathBuf::from("/data/a")]);
        assert_eq!(report.freed_bytes, 0);
        assert_eq!(ledger.stats().unwrap().cold_bytes, 3 * GB);
    }

    #[test]
    fn test_release_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("audio.mp3");
        std::fs::write(&file, b"audio").unwrap();

        let ledger = StorageLedger::new(config(GB));
        ledger
            .register(NewArtifact::new(&file, "v", ArtifactType::Audio, 5))
            .unwrap();
        assert!(ledger.touch(&file).unwrap());

        let released = ledger.release(&file).unwrap().unwrap();
        assert_eq!(released.artifact_type, ArtifactType::Audio);
        assert!(!file.exists());
        assert!(ledger.release(&file).unwrap().is_none());
        assert!(!ledger.touch(&file).unwrap());
    }

    #[test]
    fn test_headroom_is_required_but_not_reserved() {
        let ledger = StorageLedger::new(config(10 * GB));
        ledger.register(artifact("held", 4 * GB).pinned()).unwrap();

        assert!(ledger.admit_with_headroom(3 * GB, 4 * GB).unwrap().is_none());

        let reservation = ledger.admit_with_headroom(3 * GB, 3 * GB).unwrap().unwrap();
        assert_eq!(reservation.bytes, 3 * GB);
        assert_eq!(ledger.stats().unwrap().reserved_bytes, 3 * GB);
        // The headroom is still there for the next request.
        assert!(ledger.admit(3 * GB).unwrap().is_some());
    }

    #[test]
    fn test_restore_moves_cold_file_back() {
        let dir = tempfile::tempdir().unwrap();
        let cold_dir = dir.path().join("cold");
        let hot_dir = dir.path().join("videos");
        std::fs::create_dir_all(&hot_dir).unwrap();
        let file = hot_dir.join("clip.mp4");
        std::fs::write(&file, b"video").unwrap();

        let mut cfg = config(100 * GB);
        cfg.cold_dir = Some(cold_dir.clone());
        let ledger = StorageLedger::new(cfg);
        let start = Utc::now();
        ledger
            .register_at(NewArtifact::new(&file, "clip", ArtifactType::Video, 5), start)
            .unwrap();
        let day = chrono::Duration::days(1);
        ledger.sweep_at(start + day * 8).unwrap();
        ledger.sweep_at(start + day * 16).unwrap();
        let cold = cold_dir.join("clip.mp4");
        assert!(cold.exists());

        let restored = ledger.restore_at(&cold, &hot_dir, start + day * 17).unwrap();
        assert_eq!(restored.path, file);
        assert_eq!(restored.tier, Tier::Hot);
        assert!(file.exists());
        assert!(!cold.exists());

        let entry = ledger.artifact("clip", ArtifactType::Video).unwrap().unwrap();
        assert_eq!(entry.path, file);
        assert_eq!(ledger.stats().unwrap().hot_bytes, 5);
        assert_eq!(ledger.stats().unwrap().cold_bytes, 0);
    }

    #[test]
    fn test_restore_is_denied_without_room() {
        let ledger = StorageLedger::new(config(10 * GB));
        ledger.register(artifact("archived", 6 * GB)).unwrap();
        {
            let mut state = ledger.lock().unwrap();
            for entry in state.entries.values_mut() {
                entry.tier = Tier::Cold;
            }
        }
        ledger.register(artifact("busy", 5 * GB).pinned()).unwrap();

        let err = ledger.restore(Path::new("/data/archived"), Path::new("/data")).unwrap_err();
        assert!(matches!(
            err,
            VidwikiError::StorageExhausted { requested, available }
                if requested == 6 * GB && available == 5 * GB
        ));
        let entry = ledger.artifact("archived", ArtifactType::Video).unwrap().unwrap();
        assert_eq!(entry.tier, Tier::Cold);

        ledger.unpin_video("busy").unwrap();
        ledger.release(Path::new("/data/busy")).unwrap();
        let restored = ledger.restore(Path::new("/data/archived"), Path::new("/data")).unwrap();
        assert_eq!(restored.tier, Tier::Hot);
    }

    #[test]
    fn test_restore_of_unknown_path_is_missing_artifact() {
        let ledger = StorageLedger::new(config(GB));
        let err = ledger.restore(Path::new("/data/nothing"), Path::new("/data")).unwrap_err();
        assert!(matches!(err, VidwikiError::MissingArtifact(_)));
    }
}
