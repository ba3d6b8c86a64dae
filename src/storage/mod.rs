//! Storage lifecycle for downloaded and generated artifacts.
//!
//! Every artifact file written by a stage is recorded in the [`StorageLedger`],
//! which enforces the Hot+Warm byte budget through admission and tiered sweeps.

mod ledger;

pub use ledger::{LedgerConfig, StorageLedger};

use crate::error::{Result, VidwikiError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Kind of artifact file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    Video,
    Audio,
    Transcript,
    Temp,
}

impl ArtifactType {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactType::Video => "video",
            ArtifactType::Audio => "audio",
            ArtifactType::Transcript => "transcript",
            ArtifactType::Temp => "temp",
        }
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactType {
    type Err = VidwikiError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "video" => Ok(ArtifactType::Video),
            "audio" => Ok(ArtifactType::Audio),
            "transcript" => Ok(ArtifactType::Transcript),
            "temp" => Ok(ArtifactType::Temp),
            other => Err(VidwikiError::InvalidInput(format!("Unknown artifact type: {}", other))),
        }
    }
}

/// Storage tier, hottest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

impl Tier {
    /// Whether bytes in this tier count against the budget.
    pub fn is_budgeted(self) -> bool {
        matches!(self, Tier::Hot | Tier::Warm)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = VidwikiError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hot" => Ok(Tier::Hot),
            "warm" => Ok(Tier::Warm),
            "cold" => Ok(Tier::Cold),
            other => Err(VidwikiError::InvalidInput(format!("Unknown tier: {}", other))),
        }
    }
}

/// One artifact file tracked by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageEntry {
    pub path: PathBuf,
    /// Video the artifact belongs to.
    pub video_id: String,
    pub artifact_type: ArtifactType,
    pub size_bytes: u64,
    pub tier: Tier,
    pub last_access: DateTime<Utc>,
    /// When the entry entered its current tier.
    pub tier_since: DateTime<Utc>,
    pub retention_days: u32,
    /// Still needed by an unfinished task; never swept while set.
    pub pinned: bool,
}

impl StorageEntry {
    /// Time the entry has been idle in its current tier.
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_access.max(self.tier_since)
    }
}

/// An artifact a stage produced, not yet in the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct NewArtifact {
    pub path: PathBuf,
    pub video_id: String,
    pub artifact_type: ArtifactType,
    pub size_bytes: u64,
    pub pinned: bool,
}

impl NewArtifact {
    pub fn new(
        path: impl Into<PathBuf>,
        video_id: impl Into<String>,
        artifact_type: ArtifactType,
        size_bytes: u64,
    ) -> Self {
        Self {
            path: path.into(),
            video_id: video_id.into(),
            artifact_type,
            size_bytes,
            pinned: false,
        }
    }

    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }
}

/// Bytes granted by an admission, held until settled.
#[derive(Debug, PartialEq, Eq)]
pub struct Reservation {
    pub(crate) id: u64,
    pub bytes: u64,
}

/// What a sweep did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// Hot entries demoted to Warm.
    pub warmed: Vec<PathBuf>,
    /// Entries moved to Cold (paths before the move).
    pub cooled: Vec<PathBuf>,
    /// Entries whose files were deleted.
    pub deleted: Vec<PathBuf>,
    /// Hot+Warm bytes freed.
    pub freed_bytes: u64,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.warmed.is_empty() && self.cooled.is_empty() && self.deleted.is_empty()
    }
}

/// Usage snapshot of the ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StorageStats {
    pub budget_bytes: u64,
    pub hot_bytes: u64,
    pub warm_bytes: u64,
    pub cold_bytes: u64,
    pub reserved_bytes: u64,
    pub entries: usize,
    pub pinned: usize,
}

impl StorageStats {
    /// Fraction of the budget used by Hot, Warm and reserved bytes.
    pub fn usage_ratio(&self) -> f64 {
        if self.budget_bytes == 0 {
            return 0.0;
        }
        (self.hot_bytes + self.warm_bytes + self.reserved_bytes) as f64 / self.budget_bytes as f64
    }
}

/// Durable backing for ledger entries.
pub trait LedgerJournal: Send + Sync {
    fn save_entry(&self, entry: &StorageEntry) -> Result<()>;

    /// Update only the access time of a known entry; unknown paths are ignored.
    fn record_access(&self, path: &Path, at: DateTime<Utc>) -> Result<()>;

    fn remove_entry(&self, path: &Path) -> Result<()>;

    fn load_entries(&self) -> Result<Vec<StorageEntry>>;
}
