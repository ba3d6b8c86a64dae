//! Configuration module for vidwiki.
//!
//! Settings are loaded once and passed by value into the components that need them.

mod settings;

pub use settings::{
    FilterSettings, GeneralSettings, KnowledgeBaseSettings, RetentionSettings, SchedulerSettings,
    Settings, SizeEstimates, SourceSettings, StageConcurrency, StageRetries, StorageSettings,
    TranscriptionSettings,
};
