//! CLI command implementations.

mod config;
mod discover;
mod doctor;
mod run;
mod status;
mod storage;

pub use config::run_config;
pub use discover::{run_discover, run_enqueue};
pub use doctor::run_doctor;
pub use run::run_scheduler;
pub use status::{run_cancel, run_resubmit, run_status};
pub use storage::run_storage;
