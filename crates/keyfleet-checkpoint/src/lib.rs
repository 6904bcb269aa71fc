//! keyfleet-checkpoint — makes the run survive its coordinator.
//!
//! Periodically snapshots the range set, every checkpoint, and the
//! global status to timestamped JSON files, keeping a bounded history.
//! On startup `recover` loads the newest snapshot and replays it
//! through the state store's monotonic guard, so a restarted run
//! resumes from the last persisted cursors instead of rescanning.

pub mod backup;
pub mod error;

pub use backup::{BackupManager, RecoverySummary, recover};
pub use error::{BackupError, BackupResult};
