//! Snapshot files and recovery.
//!
//! One backup is one self-contained JSON file named
//! `checkpoints-<epoch>-<seq>.json` under the destination directory.
//! The name sorts chronologically, so retention and recovery both work
//! off a plain directory listing.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use keyfleet_core::registry::epoch_secs;
use keyfleet_state::{Checkpoint, CheckpointOutcome, GlobalStatus, RangeRecord, StateStore};

use crate::error::{BackupError, BackupResult};

const FILE_PREFIX: &str = "checkpoints-";
const FILE_SUFFIX: &str = ".json";

/// On-disk snapshot contents. Assignments are deliberately absent:
/// they are rebound at deploy time and must not survive a restart.
#[derive(Debug, Serialize, Deserialize)]
struct BackupFile {
    taken_at: u64,
    status: GlobalStatus,
    ranges: Vec<RangeRecord>,
    checkpoints: Vec<Checkpoint>,
}

/// What `recover` restored from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverySummary {
    pub source: PathBuf,
    pub ranges_restored: usize,
    pub checkpoints_applied: usize,
    pub status: GlobalStatus,
}

/// Writes periodic snapshots and enforces retention.
pub struct BackupManager {
    state: StateStore,
    destination: PathBuf,
    keep: usize,
    /// Disambiguates backups taken within the same second.
    seq: AtomicU64,
}

impl BackupManager {
    pub fn new(state: StateStore, destination: impl Into<PathBuf>, keep: usize) -> Self {
        Self {
            state,
            destination: destination.into(),
            keep: keep.max(1),
            seq: AtomicU64::new(0),
        }
    }

    /// Take one snapshot and prune old ones. Returns the file written.
    pub fn backup(&self) -> BackupResult<PathBuf> {
        let snapshot = self.state.snapshot()?;
        let file = BackupFile {
            taken_at: epoch_secs(),
            status: snapshot.status,
            ranges: snapshot.ranges,
            checkpoints: snapshot.checkpoints,
        };

        std::fs::create_dir_all(&self.destination).map_err(|e| BackupError::Io {
            path: self.destination.display().to_string(),
            source: e,
        })?;

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let name = format!("{FILE_PREFIX}{}-{seq:06}{FILE_SUFFIX}", file.taken_at);
        let path = self.destination.join(name);
        let json = serde_json::to_vec_pretty(&file)?;
        std::fs::write(&path, json).map_err(|e| BackupError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        debug!(path = %path.display(), checkpoints = file.checkpoints.len(), "backup written");
        self.prune()?;
        Ok(path)
    }

    /// Delete oldest backups beyond the retention bound.
    fn prune(&self) -> BackupResult<()> {
        let mut files = list_backups(&self.destination)?;
        while files.len() > self.keep {
            let oldest = files.remove(0);
            match std::fs::remove_file(&oldest) {
                Ok(()) => debug!(path = %oldest.display(), "old backup pruned"),
                Err(e) => warn!(path = %oldest.display(), error = %e, "failed to prune backup"),
            }
        }
        Ok(())
    }

    /// Snapshot on every interval until shutdown; a final backup is
    /// taken once the run is terminal so the last cursors survive.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            destination = %self.destination.display(),
            interval_secs = interval.as_secs(),
            keep = self.keep,
            "backup loop started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.backup() {
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "periodic backup failed"),
                    }
                    if matches!(self.state.global_status(), Ok(s) if s.is_terminal()) {
                        info!("run stopped; backup loop exiting after final snapshot");
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    if matches!(self.state.global_status(), Ok(s) if s.is_terminal())
                        && let Err(e) = self.backup()
                    {
                        error!(error = %e, "final backup failed");
                    }
                    info!("backup loop shutting down");
                    break;
                }
            }
        }
    }
}

/// Restore state from the newest snapshot in `dir`.
///
/// Missing ranges are recreated; existing ones are left alone.
/// Checkpoints replay through the store's monotonic guard, so recovery
/// can never move a cursor backwards. A missing or empty directory is
/// a clean start, not an error.
pub fn recover(state: &StateStore, dir: &Path) -> BackupResult<Option<RecoverySummary>> {
    let mut files = list_backups(dir)?;
    let Some(newest) = files.pop() else {
        debug!(dir = %dir.display(), "no backups found; clean start");
        return Ok(None);
    };

    let json = std::fs::read(&newest).map_err(|e| BackupError::Io {
        path: newest.display().to_string(),
        source: e,
    })?;
    let backup: BackupFile = serde_json::from_slice(&json)?;

    let mut ranges_restored = 0;
    for range in &backup.ranges {
        if state.get_range(&range.id)?.is_none() {
            // Restored ranges come back unassigned unless terminal;
            // live bindings never survive a coordinator restart.
            let mut range = range.clone();
            if !range.is_terminal() {
                range.status = keyfleet_state::RangeStatus::Unassigned;
            }
            state.put_range(&range)?;
            ranges_restored += 1;
        }
    }

    let mut checkpoints_applied = 0;
    for cp in &backup.checkpoints {
        match state.record_checkpoint(cp) {
            Ok(CheckpointOutcome::Advanced) => checkpoints_applied += 1,
            Ok(CheckpointOutcome::Stale) => {}
            Err(e) => warn!(range_id = %cp.range_id, error = %e, "checkpoint replay failed"),
        }
    }

    if backup.status.is_terminal() {
        state.restore_status(backup.status)?;
    }

    info!(
        source = %newest.display(),
        ranges_restored,
        checkpoints_applied,
        status = ?backup.status,
        "state recovered from backup"
    );
    Ok(Some(RecoverySummary {
        source: newest,
        ranges_restored,
        checkpoints_applied,
        status: backup.status,
    }))
}

/// Backup files in `dir`, sorted oldest to newest by name.
fn list_backups(dir: &Path) -> BackupResult<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(BackupError::Io {
                path: dir.display().to_string(),
                source: e,
            });
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| {
            let path = entry.ok()?.path();
            let name = path.file_name()?.to_str()?;
            (name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX)).then_some(path)
        })
        .collect();
    files.sort();
    Ok(files)
}
