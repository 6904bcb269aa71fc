//! StateStore — redb-backed persistence for the fleet.
//!
//! Typed operations over ranges, assignments, checkpoints, and the
//! global status. All values are JSON-serialized into redb's `&[u8]`
//! value columns. Supports both on-disk and in-memory backends (the
//! latter for testing).
//!
//! Two invariants are enforced here and nowhere else:
//! - `record_checkpoint` never lets a cursor regress (stale or
//!   duplicate reports are ignored, not errors);
//! - `try_stop` is a compare-and-set from `Running` only, so the first
//!   terminal transition wins and sticks.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

use keyfleet_core::SearchMode;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe fleet state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "fleet state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory fleet state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(RANGES).map_err(map_err!(Table))?;
        txn.open_table(ASSIGNMENTS).map_err(map_err!(Table))?;
        txn.open_table(CHECKPOINTS).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Ranges ─────────────────────────────────────────────────────

    /// Insert or update a range record.
    pub fn put_range(&self, range: &RangeRecord) -> StateResult<()> {
        let value = serde_json::to_vec(range).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RANGES).map_err(map_err!(Table))?;
            table
                .insert(range.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a range by id.
    pub fn get_range(&self, range_id: &str) -> StateResult<Option<RangeRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RANGES).map_err(map_err!(Table))?;
        match table.get(range_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let range: RangeRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(range))
            }
            None => Ok(None),
        }
    }

    /// List every range in keyspace order.
    pub fn list_ranges(&self) -> StateResult<Vec<RangeRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RANGES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let range: RangeRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(range);
        }
        Ok(results)
    }

    /// Set the status of a single range.
    pub fn set_range_status(&self, range_id: &str, status: RangeStatus) -> StateResult<()> {
        let mut range = self
            .get_range(range_id)?
            .ok_or_else(|| StateError::NotFound(format!("range {range_id}")))?;
        range.status = status;
        self.put_range(&range)
    }

    /// Replace every non-terminal range with a revised set, atomically.
    ///
    /// Completed and failed ranges are kept untouched; this is the
    /// write half of a rebalance. Fails if any new range collides with
    /// a surviving terminal range id.
    pub fn replace_open_ranges(&self, revised: &[RangeRecord]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RANGES).map_err(map_err!(Table))?;

            let open_keys: Vec<String> = table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, value) = entry.ok()?;
                    let range: RangeRecord = serde_json::from_slice(value.value()).ok()?;
                    (!range.is_terminal()).then(|| key.value().to_string())
                })
                .collect();
            for key in &open_keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }

            for range in revised {
                if let Some(existing) = table.get(range.id.as_str()).map_err(map_err!(Read))? {
                    let kept: RangeRecord = serde_json::from_slice(existing.value())
                        .map_err(map_err!(Deserialize))?;
                    drop(existing);
                    if kept.is_terminal() {
                        return Err(StateError::Conflict(format!(
                            "revised range {} collides with terminal range",
                            range.id
                        )));
                    }
                }
                let value = serde_json::to_vec(range).map_err(map_err!(Serialize))?;
                table
                    .insert(range.id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = revised.len(), "open ranges replaced");
        Ok(())
    }

    // ── Assignments ────────────────────────────────────────────────

    /// Bind a range to a target: creates the assignment and flips the
    /// range `Unassigned → Assigned`.
    ///
    /// Refuses when the run is no longer `Running`, when the target
    /// already holds an active assignment, or when the range is not in
    /// the unassigned pool. One active assignment per target, always.
    pub fn bind(
        &self,
        target_id: &str,
        range_id: &str,
        mode: SearchMode,
        now: u64,
    ) -> StateResult<Assignment> {
        if self.global_status()?.is_terminal() {
            return Err(StateError::Conflict("run is no longer running".to_string()));
        }
        if self.get_assignment(target_id)?.is_some() {
            return Err(StateError::Conflict(format!(
                "target {target_id} already has an active assignment"
            )));
        }
        let range = self
            .get_range(range_id)?
            .ok_or_else(|| StateError::NotFound(format!("range {range_id}")))?;
        if range.status != RangeStatus::Unassigned {
            return Err(StateError::Conflict(format!(
                "range {range_id} is not unassigned"
            )));
        }

        let assignment = Assignment {
            target_id: target_id.to_string(),
            range_id: range_id.to_string(),
            mode,
            started_at: now,
            last_cursor: range.start,
            retry_count: 0,
        };
        self.put_assignment(&assignment)?;
        self.set_range_status(range_id, RangeStatus::Assigned)?;
        debug!(%target_id, %range_id, "range bound to target");
        Ok(assignment)
    }

    /// Insert or update an assignment.
    pub fn put_assignment(&self, assignment: &Assignment) -> StateResult<()> {
        let value = serde_json::to_vec(assignment).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ASSIGNMENTS).map_err(map_err!(Table))?;
            table
                .insert(assignment.target_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get the active assignment for a target.
    pub fn get_assignment(&self, target_id: &str) -> StateResult<Option<Assignment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ASSIGNMENTS).map_err(map_err!(Table))?;
        match table.get(target_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let assignment: Assignment =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(assignment))
            }
            None => Ok(None),
        }
    }

    /// List all active assignments.
    pub fn list_assignments(&self) -> StateResult<Vec<Assignment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ASSIGNMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let assignment: Assignment =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(assignment);
        }
        Ok(results)
    }

    /// Mark a bound range as actively being scanned (worker confirmed).
    pub fn activate(&self, target_id: &str) -> StateResult<()> {
        let assignment = self
            .get_assignment(target_id)?
            .ok_or_else(|| StateError::NotFound(format!("assignment for {target_id}")))?;
        self.set_range_status(&assignment.range_id, RangeStatus::InProgress)
    }

    /// Bump the retry counter of an active assignment, returning the
    /// new count.
    pub fn increment_retry(&self, target_id: &str) -> StateResult<u32> {
        let mut assignment = self
            .get_assignment(target_id)?
            .ok_or_else(|| StateError::NotFound(format!("assignment for {target_id}")))?;
        assignment.retry_count += 1;
        let count = assignment.retry_count;
        self.put_assignment(&assignment)?;
        Ok(count)
    }

    /// Destroy an assignment and move its range to its terminal (or
    /// returned) status. Returns the finalized assignment, or `None`
    /// if the target held none.
    pub fn finalize(
        &self,
        target_id: &str,
        outcome: AssignmentOutcome,
    ) -> StateResult<Option<Assignment>> {
        let Some(assignment) = self.get_assignment(target_id)? else {
            return Ok(None);
        };

        let status = match outcome {
            AssignmentOutcome::Completed => RangeStatus::Completed,
            AssignmentOutcome::Failed => RangeStatus::Failed,
            AssignmentOutcome::Returned => RangeStatus::Unassigned,
        };
        self.set_range_status(&assignment.range_id, status)?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ASSIGNMENTS).map_err(map_err!(Table))?;
            table.remove(target_id).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%target_id, range_id = %assignment.range_id, ?outcome, "assignment finalized");
        Ok(Some(assignment))
    }

    // ── Checkpoints ────────────────────────────────────────────────

    /// Persist a checkpoint, enforcing cursor monotonicity.
    ///
    /// A cursor at or behind the stored one, below the range start, or
    /// past the range end is ignored and reported as `Stale` — a stale
    /// or duplicate report must never regress progress. A cursor equal
    /// to the range end is accepted: that is how a finished worker
    /// reports the range fully scanned. On `Advanced`, the owning
    /// assignment's `last_cursor` mirror is refreshed.
    pub fn record_checkpoint(&self, cp: &Checkpoint) -> StateResult<CheckpointOutcome> {
        let range = self
            .get_range(&cp.range_id)?
            .ok_or_else(|| StateError::NotFound(format!("range {}", cp.range_id)))?;
        if cp.cursor < range.start || cp.cursor > range.end {
            debug!(range_id = %cp.range_id, cursor = %cp.cursor, "checkpoint outside range bounds, ignored");
            return Ok(CheckpointOutcome::Stale);
        }

        if let Some(stored) = self.get_checkpoint(&cp.range_id)?
            && cp.cursor <= stored.cursor
        {
            debug!(
                range_id = %cp.range_id,
                cursor = %cp.cursor,
                stored = %stored.cursor,
                "stale checkpoint ignored"
            );
            return Ok(CheckpointOutcome::Stale);
        }

        let value = serde_json::to_vec(cp).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CHECKPOINTS).map_err(map_err!(Table))?;
            table
                .insert(cp.range_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        // Mirror into the owning assignment, if one is active.
        for mut assignment in self.list_assignments()? {
            if assignment.range_id == cp.range_id {
                assignment.last_cursor = cp.cursor;
                self.put_assignment(&assignment)?;
                break;
            }
        }

        Ok(CheckpointOutcome::Advanced)
    }

    /// Get the latest checkpoint for a range.
    pub fn get_checkpoint(&self, range_id: &str) -> StateResult<Option<Checkpoint>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CHECKPOINTS).map_err(map_err!(Table))?;
        match table.get(range_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let cp: Checkpoint =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(cp))
            }
            None => Ok(None),
        }
    }

    /// List all checkpoints.
    pub fn list_checkpoints(&self) -> StateResult<Vec<Checkpoint>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CHECKPOINTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let cp: Checkpoint =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(cp);
        }
        Ok(results)
    }

    // ── Global status ──────────────────────────────────────────────

    /// Current run status. A store with no recorded status is `Running`.
    pub fn global_status(&self) -> StateResult<GlobalStatus> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(META).map_err(map_err!(Table))?;
        match table.get(STATUS_KEY).map_err(map_err!(Read))? {
            Some(guard) => {
                let status: GlobalStatus =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(status)
            }
            None => Ok(GlobalStatus::Running),
        }
    }

    /// Compare-and-set the global status to a terminal state.
    ///
    /// Succeeds only from `Running`; returns `false` when another
    /// writer already stopped the run. Terminal states never change
    /// again.
    pub fn try_stop(&self, status: GlobalStatus) -> StateResult<bool> {
        if !status.is_terminal() {
            return Err(StateError::Conflict(
                "cannot transition back to running".to_string(),
            ));
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let won;
        {
            let mut table = txn.open_table(META).map_err(map_err!(Table))?;
            let current = match table.get(STATUS_KEY).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => GlobalStatus::Running,
            };
            won = current == GlobalStatus::Running;
            if won {
                let value = serde_json::to_vec(&status).map_err(map_err!(Serialize))?;
                table
                    .insert(STATUS_KEY, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(?status, won, "terminal status transition attempted");
        Ok(won)
    }

    /// Force-set the status, used only by recovery to restore a
    /// previously persisted terminal state.
    pub fn restore_status(&self, status: GlobalStatus) -> StateResult<()> {
        let value = serde_json::to_vec(&status).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(META).map_err(map_err!(Table))?;
            table
                .insert(STATUS_KEY, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Snapshots ──────────────────────────────────────────────────

    /// Consistent read snapshot of the whole fleet state.
    pub fn snapshot(&self) -> StateResult<FleetSnapshot> {
        Ok(FleetSnapshot {
            ranges: self.list_ranges()?,
            assignments: self.list_assignments()?,
            checkpoints: self.list_checkpoints()?,
            status: self.global_status()?,
        })
    }
}
