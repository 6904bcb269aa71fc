//! Domain types persisted by the fleet state store.

use serde::{Deserialize, Serialize};

use keyfleet_core::{Keyspace, SearchMode};

/// Unique identifier for a range. Derived from the range start so the
/// id doubles as a sort key.
pub type RangeId = String;

/// Lifecycle of a keyspace range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeStatus {
    Unassigned,
    Assigned,
    InProgress,
    Completed,
    Failed,
}

/// Role of a range in a kangaroo pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KangarooRole {
    /// Searches upward from the block start toward the rendezvous point.
    Forward,
    /// Searches downward from the block end toward the rendezvous point.
    Backward,
}

/// A contiguous, disjoint sub-interval of the keyspace assigned as one
/// unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeRecord {
    pub id: RangeId,
    pub start: u128,
    pub end: u128,
    pub status: RangeStatus,
    pub mode: SearchMode,
    /// Set for kangaroo ranges; pairs share `pair_id`.
    pub pair_id: Option<String>,
    pub role: Option<KangarooRole>,
}

impl RangeRecord {
    /// Derive the canonical range id from its start bound.
    pub fn id_for(start: u128) -> RangeId {
        format!("{start:032x}")
    }

    pub fn new(start: u128, end: u128, mode: SearchMode) -> Self {
        Self {
            id: Self::id_for(start),
            start,
            end,
            status: RangeStatus::Unassigned,
            mode,
            pair_id: None,
            role: None,
        }
    }

    pub fn keyspace(&self) -> Keyspace {
        Keyspace {
            start: self.start,
            end: self.end,
        }
    }

    pub fn width(&self) -> u128 {
        self.end - self.start
    }

    /// Terminal states never leave the pool again.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, RangeStatus::Completed | RangeStatus::Failed)
    }
}

/// Binding of a range to a target. One active assignment per target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub target_id: String,
    pub range_id: RangeId,
    pub mode: SearchMode,
    /// Unix timestamp (seconds) when the worker was launched.
    pub started_at: u64,
    /// Last cursor observed by the monitor, mirrored from checkpoints.
    pub last_cursor: u128,
    pub retry_count: u32,
}

/// Persisted progress marker for a range. Cursor only ever advances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub range_id: RangeId,
    pub cursor: u128,
    pub timestamp: u64,
    pub found: bool,
}

/// Outcome of submitting a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// Cursor advanced and was persisted.
    Advanced,
    /// Cursor was behind or equal to the stored one, or outside the
    /// range bounds; ignored.
    Stale,
}

/// Terminal outcome when an assignment is finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentOutcome {
    /// Range fully scanned (or force-completed at a partial cursor on
    /// a global stop).
    Completed,
    /// Retry budget exhausted; surfaced for operator attention.
    Failed,
    /// Deployment never stuck; range goes back to the unassigned pool.
    Returned,
}

/// Run-level status. Transitions are monotonic: once non-`Running`,
/// no new assignment may be created and rebalancing stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalStatus {
    Running,
    StoppedFound,
    StoppedExhausted,
    StoppedError,
}

impl GlobalStatus {
    pub fn is_terminal(&self) -> bool {
        *self != GlobalStatus::Running
    }
}

/// Read snapshot of the whole fleet state, consumed by the
/// partitioner's rebalance, the scaler, and the final report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub ranges: Vec<RangeRecord>,
    pub assignments: Vec<Assignment>,
    pub checkpoints: Vec<Checkpoint>,
    pub status: GlobalStatus,
}

impl FleetSnapshot {
    /// Latest persisted cursor for a range, if any.
    pub fn cursor_for(&self, range_id: &str) -> Option<u128> {
        self.checkpoints
            .iter()
            .find(|c| c.range_id == range_id)
            .map(|c| c.cursor)
    }

    /// The assignment currently bound to a target, if any.
    pub fn assignment_for(&self, target_id: &str) -> Option<&Assignment> {
        self.assignments.iter().find(|a| a.target_id == target_id)
    }

    /// Total keys in all ranges.
    pub fn total_width(&self) -> u128 {
        self.ranges.iter().map(RangeRecord::width).sum()
    }

    /// Keys confirmed scanned: completed ranges plus checkpointed
    /// prefixes of in-progress ranges.
    pub fn scanned_width(&self) -> u128 {
        self.ranges
            .iter()
            .map(|r| match r.status {
                RangeStatus::Completed => r.width(),
                RangeStatus::InProgress | RangeStatus::Assigned => self
                    .cursor_for(&r.id)
                    .map(|c| c.saturating_sub(r.start).min(r.width()))
                    .unwrap_or(0),
                _ => 0,
            })
            .sum()
    }

    /// Whether every range reached `Completed`.
    pub fn all_completed(&self) -> bool {
        !self.ranges.is_empty()
            && self
                .ranges
                .iter()
                .all(|r| r.status == RangeStatus::Completed)
    }
}
