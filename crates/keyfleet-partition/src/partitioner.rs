//! Range partitioning and rebalancing.
//!
//! `partition` cuts a keyspace into per-worker ranges under a
//! distribution strategy; `rebalance` re-cuts only the unscanned
//! remainder of an existing fleet. Both uphold the coverage law:
//! output ranges are sorted, pairwise disjoint, and their union equals
//! the input exactly. The remainder policy is deterministic — when the
//! interval does not divide evenly, the final range absorbs the
//! remainder.

use tracing::debug;

use keyfleet_core::{Keyspace, SearchMode};
use keyfleet_state::{FleetSnapshot, KangarooRole, RangeRecord};

use crate::error::PartitionError;

/// Output of `partition`: ranges in keyspace order plus the order in
/// which they should be handed to workers.
///
/// For the `random` strategy the assignment order is a deterministic
/// shuffle (reduces bias toward low addresses); for every other
/// strategy it is the identity.
#[derive(Debug, Clone)]
pub struct PartitionPlan {
    pub ranges: Vec<RangeRecord>,
    pub assignment_order: Vec<usize>,
}

impl PartitionPlan {
    /// Ranges in assignment order.
    pub fn in_assignment_order(&self) -> impl Iterator<Item = &RangeRecord> {
        self.assignment_order.iter().map(|&i| &self.ranges[i])
    }
}

/// Revised range set produced by a rebalance.
#[derive(Debug, Clone)]
pub struct RebalancePlan {
    /// Replacement for every non-terminal range, in keyspace order.
    pub revised: Vec<RangeRecord>,
    /// Unscanned keys covered by the revised ranges.
    pub remaining_width: u128,
}

/// Split `keyspace` into an ordered sequence of disjoint ranges
/// covering it exactly, one per worker.
pub fn partition(
    keyspace: Keyspace,
    mode: SearchMode,
    worker_count: u32,
) -> Result<PartitionPlan, PartitionError> {
    if keyspace.start >= keyspace.end {
        return Err(PartitionError::EmptyKeyspace {
            start: keyspace.start,
            end: keyspace.end,
        });
    }
    if worker_count == 0 {
        return Err(PartitionError::NoWorkers);
    }
    let width = keyspace.width();
    // A kangaroo pair needs at least two keys per worker or the
    // forward half of a block collapses to empty.
    let min_per_worker: u128 = if mode == SearchMode::Kangaroo { 2 } else { 1 };
    if u128::from(worker_count) * min_per_worker > width {
        return Err(PartitionError::TooManyWorkers {
            workers: worker_count,
            width,
        });
    }

    let ranges = match mode {
        SearchMode::Sequential | SearchMode::Random => {
            uniform_cuts(keyspace, worker_count, mode)
        }
        SearchMode::Smart => smart_cuts(keyspace, worker_count),
        SearchMode::Kangaroo => kangaroo_cuts(keyspace, worker_count),
    };

    let assignment_order = match mode {
        SearchMode::Random => shuffled_order(ranges.len(), shuffle_seed(keyspace, worker_count)),
        _ => (0..ranges.len()).collect(),
    };

    debug!(
        %keyspace,
        %mode,
        workers = worker_count,
        ranges = ranges.len(),
        "keyspace partitioned"
    );
    Ok(PartitionPlan {
        ranges,
        assignment_order,
    })
}

/// Uniform-size ranges; the final range absorbs the remainder.
fn uniform_cuts(keyspace: Keyspace, worker_count: u32, mode: SearchMode) -> Vec<RangeRecord> {
    let size = keyspace.width() / u128::from(worker_count);
    let mut ranges = Vec::with_capacity(worker_count as usize);
    let mut cursor = keyspace.start;
    for i in 0..worker_count {
        let end = if i == worker_count - 1 {
            keyspace.end
        } else {
            cursor + size
        };
        ranges.push(RangeRecord::new(cursor, end, mode));
        cursor = end;
    }
    ranges
}

/// Weighted sizing from a linear density ramp: range k gets weight
/// k + 1, so low-address ranges are narrower and receive more scanning
/// attention per key. Falls back to uniform cuts when the keyspace is
/// too small for the weights to resolve.
fn smart_cuts(keyspace: Keyspace, worker_count: u32) -> Vec<RangeRecord> {
    let n = u128::from(worker_count);
    let weight_total = n * (n + 1) / 2;
    let unit = keyspace.width() / weight_total;
    if unit == 0 {
        return uniform_cuts(keyspace, worker_count, SearchMode::Smart);
    }

    let mut ranges = Vec::with_capacity(worker_count as usize);
    let mut cursor = keyspace.start;
    for i in 0..worker_count {
        let end = if i == worker_count - 1 {
            keyspace.end
        } else {
            cursor + unit * u128::from(i + 1)
        };
        ranges.push(RangeRecord::new(cursor, end, SearchMode::Smart));
        cursor = end;
    }
    ranges
}

/// Worker pairs search a contiguous block inward from both ends: the
/// forward half runs up to the rendezvous midpoint, the backward half
/// from the midpoint to the block end. An odd worker gets a lone
/// forward range over the final block.
fn kangaroo_cuts(keyspace: Keyspace, worker_count: u32) -> Vec<RangeRecord> {
    let pairs = worker_count / 2;
    let lone = worker_count % 2;
    let blocks = u128::from(pairs + lone);
    let block_size = keyspace.width() / blocks;

    let mut ranges = Vec::with_capacity(worker_count as usize);
    let mut cursor = keyspace.start;
    for b in 0..pairs + lone {
        let block_end = if u128::from(b + 1) == blocks {
            keyspace.end
        } else {
            cursor + block_size
        };

        if b < pairs {
            let mid = cursor + (block_end - cursor) / 2;
            let pair_id = RangeRecord::id_for(cursor);
            let mut forward = RangeRecord::new(cursor, mid, SearchMode::Kangaroo);
            forward.pair_id = Some(pair_id.clone());
            forward.role = Some(KangarooRole::Forward);
            let mut backward = RangeRecord::new(mid, block_end, SearchMode::Kangaroo);
            backward.pair_id = Some(pair_id);
            backward.role = Some(KangarooRole::Backward);
            ranges.push(forward);
            ranges.push(backward);
        } else {
            let mut single = RangeRecord::new(cursor, block_end, SearchMode::Kangaroo);
            single.role = Some(KangarooRole::Forward);
            ranges.push(single);
        }
        cursor = block_end;
    }
    ranges
}

/// Re-cut the unscanned keyspace across a new worker count.
///
/// Completed and failed ranges are untouched. Every in-progress range
/// is first shrunk to `[last_checkpoint_cursor, end)`; only those
/// remainders are re-partitioned, so no revised range ever starts
/// below a persisted cursor.
pub fn rebalance(
    snapshot: &FleetSnapshot,
    mode: SearchMode,
    new_worker_count: u32,
) -> Result<RebalancePlan, PartitionError> {
    if new_worker_count == 0 {
        return Err(PartitionError::NoWorkers);
    }

    // Unscanned remainders, in keyspace order.
    let mut remainders: Vec<Keyspace> = Vec::new();
    for range in &snapshot.ranges {
        if range.is_terminal() {
            continue;
        }
        let resume_from = snapshot
            .cursor_for(&range.id)
            .map(|c| c.clamp(range.start, range.end))
            .unwrap_or(range.start);
        if resume_from < range.end {
            remainders.push(Keyspace {
                start: resume_from,
                end: range.end,
            });
        }
    }

    let remaining_width: u128 = remainders.iter().map(Keyspace::width).sum();
    if remaining_width == 0 {
        return Ok(RebalancePlan {
            revised: Vec::new(),
            remaining_width: 0,
        });
    }

    // Slice the remainders into ~new_worker_count ranges of roughly
    // equal size. A slice never crosses a remainder boundary — the gap
    // between remainders is already-scanned keyspace.
    let target = (remaining_width / u128::from(new_worker_count)).max(1);
    let mut revised = Vec::new();
    let mut quota_left = u128::from(new_worker_count);
    for remainder in &remainders {
        let mut cursor = remainder.start;
        while cursor < remainder.end {
            let is_last_slot = quota_left <= 1;
            let end = if is_last_slot {
                remainder.end
            } else {
                (cursor + target).min(remainder.end)
            };
            revised.push(RangeRecord::new(cursor, end, mode));
            cursor = end;
            quota_left = quota_left.saturating_sub(1);
        }
    }

    debug!(
        remainders = remainders.len(),
        revised = revised.len(),
        remaining_width,
        "keyspace rebalanced"
    );
    Ok(RebalancePlan {
        revised,
        remaining_width,
    })
}

/// Seed the deterministic shuffle from the partition inputs so a
/// resumed run reproduces the same assignment order.
fn shuffle_seed(keyspace: Keyspace, worker_count: u32) -> u64 {
    let mixed = keyspace.start ^ keyspace.end.rotate_left(64) ^ u128::from(worker_count);
    (mixed as u64) ^ ((mixed >> 64) as u64) | 1
}

/// Fisher-Yates with an xorshift64* generator.
fn shuffled_order(len: usize, seed: u64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    let mut state = seed;
    let mut next = || {
        state ^= state >> 12;
        state ^= state << 25;
        state ^= state >> 27;
        state.wrapping_mul(0x2545F4914F6CDD1D)
    };
    for i in (1..len).rev() {
        let j = (next() % (i as u64 + 1)) as usize;
        order.swap(i, j);
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyfleet_state::{Checkpoint, GlobalStatus, RangeStatus};

    fn ks(start: u128, end: u128) -> Keyspace {
        Keyspace { start, end }
    }

    fn assert_exact_cover(ranges: &[RangeRecord], keyspace: Keyspace) {
        assert!(!ranges.is_empty());
        assert_eq!(ranges[0].start, keyspace.start);
        assert_eq!(ranges.last().unwrap().end, keyspace.end);
        for pair in ranges.windows(2) {
            // Sorted, disjoint, gap-free.
            assert_eq!(pair[0].end, pair[1].start);
            assert!(pair[0].start < pair[0].end);
        }
        let total: u128 = ranges.iter().map(RangeRecord::width).sum();
        assert_eq!(total, keyspace.width());
    }

    // ── partition: sequential ──────────────────────────────────────

    #[test]
    fn sequential_even_split() {
        let plan = partition(ks(0, 100), SearchMode::Sequential, 4).unwrap();
        let bounds: Vec<(u128, u128)> = plan.ranges.iter().map(|r| (r.start, r.end)).collect();
        assert_eq!(bounds, vec![(0, 25), (25, 50), (50, 75), (75, 100)]);
        assert_eq!(plan.assignment_order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn sequential_last_range_absorbs_remainder() {
        let plan = partition(ks(0, 101), SearchMode::Sequential, 4).unwrap();
        let bounds: Vec<(u128, u128)> = plan.ranges.iter().map(|r| (r.start, r.end)).collect();
        assert_eq!(bounds, vec![(0, 25), (25, 50), (50, 75), (75, 101)]);
    }

    #[test]
    fn sequential_covers_hex_puzzle_bounds() {
        let keyspace = ks(0x20000000000000000, 0x3ffffffffffffffff);
        let plan = partition(keyspace, SearchMode::Sequential, 7).unwrap();
        assert_exact_cover(&plan.ranges, keyspace);
    }

    #[test]
    fn single_worker_gets_everything() {
        let plan = partition(ks(5, 17), SearchMode::Sequential, 1).unwrap();
        assert_eq!(plan.ranges.len(), 1);
        assert_eq!((plan.ranges[0].start, plan.ranges[0].end), (5, 17));
    }

    // ── partition: validation ──────────────────────────────────────

    #[test]
    fn empty_keyspace_rejected() {
        let err = partition(ks(10, 10), SearchMode::Sequential, 2).unwrap_err();
        assert!(matches!(err, PartitionError::EmptyKeyspace { .. }));
    }

    #[test]
    fn zero_workers_rejected() {
        let err = partition(ks(0, 100), SearchMode::Sequential, 0).unwrap_err();
        assert_eq!(err, PartitionError::NoWorkers);
    }

    #[test]
    fn more_workers_than_keys_rejected() {
        let err = partition(ks(0, 3), SearchMode::Sequential, 5).unwrap_err();
        assert!(matches!(err, PartitionError::TooManyWorkers { .. }));
    }

    // ── partition: random ──────────────────────────────────────────

    #[test]
    fn random_shuffles_assignment_order_not_ranges() {
        let plan = partition(ks(0, 1000), SearchMode::Random, 10).unwrap();
        assert_exact_cover(&plan.ranges, ks(0, 1000));

        let mut order = plan.assignment_order.clone();
        order.sort_unstable();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
        // 10 elements: identity permutation is vanishingly unlikely
        // from the fixed seed; assert the shuffle actually moved some.
        assert_ne!(plan.assignment_order, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn random_order_is_deterministic() {
        let a = partition(ks(0, 1000), SearchMode::Random, 10).unwrap();
        let b = partition(ks(0, 1000), SearchMode::Random, 10).unwrap();
        assert_eq!(a.assignment_order, b.assignment_order);
    }

    // ── partition: smart ───────────────────────────────────────────

    #[test]
    fn smart_is_exact_and_front_loaded() {
        let keyspace = ks(0, 1000);
        let plan = partition(keyspace, SearchMode::Smart, 4).unwrap();
        assert_exact_cover(&plan.ranges, keyspace);
        // Linear ramp: each range at least as wide as its predecessor.
        for pair in plan.ranges.windows(2) {
            assert!(pair[0].width() <= pair[1].width());
        }
        assert!(plan.ranges[0].width() < plan.ranges[3].width());
    }

    #[test]
    fn smart_tiny_keyspace_falls_back_to_uniform() {
        let keyspace = ks(0, 8);
        let plan = partition(keyspace, SearchMode::Smart, 4).unwrap();
        assert_exact_cover(&plan.ranges, keyspace);
    }

    // ── partition: kangaroo ────────────────────────────────────────

    #[test]
    fn kangaroo_pairs_share_a_contiguous_block() {
        let keyspace = ks(0, 400);
        let plan = partition(keyspace, SearchMode::Kangaroo, 4).unwrap();
        assert_exact_cover(&plan.ranges, keyspace);
        assert_eq!(plan.ranges.len(), 4);

        // Two pairs, each forward+backward meeting at the midpoint.
        for pair in plan.ranges.chunks(2) {
            assert_eq!(pair[0].pair_id, pair[1].pair_id);
            assert!(pair[0].pair_id.is_some());
            assert_eq!(pair[0].role, Some(KangarooRole::Forward));
            assert_eq!(pair[1].role, Some(KangarooRole::Backward));
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn kangaroo_odd_worker_gets_lone_forward_range() {
        let keyspace = ks(0, 300);
        let plan = partition(keyspace, SearchMode::Kangaroo, 3).unwrap();
        assert_exact_cover(&plan.ranges, keyspace);
        assert_eq!(plan.ranges.len(), 3);

        let lone = plan.ranges.last().unwrap();
        assert!(lone.pair_id.is_none());
        assert_eq!(lone.role, Some(KangarooRole::Forward));
    }

    // ── rebalance ──────────────────────────────────────────────────

    fn snapshot_with(
        ranges: Vec<RangeRecord>,
        checkpoints: Vec<Checkpoint>,
    ) -> FleetSnapshot {
        FleetSnapshot {
            ranges,
            assignments: Vec::new(),
            checkpoints,
            status: GlobalStatus::Running,
        }
    }

    #[test]
    fn rebalance_never_regresses_below_cursor() {
        let mut in_progress = RangeRecord::new(0, 100, SearchMode::Sequential);
        in_progress.status = RangeStatus::InProgress;
        let id = in_progress.id.clone();

        let snapshot = snapshot_with(
            vec![in_progress],
            vec![Checkpoint {
                range_id: id,
                cursor: 40,
                timestamp: 1000,
                found: false,
            }],
        );

        let plan = rebalance(&snapshot, SearchMode::Sequential, 3).unwrap();
        assert_eq!(plan.remaining_width, 60);
        assert_eq!(plan.revised.first().unwrap().start, 40);
        assert_eq!(plan.revised.last().unwrap().end, 100);
        for range in &plan.revised {
            assert!(range.start >= 40);
        }
    }

    #[test]
    fn rebalance_skips_terminal_ranges() {
        let mut done = RangeRecord::new(0, 50, SearchMode::Sequential);
        done.status = RangeStatus::Completed;
        let open = RangeRecord::new(50, 100, SearchMode::Sequential);

        let snapshot = snapshot_with(vec![done, open], vec![]);
        let plan = rebalance(&snapshot, SearchMode::Sequential, 2).unwrap();

        assert_eq!(plan.remaining_width, 50);
        assert!(plan.revised.iter().all(|r| r.start >= 50));
        assert_eq!(plan.revised.last().unwrap().end, 100);
    }

    #[test]
    fn rebalance_slices_never_cross_scanned_gaps() {
        // Two in-progress ranges with a completed range between them.
        let mut a = RangeRecord::new(0, 100, SearchMode::Sequential);
        a.status = RangeStatus::InProgress;
        let a_id = a.id.clone();
        let mut done = RangeRecord::new(100, 200, SearchMode::Sequential);
        done.status = RangeStatus::Completed;
        let b = RangeRecord::new(200, 300, SearchMode::Sequential);

        let snapshot = snapshot_with(
            vec![a, done, b],
            vec![Checkpoint {
                range_id: a_id,
                cursor: 90,
                timestamp: 1000,
                found: false,
            }],
        );

        let plan = rebalance(&snapshot, SearchMode::Sequential, 2).unwrap();
        assert_eq!(plan.remaining_width, 10 + 100);
        // No revised range may overlap [90, 100) ∪ [200, 300) complement.
        for range in &plan.revised {
            let in_first = range.start >= 90 && range.end <= 100;
            let in_second = range.start >= 200 && range.end <= 300;
            assert!(in_first || in_second, "range {range:?} crosses a scanned gap");
        }
        let covered: u128 = plan.revised.iter().map(RangeRecord::width).sum();
        assert_eq!(covered, plan.remaining_width);
    }

    #[test]
    fn rebalance_of_finished_fleet_is_empty() {
        let mut done = RangeRecord::new(0, 100, SearchMode::Sequential);
        done.status = RangeStatus::Completed;
        let snapshot = snapshot_with(vec![done], vec![]);

        let plan = rebalance(&snapshot, SearchMode::Sequential, 4).unwrap();
        assert!(plan.revised.is_empty());
        assert_eq!(plan.remaining_width, 0);
    }

    #[test]
    fn rebalance_zero_workers_rejected() {
        let snapshot = snapshot_with(vec![RangeRecord::new(0, 10, SearchMode::Sequential)], vec![]);
        assert_eq!(
            rebalance(&snapshot, SearchMode::Sequential, 0).unwrap_err(),
            PartitionError::NoWorkers
        );
    }

    #[test]
    fn rebalance_spreads_across_worker_count() {
        let open = RangeRecord::new(0, 1000, SearchMode::Sequential);
        let snapshot = snapshot_with(vec![open], vec![]);

        let plan = rebalance(&snapshot, SearchMode::Sequential, 4).unwrap();
        assert_eq!(plan.revised.len(), 4);
        assert_eq!(plan.revised[0].width(), 250);
        assert_eq!(plan.revised.last().unwrap().end, 1000);
    }
}
