//! Scaling controller — utilization-driven fleet sizing.
//!
//! Decisions come from the state snapshot alone; the actions that need
//! a remote side (provisioning, launching, teardown) go through
//! callbacks supplied by the assembly in the binary.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use keyfleet_core::{CoordinatorConfig, Target};
use keyfleet_deploy::BoxFuture;
use keyfleet_state::{
    AssignmentOutcome, FleetSnapshot, RangeId, RangeRecord, RangeStatus, StateResult, StateStore,
};

/// A sizing decision for the fleet as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Provision this many additional targets.
    ScaleUp(u32),
    /// Release this many active targets.
    ScaleDown(u32),
    NoChange,
}

/// Requests `n` fresh targets; may return fewer than asked.
pub type ProvisionCallback = Arc<dyn Fn(u32) -> BoxFuture<Vec<Target>> + Send + Sync>;
/// Binds and launches workers on freshly provisioned targets.
pub type AssignCallback = Arc<dyn Fn(Vec<(Target, RangeId)>) -> BoxFuture<()> + Send + Sync>;
/// Relaunches workers whose range shrank during a carve.
pub type RescopeCallback = Arc<dyn Fn(Vec<String>) -> BoxFuture<()> + Send + Sync>;
/// Tears down released targets (kill worker, stop monitor).
pub type ReleaseCallback = Arc<dyn Fn(Vec<String>) -> BoxFuture<()> + Send + Sync>;

/// Periodically sizes the fleet against the configured bounds.
pub struct ScalingController {
    state: StateStore,
    config: Arc<CoordinatorConfig>,
    provision: Option<ProvisionCallback>,
    assign: Option<AssignCallback>,
    rescope: Option<RescopeCallback>,
    release: Option<ReleaseCallback>,
}

impl ScalingController {
    pub fn new(state: StateStore, config: Arc<CoordinatorConfig>) -> Self {
        Self {
            state,
            config,
            provision: None,
            assign: None,
            rescope: None,
            release: None,
        }
    }

    pub fn with_provision(mut self, callback: ProvisionCallback) -> Self {
        self.provision = Some(callback);
        self
    }

    pub fn with_assign(mut self, callback: AssignCallback) -> Self {
        self.assign = Some(callback);
        self
    }

    pub fn with_rescope(mut self, callback: RescopeCallback) -> Self {
        self.rescope = Some(callback);
        self
    }

    pub fn with_release(mut self, callback: ReleaseCallback) -> Self {
        self.release = Some(callback);
        self
    }

    /// Size the fleet against the thresholds. Pure over the snapshot.
    ///
    /// Utilization is active targets over `max_instances`: low
    /// utilization means unused quota, so the fleet grows into it;
    /// utilization above `scale_down_threshold` sheds targets toward
    /// `min_instances`.
    pub fn evaluate(&self, snapshot: &FleetSnapshot) -> ScaleDecision {
        let opt = &self.config.optimization;
        if !opt.auto_scale || snapshot.status.is_terminal() || opt.max_instances == 0 {
            return ScaleDecision::NoChange;
        }

        let active = snapshot.assignments.len() as u32;
        let utilization = f64::from(active) / f64::from(opt.max_instances);

        if utilization < opt.scale_up_threshold && active < opt.max_instances {
            if !has_carvable_work(snapshot) {
                debug!("unused quota but no carvable work; not scaling up");
                return ScaleDecision::NoChange;
            }
            // Fill half the remaining headroom per pass.
            let headroom = opt.max_instances - active;
            return ScaleDecision::ScaleUp(headroom.div_ceil(2));
        }

        if utilization > opt.scale_down_threshold && active > opt.min_instances {
            let excess = active - opt.min_instances;
            return ScaleDecision::ScaleDown(excess.div_ceil(2));
        }

        ScaleDecision::NoChange
    }

    /// Execute a decision through the configured callbacks.
    pub async fn apply(&self, decision: ScaleDecision) {
        match decision {
            ScaleDecision::ScaleUp(n) => self.scale_up(n).await,
            ScaleDecision::ScaleDown(n) => self.scale_down(n).await,
            ScaleDecision::NoChange => {}
        }
    }

    async fn scale_up(&self, n: u32) {
        let Some(provision) = &self.provision else {
            warn!("scale-up decided but no provisioner configured");
            return;
        };
        let targets = provision(n).await;
        if targets.is_empty() {
            warn!(requested = n, "provisioner returned no targets");
            return;
        }
        if (targets.len() as u32) < n {
            info!(requested = n, granted = targets.len(), "provisioner granted fewer targets");
        }

        let (range_ids, donors) = match self.carve(targets.len()) {
            Ok(carved) => carved,
            Err(e) => {
                error!(error = %e, "failed to carve ranges for new targets");
                return;
            }
        };
        if range_ids.is_empty() {
            warn!("no ranges available for new targets");
            return;
        }

        let plan: Vec<(Target, RangeId)> = targets.into_iter().zip(range_ids).collect();
        info!(added = plan.len(), rescoped = donors.len(), "scaling up");
        if let Some(assign) = &self.assign {
            assign(plan).await;
        }
        if !donors.is_empty()
            && let Some(rescope) = &self.rescope
        {
            rescope(donors).await;
        }
    }

    /// Produce `want` unassigned ranges, splitting the largest work
    /// first. Prefers splitting unassigned ranges; once those are
    /// exhausted the unscanned tail of the biggest in-flight range is
    /// carved off, shrinking the donor (which must be relaunched).
    fn carve(&self, want: usize) -> StateResult<(Vec<RangeId>, Vec<String>)> {
        let snapshot = self.state.snapshot()?;
        let mut pool: Vec<RangeRecord> = Vec::new();
        let mut kept: Vec<RangeRecord> = Vec::new();
        for range in snapshot.ranges.iter().filter(|r| !r.is_terminal()) {
            if range.status == RangeStatus::Unassigned {
                pool.push(range.clone());
            } else {
                kept.push(range.clone());
            }
        }

        let mut donors: Vec<String> = Vec::new();
        let mut mutated = false;

        while pool.len() < want {
            // Widest unassigned range that can still be halved.
            if let Some(idx) = widest_splittable(&pool) {
                let range = pool.swap_remove(idx);
                let mid = range.start + range.width() / 2;
                pool.push(RangeRecord::new(range.start, mid, range.mode));
                pool.push(RangeRecord::new(mid, range.end, range.mode));
                mutated = true;
                continue;
            }

            // Otherwise carve the tail of the largest in-flight
            // remainder. The donor's checkpoint stays below the new
            // end, so the monotonic guard is preserved.
            let donor = kept
                .iter_mut()
                .filter(|r| unscanned_remainder(r, &snapshot) >= 2)
                .max_by_key(|r| unscanned_remainder(r, &snapshot));
            let Some(donor) = donor else { break };

            let cursor = scanned_to(donor, &snapshot);
            let mid = cursor + (donor.end - cursor) / 2;
            let tail = RangeRecord::new(mid, donor.end, donor.mode);
            donor.end = mid;
            if let Some(owner) = snapshot
                .assignments
                .iter()
                .find(|a| a.range_id == donor.id)
            {
                donors.push(owner.target_id.clone());
            }
            pool.push(tail);
            mutated = true;
        }

        if mutated {
            let mut revised = kept;
            revised.extend(pool.iter().cloned());
            self.state.replace_open_ranges(&revised)?;
        }

        pool.sort_by(|a, b| b.width().cmp(&a.width()).then(a.id.cmp(&b.id)));
        Ok((
            pool.into_iter().take(want).map(|r| r.id).collect(),
            donors,
        ))
    }

    /// Release the least-progressed targets. Their checkpoint stays in
    /// the store, so the range resumes from its cursor when it is
    /// handed out again.
    async fn scale_down(&self, n: u32) {
        let snapshot = match self.state.snapshot() {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to snapshot state for scale-down");
                return;
            }
        };

        let mut scored: Vec<(u128, String)> = snapshot
            .assignments
            .iter()
            .map(|a| {
                let progress = snapshot
                    .ranges
                    .iter()
                    .find(|r| r.id == a.range_id)
                    .map(|r| scanned_to(r, &snapshot) - r.start)
                    .unwrap_or(0);
                (progress, a.target_id.clone())
            })
            .collect();
        scored.sort();

        let mut released = Vec::new();
        for (progress, target_id) in scored.into_iter().take(n as usize) {
            match self.state.finalize(&target_id, AssignmentOutcome::Returned) {
                Ok(Some(assignment)) => {
                    info!(
                        %target_id,
                        range_id = %assignment.range_id,
                        progress,
                        "target released; range returned to pool"
                    );
                    released.push(target_id);
                }
                Ok(None) => {}
                Err(e) => error!(%target_id, error = %e, "failed to release target"),
            }
        }

        if !released.is_empty()
            && let Some(release) = &self.release
        {
            release(released).await;
        }
    }

    /// Evaluate and apply on the rebalance interval until shutdown or
    /// a terminal status.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.optimization.auto_scale {
            debug!("auto-scale disabled; scaling controller idle");
            return;
        }
        let interval: Duration = self.config.rebalance_interval();
        info!(interval_secs = interval.as_secs(), "scaling controller started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.state.snapshot() {
                        Ok(snapshot) => {
                            if snapshot.status.is_terminal() {
                                info!("run stopped; scaling controller exiting");
                                break;
                            }
                            let decision = self.evaluate(&snapshot);
                            if decision != ScaleDecision::NoChange {
                                self.apply(decision).await;
                            }
                        }
                        Err(e) => error!(error = %e, "failed to snapshot state"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("scaling controller shutting down");
                    break;
                }
            }
        }
    }
}

/// Cursor position of a range, clamped to its bounds.
fn scanned_to(range: &RangeRecord, snapshot: &FleetSnapshot) -> u128 {
    snapshot
        .cursor_for(&range.id)
        .map(|c| c.clamp(range.start, range.end))
        .unwrap_or(range.start)
}

fn unscanned_remainder(range: &RangeRecord, snapshot: &FleetSnapshot) -> u128 {
    range.end - scanned_to(range, snapshot)
}

fn widest_splittable(pool: &[RangeRecord]) -> Option<usize> {
    pool.iter()
        .enumerate()
        .filter(|(_, r)| r.width() >= 2)
        .max_by_key(|(_, r)| r.width())
        .map(|(idx, _)| idx)
}

/// Whether any work exists a new target could take on.
fn has_carvable_work(snapshot: &FleetSnapshot) -> bool {
    snapshot.ranges.iter().any(|r| match r.status {
        RangeStatus::Unassigned => true,
        RangeStatus::Assigned | RangeStatus::InProgress => {
            unscanned_remainder(r, snapshot) >= 2
        }
        _ => false,
    })
}
