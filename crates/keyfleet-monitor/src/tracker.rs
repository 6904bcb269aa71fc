//! Poll result tracking for a single target.
//!
//! Classifies a target from its consecutive poll outcomes: a target
//! that answers is healthy, one that keeps answering garbage (or an
//! empty status file) goes stale, and one the transport cannot reach
//! goes dead. A single successful poll recovers from either.

use tracing::{debug, warn};

use keyfleet_core::TargetHealth;

/// Outcome of a single status poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    /// The status file was read and parsed.
    Answered,
    /// The transport worked but the status line was absent or malformed.
    Missed,
    /// The transport could not reach the target at all.
    Unreachable,
}

/// Tracks consecutive poll results for a single target.
#[derive(Debug)]
pub struct PollTracker {
    health: TargetHealth,
    consecutive_misses: u32,
    consecutive_unreachable: u32,
    /// Consecutive degraded polls before Healthy flips to Stale/Dead.
    threshold: u32,
}

impl PollTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            health: TargetHealth::Unknown,
            consecutive_misses: 0,
            consecutive_unreachable: 0,
            threshold: threshold.max(1),
        }
    }

    /// Record a poll result and return the new classification.
    pub fn record(&mut self, result: PollResult) -> TargetHealth {
        match result {
            PollResult::Answered => {
                if self.health != TargetHealth::Healthy && self.health != TargetHealth::Unknown {
                    debug!(
                        misses = self.consecutive_misses,
                        unreachable = self.consecutive_unreachable,
                        "target recovered"
                    );
                }
                self.consecutive_misses = 0;
                self.consecutive_unreachable = 0;
                self.health = TargetHealth::Healthy;
            }
            PollResult::Missed => {
                self.consecutive_unreachable = 0;
                self.consecutive_misses += 1;
                if self.consecutive_misses >= self.threshold {
                    if self.health != TargetHealth::Stale {
                        warn!(
                            misses = self.consecutive_misses,
                            threshold = self.threshold,
                            "target classified stale"
                        );
                    }
                    self.health = TargetHealth::Stale;
                }
            }
            PollResult::Unreachable => {
                self.consecutive_misses = 0;
                self.consecutive_unreachable += 1;
                if self.consecutive_unreachable >= self.threshold {
                    if self.health != TargetHealth::Dead {
                        warn!(
                            unreachable = self.consecutive_unreachable,
                            threshold = self.threshold,
                            "target classified dead"
                        );
                    }
                    self.health = TargetHealth::Dead;
                }
            }
        }
        self.health
    }

    pub fn health(&self) -> TargetHealth {
        self.health
    }

    /// Whether the target needs its worker relaunched.
    pub fn needs_restart(&self) -> bool {
        matches!(self.health, TargetHealth::Stale | TargetHealth::Dead)
    }

    /// Forget the degraded streak after a restart was issued, so the
    /// relaunched worker gets a full threshold before re-escalating.
    pub fn reset(&mut self) {
        self.consecutive_misses = 0;
        self.consecutive_unreachable = 0;
        self.health = TargetHealth::Unknown;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_starts_unknown() {
        let tracker = PollTracker::new(3);
        assert_eq!(tracker.health(), TargetHealth::Unknown);
        assert!(!tracker.needs_restart());
    }

    #[test]
    fn answered_poll_is_healthy() {
        let mut tracker = PollTracker::new(3);
        assert_eq!(tracker.record(PollResult::Answered), TargetHealth::Healthy);
    }

    #[test]
    fn stays_healthy_under_threshold() {
        let mut tracker = PollTracker::new(3);
        tracker.record(PollResult::Answered);
        tracker.record(PollResult::Missed);
        tracker.record(PollResult::Missed);
        assert_eq!(tracker.health(), TargetHealth::Healthy);
        assert!(!tracker.needs_restart());
    }

    #[test]
    fn goes_stale_at_threshold() {
        let mut tracker = PollTracker::new(3);
        tracker.record(PollResult::Answered);
        tracker.record(PollResult::Missed);
        tracker.record(PollResult::Missed);
        let health = tracker.record(PollResult::Missed);
        assert_eq!(health, TargetHealth::Stale);
        assert!(tracker.needs_restart());
    }

    #[test]
    fn goes_dead_on_unreachable_streak() {
        let mut tracker = PollTracker::new(2);
        tracker.record(PollResult::Unreachable);
        let health = tracker.record(PollResult::Unreachable);
        assert_eq!(health, TargetHealth::Dead);
        assert!(tracker.needs_restart());
    }

    #[test]
    fn mixed_failures_do_not_share_a_streak() {
        // Alternating miss/unreachable never reaches either threshold.
        let mut tracker = PollTracker::new(2);
        for _ in 0..4 {
            tracker.record(PollResult::Missed);
            tracker.record(PollResult::Unreachable);
        }
        assert_eq!(tracker.health(), TargetHealth::Unknown);
    }

    #[test]
    fn single_answer_recovers() {
        let mut tracker = PollTracker::new(2);
        tracker.record(PollResult::Unreachable);
        tracker.record(PollResult::Unreachable);
        assert_eq!(tracker.health(), TargetHealth::Dead);

        assert_eq!(tracker.record(PollResult::Answered), TargetHealth::Healthy);
        assert!(!tracker.needs_restart());
    }

    #[test]
    fn reset_restores_full_budget() {
        let mut tracker = PollTracker::new(2);
        tracker.record(PollResult::Missed);
        tracker.record(PollResult::Missed);
        assert!(tracker.needs_restart());

        tracker.reset();
        assert_eq!(tracker.health(), TargetHealth::Unknown);
        tracker.record(PollResult::Missed);
        assert!(!tracker.needs_restart());
    }

    #[test]
    fn zero_threshold_clamps_to_one() {
        let mut tracker = PollTracker::new(0);
        assert_eq!(tracker.record(PollResult::Missed), TargetHealth::Stale);
    }
}
