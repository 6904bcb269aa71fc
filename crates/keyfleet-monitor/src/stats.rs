//! Fleet-wide progress statistics.
//!
//! The poll loops publish each worker's latest scan rate onto a shared
//! board; the aggregator combines that with the state store snapshot
//! into scanned fraction, aggregate throughput, and an ETA, logged on
//! the stats interval and reused for the final report.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use keyfleet_state::{GlobalStatus, RangeStatus, StateResult, StateStore};

/// Latest observed scan rate per target, keys per second.
#[derive(Debug, Default)]
pub struct RateBoard {
    rates: Mutex<HashMap<String, f64>>,
}

impl RateBoard {
    pub fn record(&self, target_id: &str, rate: f64) {
        let mut rates = self.rates.lock().unwrap_or_else(|e| e.into_inner());
        rates.insert(target_id.to_string(), rate);
    }

    pub fn remove(&self, target_id: &str) {
        let mut rates = self.rates.lock().unwrap_or_else(|e| e.into_inner());
        rates.remove(target_id);
    }

    /// Aggregate fleet throughput.
    pub fn total(&self) -> f64 {
        let rates = self.rates.lock().unwrap_or_else(|e| e.into_inner());
        rates.values().sum()
    }
}

/// One computed stats sample.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetStats {
    pub status: GlobalStatus,
    pub total_keys: u128,
    pub scanned_keys: u128,
    /// Scanned fraction in [0, 1].
    pub fraction: f64,
    /// Aggregate throughput, keys per second.
    pub throughput: f64,
    /// Seconds to exhaustion at current throughput, if computable.
    pub eta_secs: Option<u64>,
    pub active_targets: usize,
    pub completed_ranges: usize,
    pub failed_ranges: usize,
}

/// Computes and logs fleet stats on an interval.
pub struct StatsAggregator {
    state: StateStore,
    rates: std::sync::Arc<RateBoard>,
}

impl StatsAggregator {
    pub fn new(state: StateStore, rates: std::sync::Arc<RateBoard>) -> Self {
        Self { state, rates }
    }

    /// One sample from the current state.
    pub fn compute(&self) -> StateResult<FleetStats> {
        let snapshot = self.state.snapshot()?;
        let total = snapshot.total_width();
        let scanned = snapshot.scanned_width();
        let throughput = self.rates.total();

        let fraction = if total == 0 {
            0.0
        } else {
            scanned as f64 / total as f64
        };
        let remaining = total.saturating_sub(scanned);
        let eta_secs = if throughput > 0.0 && remaining > 0 {
            Some((remaining as f64 / throughput) as u64)
        } else {
            None
        };

        Ok(FleetStats {
            status: snapshot.status,
            total_keys: total,
            scanned_keys: scanned,
            fraction,
            throughput,
            eta_secs,
            active_targets: snapshot.assignments.len(),
            completed_ranges: snapshot
                .ranges
                .iter()
                .filter(|r| r.status == RangeStatus::Completed)
                .count(),
            failed_ranges: snapshot
                .ranges
                .iter()
                .filter(|r| r.status == RangeStatus::Failed)
                .count(),
        })
    }

    /// Log a sample every `interval` until shutdown or the run ends.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.compute() {
                        Ok(stats) => {
                            info!(
                                scanned_pct = format!("{:.4}", stats.fraction * 100.0),
                                throughput = format!("{:.0}", stats.throughput),
                                eta_secs = stats.eta_secs,
                                active = stats.active_targets,
                                completed = stats.completed_ranges,
                                failed = stats.failed_ranges,
                                "fleet progress"
                            );
                            if stats.status.is_terminal() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to compute fleet stats"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use keyfleet_core::SearchMode;
    use keyfleet_state::{Checkpoint, RangeRecord};

    #[test]
    fn rate_board_aggregates_and_forgets() {
        let board = RateBoard::default();
        board.record("proj-1", 100.0);
        board.record("proj-2", 50.0);
        assert_eq!(board.total(), 150.0);

        // Re-recording replaces, removal forgets.
        board.record("proj-1", 80.0);
        assert_eq!(board.total(), 130.0);
        board.remove("proj-2");
        assert_eq!(board.total(), 80.0);
    }

    #[test]
    fn compute_reports_progress_and_eta() {
        let state = StateStore::open_in_memory().unwrap();
        let done = {
            let mut r = RangeRecord::new(0, 400, SearchMode::Sequential);
            r.status = RangeStatus::Completed;
            r
        };
        let live = RangeRecord::new(400, 1000, SearchMode::Sequential);
        state.put_range(&done).unwrap();
        state.put_range(&live).unwrap();
        state
            .bind("proj-1", &live.id, SearchMode::Sequential, 1000)
            .unwrap();
        state.activate("proj-1").unwrap();
        state
            .record_checkpoint(&Checkpoint {
                range_id: live.id.clone(),
                cursor: 500,
                timestamp: 1000,
                found: false,
            })
            .unwrap();

        let rates = Arc::new(RateBoard::default());
        rates.record("proj-1", 100.0);
        let stats = StatsAggregator::new(state, rates).compute().unwrap();

        assert_eq!(stats.total_keys, 1000);
        assert_eq!(stats.scanned_keys, 500);
        assert_eq!(stats.fraction, 0.5);
        assert_eq!(stats.throughput, 100.0);
        // 500 keys left at 100 keys/s.
        assert_eq!(stats.eta_secs, Some(5));
        assert_eq!(stats.active_targets, 1);
        assert_eq!(stats.completed_ranges, 1);
    }

    #[test]
    fn compute_without_throughput_has_no_eta() {
        let state = StateStore::open_in_memory().unwrap();
        state
            .put_range(&RangeRecord::new(0, 100, SearchMode::Sequential))
            .unwrap();

        let stats = StatsAggregator::new(state, Arc::new(RateBoard::default()))
            .compute()
            .unwrap();
        assert_eq!(stats.eta_secs, None);
        assert_eq!(stats.fraction, 0.0);
    }

    #[tokio::test]
    async fn run_exits_on_shutdown() {
        let state = StateStore::open_in_memory().unwrap();
        let aggregator = StatsAggregator::new(state, Arc::new(RateBoard::default()));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            aggregator.run(Duration::from_secs(3600), rx).await;
        });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
