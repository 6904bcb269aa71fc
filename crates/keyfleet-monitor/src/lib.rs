//! keyfleet-monitor — watches the fleet while it scans.
//!
//! One poll loop per target reads the worker's status file over the
//! deployment transport, feeds checkpoints into the state store, and
//! publishes `FleetEvent`s on a single mpsc stream. Targets that stop
//! answering are restarted up to a budget; past the budget their range
//! is marked failed and surfaced instead of retried forever.

pub mod monitor;
pub mod stats;
pub mod status;
pub mod tracker;

pub use monitor::{FleetEvent, FleetMonitor, RestartCallback};
pub use stats::{FleetStats, RateBoard, StatsAggregator};
pub use status::WorkerStatus;
pub use tracker::{PollResult, PollTracker};
