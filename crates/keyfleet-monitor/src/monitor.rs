//! Fleet monitor — background poll loop per target.
//!
//! Each monitored target gets its own task that periodically `cat`s
//! the worker status file over the transport, records the checkpoint,
//! and publishes events on a single mpsc stream. Degraded targets are
//! relaunched through a callback up to `max_restart_attempts`; after
//! that the range is finalized failed and surfaced.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use keyfleet_core::{CoordinatorConfig, Target, TargetHealth};
use keyfleet_deploy::{BoxFuture, TargetTransport};
use keyfleet_state::{AssignmentOutcome, Checkpoint, CheckpointOutcome, RangeId, StateStore};

use keyfleet_core::registry::epoch_secs;

use crate::stats::RateBoard;
use crate::status::parse_status_line;
use crate::tracker::{PollResult, PollTracker};

/// Everything downstream consumers need to react to the fleet.
#[derive(Debug, Clone, PartialEq)]
pub enum FleetEvent {
    /// A worker reported progress; the cursor has been persisted.
    Checkpoint {
        target_id: String,
        range_id: RangeId,
        cursor: u128,
        rate: f64,
    },
    /// A worker reported a hit. The run should stop.
    Found {
        target_id: String,
        range_id: RangeId,
        cursor: u128,
    },
    /// A target degraded to stale or dead.
    TargetDown {
        target_id: String,
        health: TargetHealth,
    },
    /// A range exhausted its restart budget and was marked failed.
    RangeFailed {
        target_id: String,
        range_id: RangeId,
    },
}

/// Invoked to relaunch the worker on a degraded target, same range.
pub type RestartCallback = Arc<dyn Fn(Target, RangeId) -> BoxFuture<()> + Send + Sync>;

struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Manages poll loops for all deployed targets.
pub struct FleetMonitor {
    state: StateStore,
    transport: Arc<dyn TargetTransport>,
    config: Arc<CoordinatorConfig>,
    rates: Arc<RateBoard>,
    events: mpsc::Sender<FleetEvent>,
    /// Active loops: target_id → slot.
    monitors: Arc<RwLock<HashMap<String, MonitorSlot>>>,
    on_restart: Option<RestartCallback>,
}

impl FleetMonitor {
    /// Create a monitor and the event stream it publishes to.
    pub fn new(
        state: StateStore,
        transport: Arc<dyn TargetTransport>,
        config: Arc<CoordinatorConfig>,
        rates: Arc<RateBoard>,
    ) -> (Self, mpsc::Receiver<FleetEvent>) {
        let (events, rx) = mpsc::channel(256);
        let monitor = Self {
            state,
            transport,
            config,
            rates,
            events,
            monitors: Arc::new(RwLock::new(HashMap::new())),
            on_restart: None,
        };
        (monitor, rx)
    }

    /// Set the callback used to relaunch workers on degraded targets.
    pub fn with_restart_callback(mut self, callback: RestartCallback) -> Self {
        self.on_restart = Some(callback);
        self
    }

    /// Start polling a target. Replaces any existing loop for it.
    pub async fn start(&self, target: &Target) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = PollContext {
            target: target.clone(),
            state: self.state.clone(),
            transport: self.transport.clone(),
            config: self.config.clone(),
            rates: self.rates.clone(),
            events: self.events.clone(),
            on_restart: self.on_restart.clone(),
        };
        let handle = tokio::spawn(async move {
            run_poll_loop(ctx, shutdown_rx).await;
        });

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(
            target.id.clone(),
            MonitorSlot {
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }
        info!(target = %target.id, "poll loop started");
    }

    /// Stop polling a target.
    pub async fn stop(&self, target_id: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(target_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(%target_id, "poll loop stopped");
        }
    }

    /// Stop all poll loops (graceful shutdown).
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (id, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(target_id = %id, "poll loop stopped");
        }
        info!("all poll loops stopped");
    }

    pub async fn active_monitors(&self) -> Vec<String> {
        let monitors = self.monitors.read().await;
        monitors.keys().cloned().collect()
    }

    pub async fn is_monitoring(&self, target_id: &str) -> bool {
        let monitors = self.monitors.read().await;
        monitors.contains_key(target_id)
    }
}

/// Everything one poll loop owns.
struct PollContext {
    target: Target,
    state: StateStore,
    transport: Arc<dyn TargetTransport>,
    config: Arc<CoordinatorConfig>,
    rates: Arc<RateBoard>,
    events: mpsc::Sender<FleetEvent>,
    on_restart: Option<RestartCallback>,
}

/// The poll loop for a single target. Exits when the run reaches a
/// terminal status, the target's assignment disappears, its range
/// completes or fails, or shutdown is signalled.
async fn run_poll_loop(ctx: PollContext, mut shutdown: watch::Receiver<bool>) {
    let target_id = ctx.target.id.clone();
    let interval = ctx.config.health_check_interval();
    let timeout = ctx.config.deployment_timeout();
    let status_path = format!("{}/worker.status", ctx.config.deployment.work_dir);
    let read_status = format!("cat {status_path}");
    let mut tracker = PollTracker::new(ctx.config.monitoring.stale_poll_threshold);

    debug!(%target_id, "poll loop starting");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match ctx.state.global_status() {
                    Ok(status) if status.is_terminal() => {
                        debug!(%target_id, ?status, "run stopped; poll loop exiting");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(%target_id, error = %e, "failed to read global status");
                        continue;
                    }
                }

                // Assignment gone means the range was finalized or
                // rebalanced away; nothing left to watch here.
                let assignment = match ctx.state.get_assignment(&target_id) {
                    Ok(Some(a)) => a,
                    Ok(None) => {
                        debug!(%target_id, "no active assignment; poll loop exiting");
                        break;
                    }
                    Err(e) => {
                        error!(%target_id, error = %e, "failed to read assignment");
                        continue;
                    }
                };

                let poll = match ctx.transport.exec(&ctx.target, &read_status, timeout).await {
                    Ok(output) => match parse_status_line(output.trim()) {
                        Some(status) => (PollResult::Answered, Some(status)),
                        None => {
                            debug!(%target_id, output = %output.trim(), "unparseable status line");
                            (PollResult::Missed, None)
                        }
                    },
                    Err(e) => {
                        debug!(%target_id, error = %e, "status poll failed");
                        (PollResult::Unreachable, None)
                    }
                };

                match poll {
                    (PollResult::Answered, Some(status)) => {
                        tracker.record(PollResult::Answered);
                        ctx.rates.record(&target_id, status.rate);

                        let cp = Checkpoint {
                            range_id: assignment.range_id.clone(),
                            cursor: status.cursor,
                            timestamp: epoch_secs(),
                            found: status.found,
                        };
                        match ctx.state.record_checkpoint(&cp) {
                            Ok(CheckpointOutcome::Advanced) => {}
                            Ok(CheckpointOutcome::Stale) => {
                                debug!(%target_id, cursor = status.cursor, "stale checkpoint ignored");
                            }
                            Err(e) => {
                                error!(%target_id, error = %e, "failed to record checkpoint");
                                continue;
                            }
                        }

                        if status.found {
                            info!(%target_id, range_id = %assignment.range_id, "worker reported a hit");
                            if send(&ctx.events, FleetEvent::Found {
                                target_id: target_id.clone(),
                                range_id: assignment.range_id.clone(),
                                cursor: status.cursor,
                            }).await.is_err() {
                                break;
                            }
                            continue;
                        }

                        let range_end = match ctx.state.get_range(&assignment.range_id) {
                            Ok(Some(range)) => range.end,
                            Ok(None) | Err(_) => continue,
                        };
                        if status.cursor >= range_end {
                            if let Err(e) = ctx
                                .state
                                .finalize(&target_id, AssignmentOutcome::Completed)
                            {
                                error!(%target_id, error = %e, "failed to complete range");
                                continue;
                            }
                            ctx.rates.remove(&target_id);
                            info!(%target_id, range_id = %assignment.range_id, "range scanned to completion");
                            let _ = send(&ctx.events, FleetEvent::Checkpoint {
                                target_id: target_id.clone(),
                                range_id: assignment.range_id.clone(),
                                cursor: range_end,
                                rate: status.rate,
                            }).await;
                            break;
                        }

                        if send(&ctx.events, FleetEvent::Checkpoint {
                            target_id: target_id.clone(),
                            range_id: assignment.range_id.clone(),
                            cursor: status.cursor,
                            rate: status.rate,
                        }).await.is_err() {
                            break;
                        }
                    }
                    (result, _) => {
                        let health = tracker.record(result);
                        if !tracker.needs_restart() {
                            continue;
                        }

                        if send(&ctx.events, FleetEvent::TargetDown {
                            target_id: target_id.clone(),
                            health,
                        }).await.is_err() {
                            break;
                        }

                        let restartable = ctx.config.monitoring.auto_restart
                            && ctx.on_restart.is_some();
                        let retries = if restartable {
                            match ctx.state.increment_retry(&target_id) {
                                Ok(n) => n,
                                Err(e) => {
                                    error!(%target_id, error = %e, "failed to bump retry count");
                                    continue;
                                }
                            }
                        } else {
                            u32::MAX
                        };

                        if restartable && retries <= ctx.config.monitoring.max_restart_attempts {
                            warn!(
                                %target_id,
                                range_id = %assignment.range_id,
                                attempt = retries,
                                "relaunching worker on degraded target"
                            );
                            if let Some(ref cb) = ctx.on_restart {
                                cb(ctx.target.clone(), assignment.range_id.clone()).await;
                            }
                            tracker.reset();
                        } else {
                            warn!(
                                %target_id,
                                range_id = %assignment.range_id,
                                "restart budget exhausted; marking range failed"
                            );
                            if let Err(e) = ctx.state.finalize(&target_id, AssignmentOutcome::Failed)
                            {
                                error!(%target_id, error = %e, "failed to fail range");
                            }
                            ctx.rates.remove(&target_id);
                            let _ = send(&ctx.events, FleetEvent::RangeFailed {
                                target_id: target_id.clone(),
                                range_id: assignment.range_id.clone(),
                            }).await;
                            break;
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                debug!(%target_id, "poll loop shutting down");
                break;
            }
        }
    }
}

async fn send(
    events: &mpsc::Sender<FleetEvent>,
    event: FleetEvent,
) -> Result<(), mpsc::error::SendError<FleetEvent>> {
    events.send(event).await
}
