//! Stop controller — event stream consumer.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use keyfleet_core::{CoordinatorConfig, Target, TargetRegistry};
use keyfleet_deploy::TargetTransport;
use keyfleet_monitor::FleetEvent;
use keyfleet_state::{AssignmentOutcome, GlobalStatus, StateStore};

/// Watches the event stream and transitions the run to its terminal
/// status. Exactly one transition ever happens; everyone else observes.
pub struct StopController {
    state: StateStore,
    transport: Arc<dyn TargetTransport>,
    registry: TargetRegistry,
    config: Arc<CoordinatorConfig>,
}

impl StopController {
    pub fn new(
        state: StateStore,
        transport: Arc<dyn TargetTransport>,
        registry: TargetRegistry,
        config: Arc<CoordinatorConfig>,
    ) -> Self {
        Self {
            state,
            transport,
            registry,
            config,
        }
    }

    /// Consume events until the run reaches a terminal status or the
    /// stream closes. Returns the final status.
    pub async fn run(&self, mut events: mpsc::Receiver<FleetEvent>) -> GlobalStatus {
        while let Some(event) = events.recv().await {
            match event {
                FleetEvent::Found {
                    target_id,
                    range_id,
                    cursor,
                } => self.handle_found(&target_id, &range_id, cursor).await,
                FleetEvent::Checkpoint { .. } | FleetEvent::RangeFailed { .. } => {
                    self.check_settled();
                }
                FleetEvent::TargetDown { target_id, health } => {
                    info!(%target_id, ?health, "target degraded");
                }
            }

            match self.state.global_status() {
                Ok(status) if status.is_terminal() => return status,
                Ok(_) => {}
                Err(e) => error!(error = %e, "failed to read global status"),
            }
        }

        // Stream closed with the run still going: all producers are
        // gone, so nothing can advance the fleet anymore.
        self.state
            .global_status()
            .unwrap_or(GlobalStatus::StoppedError)
    }

    /// First hit wins; everyone else finds the status already set.
    async fn handle_found(&self, target_id: &str, range_id: &str, cursor: u128) {
        match self.state.try_stop(GlobalStatus::StoppedFound) {
            Ok(true) => {
                info!(%target_id, %range_id, cursor = format!("{cursor:#x}"), "key found; stopping fleet");
                if let Err(e) = self.state.finalize(target_id, AssignmentOutcome::Completed) {
                    error!(%target_id, error = %e, "failed to complete found range");
                }
                self.broadcast_stop(target_id).await;
            }
            Ok(false) => {
                info!(%target_id, %range_id, "duplicate hit after stop; ignored");
            }
            Err(e) => error!(%target_id, error = %e, "stop transition failed"),
        }
    }

    /// Best-effort kill of every other active worker. Each surviving
    /// assignment is completed at its last checkpointed cursor so the
    /// partial scan is preserved in the final report.
    async fn broadcast_stop(&self, found_target: &str) {
        let assignments = match self.state.list_assignments() {
            Ok(a) => a,
            Err(e) => {
                error!(error = %e, "failed to list assignments for stop broadcast");
                return;
            }
        };

        for assignment in assignments {
            if assignment.target_id == found_target {
                continue;
            }
            match self.registry.get(&assignment.target_id) {
                Some(target) => self.stop_worker(target).await,
                None => warn!(target_id = %assignment.target_id, "assignment for unknown target"),
            }
            if let Err(e) = self
                .state
                .finalize(&assignment.target_id, AssignmentOutcome::Completed)
            {
                error!(target_id = %assignment.target_id, error = %e, "failed to finalize stopped range");
            }
        }
        info!("stop broadcast complete");
    }

    /// Kill the worker process with bounded retries. Failures are
    /// logged and abandoned; the sandbox recycles itself eventually.
    async fn stop_worker(&self, target: &Target) {
        let command = format!("pkill -f {}", self.config.deployment.binary_name);
        let timeout = self.config.deployment_timeout();

        for attempt in 1..=self.config.deployment.retry_attempts {
            match self.transport.exec(target, &command, timeout).await {
                Ok(_) => {
                    info!(target_id = %target.id, "worker stopped");
                    return;
                }
                Err(e) => {
                    warn!(target_id = %target.id, attempt, error = %e, "stop attempt failed");
                    if attempt < self.config.deployment.retry_attempts {
                        tokio::time::sleep(self.config.retry_delay()).await;
                    }
                }
            }
        }
        warn!(target_id = %target.id, "could not stop worker; giving up");
    }

    /// Detect a settled keyspace: every range completed means
    /// exhaustion; every range terminal with failures among them means
    /// nothing left can make progress, which ends the run as an error.
    fn check_settled(&self) {
        let snapshot = match self.state.snapshot() {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to snapshot state");
                return;
            }
        };
        if snapshot.status.is_terminal() || snapshot.ranges.is_empty() {
            return;
        }

        if snapshot.all_completed() {
            match self.state.try_stop(GlobalStatus::StoppedExhausted) {
                Ok(true) => info!("keyspace exhausted; no key found"),
                Ok(false) => {}
                Err(e) => error!(error = %e, "exhaustion transition failed"),
            }
            return;
        }

        let all_terminal = snapshot.ranges.iter().all(|r| r.is_terminal());
        if all_terminal && snapshot.assignments.is_empty() {
            match self.state.try_stop(GlobalStatus::StoppedError) {
                Ok(true) => error!("all ranges settled with failures; run cannot finish"),
                Ok(false) => {}
                Err(e) => error!(error = %e, "error transition failed"),
            }
        }
    }
}
