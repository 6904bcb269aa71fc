//! `keyfleet deploy` — the full coordinator run.
//!
//! Assembles every subsystem, deploys the fleet, and blocks until the
//! run reaches a terminal status, then prints the final report.

use std::path::Path;
use std::sync::Arc;

use anyhow::bail;
use tokio::sync::watch;
use tracing::{error, info, warn};

use keyfleet_checkpoint::BackupManager;
use keyfleet_core::{CoordinatorConfig, Target, TargetRegistry};
use keyfleet_deploy::{DeployOutcome, DeploymentOrchestrator, DeploymentResult, TargetTransport};
use keyfleet_monitor::{FleetMonitor, RateBoard, RestartCallback, StatsAggregator};
use keyfleet_scale::{
    AssignCallback, ProvisionCallback, ReleaseCallback, RescopeCallback, ScalingController,
};
use keyfleet_state::{GlobalStatus, RangeId, RangeStatus, StateStore};
use keyfleet_stop::StopController;

pub async fn run(config_path: &Path, registry_path: &Path, data_dir: &Path) -> anyhow::Result<()> {
    let (config, registry) = super::load(config_path, registry_path)?;
    let config = Arc::new(config);
    info!(targets = registry.len(), "coordinator starting");

    // ── State store + recovery ─────────────────────────────────

    std::fs::create_dir_all(data_dir)?;
    let state = StateStore::open(&data_dir.join("keyfleet.redb"))?;

    let backup_dir = Path::new(&config.backup.destination).to_path_buf();
    if let Some(summary) = keyfleet_checkpoint::recover(&state, &backup_dir)? {
        info!(
            ranges = summary.ranges_restored,
            checkpoints = summary.checkpoints_applied,
            "resumed from backup"
        );
    }
    let status = state.global_status()?;
    if status.is_terminal() {
        print_report(&state, status)?;
        bail!("previous run already finished; use a fresh data dir to start over");
    }

    // ── Partition ──────────────────────────────────────────────

    let assignment_order: Vec<RangeId> = if state.list_ranges()?.is_empty() {
        let plan = keyfleet_partition::partition(
            config.keyspace()?,
            config.search.mode,
            registry.len() as u32,
        )?;
        for range in &plan.ranges {
            state.put_range(range)?;
        }
        info!(ranges = plan.ranges.len(), mode = %config.search.mode, "keyspace partitioned");
        plan.in_assignment_order().map(|r| r.id.clone()).collect()
    } else {
        // Resumed run: hand out whatever is back in the pool.
        let mut ids: Vec<RangeId> = state
            .list_ranges()?
            .into_iter()
            .filter(|r| r.status == RangeStatus::Unassigned)
            .map(|r| r.id)
            .collect();
        ids.sort();
        ids
    };

    // ── Transport + orchestrator ───────────────────────────────

    let transport: Arc<dyn TargetTransport> = Arc::new(super::transport_for(&config));
    let orchestrator =
        DeploymentOrchestrator::new(transport.clone(), state.clone(), config.clone());

    let plan: Vec<(Target, RangeId)> = registry
        .targets()
        .iter()
        .cloned()
        .zip(assignment_order)
        .collect();
    if plan.is_empty() {
        bail!("nothing to deploy: no unassigned ranges for this fleet");
    }

    let results = orchestrator.deploy_all(plan).await;
    let mut deployed: Vec<String> = results
        .iter()
        .filter(|r| r.outcome == DeployOutcome::Success)
        .map(|r| r.target_id.clone())
        .collect();
    for result in &results {
        if result.outcome == DeployOutcome::Failed {
            warn!(
                target = %result.target_id,
                attempts = result.attempts,
                detail = result.detail.as_deref().unwrap_or("unknown"),
                "target failed to deploy"
            );
        }
    }
    if deployed.is_empty() {
        bail!("no worker could be deployed; aborting run");
    }

    // Failed deployments bounce their range back to the unassigned
    // pool, and nothing else drains that pool mid-run. Hand stranded
    // ranges to idle targets; whatever still cannot be placed is
    // marked failed so the run settles once the rest finish.
    deployed.extend(redeploy_stranded(&state, &registry, &orchestrator, &results).await?);
    info!(deployed = deployed.len(), total = results.len(), "fleet deployed");

    // ── Monitor + event stream ─────────────────────────────────

    let rates = Arc::new(RateBoard::default());
    let restart: RestartCallback = {
        let orchestrator = orchestrator.clone();
        let state = state.clone();
        Arc::new(move |target, range_id| {
            let orchestrator = orchestrator.clone();
            let state = state.clone();
            Box::pin(async move {
                match state.get_range(&range_id) {
                    Ok(Some(range)) => {
                        orchestrator.deploy(&target, &range).await;
                    }
                    Ok(None) => warn!(%range_id, "restart requested for missing range"),
                    Err(e) => error!(%range_id, error = %e, "restart lookup failed"),
                }
            })
        })
    };

    let (monitor, events) = FleetMonitor::new(
        state.clone(),
        transport.clone(),
        config.clone(),
        rates.clone(),
    );
    let monitor = Arc::new(monitor.with_restart_callback(restart));
    for target_id in &deployed {
        if let Some(target) = registry.get(target_id) {
            monitor.start(target).await;
        }
    }

    // ── Background loops ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let stats = StatsAggregator::new(state.clone(), rates.clone());
    let stats_interval = config.stats_interval();
    let stats_shutdown = shutdown_rx.clone();
    let stats_handle = tokio::spawn(async move {
        stats.run(stats_interval, stats_shutdown).await;
    });

    let backup_handle = if config.backup.enabled {
        let manager = BackupManager::new(state.clone(), &backup_dir, config.backup.keep_backups);
        let interval = config.backup_interval();
        let backup_shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            manager.run(interval, backup_shutdown).await;
        }))
    } else {
        None
    };

    let scaler = build_scaler(
        state.clone(),
        config.clone(),
        registry.clone(),
        orchestrator.clone(),
        monitor.clone(),
    );
    let scale_shutdown = shutdown_rx.clone();
    let scale_handle = tokio::spawn(async move {
        scaler.run(scale_shutdown).await;
    });

    let stop = StopController::new(
        state.clone(),
        transport.clone(),
        registry.clone(),
        config.clone(),
    );
    let mut stop_handle = tokio::spawn(async move { stop.run(events).await });

    // ── Run to a terminal status ───────────────────────────────

    let final_status = tokio::select! {
        status = &mut stop_handle => status?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupt received; shutting down");
            let _ = shutdown_tx.send(true);
            monitor.stop_all().await;
            bail!("interrupted before the run finished; state and checkpoints are preserved");
        }
    };

    let _ = shutdown_tx.send(true);
    monitor.stop_all().await;
    let _ = stats_handle.await;
    let _ = scale_handle.await;
    if let Some(handle) = backup_handle {
        let _ = handle.await;
    }

    print_report(&state, final_status)?;
    match final_status {
        GlobalStatus::StoppedFound | GlobalStatus::StoppedExhausted => Ok(()),
        GlobalStatus::StoppedError => bail!("run ended with failed ranges"),
        GlobalStatus::Running => bail!("event stream ended with the run still active"),
    }
}

/// Re-place ranges that failed deployments returned to the pool.
///
/// Targets the first round never touched get one deployment each;
/// ranges no target can take are marked failed, which keeps the
/// all-terminal settle path reachable. Returns the newly deployed
/// target ids.
async fn redeploy_stranded(
    state: &StateStore,
    registry: &TargetRegistry,
    orchestrator: &DeploymentOrchestrator,
    results: &[DeploymentResult],
) -> anyhow::Result<Vec<String>> {
    let mut stranded: Vec<RangeId> = results
        .iter()
        .filter(|r| r.outcome == DeployOutcome::Failed)
        .map(|r| r.range_id.clone())
        .collect();
    if stranded.is_empty() {
        return Ok(Vec::new());
    }

    let idle: Vec<Target> = registry
        .targets()
        .iter()
        .filter(|t| results.iter().all(|r| r.target_id != t.id))
        .cloned()
        .collect();

    let mut rescued = Vec::new();
    if !idle.is_empty() {
        let unplaced = stranded.split_off(idle.len().min(stranded.len()));
        let plan: Vec<(Target, RangeId)> = idle.into_iter().zip(stranded).collect();
        let retried = orchestrator.deploy_all(plan).await;
        stranded = unplaced;
        for result in retried {
            match result.outcome {
                DeployOutcome::Success => rescued.push(result.target_id),
                DeployOutcome::Failed => stranded.push(result.range_id),
            }
        }
    }

    for range_id in &stranded {
        warn!(%range_id, "no target can take this range; marking it failed");
        state.set_range_status(range_id, RangeStatus::Failed)?;
    }
    Ok(rescued)
}

/// Wire the scaling controller to the live subsystems. Provisioning
/// draws from registry targets that hold no assignment; released
/// targets are cleaned up and dropped from monitoring.
fn build_scaler(
    state: StateStore,
    config: Arc<CoordinatorConfig>,
    registry: TargetRegistry,
    orchestrator: DeploymentOrchestrator,
    monitor: Arc<FleetMonitor>,
) -> ScalingController {
    let provision: ProvisionCallback = {
        let state = state.clone();
        let registry = registry.clone();
        Arc::new(move |n| {
            let state = state.clone();
            let registry = registry.clone();
            Box::pin(async move {
                let busy: Vec<String> = match state.list_assignments() {
                    Ok(assignments) => assignments.into_iter().map(|a| a.target_id).collect(),
                    Err(e) => {
                        error!(error = %e, "cannot list assignments for provisioning");
                        return Vec::new();
                    }
                };
                registry
                    .targets()
                    .iter()
                    .filter(|t| !busy.contains(&t.id))
                    .take(n as usize)
                    .cloned()
                    .collect()
            })
        })
    };

    let assign: AssignCallback = {
        let orchestrator = orchestrator.clone();
        let monitor = monitor.clone();
        Arc::new(move |plan| {
            let orchestrator = orchestrator.clone();
            let monitor = monitor.clone();
            Box::pin(async move {
                let targets: Vec<Target> = plan.iter().map(|(t, _)| t.clone()).collect();
                let results = orchestrator.deploy_all(plan).await;
                for result in results {
                    if result.outcome == DeployOutcome::Success
                        && let Some(target) = targets.iter().find(|t| t.id == result.target_id)
                    {
                        monitor.start(target).await;
                    }
                }
            })
        })
    };

    let rescope: RescopeCallback = {
        let orchestrator = orchestrator.clone();
        let state = state.clone();
        let registry = registry.clone();
        Arc::new(move |target_ids| {
            let orchestrator = orchestrator.clone();
            let state = state.clone();
            let registry = registry.clone();
            Box::pin(async move {
                for target_id in target_ids {
                    let Some(target) = registry.get(&target_id).cloned() else {
                        continue;
                    };
                    let range = state
                        .get_assignment(&target_id)
                        .ok()
                        .flatten()
                        .and_then(|a| state.get_range(&a.range_id).ok().flatten());
                    if let Some(range) = range {
                        orchestrator.deploy(&target, &range).await;
                    }
                }
            })
        })
    };

    let release: ReleaseCallback = {
        let orchestrator = orchestrator.clone();
        let registry = registry.clone();
        let monitor = monitor.clone();
        Arc::new(move |target_ids| {
            let orchestrator = orchestrator.clone();
            let registry = registry.clone();
            let monitor = monitor.clone();
            Box::pin(async move {
                for target_id in target_ids {
                    monitor.stop(&target_id).await;
                    if let Some(target) = registry.get(&target_id)
                        && let Err(e) = orchestrator.cleanup(target).await
                    {
                        warn!(%target_id, error = %e, "cleanup of released target failed");
                    }
                }
            })
        })
    };

    ScalingController::new(state, config)
        .with_provision(provision)
        .with_assign(assign)
        .with_rescope(rescope)
        .with_release(release)
}

/// Final run report: per-range outcomes, fleet totals, and the
/// distinct terminal condition.
fn print_report(state: &StateStore, status: GlobalStatus) -> anyhow::Result<()> {
    let snapshot = state.snapshot()?;

    println!();
    println!("── run report ──────────────────────────────────────");
    match status {
        GlobalStatus::StoppedFound => println!("result: KEY FOUND"),
        GlobalStatus::StoppedExhausted => println!("result: keyspace exhausted, no key found"),
        GlobalStatus::StoppedError => println!("result: stopped with failed ranges"),
        GlobalStatus::Running => println!("result: run interrupted while active"),
    }

    let total = snapshot.total_width();
    let scanned = snapshot.scanned_width();
    if total > 0 {
        println!(
            "scanned: {scanned} of {total} keys ({:.4}%)",
            scanned as f64 / total as f64 * 100.0
        );
    }

    println!("ranges:");
    let mut ranges = snapshot.ranges.clone();
    ranges.sort_by_key(|r| r.start);
    for range in &ranges {
        let cursor = snapshot
            .cursor_for(&range.id)
            .map(|c| format!("{c:#x}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  [{:#x}, {:#x})  {:<12} cursor={cursor}",
            range.start,
            range.end,
            format!("{:?}", range.status).to_lowercase(),
        );
    }

    if !snapshot.assignments.is_empty() {
        println!("targets still bound at shutdown:");
        for assignment in &snapshot.assignments {
            println!(
                "  {}  range={}  retries={}",
                assignment.target_id, assignment.range_id, assignment.retry_count
            );
        }
    }
    println!("────────────────────────────────────────────────────");
    Ok(())
}
