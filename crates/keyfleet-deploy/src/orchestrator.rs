//! Deployment orchestrator.
//!
//! Realizes an assignment plan: for each (target, range) pair it
//! establishes a session, cleans up any prior worker, uploads the
//! worker artifact and a generated per-target config, launches the
//! process, and confirms it started. Each step failure consumes one
//! retry attempt; an exhausted budget returns the range to the
//! unassigned pool instead of failing the run.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

use keyfleet_core::registry::epoch_secs;
use keyfleet_core::{CoordinatorConfig, Target};
use keyfleet_state::{AssignmentOutcome, RangeId, RangeRecord, StateStore};

use crate::error::DeployResult;
use crate::transport::TargetTransport;

/// Terminal outcome of one `deploy` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployOutcome {
    Success,
    Failed,
}

/// Exactly one of these is produced per `deploy` call.
#[derive(Debug, Clone)]
pub struct DeploymentResult {
    pub target_id: String,
    pub range_id: RangeId,
    pub outcome: DeployOutcome,
    pub attempts: u32,
    pub detail: Option<String>,
}

/// Global minimum-gap throttle over provisioning API calls.
///
/// Independent of per-target retry delay: no matter how many targets
/// retry at once, remote calls are spaced at least `min_gap` apart.
struct Throttle {
    min_gap: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            last: Mutex::new(None),
        }
    }

    async fn acquire(&self) {
        let wait = {
            let mut last = self.last.lock().await;
            let now = Instant::now();
            let ready_at = match *last {
                Some(prev) => (prev + self.min_gap).max(now),
                None => now,
            };
            *last = Some(ready_at);
            ready_at.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Binds ranges to targets and drives worker deployment.
#[derive(Clone)]
pub struct DeploymentOrchestrator {
    transport: Arc<dyn TargetTransport>,
    state: StateStore,
    config: Arc<CoordinatorConfig>,
    /// Bounds concurrent deployments fleet-wide.
    permits: Arc<Semaphore>,
    throttle: Arc<Throttle>,
}

impl DeploymentOrchestrator {
    pub fn new(
        transport: Arc<dyn TargetTransport>,
        state: StateStore,
        config: Arc<CoordinatorConfig>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.deployment.max_parallel_deployments));
        // Provisioning APIs tolerate a few calls per second; one gap
        // shared by the whole fleet.
        let throttle = Arc::new(Throttle::new(Duration::from_millis(250)));
        Self {
            transport,
            state,
            config,
            permits,
            throttle,
        }
    }

    /// Deploy the worker for an already-bound assignment.
    ///
    /// Makes at most `retry_attempts` attempts with `retry_delay`
    /// between them, and always returns exactly one terminal result.
    pub async fn deploy(&self, target: &Target, range: &RangeRecord) -> DeploymentResult {
        let retry_attempts = self.config.deployment.retry_attempts;
        let mut attempts = 0;
        let mut last_error = String::new();

        while attempts < retry_attempts {
            // Observe a global stop before spending another attempt.
            match self.state.global_status() {
                Ok(status) if status.is_terminal() => {
                    return DeploymentResult {
                        target_id: target.id.clone(),
                        range_id: range.id.clone(),
                        outcome: DeployOutcome::Failed,
                        attempts,
                        detail: Some("run already stopped".to_string()),
                    };
                }
                Ok(_) => {}
                Err(e) => {
                    return DeploymentResult {
                        target_id: target.id.clone(),
                        range_id: range.id.clone(),
                        outcome: DeployOutcome::Failed,
                        attempts,
                        detail: Some(e.to_string()),
                    };
                }
            }

            attempts += 1;
            match self.attempt(target, range).await {
                Ok(()) => {
                    info!(
                        target = %target.id,
                        range = %range.id,
                        attempts,
                        "worker deployed"
                    );
                    return DeploymentResult {
                        target_id: target.id.clone(),
                        range_id: range.id.clone(),
                        outcome: DeployOutcome::Success,
                        attempts,
                        detail: None,
                    };
                }
                Err(e) => {
                    warn!(
                        target = %target.id,
                        range = %range.id,
                        attempt = attempts,
                        error = %e,
                        "deployment attempt failed"
                    );
                    last_error = e.to_string();
                    if attempts < retry_attempts {
                        tokio::time::sleep(self.config.retry_delay()).await;
                    }
                }
            }
        }

        DeploymentResult {
            target_id: target.id.clone(),
            range_id: range.id.clone(),
            outcome: DeployOutcome::Failed,
            attempts,
            detail: Some(last_error),
        }
    }

    /// One full upload + launch pass against a target.
    async fn attempt(&self, target: &Target, range: &RangeRecord) -> DeployResult<()> {
        let timeout = self.config.deployment_timeout();
        let dep = &self.config.deployment;
        let work_dir = dep.work_dir.as_str();
        let binary = dep.binary_name.as_str();

        self.throttle.acquire().await;
        self.transport.exec(target, "echo ok", timeout).await?;

        // A prior worker on this target must die first: redeploying
        // twice must never leave two workers scanning at once.
        let clean = format!(
            "pkill -f {binary} 2>/dev/null; rm -f {work_dir}/worker.pid {work_dir}/worker.status; mkdir -p {work_dir}"
        );
        self.transport.exec(target, &clean, timeout).await?;

        self.throttle.acquire().await;
        self.transport
            .upload(
                target,
                std::path::Path::new(binary),
                &format!("{work_dir}/{binary}"),
                timeout,
            )
            .await?;
        self.transport
            .upload(
                target,
                std::path::Path::new(dep.puzzle_file.as_str()),
                &format!("{work_dir}/{}", dep.puzzle_file),
                timeout,
            )
            .await?;

        // Resume from the last persisted cursor, never before the
        // range start. A fresh range has no checkpoint and starts at
        // its lower bound.
        let resume_from = self
            .state
            .get_checkpoint(&range.id)?
            .map(|cp| cp.cursor.clamp(range.start, range.end))
            .unwrap_or(range.start);

        let worker_config = self.render_worker_config(range, resume_from);
        let write_config = format!(
            "cat > {work_dir}/worker.conf << 'EOF'\n{worker_config}EOF"
        );
        self.transport.exec(target, &write_config, timeout).await?;

        let launch = format!(
            "cd {work_dir} && chmod +x {binary} && nohup ./{binary} --config worker.conf > worker.log 2>&1 & echo $! > {work_dir}/worker.pid"
        );
        self.transport.exec(target, &launch, timeout).await?;

        // Confirm the process came up.
        let confirm = format!("kill -0 $(cat {work_dir}/worker.pid)");
        self.transport.exec(target, &confirm, timeout).await?;

        Ok(())
    }

    /// Per-target worker configuration: the assigned range, the mode,
    /// and the search pacing knobs.
    fn render_worker_config(&self, range: &RangeRecord, resume_from: u128) -> String {
        let search = &self.config.search;
        let mut out = format!(
            "start={:#x}\nend={:#x}\nmode={}\nswitch_interval={}\nbatch_size={}\ncheckpoint_interval={}\npuzzle_file={}\nstatus_file=worker.status\n",
            resume_from,
            range.end,
            range.mode,
            search.switch_interval,
            search.batch_size,
            search.checkpoint_interval,
            self.config.deployment.puzzle_file,
        );
        if let Some(sink) = &search.notify_sink {
            out.push_str(&format!("notify_sink={sink}\n"));
        }
        let monitoring = &self.config.monitoring;
        out.push_str(&format!("log_level={}\n", monitoring.log_level));
        if let Some(log_file) = &monitoring.log_file {
            out.push_str(&format!("log_file={log_file}\n"));
        }
        out
    }

    /// Bind and deploy a whole plan concurrently.
    ///
    /// Concurrency is bounded by `max_parallel_deployments`. Successful
    /// deployments activate their range; failures return it to the
    /// unassigned pool and report the target as failed this round.
    pub async fn deploy_all(&self, plan: Vec<(Target, RangeId)>) -> Vec<DeploymentResult> {
        let mut tasks: JoinSet<DeploymentResult> = JoinSet::new();

        for (target, range_id) in plan {
            let orchestrator = self.clone();
            tasks.spawn(async move {
                let _permit = match orchestrator.permits.acquire().await {
                    Ok(permit) => permit,
                    // Only possible if the semaphore was closed.
                    Err(_) => {
                        return DeploymentResult {
                            target_id: target.id.clone(),
                            range_id,
                            outcome: DeployOutcome::Failed,
                            attempts: 0,
                            detail: Some("deployment semaphore closed".to_string()),
                        };
                    }
                };
                orchestrator.deploy_one(&target, range_id).await
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "deployment task panicked"),
            }
        }
        results
    }

    /// Bind one range, deploy, and record the outcome in the store.
    async fn deploy_one(&self, target: &Target, range_id: RangeId) -> DeploymentResult {
        let fail = |detail: String| DeploymentResult {
            target_id: target.id.clone(),
            range_id: range_id.clone(),
            outcome: DeployOutcome::Failed,
            attempts: 0,
            detail: Some(detail),
        };

        let mode = self.config.search.mode;
        if let Err(e) = self.state.bind(&target.id, &range_id, mode, epoch_secs()) {
            return fail(e.to_string());
        }
        let range = match self.state.get_range(&range_id) {
            Ok(Some(r)) => r,
            Ok(None) => return fail(format!("range {range_id} vanished after bind")),
            Err(e) => return fail(e.to_string()),
        };

        let result = self.deploy(target, &range).await;
        let record = match result.outcome {
            DeployOutcome::Success => self.state.activate(&target.id),
            DeployOutcome::Failed => self
                .state
                .finalize(&target.id, AssignmentOutcome::Returned)
                .map(|_| ()),
        };
        if let Err(e) = record {
            warn!(target = %target.id, error = %e, "failed to record deployment outcome");
        }
        result
    }

    /// Connectivity probe — no mutation on the target.
    pub async fn probe(&self, target: &Target) -> DeployResult<()> {
        self.throttle.acquire().await;
        let out = self
            .transport
            .exec(target, "echo ok", self.config.deployment_timeout())
            .await?;
        if out.contains("ok") {
            Ok(())
        } else {
            Err(crate::error::DeployError::Connect {
                target: target.id.clone(),
                detail: format!("unexpected probe response {out:?}"),
            })
        }
    }

    /// Kill the worker and remove the working directory on a target.
    pub async fn cleanup(&self, target: &Target) -> DeployResult<()> {
        let dep = &self.config.deployment;
        let command = format!(
            "pkill -f {} 2>/dev/null; rm -rf {}",
            dep.binary_name, dep.work_dir
        );
        self.throttle.acquire().await;
        self.transport
            .exec(target, &command, self.config.deployment_timeout())
            .await?;
        info!(target = %target.id, "target cleaned up");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    use keyfleet_core::{SearchMode, TargetHealth};
    use keyfleet_state::{GlobalStatus, RangeStatus};

    use crate::transport::BoxFuture;

    /// Scripted transport: fails the first `fail_execs` exec calls,
    /// succeeds afterwards. Records every command it sees.
    struct ScriptedTransport {
        fail_execs: AtomicU32,
        commands: std::sync::Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(fail_execs: u32) -> Arc<Self> {
            Arc::new(Self {
                fail_execs: AtomicU32::new(fail_execs),
                commands: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl TargetTransport for ScriptedTransport {
        fn exec(
            &self,
            target: &Target,
            command: &str,
            _timeout: Duration,
        ) -> BoxFuture<DeployResult<String>> {
            self.commands.lock().unwrap().push(command.to_string());
            let target_id = target.id.clone();
            let should_fail = self
                .fail_execs
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            Box::pin(async move {
                if should_fail {
                    Err(crate::error::DeployError::Connect {
                        target: target_id,
                        detail: "scripted failure".to_string(),
                    })
                } else {
                    Ok("ok".to_string())
                }
            })
        }

        fn upload(
            &self,
            _target: &Target,
            local: &Path,
            _remote: &str,
            _timeout: Duration,
        ) -> BoxFuture<DeployResult<()>> {
            self.commands
                .lock()
                .unwrap()
                .push(format!("upload {}", local.display()));
            Box::pin(async { Ok(()) })
        }
    }

    fn test_target(id: &str) -> Target {
        Target {
            id: id.to_string(),
            locality: "us-central1-a".to_string(),
            principal: "cloudshell".to_string(),
            health: TargetHealth::Unknown,
            last_seen: 0,
        }
    }

    fn test_config() -> Arc<CoordinatorConfig> {
        let mut config = CoordinatorConfig::default();
        config.deployment.retry_attempts = 3;
        config.deployment.retry_delay_secs = 0;
        config.search.mode = SearchMode::Sequential;
        Arc::new(config)
    }

    fn seeded(state: &StateStore, start: u128, end: u128) -> RangeRecord {
        let range = RangeRecord::new(start, end, SearchMode::Sequential);
        state.put_range(&range).unwrap();
        range
    }

    #[tokio::test]
    async fn deploy_succeeds_on_first_attempt() {
        let transport = ScriptedTransport::new(0);
        let state = StateStore::open_in_memory().unwrap();
        let range = seeded(&state, 0, 100);
        let orch = DeploymentOrchestrator::new(transport.clone(), state, test_config());

        let result = orch.deploy(&test_target("proj-1"), &range).await;
        assert_eq!(result.outcome, DeployOutcome::Success);
        assert_eq!(result.attempts, 1);

        let commands = transport.seen();
        assert!(commands.iter().any(|c| c.contains("pkill")));
        assert!(commands.iter().any(|c| c.contains("worker.conf")));
        assert!(commands.iter().any(|c| c.contains("nohup")));
        assert!(commands.iter().any(|c| c.starts_with("upload")));
    }

    #[tokio::test]
    async fn deploy_retries_then_succeeds() {
        // First exec (the probe) fails once; second attempt goes through.
        let transport = ScriptedTransport::new(1);
        let state = StateStore::open_in_memory().unwrap();
        let range = seeded(&state, 0, 100);
        let orch = DeploymentOrchestrator::new(transport, state, test_config());

        let result = orch.deploy(&test_target("proj-1"), &range).await;
        assert_eq!(result.outcome, DeployOutcome::Success);
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test]
    async fn deploy_never_exceeds_retry_budget() {
        let transport = ScriptedTransport::new(u32::MAX);
        let state = StateStore::open_in_memory().unwrap();
        let range = seeded(&state, 0, 100);
        let orch = DeploymentOrchestrator::new(transport, state, test_config());

        let result = orch.deploy(&test_target("proj-1"), &range).await;
        assert_eq!(result.outcome, DeployOutcome::Failed);
        assert_eq!(result.attempts, 3);
        assert!(result.detail.unwrap().contains("scripted failure"));
    }

    #[tokio::test]
    async fn deploy_refuses_after_global_stop() {
        let transport = ScriptedTransport::new(0);
        let state = StateStore::open_in_memory().unwrap();
        let range = seeded(&state, 0, 100);
        state.try_stop(GlobalStatus::StoppedFound).unwrap();
        let orch = DeploymentOrchestrator::new(transport.clone(), state, test_config());

        let result = orch.deploy(&test_target("proj-1"), &range).await;
        assert_eq!(result.outcome, DeployOutcome::Failed);
        assert_eq!(result.attempts, 0);
        assert!(transport.seen().is_empty());
    }

    #[tokio::test]
    async fn deploy_all_activates_on_success() {
        let transport = ScriptedTransport::new(0);
        let state = StateStore::open_in_memory().unwrap();
        let r1 = seeded(&state, 0, 50);
        let r2 = seeded(&state, 50, 100);
        let orch = DeploymentOrchestrator::new(transport, state.clone(), test_config());

        let results = orch
            .deploy_all(vec![
                (test_target("proj-1"), r1.id.clone()),
                (test_target("proj-2"), r2.id.clone()),
            ])
            .await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.outcome == DeployOutcome::Success));
        assert_eq!(
            state.get_range(&r1.id).unwrap().unwrap().status,
            RangeStatus::InProgress
        );
        assert_eq!(state.list_assignments().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn deploy_all_returns_range_on_failure() {
        let transport = ScriptedTransport::new(u32::MAX);
        let state = StateStore::open_in_memory().unwrap();
        let range = seeded(&state, 0, 100);
        let orch = DeploymentOrchestrator::new(transport, state.clone(), test_config());

        let results = orch
            .deploy_all(vec![(test_target("proj-1"), range.id.clone())])
            .await;

        assert_eq!(results[0].outcome, DeployOutcome::Failed);
        // Range is back in the pool, not stranded as assigned.
        assert_eq!(
            state.get_range(&range.id).unwrap().unwrap().status,
            RangeStatus::Unassigned
        );
        assert!(state.list_assignments().unwrap().is_empty());
    }

    #[tokio::test]
    async fn deploy_all_refuses_double_binding() {
        let transport = ScriptedTransport::new(0);
        let state = StateStore::open_in_memory().unwrap();
        let r1 = seeded(&state, 0, 50);
        let r2 = seeded(&state, 50, 100);
        let orch = DeploymentOrchestrator::new(transport, state.clone(), test_config());

        // Same target in the plan twice: one binding must lose.
        let results = orch
            .deploy_all(vec![
                (test_target("proj-1"), r1.id.clone()),
                (test_target("proj-1"), r2.id.clone()),
            ])
            .await;

        let successes = results
            .iter()
            .filter(|r| r.outcome == DeployOutcome::Success)
            .count();
        assert_eq!(successes, 1);
        assert_eq!(state.list_assignments().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn worker_config_carries_range_and_mode() {
        let transport = ScriptedTransport::new(0);
        let state = StateStore::open_in_memory().unwrap();
        let range = seeded(&state, 0x100, 0x200);
        let orch = DeploymentOrchestrator::new(transport, state, test_config());

        let rendered = orch.render_worker_config(&range, range.start);
        assert!(rendered.contains("start=0x100"));
        assert!(rendered.contains("end=0x200"));
        assert!(rendered.contains("mode=sequential"));
        assert!(rendered.contains("status_file=worker.status"));
        assert!(rendered.contains("log_level=info"));
    }

    #[tokio::test]
    async fn worker_config_carries_log_destination_when_set() {
        let transport = ScriptedTransport::new(0);
        let state = StateStore::open_in_memory().unwrap();
        let range = seeded(&state, 0x100, 0x200);
        let mut config = CoordinatorConfig::default();
        config.monitoring.log_level = "debug".to_string();
        config.monitoring.log_file = Some("worker.log.d".to_string());
        let orch = DeploymentOrchestrator::new(transport, state, Arc::new(config));

        let rendered = orch.render_worker_config(&range, range.start);
        assert!(rendered.contains("log_level=debug"));
        assert!(rendered.contains("log_file=worker.log.d"));
    }

    #[tokio::test]
    async fn redeploy_resumes_from_checkpoint() {
        let transport = ScriptedTransport::new(0);
        let state = StateStore::open_in_memory().unwrap();
        let range = seeded(&state, 0x100, 0x200);
        state
            .record_checkpoint(&keyfleet_state::Checkpoint {
                range_id: range.id.clone(),
                cursor: 0x180,
                timestamp: 0,
                found: false,
            })
            .unwrap();
        let orch = DeploymentOrchestrator::new(transport.clone(), state, test_config());

        let result = orch.deploy(&test_target("proj-1"), &range).await;
        assert_eq!(result.outcome, DeployOutcome::Success);

        let config_write = transport
            .seen()
            .into_iter()
            .find(|c| c.contains("worker.conf"))
            .unwrap();
        assert!(config_write.contains("start=0x180"));
        assert!(config_write.contains("end=0x200"));
    }

    #[tokio::test]
    async fn probe_and_cleanup_run_single_commands() {
        let transport = ScriptedTransport::new(0);
        let state = StateStore::open_in_memory().unwrap();
        let orch = DeploymentOrchestrator::new(transport.clone(), state, test_config());

        orch.probe(&test_target("proj-1")).await.unwrap();
        orch.cleanup(&test_target("proj-1")).await.unwrap();

        let commands = transport.seen();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].contains("echo ok"));
        assert!(commands[1].contains("rm -rf"));
    }
}
