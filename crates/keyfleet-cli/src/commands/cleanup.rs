//! `keyfleet cleanup` — tear workers down everywhere.

use std::path::Path;
use std::sync::Arc;

use anyhow::bail;
use tracing::{info, warn};

use keyfleet_deploy::DeploymentOrchestrator;
use keyfleet_state::StateStore;

pub async fn run(config_path: &Path, registry_path: &Path) -> anyhow::Result<()> {
    let (config, registry) = super::load(config_path, registry_path)?;
    let state = StateStore::open_in_memory()?;
    let transport = Arc::new(super::transport_for(&config));
    let orchestrator = DeploymentOrchestrator::new(transport, state, Arc::new(config));

    let mut failures = 0usize;
    for target in registry.targets() {
        match orchestrator.cleanup(target).await {
            Ok(()) => info!(target = %target.id, "cleaned up"),
            Err(e) => {
                warn!(target = %target.id, error = %e, "cleanup failed");
                failures += 1;
            }
        }
    }

    println!(
        "{} of {} targets cleaned up",
        registry.len() - failures,
        registry.len()
    );
    if failures > 0 {
        bail!("{failures} target(s) could not be cleaned up");
    }
    Ok(())
}
