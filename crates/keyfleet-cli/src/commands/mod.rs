pub mod cleanup;
pub mod config;
pub mod deploy;
pub mod probe;

use std::path::Path;

use keyfleet_core::{CoordinatorConfig, TargetRegistry};
use keyfleet_deploy::CloudShellTransport;

/// Principal used when a registry line carries none.
pub const DEFAULT_PRINCIPAL: &str = "cloudshell";

/// Load and validate the config + registry pair every command needs.
pub fn load(
    config_path: &Path,
    registry_path: &Path,
) -> anyhow::Result<(CoordinatorConfig, TargetRegistry)> {
    let config = CoordinatorConfig::from_file(config_path)?;
    let registry = TargetRegistry::from_file(
        registry_path,
        &config.provision.default_locality,
        DEFAULT_PRINCIPAL,
    )?;
    for target in registry.targets() {
        if !config.security.allows_locality(&target.locality) {
            anyhow::bail!(
                "target {} is in locality {}, which security.allowed_localities does not permit",
                target.id,
                target.locality
            );
        }
    }
    Ok((config, registry))
}

/// Build the production transport, honoring configured credentials.
pub fn transport_for(config: &CoordinatorConfig) -> CloudShellTransport {
    let mut transport = CloudShellTransport::new();
    if let Some(path) = &config.security.credential_path {
        transport = transport.with_credentials(path);
    }
    transport
}
