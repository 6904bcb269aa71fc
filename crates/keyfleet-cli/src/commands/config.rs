//! `keyfleet config` — emit the instance manifest.

use std::path::Path;

pub fn run(config_path: &Path, registry_path: &Path) -> anyhow::Result<()> {
    let (config, registry) = super::load(config_path, registry_path)?;
    let manifest = registry.manifest(&config.provision.name_pattern);
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}
