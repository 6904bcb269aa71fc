//! Coordinator configuration (TOML).
//!
//! Every section is optional; defaults mirror a single-project fleet
//! searching puzzle-sized keyspaces. `validate()` runs before any
//! remote action and structural errors are fatal to the run.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::keyspace::{Keyspace, SearchMode, parse_bound};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub deployment: DeploymentConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub provision: ProvisionConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub optimization: OptimizationConfig,
    #[serde(default)]
    pub backup: BackupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Worker binary uploaded to each target.
    pub binary_name: String,
    /// Puzzle/target definition file uploaded alongside the binary.
    pub puzzle_file: String,
    /// Remote working directory.
    pub work_dir: String,
    pub max_parallel_deployments: usize,
    pub deployment_timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
    pub health_check_interval_secs: u64,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            binary_name: "puzzle_worker".to_string(),
            puzzle_file: "puzzle.txt".to_string(),
            work_dir: "~/keyfleet".to_string(),
            max_parallel_deployments: 8,
            deployment_timeout_secs: 30,
            retry_attempts: 3,
            retry_delay_secs: 5,
            health_check_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Keyspace start, decimal or `0x` hex.
    pub start: String,
    /// Keyspace end (exclusive), decimal or `0x` hex.
    pub end: String,
    pub mode: SearchMode,
    pub switch_interval: u64,
    pub batch_size: u64,
    pub checkpoint_interval: u64,
    /// Optional notification sink URI, forwarded opaquely to workers.
    pub notify_sink: Option<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            start: "0x20000000000000000".to_string(),
            end: "0x3ffffffffffffffff".to_string(),
            mode: SearchMode::Smart,
            switch_interval: 1_000_000,
            batch_size: 10_000,
            checkpoint_interval: 10_000_000,
            notify_sink: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    pub default_locality: String,
    pub machine_class: String,
    pub required_capabilities: Vec<String>,
    pub max_instances_per_project: u32,
    /// `{id}` is substituted with the target identifier.
    pub name_pattern: String,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            default_locality: "us-central1-a".to_string(),
            machine_class: "e2-small".to_string(),
            required_capabilities: vec!["cloudshell.googleapis.com".to_string()],
            max_instances_per_project: 1,
            name_pattern: "fleet-{id}".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub stats_interval_secs: u64,
    pub log_level: String,
    pub log_file: Option<String>,
    pub auto_restart: bool,
    pub max_restart_attempts: u32,
    /// Consecutive missed polls before a target is classified stale.
    pub stale_poll_threshold: u32,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            stats_interval_secs: 60,
            log_level: "info".to_string(),
            log_file: None,
            auto_restart: true,
            max_restart_attempts: 3,
            stale_poll_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SecurityConfig {
    /// Localities targets are allowed to run in; empty = no restriction.
    pub allowed_localities: Vec<String>,
    /// Recognized for operator tooling; enforcement is left to the
    /// provisioning environment.
    pub firewall_policy: Option<String>,
    /// Service account key handed to the provisioning CLI.
    pub credential_path: Option<String>,
}

impl SecurityConfig {
    /// Whether targets in `locality` may be used.
    pub fn allows_locality(&self, locality: &str) -> bool {
        self.allowed_localities.is_empty()
            || self.allowed_localities.iter().any(|l| l == locality)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationConfig {
    pub auto_scale: bool,
    pub min_instances: u32,
    pub max_instances: u32,
    /// Utilization below this triggers scale-up consideration.
    pub scale_up_threshold: f64,
    /// Utilization above this triggers scale-down consideration.
    pub scale_down_threshold: f64,
    pub rebalance_interval_secs: u64,
    pub smart_distribution: bool,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            auto_scale: false,
            min_instances: 1,
            max_instances: 50,
            scale_up_threshold: 0.7,
            scale_down_threshold: 0.95,
            rebalance_interval_secs: 300,
            smart_distribution: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub destination: String,
    pub keep_backups: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 600,
            destination: "./backups".to_string(),
            keep_backups: 10,
        }
    }
}

impl CoordinatorConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: CoordinatorConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// The configured keyspace, parsed and bounds-checked.
    pub fn keyspace(&self) -> ConfigResult<Keyspace> {
        Keyspace::parse(&self.search.start, &self.search.end)
    }

    pub fn deployment_timeout(&self) -> Duration {
        Duration::from_secs(self.deployment.deployment_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.deployment.health_check_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.deployment.retry_delay_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring.stats_interval_secs)
    }

    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_secs(self.optimization.rebalance_interval_secs)
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup.interval_secs)
    }

    /// Structural validation. Rejects on the first error.
    pub fn validate(&self) -> ConfigResult<()> {
        // Bounds parse + start < end.
        let _ = Keyspace::parse(&self.search.start, &self.search.end)?;
        let _ = parse_bound(&self.search.start)?;

        if self.deployment.max_parallel_deployments == 0 {
            return Err(ConfigError::InvalidValue {
                field: "deployment.max_parallel_deployments",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.deployment.retry_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "deployment.retry_attempts",
                reason: "must be at least 1".to_string(),
            });
        }

        let opt = &self.optimization;
        for (field, value) in [
            ("optimization.scale_up_threshold", opt.scale_up_threshold),
            ("optimization.scale_down_threshold", opt.scale_down_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: format!("{value} is outside (0, 1]"),
                });
            }
        }
        if opt.scale_up_threshold >= opt.scale_down_threshold {
            return Err(ConfigError::InvalidValue {
                field: "optimization.scale_up_threshold",
                reason: "must be below scale_down_threshold".to_string(),
            });
        }
        if opt.min_instances > opt.max_instances {
            return Err(ConfigError::InvalidValue {
                field: "optimization.min_instances",
                reason: "exceeds max_instances".to_string(),
            });
        }

        if self.backup.enabled && self.backup.keep_backups == 0 {
            return Err(ConfigError::InvalidValue {
                field: "backup.keep_backups",
                reason: "must be at least 1 when backups are enabled".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CoordinatorConfig::default();
        config.validate().unwrap();
        let ks = config.keyspace().unwrap();
        assert_eq!(ks.start, 0x20000000000000000);
    }

    #[test]
    fn parse_minimal_toml() {
        let config: CoordinatorConfig = toml::from_str("").unwrap();
        assert_eq!(config.deployment.retry_attempts, 3);
        assert_eq!(config.search.mode, SearchMode::Smart);
    }

    #[test]
    fn parse_partial_sections() {
        let config: CoordinatorConfig = toml::from_str(
            r#"
[search]
start = "0"
end = "1000"
mode = "kangaroo"

[optimization]
auto_scale = true
max_instances = 12
"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.search.mode, SearchMode::Kangaroo);
        assert!(config.optimization.auto_scale);
        assert_eq!(config.optimization.max_instances, 12);
        // Untouched sections keep defaults.
        assert_eq!(config.deployment.binary_name, "puzzle_worker");
    }

    #[test]
    fn inverted_keyspace_fails_validation() {
        let config: CoordinatorConfig = toml::from_str(
            r#"
[search]
start = "0x300"
end = "0x200"
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_parallelism_rejected() {
        let config: CoordinatorConfig = toml::from_str(
            r#"
[deployment]
max_parallel_deployments = 0
"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field, .. })
                if field == "deployment.max_parallel_deployments"
        ));
    }

    #[test]
    fn crossed_thresholds_rejected() {
        let config: CoordinatorConfig = toml::from_str(
            r#"
[optimization]
scale_up_threshold = 0.9
scale_down_threshold = 0.5
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn min_above_max_instances_rejected() {
        let config: CoordinatorConfig = toml::from_str(
            r#"
[optimization]
min_instances = 10
max_instances = 5
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyfleet.toml");
        std::fs::write(
            &path,
            r#"
[deployment]
binary_name = "solver"

[search]
start = "0x1"
end = "0xffff"
mode = "sequential"
"#,
        )
        .unwrap();

        let config = CoordinatorConfig::from_file(&path).unwrap();
        assert_eq!(config.deployment.binary_name, "solver");
        assert_eq!(config.search.mode, SearchMode::Sequential);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = CoordinatorConfig::from_file(Path::new("/nonexistent/keyfleet.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn empty_allowed_localities_admits_everything() {
        let security = SecurityConfig::default();
        assert!(security.allows_locality("us-central1-a"));
        assert!(security.allows_locality("europe-west1-b"));
    }

    #[test]
    fn allowed_localities_restrict_targets() {
        let security = SecurityConfig {
            allowed_localities: vec!["us-central1-a".to_string()],
            ..SecurityConfig::default()
        };
        assert!(security.allows_locality("us-central1-a"));
        assert!(!security.allows_locality("europe-west1-b"));
    }
}
