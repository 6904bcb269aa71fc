//! Target registry — the fleet roster.
//!
//! One target per line, `identifier[:locality[:principal]]`. Blank
//! lines and `#` comments are ignored; missing locality/principal fall
//! back to configured defaults. The parser rejects on the first
//! structural error rather than silently skipping bad lines.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Observed liveness of a target. Only the fleet monitor mutates this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetHealth {
    /// Not yet polled.
    Unknown,
    /// Answered its last poll within the check interval.
    Healthy,
    /// Missed consecutive polls but the transport still connects.
    Stale,
    /// Transport-level connection failure.
    Dead,
}

/// A remote, ephemeral compute sandbox capable of running one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub locality: String,
    pub principal: String,
    pub health: TargetHealth,
    /// Unix timestamp (seconds) of the last successful poll.
    pub last_seen: u64,
}

/// One record of the generated instance manifest, derived per target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceManifest {
    pub name: String,
    pub project_identifier: String,
    pub locality: String,
    pub principal: String,
}

/// Validated, ordered list of execution targets.
///
/// Loaded once at startup; treated as read-only for the run except for
/// each target's health field.
#[derive(Debug, Clone)]
pub struct TargetRegistry {
    targets: Vec<Target>,
}

impl TargetRegistry {
    /// Load and validate a registry file.
    pub fn from_file(
        path: &Path,
        default_locality: &str,
        default_principal: &str,
    ) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_str_with_defaults(&content, default_locality, default_principal)
    }

    /// Parse registry text. Rejects the whole input on the first
    /// malformed or duplicate line.
    pub fn from_str_with_defaults(
        content: &str,
        default_locality: &str,
        default_principal: &str,
    ) -> ConfigResult<Self> {
        let mut targets: Vec<Target> = Vec::new();

        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.splitn(3, ':');
            let id = parts.next().unwrap_or_default().trim();
            if id.is_empty() {
                return Err(ConfigError::Registry {
                    line: idx + 1,
                    reason: "empty target identifier".to_string(),
                });
            }

            let locality = match parts.next().map(str::trim) {
                Some("") => {
                    return Err(ConfigError::Registry {
                        line: idx + 1,
                        reason: "empty locality field".to_string(),
                    });
                }
                Some(l) => l.to_string(),
                None => default_locality.to_string(),
            };
            let principal = match parts.next().map(str::trim) {
                Some("") => {
                    return Err(ConfigError::Registry {
                        line: idx + 1,
                        reason: "empty principal field".to_string(),
                    });
                }
                Some(p) => p.to_string(),
                None => default_principal.to_string(),
            };

            if targets.iter().any(|t| t.id == id) {
                return Err(ConfigError::Registry {
                    line: idx + 1,
                    reason: format!("duplicate target identifier {id:?}"),
                });
            }

            targets.push(Target {
                id: id.to_string(),
                locality,
                principal,
                health: TargetHealth::Unknown,
                last_seen: 0,
            });
        }

        if targets.is_empty() {
            return Err(ConfigError::Registry {
                line: 0,
                reason: "registry contains no targets".to_string(),
            });
        }

        Ok(Self { targets })
    }

    /// All targets, in registry order.
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.id == id)
    }

    /// Derive the ordered instance manifest, one record per target.
    ///
    /// `name_pattern` substitutes `{id}` with the target identifier,
    /// e.g. `"fleet-{id}"` → `fleet-shell-01`.
    pub fn manifest(&self, name_pattern: &str) -> Vec<InstanceManifest> {
        self.targets
            .iter()
            .map(|t| InstanceManifest {
                name: name_pattern.replace("{id}", &t.id),
                project_identifier: t.id.clone(),
                locality: t.locality.clone(),
                principal: t.principal.clone(),
            })
            .collect()
    }
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> ConfigResult<TargetRegistry> {
        TargetRegistry::from_str_with_defaults(content, "us-central1-a", "cloudshell")
    }

    #[test]
    fn full_lines_parse() {
        let reg = parse("proj-1:europe-west1-b:alice\nproj-2:us-east1-c:bob\n").unwrap();
        assert_eq!(reg.len(), 2);
        let t = reg.get("proj-1").unwrap();
        assert_eq!(t.locality, "europe-west1-b");
        assert_eq!(t.principal, "alice");
        assert_eq!(t.health, TargetHealth::Unknown);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let reg = parse("proj-1\nproj-2:asia-east1-a\n").unwrap();
        let bare = reg.get("proj-1").unwrap();
        assert_eq!(bare.locality, "us-central1-a");
        assert_eq!(bare.principal, "cloudshell");
        let partial = reg.get("proj-2").unwrap();
        assert_eq!(partial.locality, "asia-east1-a");
        assert_eq!(partial.principal, "cloudshell");
    }

    #[test]
    fn comments_and_blanks_ignored() {
        let reg = parse("# fleet roster\n\nproj-1\n   \n# tail comment\nproj-2\n").unwrap();
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn duplicate_identifier_rejected() {
        let err = parse("proj-1\nproj-1:eu\n").unwrap_err();
        assert!(matches!(err, ConfigError::Registry { line: 2, .. }));
    }

    #[test]
    fn empty_fields_rejected() {
        assert!(parse("proj-1::alice\n").is_err());
        assert!(parse(":eu:alice\n").is_err());
    }

    #[test]
    fn empty_registry_rejected() {
        assert!(parse("# only comments\n\n").is_err());
    }

    #[test]
    fn manifest_preserves_order_and_pattern() {
        let reg = parse("proj-b:eu:x\nproj-a\n").unwrap();
        let manifest = reg.manifest("fleet-{id}");
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest[0].name, "fleet-proj-b");
        assert_eq!(manifest[0].project_identifier, "proj-b");
        assert_eq!(manifest[1].name, "fleet-proj-a");
    }
}
