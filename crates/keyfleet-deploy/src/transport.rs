//! Remote execution transport.
//!
//! The coordinator never talks to a sandbox directly; everything rides
//! a `TargetTransport`. The production implementation shells out to
//! the `gcloud cloud-shell` CLI, the same mechanism the worker fleet
//! is provisioned through. Tests substitute a scripted double.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use keyfleet_core::Target;

use crate::error::{DeployError, DeployResult};

/// Boxed future type for dyn-compatible async trait methods.
pub type BoxFuture<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>;

/// Remote command execution and file upload against one target.
///
/// Implementations must be cheap to share (`Arc<dyn TargetTransport>`)
/// and must honor the timeout on every call — a hung remote session is
/// reported as `Timeout`, never left pending.
pub trait TargetTransport: Send + Sync {
    /// Run a shell command on the target, returning its stdout.
    fn exec(
        &self,
        target: &Target,
        command: &str,
        timeout: Duration,
    ) -> BoxFuture<DeployResult<String>>;

    /// Upload a local file to a path on the target.
    fn upload(
        &self,
        target: &Target,
        local: &Path,
        remote: &str,
        timeout: Duration,
    ) -> BoxFuture<DeployResult<()>>;
}

/// Transport over the `gcloud cloud-shell` CLI.
pub struct CloudShellTransport {
    gcloud_bin: String,
    credentials: Option<String>,
}

impl CloudShellTransport {
    pub fn new() -> Self {
        Self {
            gcloud_bin: "gcloud".to_string(),
            credentials: None,
        }
    }

    /// Override the gcloud binary path (e.g. for a wrapper script).
    pub fn with_binary(gcloud_bin: impl Into<String>) -> Self {
        Self {
            gcloud_bin: gcloud_bin.into(),
            credentials: None,
        }
    }

    /// Authenticate every gcloud invocation with a service account key.
    pub fn with_credentials(mut self, path: impl Into<String>) -> Self {
        self.credentials = Some(path.into());
        self
    }

    async fn run(
        bin: String,
        args: Vec<String>,
        credentials: Option<String>,
        target_id: String,
        timeout: Duration,
    ) -> DeployResult<String> {
        let output = tokio::time::timeout(timeout, async {
            let mut cmd = Command::new(&bin);
            cmd.args(&args);
            if let Some(credentials) = &credentials {
                cmd.env("GOOGLE_APPLICATION_CREDENTIALS", credentials);
            }
            cmd.output().await
        })
        .await
        .map_err(|_| DeployError::Timeout {
            target: target_id.clone(),
            secs: timeout.as_secs(),
        })?
        .map_err(|e| DeployError::Connect {
            target: target_id.clone(),
            detail: e.to_string(),
        })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(DeployError::Connect {
                target: target_id,
                detail: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }
}

impl Default for CloudShellTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetTransport for CloudShellTransport {
    fn exec(
        &self,
        target: &Target,
        command: &str,
        timeout: Duration,
    ) -> BoxFuture<DeployResult<String>> {
        let bin = self.gcloud_bin.clone();
        let target_id = target.id.clone();
        let args = vec![
            "cloud-shell".to_string(),
            "ssh".to_string(),
            "--project".to_string(),
            target.id.clone(),
            "--command".to_string(),
            command.to_string(),
        ];
        let credentials = self.credentials.clone();
        debug!(target = %target_id, %command, "exec via cloud-shell");
        Box::pin(Self::run(bin, args, credentials, target_id, timeout))
    }

    fn upload(
        &self,
        target: &Target,
        local: &Path,
        remote: &str,
        timeout: Duration,
    ) -> BoxFuture<DeployResult<()>> {
        let bin = self.gcloud_bin.clone();
        let target_id = target.id.clone();
        let local_str = local.display().to_string();
        let args = vec![
            "cloud-shell".to_string(),
            "scp".to_string(),
            local_str.clone(),
            format!("cloudshell:{remote}"),
            "--project".to_string(),
            target.id.clone(),
        ];
        let credentials = self.credentials.clone();
        debug!(target = %target_id, file = %local_str, %remote, "upload via cloud-shell");
        Box::pin(async move {
            Self::run(bin, args, credentials, target_id.clone(), timeout)
                .await
                .map(|_| ())
                .map_err(|e| match e {
                    DeployError::Timeout { .. } => e,
                    other => DeployError::Upload {
                        target: target_id,
                        file: local_str,
                        detail: other.to_string(),
                    },
                })
        })
    }
}
