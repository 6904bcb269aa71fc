//! keyfleet-deploy — realizes an assignment plan on real targets.
//!
//! The orchestrator binds ranges to targets through the state store,
//! then performs upload + launch over a pluggable transport with
//! bounded retries. Independent targets deploy concurrently under a
//! shared parallelism bound, and a global throttle keeps the remote
//! provisioning API from being hammered regardless of per-target
//! retry pacing.

pub mod error;
pub mod orchestrator;
pub mod transport;

pub use error::{DeployError, DeployResult};
pub use orchestrator::{DeployOutcome, DeploymentOrchestrator, DeploymentResult};
pub use transport::{BoxFuture, CloudShellTransport, TargetTransport};
