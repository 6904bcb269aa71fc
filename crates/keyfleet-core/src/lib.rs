//! keyfleet-core — shared types for the fleet coordinator.
//!
//! Defines the keyspace interval model, the target registry, and the
//! coordinator configuration. Everything here is plain data: no I/O
//! beyond loading the config and registry files, no async.

pub mod config;
pub mod error;
pub mod keyspace;
pub mod registry;

pub use config::CoordinatorConfig;
pub use error::ConfigError;
pub use keyspace::{Keyspace, SearchMode};
pub use registry::{InstanceManifest, Target, TargetHealth, TargetRegistry};
