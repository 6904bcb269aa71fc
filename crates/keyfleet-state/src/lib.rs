//! keyfleet-state — embedded fleet state store.
//!
//! Backed by [redb](https://docs.rs/redb). Holds the keyspace ranges,
//! the active target assignments, the per-range checkpoints, and the
//! global run status. This store is the single serialization point for
//! all fleet state: every component mutates through it and never
//! through shared memory, so range status and global status can never
//! interleave into an inconsistent intermediate.
//!
//! Checkpoints are the only state that must survive a coordinator
//! restart; everything else is reconstructed from them plus the
//! target registry.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
