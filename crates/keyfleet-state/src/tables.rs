//! redb table definitions for the fleet state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized
//! domain types). Range keys are the zero-padded hex of the range
//! start so that iteration order is keyspace order.

use redb::TableDefinition;

/// Keyspace ranges keyed by zero-padded hex of `start`.
pub const RANGES: TableDefinition<&str, &[u8]> = TableDefinition::new("ranges");

/// Active assignments keyed by `{target_id}`.
pub const ASSIGNMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("assignments");

/// Latest checkpoint per range keyed by `{range_id}`.
pub const CHECKPOINTS: TableDefinition<&str, &[u8]> = TableDefinition::new("checkpoints");

/// Run-level metadata (global status) keyed by a fixed name.
pub const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

/// Key under which the global status lives in [`META`].
pub const STATUS_KEY: &str = "global_status";
