//! Partitioner error types.

use thiserror::Error;

/// Errors for invalid partition inputs. These are fatal: a run cannot
/// start from a malformed keyspace or worker count.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartitionError {
    #[error("empty keyspace: start {start:#x} is not below end {end:#x}")]
    EmptyKeyspace { start: u128, end: u128 },

    #[error("worker count must be at least 1")]
    NoWorkers,

    #[error("worker count {workers} exceeds keyspace width {width}")]
    TooManyWorkers { workers: u32, width: u128 },
}
