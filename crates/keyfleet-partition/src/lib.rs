//! keyfleet-partition — keyspace partitioning and rebalancing.
//!
//! Pure decision logic: given a keyspace, a distribution strategy, and
//! a worker count, produce an ordered sequence of disjoint ranges whose
//! union is exactly the input interval. Rebalancing shrinks in-progress
//! ranges to their checkpointed remainder before re-cutting, so a
//! confirmed-scanned prefix is never handed out twice.

pub mod error;
pub mod partitioner;

pub use error::PartitionError;
pub use partitioner::{PartitionPlan, RebalancePlan, partition, rebalance};
