//! keyfleet-scale — grows and shrinks the fleet while it runs.
//!
//! On each rebalance interval the controller compares fleet
//! utilization against the configured thresholds and decides to add
//! targets (carving fresh ranges out of the largest unscanned work) or
//! to release the least-progressed ones (their unscanned remainder
//! goes back to the pool via the retained checkpoint). Provisioning,
//! launching, and teardown are performed through callbacks so the
//! controller itself never talks to a target.

pub mod scaler;

pub use scaler::{
    AssignCallback, ProvisionCallback, ReleaseCallback, RescopeCallback, ScaleDecision,
    ScalingController,
};
