//! keyfleet-stop — ends the run, exactly once.
//!
//! Consumes the fleet event stream and drives the global status to its
//! terminal value: the first hit wins the compare-and-swap to
//! `StoppedFound` and triggers a best-effort stop broadcast to every
//! other worker; a fully completed keyspace becomes `StoppedExhausted`.
//! Duplicate hits and broadcast failures are logged, never escalated.

pub mod controller;

pub use controller::StopController;
