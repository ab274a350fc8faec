//! Reshard Tests - Deterministic Simulation Testing for resharding participants.
//!
//! This crate contains the multi-shard simulation harness and every
//! cross-crate test of the resharding participant services. Unit tests live
//! inline in each crate.
//!
//! ## Test Organization
//!
//! **DST Tests** (`*_dst.rs`): Deterministic simulation with fault injection
//! - `simulation_dst`: Full operations over regression seeds with store
//!   faults, unreachable donors and leadership flaps
//!
//! **Integration Tests** (`*_tests.rs`): Multi-component integration
//! - `crash_restart_tests`: Restarting a shard in every donor and recipient state
//! - `leadership_tests`: Registry rebuild, interruption and document stability
//! - `abort_tests`: Coordinator aborts and protocol violations
//! - `routing_tests`: Stale routing versions and snapshot refreshes
//!
//! **Support Modules**:
//! - `cluster`: `SimulatedCluster` with a scripted coordinator
//! - `properties`: Property checkers over document histories and effects
//! - `scenarios`: Reusable cluster shapes, fault profiles and seeds
//!
//! ## Naming Conventions
//!
//! - DST tests: `test_dst_<component>_<scenario>`
//! - Integration tests: `test_<component>_<scenario>`
//! - Unit tests: Inline in each crate under `#[cfg(test)]`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod cluster;
pub mod properties;
pub mod scenarios;

// DST test modules (deterministic simulation with fault injection).
#[cfg(test)]
mod simulation_dst;

// Integration test modules (multi-component tests).
#[cfg(test)]
mod abort_tests;
#[cfg(test)]
mod crash_restart_tests;

pub use cluster::{
    ClusterConfig, ClusterError, ClusterOutcome, ClusterResult, Coordinator, SimulatedCluster,
    SimulatedRegistry, OPERATION_ID,
};
pub use properties::{PropertyChecker, PropertyViolation};
