//! Reshard Routing - versioned chunk ownership for resharding participants.
//!
//! This crate provides the routing metadata a shard consults while it takes
//! part in a resharding operation: which shard owns which shard-key range,
//! and at which version.
//!
//! # Design (`TigerStyle`)
//!
//! - **Immutable snapshots**: A `RoutingSnapshot` is never mutated; refreshes
//!   build a new snapshot and swap it in atomically
//! - **Monotonic versions**: Per-shard versions never decrease within an epoch
//! - **Stale routing is not corruption**: Version mismatches are reported as a
//!   distinct error that callers resolve by refresh-and-retry

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod cache;
mod error;
mod key;
mod snapshot;
mod version;

pub use cache::{InstallOutcome, RoutingCache};
pub use error::{RoutingError, RoutingResult};
pub use key::{ChunkRange, KeyBound};
pub use snapshot::{Chunk, RoutingSnapshot};
pub use version::ChunkVersion;
