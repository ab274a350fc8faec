//! Reshard Core - Strongly-typed identifiers and limits for resharding.
//!
//! This crate provides the vocabulary shared by every resharding crate:
//! operation and collection identifiers, shard names, cluster timestamps,
//! namespaces, shard-key patterns and explicit resource limits.
//!
//! # Design Principles (TigerStyle)
//!
//! - **Strongly-typed IDs**: Prevent mixing up an `OperationId` with a `CollectionId`
//! - **Explicit limits**: Every resource has a bounded maximum
//! - **Explicit types**: Use u32/u64, not usize
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod limits;
mod namespace;
mod types;

pub use error::{Error, Result};
pub use limits::Limits;
pub use namespace::{Namespace, ShardKeyPattern, TEMPORARY_RESHARDING_PREFIX};
pub use types::{CollectionId, Epoch, OperationId, ShardId, TermId, Timestamp};
