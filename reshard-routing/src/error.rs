//! Routing error types.

use reshard_core::{Namespace, ShardId};
use thiserror::Error;

use crate::key::KeyBound;
use crate::version::ChunkVersion;

/// Result type for routing operations.
pub type RoutingResult<T> = Result<T, RoutingError>;

/// Errors from routing snapshot construction, refresh and version checks.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// The attached shard version does not match the locally cached one.
    #[error("stale shard version for {shard} on {namespace}: received {received}, wanted {wanted}")]
    StaleShardVersion {
        /// Collection being routed.
        namespace: Namespace,
        /// Shard whose version was checked.
        shard: ShardId,
        /// Version attached by the caller.
        received: ChunkVersion,
        /// Version in the local snapshot.
        wanted: ChunkVersion,
    },

    /// The attached version belongs to a different collection epoch.
    #[error("stale epoch on {namespace}: received {received}, wanted {wanted}")]
    StaleEpoch {
        /// Collection being routed.
        namespace: Namespace,
        /// Version attached by the caller.
        received: ChunkVersion,
        /// Version in the local snapshot.
        wanted: ChunkVersion,
    },

    /// A snapshot must contain at least one chunk.
    #[error("routing snapshot for {namespace} has no chunks")]
    EmptySnapshot {
        /// Collection being routed.
        namespace: Namespace,
    },

    /// Too many chunks for one snapshot.
    #[error("too many chunks: {count} (max {max})")]
    TooManyChunks {
        /// Number of chunks supplied.
        count: usize,
        /// Maximum allowed.
        max: u32,
    },

    /// Chunks leave part of the key space unowned.
    #[error("gap in chunk coverage at {at}")]
    GapInChunks {
        /// First uncovered key.
        at: KeyBound,
    },

    /// Two chunks claim the same keys.
    #[error("overlapping chunks at {at}")]
    OverlappingChunks {
        /// First doubly-owned key.
        at: KeyBound,
    },

    /// A chunk's epoch differs from the snapshot's epoch.
    #[error("chunk version {version} does not belong to {namespace}'s epoch")]
    EpochMismatch {
        /// Collection being routed.
        namespace: Namespace,
        /// Offending chunk version.
        version: ChunkVersion,
    },

    /// A refresh tried to move versions backwards.
    #[error("version regression on {namespace}: current {current}, proposed {proposed}")]
    VersionRegression {
        /// Collection being routed.
        namespace: Namespace,
        /// Current collection version.
        current: ChunkVersion,
        /// Proposed version.
        proposed: ChunkVersion,
    },

    /// A snapshot for a different collection was installed into a cache.
    #[error("namespace mismatch: cache holds {expected}, snapshot is for {actual}")]
    NamespaceMismatch {
        /// Namespace of the cache.
        expected: Namespace,
        /// Namespace of the rejected snapshot.
        actual: Namespace,
    },
}

impl RoutingError {
    /// Returns true if this error means "refresh routing and retry".
    #[must_use]
    pub const fn is_stale_routing(&self) -> bool {
        matches!(self, Self::StaleShardVersion { .. } | Self::StaleEpoch { .. })
    }
}

#[cfg(test)]
mod tests {
    use reshard_core::Epoch;

    use super::*;

    #[test]
    fn test_stale_classification() {
        let ns: Namespace = "db.foo".parse().unwrap();
        let stale = RoutingError::StaleEpoch {
            namespace: ns.clone(),
            received: ChunkVersion::new(1, 0, Epoch::new(1)),
            wanted: ChunkVersion::new(1, 0, Epoch::new(2)),
        };
        assert!(stale.is_stale_routing());
        assert!(stale.to_string().contains("db.foo"));

        let gap = RoutingError::GapInChunks { at: KeyBound::Min };
        assert!(!gap.is_stale_routing());
        assert_eq!(gap.to_string(), "gap in chunk coverage at MinKey");

        let empty = RoutingError::EmptySnapshot { namespace: ns };
        assert!(!empty.is_stale_routing());
    }
}
