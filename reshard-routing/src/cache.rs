//! Routing cache - the locally cached snapshot for one collection.
//!
//! Readers take a cheap `Arc` clone of the current snapshot and never block a
//! refresh; a refresh swaps in a whole new snapshot.

use std::sync::{Arc, PoisonError, RwLock};

use reshard_core::{Namespace, ShardId};
use tracing::{debug, info};

use crate::error::{RoutingError, RoutingResult};
use crate::snapshot::RoutingSnapshot;
use crate::version::ChunkVersion;

/// Result of installing a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The snapshot replaced the cached one.
    Installed,
    /// The snapshot was older than (or equal to) the cached one and was dropped.
    IgnoredOlder,
}

/// Cached routing for one collection.
#[derive(Debug)]
pub struct RoutingCache {
    namespace: Namespace,
    current: RwLock<Arc<RoutingSnapshot>>,
}

impl RoutingCache {
    /// Creates a cache holding `snapshot`.
    #[must_use]
    pub fn new(snapshot: RoutingSnapshot) -> Self {
        Self {
            namespace: snapshot.namespace().clone(),
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Collection this cache routes.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Returns the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Installs a new snapshot.
    ///
    /// A snapshot from another epoch always replaces the cached one (the
    /// collection was recreated). Within an epoch only a strictly newer
    /// collection version is installed.
    ///
    /// # Errors
    ///
    /// Returns `NamespaceMismatch` if the snapshot routes another collection.
    pub fn install(&self, snapshot: RoutingSnapshot) -> RoutingResult<InstallOutcome> {
        if snapshot.namespace() != &self.namespace {
            return Err(RoutingError::NamespaceMismatch {
                expected: self.namespace.clone(),
                actual: snapshot.namespace().clone(),
            });
        }

        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let cached = guard.collection_version();
        let proposed = snapshot.collection_version();

        if cached.is_same_epoch(&proposed) && !cached.is_older_than(&proposed) {
            debug!(
                namespace = %self.namespace,
                cached = %cached,
                proposed = %proposed,
                "Ignoring routing snapshot that is not newer"
            );
            return Ok(InstallOutcome::IgnoredOlder);
        }

        info!(
            namespace = %self.namespace,
            from = %cached,
            to = %proposed,
            "Installed routing snapshot"
        );
        *guard = Arc::new(snapshot);
        Ok(InstallOutcome::Installed)
    }

    /// Checks a version attached by a caller against the cached shard version.
    ///
    /// # Errors
    ///
    /// Returns `StaleEpoch` if the epochs differ and `StaleShardVersion` if
    /// the versions differ within the epoch. Both mean "refresh and retry".
    pub fn check_shard_version(
        &self,
        shard: &ShardId,
        received: ChunkVersion,
    ) -> RoutingResult<()> {
        let snapshot = self.snapshot();
        let wanted = snapshot.version_for(shard);

        if !received.is_same_epoch(&wanted) {
            return Err(RoutingError::StaleEpoch {
                namespace: self.namespace.clone(),
                received,
                wanted,
            });
        }
        if received != wanted {
            return Err(RoutingError::StaleShardVersion {
                namespace: self.namespace.clone(),
                shard: shard.clone(),
                received,
                wanted,
            });
        }
        Ok(())
    }
}
