//! Process-scoped context handed to every instance on a shard.

use std::sync::Arc;

use reshard_core::ShardId;

use crate::config::ServiceConfig;
use crate::effects::ShardEffects;
use crate::projection::ProjectionFeed;
use crate::store::StateDocumentStore;

/// Collaborators shared by the registry and its instances.
///
/// Built once at startup and passed explicitly; there is no global registry.
pub struct ServiceContext<S, E> {
    /// This shard.
    pub shard: ShardId,
    /// Durable document storage.
    pub store: Arc<S>,
    /// Data-plane effects.
    pub effects: Arc<E>,
    /// Coordinator projections for this shard.
    pub projections: ProjectionFeed,
    /// Timing and limits.
    pub config: ServiceConfig,
}

impl<S, E> ServiceContext<S, E>
where
    S: StateDocumentStore,
    E: ShardEffects,
{
    /// Creates a context.
    pub fn new(
        shard: ShardId,
        store: S,
        effects: E,
        projections: ProjectionFeed,
        config: ServiceConfig,
    ) -> Self {
        Self {
            shard,
            store: Arc::new(store),
            effects: Arc::new(effects),
            projections,
            config,
        }
    }
}

// Manual impl: `S` and `E` need not be `Clone`.
impl<S, E> Clone for ServiceContext<S, E> {
    fn clone(&self) -> Self {
        Self {
            shard: self.shard.clone(),
            store: Arc::clone(&self.store),
            effects: Arc::clone(&self.effects),
            projections: self.projections.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S, E> std::fmt::Debug for ServiceContext<S, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("shard", &self.shard)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
