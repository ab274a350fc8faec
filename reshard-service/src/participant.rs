//! Role assignment.
//!
//! Turns the coordinator's projection for a collection into donor and
//! recipient documents on this shard. A document is created only the first
//! time the operation is seen in `PreparingToDonate`, and only for roles
//! this shard actually plays according to routing.

use std::sync::Arc;

use reshard_core::{Limits, ShardId};
use reshard_routing::{ChunkVersion, RoutingCache, RoutingSnapshot};
use tracing::{debug, info};

use crate::document::{CommonMetadata, DonorDocument, RecipientDocument};
use crate::effects::ShardEffects;
use crate::error::{RegistryResult, ServiceError};
use crate::projection::{CoordinatorState, RoleProjection};
use crate::registry::PrimaryOnlyServiceRegistry;
use crate::store::StateDocumentStore;

/// Documents created by one projection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// A donor document was created.
    pub donor_created: bool,
    /// A recipient document was created.
    pub recipient_created: bool,
}

/// Per-shard entry point for coordinator projections of one collection.
#[derive(Debug, Clone)]
pub struct ReshardingParticipant {
    shard: ShardId,
    source_cache: Arc<RoutingCache>,
}

impl ReshardingParticipant {
    /// Creates a participant for `shard` routing the source collection
    /// through `source_cache`.
    #[must_use]
    pub const fn new(shard: ShardId, source_cache: Arc<RoutingCache>) -> Self {
        Self {
            shard,
            source_cache,
        }
    }

    /// The shard.
    #[must_use]
    pub const fn shard(&self) -> &ShardId {
        &self.shard
    }

    /// Routing cache of the source collection.
    #[must_use]
    pub const fn source_cache(&self) -> &Arc<RoutingCache> {
        &self.source_cache
    }

    /// Applies a projection received with `received_version` attached.
    ///
    /// The projection is published to running instances; in
    /// `PreparingToDonate` it also creates this shard's documents.
    /// `temporary_routing` is the routing of the temporary collection, if
    /// it exists yet.
    ///
    /// # Errors
    /// Returns a stale-routing error (see `RegistryError::is_stale_routing`)
    /// if `received_version` does not match the cached shard version; the
    /// caller refreshes and retries.
    pub async fn process_projection<S, E>(
        &self,
        registry: &mut PrimaryOnlyServiceRegistry<S, E>,
        received_version: ChunkVersion,
        projection: RoleProjection,
        temporary_routing: Option<&RoutingSnapshot>,
    ) -> RegistryResult<ProcessOutcome>
    where
        S: StateDocumentStore,
        E: ShardEffects,
    {
        self.source_cache
            .check_shard_version(&self.shard, received_version)
            .map_err(ServiceError::StaleRouting)?;

        let op = projection.operation_id;
        debug!(
            op = %op,
            shard = %self.shard,
            global_state = %projection.global_state,
            "Received projection"
        );
        registry.context().projections.publish(projection.clone());

        let mut outcome = ProcessOutcome::default();
        if projection.global_state != CoordinatorState::PreparingToDonate {
            return Ok(outcome);
        }
        let limits = registry.context().config.limits;

        if let Some(role) = &projection.donor {
            let source = self.source_cache.snapshot();
            if source.owns_chunks(&self.shard) {
                Limits::check(
                    "max_recipient_shards",
                    limits.max_recipient_shards,
                    role.recipient_shards.len(),
                )
                .map_err(ServiceError::from)?;
                let metadata = CommonMetadata::new(
                    op,
                    source.namespace().clone(),
                    source.collection_id(),
                    role.new_shard_key.clone(),
                );
                if metadata.temporary_namespace != role.temporary_namespace {
                    return Err(ServiceError::ProtocolViolation {
                        operation_id: op,
                        reason: format!(
                            "donor role names {} but the source collection reshards into {}",
                            role.temporary_namespace, metadata.temporary_namespace
                        ),
                    }
                    .into());
                }
                let doc = DonorDocument::new(metadata, role.recipient_shards.clone());
                outcome.donor_created = registry.start_instance(doc.into()).await?;
            }
        }

        if let (Some(role), Some(temporary)) = (&projection.recipient, temporary_routing) {
            if temporary.owns_chunks(&self.shard) {
                Limits::check(
                    "max_donor_shards",
                    limits.max_donor_shards,
                    role.donor_shards.len(),
                )
                .map_err(ServiceError::from)?;
                let metadata = CommonMetadata::new(
                    op,
                    role.source_namespace.clone(),
                    role.source_collection_id,
                    temporary.shard_key().clone(),
                );
                if &metadata.temporary_namespace != temporary.namespace() {
                    return Err(ServiceError::ProtocolViolation {
                        operation_id: op,
                        reason: format!(
                            "temporary routing is for {} but the recipient role reshards into {}",
                            temporary.namespace(),
                            metadata.temporary_namespace
                        ),
                    }
                    .into());
                }
                let doc = RecipientDocument::new(
                    metadata,
                    role.donor_shards.clone(),
                    role.minimum_operation_duration,
                );
                outcome.recipient_created = registry.start_instance(doc.into()).await?;
            }
        }

        if outcome.donor_created || outcome.recipient_created {
            info!(
                op = %op,
                shard = %self.shard,
                donor = outcome.donor_created,
                recipient = outcome.recipient_created,
                "Assigned resharding roles"
            );
        }
        Ok(outcome)
    }
}
