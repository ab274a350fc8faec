//! Primary-only service registry.
//!
//! Instances run only while the local node is leader. Every leadership
//! acquisition rebuilds them from the persisted documents; every loss
//! interrupts them and forgets all in-memory state.
//!
//! Lifecycle methods take `&mut self`, so they are serialized by
//! construction.

use std::collections::{BTreeMap, HashMap};

use reshard_core::{OperationId, TermId};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::retry_transient;
use crate::codec::decode_document;
use crate::context::ServiceContext;
use crate::document::{ParticipantDocument, ServiceKind};
use crate::effects::ShardEffects;
use crate::error::{RegistryError, RegistryResult, ServiceError};
use crate::instance::{Instance, InstanceOutcome};
use crate::interrupt::{InterruptSource, InterruptToken};
use crate::store::{StateDocumentStore, StoreError, WriteConcern};

/// A state-machine family and the namespace holding its documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// The family.
    pub kind: ServiceKind,
    /// Persisted-document namespace.
    pub namespace: &'static str,
}

impl ServiceDescriptor {
    /// Descriptor for `kind`.
    #[must_use]
    pub const fn for_kind(kind: ServiceKind) -> Self {
        Self {
            kind,
            namespace: kind.namespace(),
        }
    }

    /// The donor service.
    #[must_use]
    pub const fn donor() -> Self {
        Self::for_kind(ServiceKind::Donor)
    }

    /// The recipient service.
    #[must_use]
    pub const fn recipient() -> Self {
        Self::for_kind(ServiceKind::Recipient)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Registering,
    Started,
    Leader { term: TermId },
    Follower,
    ShutDown,
}

struct RunningInstance {
    handle: Option<JoinHandle<InstanceOutcome>>,
    outcome: Option<InstanceOutcome>,
}

/// Builds, runs and interrupts donor and recipient instances for one shard.
pub struct PrimaryOnlyServiceRegistry<S, E> {
    ctx: ServiceContext<S, E>,
    services: BTreeMap<ServiceKind, ServiceDescriptor>,
    lifecycle: Lifecycle,
    last_term: Option<TermId>,
    instances: HashMap<(ServiceKind, OperationId), RunningInstance>,
    /// Present while leader; fired on leadership loss.
    interrupt: Option<InterruptSource>,
}

impl<S, E> PrimaryOnlyServiceRegistry<S, E>
where
    S: StateDocumentStore,
    E: ShardEffects,
{
    /// Creates a registry with no services.
    pub fn new(ctx: ServiceContext<S, E>) -> Self {
        Self {
            ctx,
            services: BTreeMap::new(),
            lifecycle: Lifecycle::Registering,
            last_term: None,
            instances: HashMap::new(),
            interrupt: None,
        }
    }

    /// Registers a service. Only valid before `on_startup`.
    ///
    /// # Errors
    /// Returns `AlreadyStarted` after startup and `DuplicateService` if the
    /// kind is already registered.
    pub fn register(&mut self, descriptor: ServiceDescriptor) -> RegistryResult<()> {
        if self.lifecycle != Lifecycle::Registering {
            return Err(RegistryError::AlreadyStarted);
        }
        if self.services.contains_key(&descriptor.kind) {
            return Err(RegistryError::DuplicateService {
                kind: descriptor.kind,
            });
        }
        debug!(kind = %descriptor.kind, namespace = descriptor.namespace, "Registered service");
        self.services.insert(descriptor.kind, descriptor);
        Ok(())
    }

    /// Freezes the service set.
    pub fn on_startup(&mut self) {
        if self.lifecycle == Lifecycle::Registering {
            info!(
                shard = %self.ctx.shard,
                services = self.services.len(),
                "Service registry started"
            );
            self.lifecycle = Lifecycle::Started;
        }
    }

    /// Becomes leader at `term` and starts an instance for every persisted
    /// document that has none. Returns the number of instances started.
    ///
    /// Calling again at the same term only starts instances for documents
    /// that appeared since. A higher term while leader steps down first.
    /// An unreadable document still gets an instance, which replaces it with
    /// an Error document. Documents over a service's instance limit are
    /// left for a later acquisition.
    ///
    /// # Errors
    /// Returns `StaleTerm` for a term older than one already acquired, and
    /// `NotStarted`/`ShutDown` outside the running lifecycle.
    pub async fn on_leadership_acquired(&mut self, term: TermId) -> RegistryResult<usize> {
        match self.lifecycle {
            Lifecycle::Registering => return Err(RegistryError::NotStarted),
            Lifecycle::ShutDown => return Err(RegistryError::ShutDown),
            Lifecycle::Started | Lifecycle::Follower | Lifecycle::Leader { .. } => {}
        }
        if let Some(current) = self.last_term {
            if term < current {
                return Err(RegistryError::StaleTerm {
                    current,
                    proposed: term,
                });
            }
        }
        if matches!(self.lifecycle, Lifecycle::Leader { term: current } if term > current) {
            self.on_leadership_lost().await;
        }
        if !self.is_leader() {
            self.lifecycle = Lifecycle::Leader { term };
            self.last_term = Some(term);
            self.interrupt = Some(InterruptSource::new());
        }

        let token = self.token()?;
        let kinds: Vec<ServiceKind> = self.services.keys().copied().collect();
        let mut started = 0;
        for kind in kinds {
            let store = &self.ctx.store;
            let documents = retry_transient("list", &self.ctx.config.backoff, &token, || async move {
                store.list(kind).await.map_err(ServiceError::from)
            })
            .await?;

            for (operation_id, bytes) in documents {
                if self.instances.contains_key(&(kind, operation_id)) {
                    continue;
                }
                match decode_document(&bytes) {
                    Ok(doc) if doc.kind() == kind => {
                        debug!(
                            op = %operation_id,
                            kind = %kind,
                            state = doc.state_name(),
                            "Found persisted document"
                        );
                    }
                    Ok(doc) => {
                        error!(
                            op = %operation_id,
                            kind = %kind,
                            found = %doc.kind(),
                            "Document stored under the wrong service"
                        );
                    }
                    Err(e) => {
                        error!(
                            op = %operation_id,
                            kind = %kind,
                            error = %e,
                            "Undecodable document"
                        );
                    }
                }
                if let Err(e) = self.check_capacity(kind) {
                    warn!(op = %operation_id, kind = %kind, error = %e, "Not starting instance");
                    continue;
                }
                self.spawn(kind, operation_id, &token);
                started += 1;
            }
        }

        info!(
            shard = %self.ctx.shard,
            term = %term,
            started,
            running = self.instances.len(),
            "Acquired leadership"
        );
        Ok(started)
    }

    /// Interrupts every instance, waits for them to stop and forgets them.
    /// Persisted documents are not touched.
    pub async fn on_leadership_lost(&mut self) {
        let Lifecycle::Leader { term } = self.lifecycle else {
            return;
        };
        if let Some(source) = self.interrupt.take() {
            source.interrupt();
        }

        let handles: Vec<JoinHandle<InstanceOutcome>> = self
            .instances
            .drain()
            .filter_map(|(_, running)| running.handle)
            .collect();
        let count = handles.len();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!(shard = %self.ctx.shard, error = %e, "Instance task failed");
            }
        }

        self.lifecycle = Lifecycle::Follower;
        info!(shard = %self.ctx.shard, term = %term, interrupted = count, "Lost leadership");
    }

    /// Interrupts everything and rejects later leadership acquisitions.
    pub async fn on_shutdown(&mut self) {
        self.on_leadership_lost().await;
        self.lifecycle = Lifecycle::ShutDown;
        info!(shard = %self.ctx.shard, "Service registry shut down");
    }

    /// Persists a new document and starts its instance. Returns false if a
    /// document for the same (kind, operation) already exists.
    ///
    /// # Errors
    /// Returns `NotLeader` when not leader, `UnknownService` if the kind
    /// is not registered, and `TooManyInstances` (before anything is
    /// persisted) if the service is at its instance limit.
    pub async fn start_instance(&mut self, document: ParticipantDocument) -> RegistryResult<bool> {
        let kind = document.kind();
        let operation_id = document.operation_id();
        let token = self.token()?;
        if !self.services.contains_key(&kind) {
            return Err(RegistryError::UnknownService { kind });
        }
        if self.instances.contains_key(&(kind, operation_id)) {
            return Ok(false);
        }
        self.check_capacity(kind)?;

        let bytes = crate::codec::encode_document(&document).map_err(ServiceError::from)?;
        let store = &self.ctx.store;
        let bytes = &bytes;
        let inserted = retry_transient("insert", &self.ctx.config.backoff, &token, || async move {
            match store
                .insert(kind, operation_id, bytes.clone(), WriteConcern::Majority)
                .await
            {
                Ok(()) => Ok(true),
                Err(StoreError::AlreadyExists { .. }) => Ok(false),
                Err(e) => Err(ServiceError::from(e)),
            }
        })
        .await?;

        self.spawn(kind, operation_id, &token);
        if inserted {
            info!(
                op = %operation_id,
                shard = %self.ctx.shard,
                kind = %kind,
                "Created instance document"
            );
        }
        Ok(inserted)
    }

    fn check_capacity(&self, kind: ServiceKind) -> RegistryResult<()> {
        let max = self.ctx.config.limits.max_instances_per_service;
        let count = self.instances.keys().filter(|(k, _)| *k == kind).count();
        if count >= max as usize {
            return Err(RegistryError::TooManyInstances { kind, count, max });
        }
        Ok(())
    }

    fn spawn(&mut self, kind: ServiceKind, operation_id: OperationId, token: &InterruptToken) {
        let instance = Instance::new(kind, self.ctx.clone(), operation_id, token.clone());
        let handle = tokio::spawn(instance.run());
        self.instances.insert(
            (kind, operation_id),
            RunningInstance {
                handle: Some(handle),
                outcome: None,
            },
        );
    }

    /// Waits for an instance to stop and returns how it stopped.
    ///
    /// # Errors
    /// Returns `InstanceNotFound` if no instance is known for the key.
    pub async fn instance_outcome(
        &mut self,
        kind: ServiceKind,
        operation_id: OperationId,
    ) -> RegistryResult<InstanceOutcome> {
        let running = self
            .instances
            .get_mut(&(kind, operation_id))
            .ok_or(RegistryError::InstanceNotFound { kind, operation_id })?;

        if let Some(handle) = running.handle.take() {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => InstanceOutcome::Errored(format!("instance task failed: {e}")),
            };
            running.outcome = Some(outcome);
        }
        Ok(running
            .outcome
            .clone()
            .unwrap_or(InstanceOutcome::Interrupted))
    }

    /// Removes every document of a globally completed operation.
    ///
    /// Nothing is removed unless every existing document of the operation is
    /// Done.
    ///
    /// # Errors
    /// Returns `NotLeader` when not leader and `NotDone` naming the first
    /// document that has not finished.
    pub async fn on_operation_completed(&mut self, operation_id: OperationId) -> RegistryResult<()> {
        let token = self.token()?;
        let kinds: Vec<ServiceKind> = self.services.keys().copied().collect();
        let store = &self.ctx.store;
        let backoff = &self.ctx.config.backoff;

        let mut present = Vec::new();
        for &kind in &kinds {
            let loaded = retry_transient("load", backoff, &token, || async move {
                store.load(kind, operation_id).await.map_err(ServiceError::from)
            })
            .await?;
            let Some(bytes) = loaded else {
                continue;
            };
            let doc = decode_document(&bytes).map_err(ServiceError::from)?;
            if !doc.is_done() {
                return Err(RegistryError::NotDone {
                    kind,
                    operation_id,
                    state: doc.state_name(),
                });
            }
            present.push(kind);
        }

        for kind in present {
            retry_transient("remove", backoff, &token, || async move {
                store
                    .remove(kind, operation_id, WriteConcern::Majority)
                    .await
                    .map_err(ServiceError::from)
            })
            .await?;
            info!(op = %operation_id, shard = %self.ctx.shard, kind = %kind, "Removed document");
        }
        for kind in kinds {
            self.instances.remove(&(kind, operation_id));
        }
        self.ctx.projections.forget(operation_id);
        Ok(())
    }

    fn token(&self) -> RegistryResult<InterruptToken> {
        self.interrupt
            .as_ref()
            .map(InterruptSource::token)
            .ok_or(RegistryError::NotLeader)
    }

    /// The shared context.
    #[must_use]
    pub const fn context(&self) -> &ServiceContext<S, E> {
        &self.ctx
    }

    /// Returns true while leader.
    #[must_use]
    pub const fn is_leader(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Leader { .. })
    }

    /// Current term, while leader.
    #[must_use]
    pub const fn term(&self) -> Option<TermId> {
        match self.lifecycle {
            Lifecycle::Leader { term } => Some(term),
            _ => None,
        }
    }

    /// Number of known instances (running or finished).
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Returns true if an instance exists for the key.
    #[must_use]
    pub fn has_instance(&self, kind: ServiceKind, operation_id: OperationId) -> bool {
        self.instances.contains_key(&(kind, operation_id))
    }
}

impl<S, E> std::fmt::Debug for PrimaryOnlyServiceRegistry<S, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimaryOnlyServiceRegistry")
            .field("shard", &self.ctx.shard)
            .field("lifecycle", &self.lifecycle)
            .field("instances", &self.instances.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use bytes::Bytes;
    use reshard_core::{CollectionId, ShardId, ShardKeyPattern};

    use super::*;
    use crate::config::ServiceConfig;
    use crate::document::{
        CommonMetadata, DonorDocument, DonorState, PersistedDocument, RecipientDocument,
    };
    use crate::effects::{DataPlaneConfig, SimulatedDataPlane, SimulatedShardEffects};
    use crate::projection::{CoordinatorState, ProjectionFeed, RoleProjection};
    use crate::store::SimulatedStateStore;

    type TestRegistry = PrimaryOnlyServiceRegistry<SimulatedStateStore, SimulatedShardEffects>;

    fn shard() -> ShardId {
        ShardId::new("shard0")
    }

    fn registry(store: &SimulatedStateStore) -> TestRegistry {
        let plane = SimulatedDataPlane::new(3, DataPlaneConfig::default());
        let ctx = ServiceContext::new(
            shard(),
            store.clone(),
            plane.shard(shard(), store.clone()),
            ProjectionFeed::new(),
            ServiceConfig::fast_for_testing(),
        );
        let mut registry = PrimaryOnlyServiceRegistry::new(ctx);
        registry.register(ServiceDescriptor::donor()).unwrap();
        registry.register(ServiceDescriptor::recipient()).unwrap();
        registry.on_startup();
        registry
    }

    fn metadata(op: u64) -> CommonMetadata {
        CommonMetadata::new(
            OperationId::new(op),
            "db.foo".parse().unwrap(),
            CollectionId::new(op),
            ShardKeyPattern::new(["newKey"]).unwrap(),
        )
    }

    fn donor(op: u64) -> DonorDocument {
        DonorDocument::new(metadata(op), BTreeSet::from([ShardId::new("shard1")]))
    }

    fn recipient(op: u64) -> RecipientDocument {
        RecipientDocument::new(metadata(op), BTreeSet::from([ShardId::new("shard1")]), Duration::ZERO)
    }

    #[test]
    fn test_register_rules() {
        let store = SimulatedStateStore::new(1);
        let mut registry = registry(&store);
        assert_eq!(
            registry.register(ServiceDescriptor::donor()),
            Err(RegistryError::AlreadyStarted)
        );

        let plane = SimulatedDataPlane::new(3, DataPlaneConfig::default());
        let ctx = ServiceContext::new(
            shard(),
            store.clone(),
            plane.shard(shard(), store),
            ProjectionFeed::new(),
            ServiceConfig::fast_for_testing(),
        );
        let mut fresh = PrimaryOnlyServiceRegistry::new(ctx);
        fresh.register(ServiceDescriptor::donor()).unwrap();
        assert_eq!(
            fresh.register(ServiceDescriptor::donor()),
            Err(RegistryError::DuplicateService {
                kind: ServiceKind::Donor
            })
        );
        assert_eq!(
            ServiceDescriptor::recipient().namespace,
            "config.localReshardingOperations.recipient"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_leadership_requires_startup() {
        let store = SimulatedStateStore::new(1);
        let plane = SimulatedDataPlane::new(3, DataPlaneConfig::default());
        let ctx = ServiceContext::new(
            shard(),
            store.clone(),
            plane.shard(shard(), store),
            ProjectionFeed::new(),
            ServiceConfig::fast_for_testing(),
        );
        let mut registry: TestRegistry = PrimaryOnlyServiceRegistry::new(ctx);
        assert_eq!(
            registry.on_leadership_acquired(TermId::new(1)).await,
            Err(RegistryError::NotStarted)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_rebuilds_from_documents() {
        let store = SimulatedStateStore::new(1);
        for op in 1..=2 {
            store
                .insert(
                    ServiceKind::Donor,
                    OperationId::new(op),
                    donor(op).encode().unwrap(),
                    WriteConcern::Majority,
                )
                .await
                .unwrap();
        }
        store
            .insert(
                ServiceKind::Recipient,
                OperationId::new(1),
                recipient(1).encode().unwrap(),
                WriteConcern::Majority,
            )
            .await
            .unwrap();

        let mut registry = registry(&store);
        assert_eq!(registry.on_leadership_acquired(TermId::new(1)).await, Ok(3));
        assert_eq!(registry.instance_count(), 3);
        assert!(registry.is_leader());
        assert_eq!(registry.term(), Some(TermId::new(1)));

        // Idempotent at the same term.
        assert_eq!(registry.on_leadership_acquired(TermId::new(1)).await, Ok(0));
        assert_eq!(registry.instance_count(), 3);

        registry.on_leadership_lost().await;
        assert!(!registry.is_leader());
        assert_eq!(registry.instance_count(), 0);
        assert_eq!(store.document_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_term_rejected() {
        let store = SimulatedStateStore::new(1);
        let mut registry = registry(&store);

        registry.on_leadership_acquired(TermId::new(5)).await.unwrap();
        registry.on_leadership_lost().await;
        assert_eq!(
            registry.on_leadership_acquired(TermId::new(4)).await,
            Err(RegistryError::StaleTerm {
                current: TermId::new(5),
                proposed: TermId::new(4),
            })
        );

        // A higher term while leader steps down first.
        registry.on_leadership_acquired(TermId::new(6)).await.unwrap();
        registry.on_leadership_acquired(TermId::new(7)).await.unwrap();
        assert_eq!(registry.term(), Some(TermId::new(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_document_moves_to_error() {
        let store = SimulatedStateStore::new(1);
        store.corrupt(ServiceKind::Donor, OperationId::new(1), Bytes::from_static(b"\x01"));
        store
            .insert(
                ServiceKind::Donor,
                OperationId::new(2),
                donor(2).encode().unwrap(),
                WriteConcern::Majority,
            )
            .await
            .unwrap();

        let mut registry = registry(&store);
        assert_eq!(registry.on_leadership_acquired(TermId::new(1)).await, Ok(2));
        assert!(registry.has_instance(ServiceKind::Donor, OperationId::new(2)));

        let outcome = registry
            .instance_outcome(ServiceKind::Donor, OperationId::new(1))
            .await
            .unwrap();
        let doc = DonorDocument::decode(&store.raw(ServiceKind::Donor, OperationId::new(1)).unwrap())
            .unwrap();
        assert_eq!(doc.state, DonorState::Error);
        assert_eq!(doc.metadata.operation_id, OperationId::new(1));
        assert_eq!(outcome, InstanceOutcome::Errored(doc.abort_reason.unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_document_missing_required_field_moves_to_error() {
        let store = SimulatedStateStore::new(1);
        let op = OperationId::new(1);
        // DonatingOplogEntries without a minFetchTimestamp.
        let bytes = donor(1).encode().unwrap();
        let state_offset = bytes.len() - (1 + 1 + 4 + 4 + "shard1".len() + 1);
        let mut patched = bytes.to_vec();
        patched[state_offset] = DonorState::DonatingOplogEntries.ordinal();
        store.corrupt(ServiceKind::Donor, op, Bytes::from(patched));

        let mut registry = registry(&store);
        assert_eq!(registry.on_leadership_acquired(TermId::new(1)).await, Ok(1));
        assert!(registry.has_instance(ServiceKind::Donor, op));
        assert!(matches!(
            registry.instance_outcome(ServiceKind::Donor, op).await,
            Ok(InstanceOutcome::Errored(_))
        ));

        let doc = DonorDocument::decode(&store.raw(ServiceKind::Donor, op).unwrap()).unwrap();
        assert_eq!(doc.state, DonorState::Error);
        assert_eq!(doc.metadata, donor(1).metadata);
        assert!(doc.abort_reason.unwrap().contains("minFetchTimestamp"));
        assert_eq!(
            store.majority_committed(ServiceKind::Donor, op),
            store.raw(ServiceKind::Donor, op)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_instance_requires_leadership() {
        let store = SimulatedStateStore::new(1);
        let mut registry = registry(&store);
        assert_eq!(
            registry.start_instance(donor(1).into()).await,
            Err(RegistryError::NotLeader)
        );

        registry.on_leadership_acquired(TermId::new(1)).await.unwrap();
        assert_eq!(registry.start_instance(donor(1).into()).await, Ok(true));
        assert_eq!(registry.start_instance(donor(1).into()).await, Ok(false));
        assert_eq!(store.document_count(), 1);
        assert_eq!(registry.instance_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_limit() {
        let store = SimulatedStateStore::new(1);
        let plane = SimulatedDataPlane::new(3, DataPlaneConfig::default());
        let mut limits = reshard_core::Limits::new();
        limits.max_instances_per_service = 1;
        let ctx = ServiceContext::new(
            shard(),
            store.clone(),
            plane.shard(shard(), store.clone()),
            ProjectionFeed::new(),
            ServiceConfig::fast_for_testing().with_limits(limits),
        );
        let mut registry = PrimaryOnlyServiceRegistry::new(ctx);
        registry.register(ServiceDescriptor::donor()).unwrap();
        registry.on_startup();
        registry.on_leadership_acquired(TermId::new(1)).await.unwrap();

        registry.start_instance(donor(1).into()).await.unwrap();
        assert!(matches!(
            registry.start_instance(donor(2).into()).await,
            Err(RegistryError::TooManyInstances { .. })
        ));
        assert_eq!(store.document_count(), 1);
        assert!(matches!(
            registry.start_instance(recipient(3).into()).await,
            Err(RegistryError::UnknownService { .. })
        ));

        // More documents than the limit: the scan starts what fits.
        store
            .insert(
                ServiceKind::Donor,
                OperationId::new(2),
                donor(2).encode().unwrap(),
                WriteConcern::Majority,
            )
            .await
            .unwrap();
        registry.on_leadership_lost().await;
        assert_eq!(registry.on_leadership_acquired(TermId::new(2)).await, Ok(1));
        assert_eq!(registry.instance_count(), 1);
        assert_eq!(store.document_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_requires_done() {
        let store = SimulatedStateStore::new(1);
        let mut registry = registry(&store);
        registry.on_leadership_acquired(TermId::new(1)).await.unwrap();
        let op = OperationId::new(1);
        registry.start_instance(donor(1).into()).await.unwrap();

        assert!(matches!(
            registry.on_operation_completed(op).await,
            Err(RegistryError::NotDone { .. })
        ));

        registry
            .context()
            .projections
            .publish(RoleProjection::new(op, CoordinatorState::DecisionPersisted));
        assert_eq!(
            registry.instance_outcome(ServiceKind::Donor, op).await,
            Ok(InstanceOutcome::Completed)
        );
        let doc = DonorDocument::decode(&store.raw(ServiceKind::Donor, op).unwrap()).unwrap();
        assert_eq!(doc.state, DonorState::Done);

        registry.on_operation_completed(op).await.unwrap();
        assert_eq!(store.document_count(), 0);
        assert!(!registry.has_instance(ServiceKind::Donor, op));
        assert!(registry.context().projections.latest(op).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_leadership() {
        let store = SimulatedStateStore::new(1);
        let mut registry = registry(&store);
        registry.on_leadership_acquired(TermId::new(1)).await.unwrap();
        registry.on_shutdown().await;
        assert_eq!(
            registry.on_leadership_acquired(TermId::new(2)).await,
            Err(RegistryError::ShutDown)
        );
    }
}
