//! Simulated multi-shard cluster running one resharding operation.
//!
//! Every shard owns a document store, a service registry and a
//! participant. All shards share one data plane and the routing cache of
//! the source collection. A scripted [`Coordinator`] reads the
//! participants' majority-committed documents, advances the global state
//! and broadcasts role projections to every leader once per step.
//!
//! Client writes and leadership flaps are drawn from a seeded RNG, and
//! simulated time only advances while every task is idle.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reshard_core::{
    CollectionId, Epoch, Namespace, OperationId, ShardId, ShardKeyPattern, TermId, Timestamp,
};
use reshard_routing::{
    Chunk, ChunkRange, ChunkVersion, KeyBound, RoutingCache, RoutingError, RoutingSnapshot,
};
use reshard_service::{
    CoordinatorState, DataPlaneConfig, DonorDocument, DonorRole, DonorState, PersistedDocument,
    PrimaryOnlyServiceRegistry, ProjectionFeed, RecipientDocument, RecipientRole,
    RecipientState, RegistryError, ReshardingParticipant, RoleProjection, ServiceConfig,
    ServiceContext, ServiceDescriptor, ServiceKind, SimulatedDataPlane, SimulatedShardEffects,
    SimulatedStateStore, StoreFaultConfig,
};
use thiserror::Error;
use tracing::{debug, info};

/// The operation every simulated cluster runs.
pub const OPERATION_ID: OperationId = OperationId::new(1);

/// Incarnation of the collection being resharded.
pub const SOURCE_COLLECTION_ID: CollectionId = CollectionId::new(100);

const TEMPORARY_COLLECTION_ID: CollectionId = CollectionId::new(101);
const SOURCE_EPOCH: Epoch = Epoch::new(1);
const TEMPORARY_EPOCH: Epoch = Epoch::new(2);

/// Registry type used on every simulated shard.
pub type SimulatedRegistry = PrimaryOnlyServiceRegistry<SimulatedStateStore, SimulatedShardEffects>;

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by the simulation harness.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The cluster configuration is unusable.
    #[error("invalid cluster config: {reason}")]
    InvalidConfig {
        /// What is wrong.
        reason: String,
    },

    /// No shard with this id exists.
    #[error("unknown shard {shard}")]
    UnknownShard {
        /// The shard asked for.
        shard: ShardId,
    },

    /// A registry call failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Routing could not be built.
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// An identifier or key pattern was rejected.
    #[error(transparent)]
    Core(#[from] reshard_core::Error),
}

/// Result type for harness operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

// ============================================================================
// Configuration
// ============================================================================

/// Shape and fault profile of a simulated cluster.
///
/// Shards are named `shard0`, `shard1`, ... Donors are the first `donors`
/// shards and recipients the last `recipients`, so the two sets overlap
/// whenever `donors + recipients > shards`.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Seed for every random choice in the run.
    pub seed: u64,
    /// Number of shards.
    pub shards: usize,
    /// Number of donor shards.
    pub donors: usize,
    /// Number of recipient shards.
    pub recipients: usize,
    /// Faults injected into every shard's store.
    pub store_faults: StoreFaultConfig,
    /// Probability that a donor call fails as unreachable (0.0 - 1.0).
    pub unreachable_rate: f64,
    /// Probability per step that one shard loses and regains leadership.
    pub leadership_flap_rate: f64,
    /// Upper bound on client writes per donor per step.
    pub max_writes_per_step: u64,
    /// Minimum time recipients spend cloning.
    pub minimum_operation_duration: Duration,
    /// Simulated time between steps.
    pub step_interval: Duration,
    /// Service configuration of every shard.
    pub service: ServiceConfig,
}

impl ClusterConfig {
    /// Three shards, two donors and two recipients sharing `shard1`, no faults.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            shards: 3,
            donors: 2,
            recipients: 2,
            store_faults: StoreFaultConfig::none(),
            unreachable_rate: 0.0,
            leadership_flap_rate: 0.0,
            max_writes_per_step: 3,
            minimum_operation_duration: Duration::from_millis(50),
            step_interval: Duration::from_millis(5),
            service: ServiceConfig::fast_for_testing(),
        }
    }

    /// Builder: set the cluster shape.
    #[must_use]
    pub const fn with_shards(mut self, shards: usize, donors: usize, recipients: usize) -> Self {
        self.shards = shards;
        self.donors = donors;
        self.recipients = recipients;
        self
    }

    /// Builder: set store faults.
    #[must_use]
    pub const fn with_store_faults(mut self, faults: StoreFaultConfig) -> Self {
        self.store_faults = faults;
        self
    }

    /// Builder: set the unreachable-donor rate.
    #[must_use]
    pub const fn with_unreachable_rate(mut self, rate: f64) -> Self {
        self.unreachable_rate = rate;
        self
    }

    /// Builder: set the leadership flap rate.
    #[must_use]
    pub const fn with_leadership_flap_rate(mut self, rate: f64) -> Self {
        self.leadership_flap_rate = rate;
        self
    }

    /// Builder: set the minimum operation duration.
    #[must_use]
    pub const fn with_minimum_operation_duration(mut self, duration: Duration) -> Self {
        self.minimum_operation_duration = duration;
        self
    }

    /// Builder: set the service configuration.
    #[must_use]
    pub fn with_service_config(mut self, service: ServiceConfig) -> Self {
        self.service = service;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns `InvalidConfig` describing the first problem found.
    pub fn validate(&self) -> ClusterResult<()> {
        let invalid = |reason: String| Err(ClusterError::InvalidConfig { reason });
        if self.donors == 0 || self.donors > self.shards {
            return invalid(format!("{} donors on {} shards", self.donors, self.shards));
        }
        if self.recipients == 0 || self.recipients > self.shards {
            return invalid(format!(
                "{} recipients on {} shards",
                self.recipients, self.shards
            ));
        }
        for (name, rate) in [
            ("unreachable_rate", self.unreachable_rate),
            ("leadership_flap_rate", self.leadership_flap_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return invalid(format!("{name} must be within [0, 1], got {rate}"));
            }
        }
        if let Err(e) = self.service.validate() {
            return invalid(e.to_string());
        }
        Ok(())
    }

    /// All shard ids, in order.
    #[must_use]
    pub fn shard_ids(&self) -> Vec<ShardId> {
        (0..self.shards).map(shard_id).collect()
    }

    /// Shards that own chunks of the source collection.
    #[must_use]
    pub fn donor_shards(&self) -> BTreeSet<ShardId> {
        (0..self.donors).map(shard_id).collect()
    }

    /// Shards that own chunks of the temporary collection.
    #[must_use]
    pub fn recipient_shards(&self) -> BTreeSet<ShardId> {
        (self.shards.saturating_sub(self.recipients)..self.shards)
            .map(shard_id)
            .collect()
    }
}

/// Name of the shard at `index`.
#[must_use]
pub fn shard_id(index: usize) -> ShardId {
    ShardId::new(format!("shard{index}"))
}

/// The collection being resharded.
///
/// # Errors
/// Never fails for the fixed name; the signature follows `Namespace::new`.
pub fn source_namespace() -> ClusterResult<Namespace> {
    Ok(Namespace::new("test", "orders")?)
}

/// One chunk per shard, in shard order, at increasing minor versions.
fn spread_chunks(shards: &BTreeSet<ShardId>, epoch: Epoch) -> Vec<Chunk> {
    let mut chunks = Vec::with_capacity(shards.len());
    let mut rest = ChunkRange::full();
    let last = shards.len().saturating_sub(1);
    for (index, shard) in shards.iter().enumerate() {
        let minor = u32::try_from(index).unwrap_or(u32::MAX);
        let version = ChunkVersion::new(1, minor, epoch);
        if index == last {
            chunks.push(Chunk::new(rest.clone(), shard.clone(), version));
        } else {
            let (left, right) = rest.split_at(KeyBound::key(format!("k{:04}", index + 1)));
            chunks.push(Chunk::new(left, shard.clone(), version));
            rest = right;
        }
    }
    chunks
}

fn build_registry(
    shard: &ShardId,
    store: &SimulatedStateStore,
    effects: &SimulatedShardEffects,
    config: &ServiceConfig,
) -> ClusterResult<SimulatedRegistry> {
    let ctx = ServiceContext::new(
        shard.clone(),
        store.clone(),
        effects.clone(),
        ProjectionFeed::new(),
        config.clone(),
    );
    let mut registry = PrimaryOnlyServiceRegistry::new(ctx);
    registry.register(ServiceDescriptor::donor())?;
    registry.register(ServiceDescriptor::recipient())?;
    registry.on_startup();
    Ok(registry)
}

// ============================================================================
// Coordinator
// ============================================================================

/// Scripted stand-in for the resharding coordinator.
///
/// Moves the global state forward once every participant has durably
/// reached the state the next phase needs. Any participant in Error aborts
/// the operation.
#[derive(Debug, Clone)]
pub struct Coordinator {
    state: CoordinatorState,
    fetch_timestamp: Option<Timestamp>,
    transitions: Vec<CoordinatorState>,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    /// Creates a coordinator that has not started.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: CoordinatorState::Unused,
            fetch_timestamp: None,
            transitions: Vec::new(),
        }
    }

    /// Current global state.
    #[must_use]
    pub const fn state(&self) -> CoordinatorState {
        self.state
    }

    /// The chosen fetch timestamp, once cloning started.
    #[must_use]
    pub const fn fetch_timestamp(&self) -> Option<Timestamp> {
        self.fetch_timestamp
    }

    /// Every state entered, in order.
    #[must_use]
    pub fn transitions(&self) -> &[CoordinatorState] {
        &self.transitions
    }

    /// Aborts the operation. Returns false once the decision is persisted.
    pub fn abort(&mut self) -> bool {
        if self.state.is_aborted() || self.state.has_reached(CoordinatorState::DecisionPersisted) {
            return false;
        }
        self.enter(CoordinatorState::Error);
        true
    }

    /// Advances the global state from the participants' durable documents.
    ///
    /// A missing document counts as not having reached anything.
    pub fn observe(
        &mut self,
        donors: &[Option<DonorDocument>],
        recipients: &[Option<RecipientDocument>],
    ) -> Option<CoordinatorState> {
        use CoordinatorState as Global;

        if self.state.is_aborted() || self.state == Global::Done {
            return None;
        }

        let errored = donors
            .iter()
            .flatten()
            .any(|doc| doc.state == DonorState::Error)
            || recipients
                .iter()
                .flatten()
                .any(|doc| doc.state == RecipientState::Error);
        let all_donors = |min: DonorState| {
            donors
                .iter()
                .all(|doc| doc.as_ref().is_some_and(|doc| doc.state >= min))
        };
        let all_recipients = |min: RecipientState| {
            recipients
                .iter()
                .all(|doc| doc.as_ref().is_some_and(|doc| doc.state >= min))
        };

        let next = if errored && !self.state.has_reached(Global::DecisionPersisted) {
            Global::Error
        } else {
            match self.state {
                Global::Unused => Global::Initializing,
                Global::Initializing => Global::PreparingToDonate,
                Global::PreparingToDonate
                    if all_donors(DonorState::DonatingInitialData)
                        && all_recipients(RecipientState::AwaitingFetchTimestamp) =>
                {
                    self.fetch_timestamp = donors
                        .iter()
                        .flatten()
                        .filter_map(|doc| doc.min_fetch_timestamp)
                        .max();
                    Global::Cloning
                }
                Global::Cloning if all_recipients(RecipientState::Applying) => Global::Applying,
                Global::Applying if all_recipients(RecipientState::SteadyState) => {
                    Global::BlockingWrites
                }
                Global::BlockingWrites if all_recipients(RecipientState::StrictConsistency) => {
                    Global::DecisionPersisted
                }
                Global::DecisionPersisted
                    if all_donors(DonorState::Done) && all_recipients(RecipientState::Done) =>
                {
                    Global::Done
                }
                _ => return None,
            }
        };
        self.enter(next);
        Some(next)
    }

    fn enter(&mut self, state: CoordinatorState) {
        info!(
            op = %OPERATION_ID,
            from = %self.state,
            to = %state,
            fetch_ts = ?self.fetch_timestamp,
            "Coordinator transitioned"
        );
        self.state = state;
        self.transitions.push(state);
    }
}

// ============================================================================
// Cluster
// ============================================================================

struct ShardNode {
    id: ShardId,
    store: SimulatedStateStore,
    effects: SimulatedShardEffects,
    registry: SimulatedRegistry,
    participant: ReshardingParticipant,
    term: TermId,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterOutcome {
    /// Global state at the end of the run.
    pub final_state: CoordinatorState,
    /// True if the operation finished (completed and cleaned up, or aborted
    /// with every participant in Error).
    pub finished: bool,
    /// Steps taken.
    pub steps: u64,
    /// Leadership flaps injected.
    pub flaps: u64,
}

/// A simulated sharded cluster running [`OPERATION_ID`].
pub struct SimulatedCluster {
    config: ClusterConfig,
    rng: StdRng,
    plane: SimulatedDataPlane,
    source_cache: Arc<RoutingCache>,
    temporary_routing: RoutingSnapshot,
    nodes: Vec<ShardNode>,
    coordinator: Coordinator,
    cleaned: BTreeSet<ShardId>,
    steps: u64,
    flaps: u64,
}

impl SimulatedCluster {
    /// Builds the cluster and makes every shard leader at term 1.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or a registry
    /// cannot start.
    pub async fn start(config: ClusterConfig) -> ClusterResult<Self> {
        config.validate()?;

        let source_namespace = source_namespace()?;
        let source = RoutingSnapshot::new(
            source_namespace.clone(),
            SOURCE_COLLECTION_ID,
            ShardKeyPattern::new(["order_id"])?,
            SOURCE_EPOCH,
            spread_chunks(&config.donor_shards(), SOURCE_EPOCH),
        )?;
        let temporary_routing = RoutingSnapshot::new(
            Namespace::temporary_resharding(source_namespace.db(), SOURCE_COLLECTION_ID),
            TEMPORARY_COLLECTION_ID,
            ShardKeyPattern::new(["customer_id"])?,
            TEMPORARY_EPOCH,
            spread_chunks(&config.recipient_shards(), TEMPORARY_EPOCH),
        )?;
        let source_cache = Arc::new(RoutingCache::new(source));
        let plane = SimulatedDataPlane::new(
            config.seed,
            DataPlaneConfig::default().with_unreachable_rate(config.unreachable_rate),
        );

        let mut nodes = Vec::with_capacity(config.shards);
        for (index, id) in config.shard_ids().into_iter().enumerate() {
            let store = SimulatedStateStore::with_faults(
                config.seed.wrapping_add(index as u64 + 1),
                config.store_faults.clone(),
            );
            let effects = plane.shard(id.clone(), store.clone());
            let mut registry = build_registry(&id, &store, &effects, &config.service)?;
            let term = TermId::new(1);
            registry.on_leadership_acquired(term).await?;
            nodes.push(ShardNode {
                participant: ReshardingParticipant::new(id.clone(), Arc::clone(&source_cache)),
                id,
                store,
                effects,
                registry,
                term,
            });
        }

        info!(
            seed = config.seed,
            shards = config.shards,
            donors = config.donors,
            recipients = config.recipients,
            "Started simulated cluster"
        );
        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            plane,
            source_cache,
            temporary_routing,
            nodes,
            coordinator: Coordinator::new(),
            cleaned: BTreeSet::new(),
            steps: 0,
            flaps: 0,
        })
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// The configuration.
    #[must_use]
    pub const fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// The shared data plane.
    #[must_use]
    pub const fn plane(&self) -> &SimulatedDataPlane {
        &self.plane
    }

    /// Routing cache of the source collection, shared by every shard.
    #[must_use]
    pub const fn source_cache(&self) -> &Arc<RoutingCache> {
        &self.source_cache
    }

    /// Routing of the temporary collection.
    #[must_use]
    pub const fn temporary_routing(&self) -> &RoutingSnapshot {
        &self.temporary_routing
    }

    /// The coordinator.
    #[must_use]
    pub const fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Mutable coordinator, for scripting aborts.
    pub fn coordinator_mut(&mut self) -> &mut Coordinator {
        &mut self.coordinator
    }

    /// All shard ids.
    #[must_use]
    pub fn shards(&self) -> Vec<ShardId> {
        self.nodes.iter().map(|node| node.id.clone()).collect()
    }

    /// A shard's document store.
    #[must_use]
    pub fn store(&self, shard: &ShardId) -> Option<&SimulatedStateStore> {
        self.node(shard).map(|node| &node.store)
    }

    /// A shard's registry.
    #[must_use]
    pub fn registry(&self, shard: &ShardId) -> Option<&SimulatedRegistry> {
        self.node(shard).map(|node| &node.registry)
    }

    /// A shard's registry, mutably.
    ///
    /// # Errors
    /// Returns `UnknownShard` if the shard does not exist.
    pub fn registry_mut(&mut self, shard: &ShardId) -> ClusterResult<&mut SimulatedRegistry> {
        Ok(&mut self.node_mut(shard)?.registry)
    }

    /// Steps taken so far.
    #[must_use]
    pub const fn steps(&self) -> u64 {
        self.steps
    }

    /// Leadership flaps so far.
    #[must_use]
    pub const fn flaps(&self) -> u64 {
        self.flaps
    }

    /// The majority-committed donor document on `shard`.
    #[must_use]
    pub fn donor_document(&self, shard: &ShardId) -> Option<DonorDocument> {
        let bytes = self
            .store(shard)?
            .majority_committed(ServiceKind::Donor, OPERATION_ID)?;
        DonorDocument::decode(&bytes).ok()
    }

    /// The majority-committed recipient document on `shard`.
    #[must_use]
    pub fn recipient_document(&self, shard: &ShardId) -> Option<RecipientDocument> {
        let bytes = self
            .store(shard)?
            .majority_committed(ServiceKind::Recipient, OPERATION_ID)?;
        RecipientDocument::decode(&bytes).ok()
    }

    /// Returns true once the operation completed and every shard cleaned
    /// up, or aborted and every existing participant document is in Error.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        match self.coordinator.state() {
            CoordinatorState::Done => self.nodes.iter().all(|node| self.cleaned.contains(&node.id)),
            CoordinatorState::Error => {
                self.config.donor_shards().iter().all(|shard| {
                    self.donor_document(shard)
                        .map_or(true, |doc| doc.state.is_terminal())
                }) && self.config.recipient_shards().iter().all(|shard| {
                    self.recipient_document(shard)
                        .map_or(true, |doc| doc.state.is_terminal())
                })
            }
            _ => false,
        }
    }

    fn node(&self, shard: &ShardId) -> Option<&ShardNode> {
        self.nodes.iter().find(|node| &node.id == shard)
    }

    fn node_mut(&mut self, shard: &ShardId) -> ClusterResult<&mut ShardNode> {
        self.nodes
            .iter_mut()
            .find(|node| &node.id == shard)
            .ok_or_else(|| ClusterError::UnknownShard {
                shard: shard.clone(),
            })
    }

    // ------------------------------------------------------------------------
    // Driving
    // ------------------------------------------------------------------------

    /// Runs one step: maybe a leadership flap, client writes, one
    /// coordinator observation, a projection broadcast, cleanup, and then
    /// `step_interval` of simulated time for the instances.
    ///
    /// # Errors
    /// Returns an error if a registry call fails.
    pub async fn step(&mut self) -> ClusterResult<()> {
        self.steps += 1;

        let flap_rate = self.config.leadership_flap_rate;
        if flap_rate > 0.0 && !self.is_finished() && self.rng.gen_bool(flap_rate) {
            let index = self.rng.gen_range(0..self.nodes.len());
            let shard = self.nodes[index].id.clone();
            self.flap(&shard).await?;
        }

        self.client_writes();
        self.observe();
        self.broadcast().await?;
        self.clean_up().await?;

        tokio::time::sleep(self.config.step_interval).await;
        Ok(())
    }

    /// Steps until `predicate` holds, at most `max_steps` times. Returns
    /// whether it holds at the end.
    ///
    /// # Errors
    /// Returns an error if a step fails.
    pub async fn run_until<P>(&mut self, max_steps: u64, mut predicate: P) -> ClusterResult<bool>
    where
        P: FnMut(&Self) -> bool,
    {
        for _ in 0..max_steps {
            if predicate(self) {
                return Ok(true);
            }
            self.step().await?;
        }
        Ok(predicate(self))
    }

    /// Steps until the operation finishes, at most `max_steps` times.
    ///
    /// # Errors
    /// Returns an error if a step fails.
    pub async fn run_to_completion(&mut self, max_steps: u64) -> ClusterResult<ClusterOutcome> {
        let finished = self.run_until(max_steps, Self::is_finished).await?;
        let outcome = ClusterOutcome {
            final_state: self.coordinator.state(),
            finished,
            steps: self.steps,
            flaps: self.flaps,
        };
        info!(
            seed = self.config.seed,
            final_state = %outcome.final_state,
            finished,
            steps = outcome.steps,
            flaps = outcome.flaps,
            "Simulation finished"
        );
        Ok(outcome)
    }

    /// Loses and immediately regains leadership on `shard` at the next term.
    ///
    /// # Errors
    /// Returns `UnknownShard` or the registry's error.
    pub async fn flap(&mut self, shard: &ShardId) -> ClusterResult<()> {
        self.lose_leadership(shard).await?;
        self.acquire_leadership(shard).await?;
        self.flaps += 1;
        Ok(())
    }

    /// Steps `shard` down. Its instances stop; its documents stay.
    ///
    /// # Errors
    /// Returns `UnknownShard` if the shard does not exist.
    pub async fn lose_leadership(&mut self, shard: &ShardId) -> ClusterResult<()> {
        let node = self.node_mut(shard)?;
        node.registry.on_leadership_lost().await;
        debug!(shard = %shard, term = %node.term, "Shard stepped down");
        Ok(())
    }

    /// Makes `shard` leader at its next term.
    ///
    /// # Errors
    /// Returns `UnknownShard` or the registry's error.
    pub async fn acquire_leadership(&mut self, shard: &ShardId) -> ClusterResult<usize> {
        let node = self.node_mut(shard)?;
        node.term = node.term.next();
        let term = node.term;
        Ok(node.registry.on_leadership_acquired(term).await?)
    }

    /// Crashes and restarts `shard`: the old registry shuts down and a new
    /// one, with empty memory and a fresh projection feed, takes over the
    /// same store at the next term.
    ///
    /// # Errors
    /// Returns `UnknownShard` or the registry's error.
    pub async fn restart(&mut self, shard: &ShardId) -> ClusterResult<()> {
        let service = self.config.service.clone();
        let node = self.node_mut(shard)?;
        node.registry.on_shutdown().await;
        node.registry = build_registry(&node.id, &node.store, &node.effects, &service)?;
        node.term = node.term.next();
        let term = node.term;
        let started = node.registry.on_leadership_acquired(term).await?;
        info!(shard = %shard, term = %term, started, "Shard restarted");
        Ok(())
    }

    /// Shuts every registry down.
    pub async fn shutdown(&mut self) {
        for node in &mut self.nodes {
            node.registry.on_shutdown().await;
        }
    }

    fn client_writes(&mut self) {
        let state = self.coordinator.state();
        if !state.has_reached(CoordinatorState::Cloning)
            || state.has_reached(CoordinatorState::DecisionPersisted)
        {
            return;
        }
        for donor in self.config.donor_shards() {
            let count = self.rng.gen_range(0..=self.config.max_writes_per_step);
            if count > 0 && !self.plane.record_writes(OPERATION_ID, &donor, count) {
                debug!(shard = %donor, count, "Client writes rejected");
            }
        }
    }

    fn observe(&mut self) {
        let donors: Vec<Option<DonorDocument>> = self
            .config
            .donor_shards()
            .iter()
            .map(|shard| self.donor_document(shard))
            .collect();
        let recipients: Vec<Option<RecipientDocument>> = self
            .config
            .recipient_shards()
            .iter()
            .map(|shard| self.recipient_document(shard))
            .collect();
        self.coordinator.observe(&donors, &recipients);
    }

    fn projection_for(&self, shard: &ShardId, source: &RoutingSnapshot) -> RoleProjection {
        let donors = self.config.donor_shards();
        let recipients = self.config.recipient_shards();
        let mut projection = RoleProjection::new(OPERATION_ID, self.coordinator.state());
        if donors.contains(shard) {
            projection = projection.with_donor(DonorRole {
                temporary_namespace: self.temporary_routing.namespace().clone(),
                new_shard_key: self.temporary_routing.shard_key().clone(),
                recipient_shards: recipients.clone(),
            });
        }
        if recipients.contains(shard) {
            projection = projection.with_recipient(RecipientRole {
                source_namespace: source.namespace().clone(),
                source_collection_id: source.collection_id(),
                donor_shards: donors,
                fetch_timestamp: self.coordinator.fetch_timestamp(),
                minimum_operation_duration: self.config.minimum_operation_duration,
            });
        }
        projection
    }

    async fn broadcast(&mut self) -> ClusterResult<()> {
        if matches!(
            self.coordinator.state(),
            CoordinatorState::Unused | CoordinatorState::Initializing | CoordinatorState::Done
        ) {
            return Ok(());
        }

        let source = self.source_cache.snapshot();
        let projections: Vec<RoleProjection> = self
            .nodes
            .iter()
            .map(|node| self.projection_for(&node.id, &source))
            .collect();

        for (node, projection) in self.nodes.iter_mut().zip(projections) {
            if !node.registry.is_leader() {
                continue;
            }
            let version = source.version_for(&node.id);
            node.participant
                .process_projection(
                    &mut node.registry,
                    version,
                    projection,
                    Some(&self.temporary_routing),
                )
                .await?;
        }
        Ok(())
    }

    async fn clean_up(&mut self) -> ClusterResult<()> {
        if self.coordinator.state() != CoordinatorState::Done {
            return Ok(());
        }
        for node in &mut self.nodes {
            if self.cleaned.contains(&node.id) || !node.registry.is_leader() {
                continue;
            }
            node.registry.on_operation_completed(OPERATION_ID).await?;
            self.cleaned.insert(node.id.clone());
        }
        Ok(())
    }
}

impl std::fmt::Debug for SimulatedCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedCluster")
            .field("seed", &self.config.seed)
            .field("coordinator", &self.coordinator.state())
            .field("steps", &self.steps)
            .field("flaps", &self.flaps)
            .finish_non_exhaustive()
    }
}
