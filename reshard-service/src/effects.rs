//! Shard effects - the data-plane work instances trigger.
//!
//! Provides the `ShardEffects` trait for the externally observable side
//! effects of donor and recipient transitions, and a simulated data plane
//! shared by every shard of a test cluster.
//!
//! The simulated plane checks the durability-before-effect rule: blocking
//! writes or creating the temporary collection before the matching document
//! state is majority committed is recorded as a violation.

#![allow(clippy::significant_drop_tightening)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reshard_core::{Namespace, OperationId, ShardId, ShardKeyPattern, Timestamp};
use thiserror::Error;
use tracing::debug;

use crate::codec::{decode_donor, decode_recipient};
use crate::document::{DonorState, RecipientState, ServiceKind};
use crate::store::SimulatedStateStore;

/// Result type for effect operations.
pub type EffectResult<T> = Result<T, EffectError>;

/// Errors from shard effects.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EffectError {
    /// A donor could not be reached.
    #[error("donor {donor} unreachable")]
    DonorUnreachable {
        /// The donor.
        donor: ShardId,
    },

    /// The donor has not blocked writes yet, so it has no cutover point.
    #[error("donor {donor} has no cutover point yet")]
    NotAtCutover {
        /// The donor.
        donor: ShardId,
    },

    /// Local resource temporarily unavailable.
    #[error("unavailable: {operation}: {message}")]
    Unavailable {
        /// The operation that failed.
        operation: &'static str,
        /// Error message.
        message: String,
    },

    /// The temporary collection exists with a different shard key.
    #[error("collection {namespace} already exists with shard key {existing}")]
    CollectionConflict {
        /// The collection.
        namespace: Namespace,
        /// Shard key of the existing collection.
        existing: ShardKeyPattern,
    },
}

impl EffectError {
    /// Returns true if retrying the operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DonorUnreachable { .. } | Self::NotAtCutover { .. } | Self::Unavailable { .. }
        )
    }
}

/// Result of one clone batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloneProgress {
    /// Documents copied by this batch.
    pub documents: u64,
    /// True once the donor's snapshot is fully copied.
    pub exhausted: bool,
}

/// Result of one apply batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyProgress {
    /// Entries applied by this batch.
    pub applied: u64,
    /// Entries the donor has that this recipient has not applied.
    pub lag: u64,
}

// -----------------------------------------------------------------------------
// Shard Effects Trait
// -----------------------------------------------------------------------------

/// Side effects available to the instances of one shard.
///
/// Every method must be idempotent: instances repeat them after resuming.
#[async_trait]
pub trait ShardEffects: Send + Sync + 'static {
    /// Latest majority-committed cluster time on this shard. No side effect.
    async fn majority_committed_timestamp(&self) -> EffectResult<Timestamp>;

    /// Blocks writes to the source collection on this shard (donor).
    async fn block_writes(&self, operation_id: OperationId, source: &Namespace)
        -> EffectResult<()>;

    /// Lets writes to the source collection resume after the donor moved
    /// to Error. A no-op if writes were never blocked.
    async fn unblock_writes(&self, operation_id: OperationId, source: &Namespace)
        -> EffectResult<()>;

    /// Creates the temporary collection on this shard (recipient).
    async fn create_temporary_collection(
        &self,
        operation_id: OperationId,
        namespace: &Namespace,
        shard_key: &ShardKeyPattern,
    ) -> EffectResult<()>;

    /// Copies the next batch of `donor`'s data as of `fetch_timestamp`.
    async fn clone_batch(
        &self,
        operation_id: OperationId,
        donor: &ShardId,
        fetch_timestamp: Timestamp,
    ) -> EffectResult<CloneProgress>;

    /// Applies the next batch of `donor`'s oplog entries.
    async fn apply_batch(
        &self,
        operation_id: OperationId,
        donor: &ShardId,
    ) -> EffectResult<ApplyProgress>;

    /// Applies every entry up to `donor`'s cutover point.
    async fn apply_to_cutover(&self, operation_id: OperationId, donor: &ShardId)
        -> EffectResult<()>;
}

// -----------------------------------------------------------------------------
// Simulated Data Plane
// -----------------------------------------------------------------------------

/// Sizing of the simulated data plane.
#[derive(Debug, Clone)]
pub struct DataPlaneConfig {
    /// Documents in each donor's initial snapshot.
    pub documents_per_donor: u64,
    /// Documents copied per clone batch.
    pub clone_batch_size: u64,
    /// Oplog entries applied per apply batch.
    pub apply_batch_size: u64,
    /// New writes a non-blocked donor accepts per apply batch.
    pub writes_per_apply: u64,
    /// Probability of a donor being unreachable for one call (0.0 - 1.0).
    pub unreachable_rate: f64,
}

impl Default for DataPlaneConfig {
    fn default() -> Self {
        Self {
            documents_per_donor: 100,
            clone_batch_size: 25,
            apply_batch_size: 50,
            writes_per_apply: 2,
            unreachable_rate: 0.0,
        }
    }
}

impl DataPlaneConfig {
    /// Builder: set unreachable rate.
    #[must_use]
    pub const fn with_unreachable_rate(mut self, rate: f64) -> Self {
        self.unreachable_rate = rate;
        self
    }
}

/// What an effect did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectKind {
    /// Writes blocked on a donor.
    BlockWrites,
    /// Writes resumed on an aborted donor.
    UnblockWrites,
    /// Temporary collection created on a recipient.
    CreateCollection,
    /// A clone batch from `donor`.
    CloneBatch {
        /// Source donor.
        donor: ShardId,
        /// Documents copied.
        documents: u64,
    },
    /// An apply batch from `donor`.
    ApplyBatch {
        /// Source donor.
        donor: ShardId,
        /// Entries applied.
        applied: u64,
    },
    /// Applied to `donor`'s cutover point.
    Cutover {
        /// Source donor.
        donor: ShardId,
    },
}

/// One recorded effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectEvent {
    /// Shard that performed the effect.
    pub shard: ShardId,
    /// Operation it belongs to.
    pub operation_id: OperationId,
    /// What happened.
    pub kind: EffectKind,
}

#[derive(Debug, Default)]
struct DonorData {
    /// Oplog entries written since the fetch timestamp.
    position: u64,
    blocked: bool,
}

#[derive(Debug, Default)]
struct RecipientData {
    collection: Option<(Namespace, ShardKeyPattern)>,
    cloned: HashMap<ShardId, u64>,
    applied: HashMap<ShardId, u64>,
    at_cutover: BTreeSet<ShardId>,
}

#[derive(Debug, Default)]
struct PlaneState {
    clock: u32,
    donors: HashMap<(OperationId, ShardId), DonorData>,
    recipients: HashMap<(OperationId, ShardId), RecipientData>,
    unreachable: HashSet<ShardId>,
    events: Vec<EffectEvent>,
    violations: Vec<String>,
}

/// Data plane shared by every shard of a simulated cluster.
///
/// Clones share state via `Arc`.
#[derive(Debug, Clone)]
pub struct SimulatedDataPlane {
    state: Arc<Mutex<PlaneState>>,
    config: DataPlaneConfig,
    /// RNG seed for deterministic faults.
    seed: u64,
    /// Operation counter for deterministic RNG.
    counter: Arc<AtomicU64>,
}

impl SimulatedDataPlane {
    /// Creates a data plane.
    #[must_use]
    pub fn new(seed: u64, config: DataPlaneConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(PlaneState::default())),
            config,
            seed,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns the effects handle for one shard.
    #[must_use]
    pub fn shard(&self, shard: ShardId, store: SimulatedStateStore) -> SimulatedShardEffects {
        SimulatedShardEffects {
            shard,
            plane: self.clone(),
            store,
        }
    }

    fn should_inject_fault(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let hash = self
            .seed
            .wrapping_add(counter)
            .wrapping_mul(0x9e37_79b9_7f4a_7c15);
        #[allow(clippy::cast_precision_loss)]
        let normalized = (hash as f64) / (u64::MAX as f64);
        normalized < rate
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PlaneState> {
        self.state.lock().expect("data plane lock poisoned")
    }

    fn check_reachable(&self, donor: &ShardId) -> EffectResult<()> {
        let partitioned = self.lock().unreachable.contains(donor);
        if partitioned || self.should_inject_fault(self.config.unreachable_rate) {
            return Err(EffectError::DonorUnreachable {
                donor: donor.clone(),
            });
        }
        Ok(())
    }

    /// Marks a donor unreachable (or reachable again).
    pub fn set_unreachable(&self, donor: &ShardId, unreachable: bool) {
        let mut state = self.lock();
        if unreachable {
            state.unreachable.insert(donor.clone());
        } else {
            state.unreachable.remove(donor);
        }
    }

    /// Records `count` client writes on a donor. Returns false if the donor
    /// blocks writes.
    pub fn record_writes(&self, operation_id: OperationId, donor: &ShardId, count: u64) -> bool {
        let mut state = self.lock();
        let data = state
            .donors
            .entry((operation_id, donor.clone()))
            .or_default();
        if data.blocked {
            return false;
        }
        data.position += count;
        true
    }

    /// Returns true if the donor blocks writes for the operation.
    #[must_use]
    pub fn is_blocked(&self, operation_id: OperationId, donor: &ShardId) -> bool {
        self.lock()
            .donors
            .get(&(operation_id, donor.clone()))
            .is_some_and(|data| data.blocked)
    }

    /// Donor's oplog position for the operation.
    #[must_use]
    pub fn donor_position(&self, operation_id: OperationId, donor: &ShardId) -> u64 {
        self.lock()
            .donors
            .get(&(operation_id, donor.clone()))
            .map_or(0, |data| data.position)
    }

    /// Entries of `donor` applied by `recipient`.
    #[must_use]
    pub fn applied(&self, operation_id: OperationId, recipient: &ShardId, donor: &ShardId) -> u64 {
        self.lock()
            .recipients
            .get(&(operation_id, recipient.clone()))
            .and_then(|data| data.applied.get(donor).copied())
            .unwrap_or(0)
    }

    /// Documents of `donor` cloned by `recipient`.
    #[must_use]
    pub fn cloned(&self, operation_id: OperationId, recipient: &ShardId, donor: &ShardId) -> u64 {
        self.lock()
            .recipients
            .get(&(operation_id, recipient.clone()))
            .and_then(|data| data.cloned.get(donor).copied())
            .unwrap_or(0)
    }

    /// Returns true if `recipient` created its temporary collection.
    #[must_use]
    pub fn has_collection(&self, operation_id: OperationId, recipient: &ShardId) -> bool {
        self.lock()
            .recipients
            .get(&(operation_id, recipient.clone()))
            .is_some_and(|data| data.collection.is_some())
    }

    /// Every effect performed so far.
    #[must_use]
    pub fn events(&self) -> Vec<EffectEvent> {
        self.lock().events.clone()
    }

    /// Durability-order violations detected so far.
    #[must_use]
    pub fn violations(&self) -> Vec<String> {
        self.lock().violations.clone()
    }

    /// Sizing of the plane.
    #[must_use]
    pub const fn config(&self) -> &DataPlaneConfig {
        &self.config
    }
}

/// Effects handle for one shard of a [`SimulatedDataPlane`].
///
/// Holds the shard's store so it can check that a document state is
/// majority committed before the effect it gates.
#[derive(Debug, Clone)]
pub struct SimulatedShardEffects {
    shard: ShardId,
    plane: SimulatedDataPlane,
    store: SimulatedStateStore,
}

impl SimulatedShardEffects {
    /// The shard these effects act on.
    #[must_use]
    pub const fn shard_id(&self) -> &ShardId {
        &self.shard
    }

    fn donor_durable(&self, operation_id: OperationId) -> bool {
        self.store
            .majority_committed(ServiceKind::Donor, operation_id)
            .and_then(|bytes| decode_donor(&bytes).ok())
            .is_some_and(|doc| {
                doc.state >= DonorState::BlockingWrites && doc.state != DonorState::Error
            })
    }

    fn donor_errored(&self, operation_id: OperationId) -> bool {
        self.store
            .majority_committed(ServiceKind::Donor, operation_id)
            .and_then(|bytes| decode_donor(&bytes).ok())
            .is_some_and(|doc| doc.state == DonorState::Error)
    }

    fn recipient_durable(&self, operation_id: OperationId) -> bool {
        self.store
            .majority_committed(ServiceKind::Recipient, operation_id)
            .and_then(|bytes| decode_recipient(&bytes).ok())
            .is_some_and(|doc| {
                doc.state >= RecipientState::CreatingCollection
                    && doc.state != RecipientState::Error
            })
    }

    fn record(&self, state: &mut PlaneState, operation_id: OperationId, kind: EffectKind) {
        state.events.push(EffectEvent {
            shard: self.shard.clone(),
            operation_id,
            kind,
        });
    }
}

#[async_trait]
impl ShardEffects for SimulatedShardEffects {
    async fn majority_committed_timestamp(&self) -> EffectResult<Timestamp> {
        let mut state = self.plane.lock();
        state.clock += 1;
        Ok(Timestamp::new(state.clock, 1))
    }

    async fn block_writes(
        &self,
        operation_id: OperationId,
        source: &Namespace,
    ) -> EffectResult<()> {
        let durable = self.donor_durable(operation_id);

        let mut state = self.plane.lock();
        if !durable {
            state.violations.push(format!(
                "{} blocked writes on {source} for {operation_id} before blocking-writes was majority committed",
                self.shard
            ));
        }
        let data = state
            .donors
            .entry((operation_id, self.shard.clone()))
            .or_default();
        if !data.blocked {
            data.blocked = true;
            debug!(op = %operation_id, shard = %self.shard, "Blocked writes");
            self.record(&mut state, operation_id, EffectKind::BlockWrites);
        }
        Ok(())
    }

    async fn unblock_writes(
        &self,
        operation_id: OperationId,
        source: &Namespace,
    ) -> EffectResult<()> {
        let errored = self.donor_errored(operation_id);

        let mut state = self.plane.lock();
        let key = (operation_id, self.shard.clone());
        if !state.donors.get(&key).is_some_and(|data| data.blocked) {
            return Ok(());
        }
        if !errored {
            state.violations.push(format!(
                "{} unblocked writes on {source} for {operation_id} before error was majority committed",
                self.shard
            ));
        }
        if let Some(data) = state.donors.get_mut(&key) {
            data.blocked = false;
        }
        debug!(op = %operation_id, shard = %self.shard, "Unblocked writes");
        self.record(&mut state, operation_id, EffectKind::UnblockWrites);
        Ok(())
    }

    async fn create_temporary_collection(
        &self,
        operation_id: OperationId,
        namespace: &Namespace,
        shard_key: &ShardKeyPattern,
    ) -> EffectResult<()> {
        let durable = self.recipient_durable(operation_id);

        let mut state = self.plane.lock();
        if !durable {
            state.violations.push(format!(
                "{} created {namespace} for {operation_id} before creating-collection was majority committed",
                self.shard
            ));
        }
        let data = state
            .recipients
            .entry((operation_id, self.shard.clone()))
            .or_default();
        match &data.collection {
            Some((_, existing)) if existing != shard_key => {
                return Err(EffectError::CollectionConflict {
                    namespace: namespace.clone(),
                    existing: existing.clone(),
                });
            }
            Some(_) => return Ok(()),
            None => data.collection = Some((namespace.clone(), shard_key.clone())),
        }
        self.record(&mut state, operation_id, EffectKind::CreateCollection);
        Ok(())
    }

    async fn clone_batch(
        &self,
        operation_id: OperationId,
        donor: &ShardId,
        fetch_timestamp: Timestamp,
    ) -> EffectResult<CloneProgress> {
        self.plane.check_reachable(donor)?;
        let total = self.plane.config.documents_per_donor;
        let batch = self.plane.config.clone_batch_size;

        let mut state = self.plane.lock();
        let data = state
            .recipients
            .entry((operation_id, self.shard.clone()))
            .or_default();
        if data.collection.is_none() {
            return Err(EffectError::Unavailable {
                operation: "clone_batch",
                message: "temporary collection does not exist".to_string(),
            });
        }
        let cloned = data.cloned.entry(donor.clone()).or_insert(0);
        let documents = batch.min(total - *cloned);
        *cloned += documents;
        let exhausted = *cloned == total;

        debug!(
            op = %operation_id,
            shard = %self.shard,
            donor = %donor,
            fetch_ts = %fetch_timestamp,
            documents,
            exhausted,
            "Cloned batch"
        );
        if documents > 0 {
            self.record(
                &mut state,
                operation_id,
                EffectKind::CloneBatch {
                    donor: donor.clone(),
                    documents,
                },
            );
        }
        Ok(CloneProgress {
            documents,
            exhausted,
        })
    }

    async fn apply_batch(
        &self,
        operation_id: OperationId,
        donor: &ShardId,
    ) -> EffectResult<ApplyProgress> {
        self.plane.check_reachable(donor)?;
        let batch = self.plane.config.apply_batch_size;
        let writes = self.plane.config.writes_per_apply;

        let mut state = self.plane.lock();
        let donor_data = state
            .donors
            .entry((operation_id, donor.clone()))
            .or_default();
        if !donor_data.blocked {
            donor_data.position += writes;
        }
        let position = donor_data.position;

        let recipient = state
            .recipients
            .entry((operation_id, self.shard.clone()))
            .or_default();
        let applied = recipient.applied.entry(donor.clone()).or_insert(0);
        let step = batch.min(position - *applied);
        *applied += step;
        let lag = position - *applied;

        if step > 0 {
            self.record(
                &mut state,
                operation_id,
                EffectKind::ApplyBatch {
                    donor: donor.clone(),
                    applied: step,
                },
            );
        }
        Ok(ApplyProgress { applied: step, lag })
    }

    async fn apply_to_cutover(
        &self,
        operation_id: OperationId,
        donor: &ShardId,
    ) -> EffectResult<()> {
        self.plane.check_reachable(donor)?;

        let mut state = self.plane.lock();
        let (blocked, position) = state
            .donors
            .get(&(operation_id, donor.clone()))
            .map_or((false, 0), |data| (data.blocked, data.position));
        if !blocked {
            return Err(EffectError::NotAtCutover {
                donor: donor.clone(),
            });
        }

        let recipient = state
            .recipients
            .entry((operation_id, self.shard.clone()))
            .or_default();
        recipient.applied.insert(donor.clone(), position);
        if recipient.at_cutover.insert(donor.clone()) {
            self.record(
                &mut state,
                operation_id,
                EffectKind::Cutover {
                    donor: donor.clone(),
                },
            );
        }
        Ok(())
    }
}
