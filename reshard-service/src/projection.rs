//! Coordinator-fed role projection.
//!
//! The coordinator (external to this crate) tells each shard which roles it
//! plays in an operation and how far the operation has progressed globally.
//! Instances only ever read the latest known value; a stale value is fine
//! because every decision taken from it is forward-only.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reshard_core::{CollectionId, Namespace, OperationId, ShardId, ShardKeyPattern, Timestamp};
use tokio::sync::watch;

use crate::error::{ServiceError, ServiceResult};

/// Global state of an operation, as persisted by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinatorState {
    /// Not started.
    Unused,
    /// Coordinator document created.
    Initializing,
    /// Participants are being told their roles.
    PreparingToDonate,
    /// Fetch timestamp chosen; recipients clone.
    Cloning,
    /// All recipients finished cloning; recipients apply oplog entries.
    Applying,
    /// Donors block writes.
    BlockingWrites,
    /// Commit decision is durable.
    DecisionPersisted,
    /// Finished.
    Done,
    /// Aborted.
    Error,
}

impl CoordinatorState {
    /// Position in the forward order. Error has none.
    const fn rank(self) -> Option<u8> {
        match self {
            Self::Unused => Some(0),
            Self::Initializing => Some(1),
            Self::PreparingToDonate => Some(2),
            Self::Cloning => Some(3),
            Self::Applying => Some(4),
            Self::BlockingWrites => Some(5),
            Self::DecisionPersisted => Some(6),
            Self::Done => Some(7),
            Self::Error => None,
        }
    }

    /// Returns true if the operation progressed at least to `target`.
    ///
    /// An aborted operation has not reached anything.
    #[must_use]
    pub fn has_reached(self, target: Self) -> bool {
        match (self.rank(), target.rank()) {
            (Some(current), Some(target)) => current >= target,
            _ => false,
        }
    }

    /// Returns true if the coordinator aborted the operation.
    #[must_use]
    pub const fn is_aborted(self) -> bool {
        matches!(self, Self::Error)
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unused => "unused",
            Self::Initializing => "initializing",
            Self::PreparingToDonate => "preparing-to-donate",
            Self::Cloning => "cloning",
            Self::Applying => "applying",
            Self::BlockingWrites => "blocking-writes",
            Self::DecisionPersisted => "decision-persisted",
            Self::Done => "done",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Donor fields of a projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DonorRole {
    /// Collection the recipients build.
    pub temporary_namespace: Namespace,
    /// The new shard key.
    pub new_shard_key: ShardKeyPattern,
    /// Shards receiving data.
    pub recipient_shards: BTreeSet<ShardId>,
}

/// Recipient fields of a projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientRole {
    /// Collection being resharded.
    pub source_namespace: Namespace,
    /// Incarnation of the source collection.
    pub source_collection_id: CollectionId,
    /// Shards to copy from.
    pub donor_shards: BTreeSet<ShardId>,
    /// Chosen once every donor reported its `minFetchTimestamp`.
    pub fetch_timestamp: Option<Timestamp>,
    /// Minimum time to spend cloning.
    pub minimum_operation_duration: Duration,
}

/// The coordinator's view of one operation for one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleProjection {
    /// The operation.
    pub operation_id: OperationId,
    /// How far the operation progressed globally.
    pub global_state: CoordinatorState,
    /// Present if this shard donates.
    pub donor: Option<DonorRole>,
    /// Present if this shard receives.
    pub recipient: Option<RecipientRole>,
}

impl RoleProjection {
    /// Creates a projection with no roles.
    #[must_use]
    pub const fn new(operation_id: OperationId, global_state: CoordinatorState) -> Self {
        Self {
            operation_id,
            global_state,
            donor: None,
            recipient: None,
        }
    }

    /// Sets the donor role.
    #[must_use]
    pub fn with_donor(mut self, role: DonorRole) -> Self {
        self.donor = Some(role);
        self
    }

    /// Sets the recipient role.
    #[must_use]
    pub fn with_recipient(mut self, role: RecipientRole) -> Self {
        self.recipient = Some(role);
        self
    }
}

type ProjectionMap = HashMap<OperationId, RoleProjection>;

/// Latest-value feed of projections for one shard.
///
/// Clones share the same feed.
#[derive(Debug, Clone)]
pub struct ProjectionFeed {
    sender: Arc<watch::Sender<ProjectionMap>>,
}

impl Default for ProjectionFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectionFeed {
    /// Creates an empty feed.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(HashMap::new());
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Replaces the projection for its operation and wakes watchers.
    pub fn publish(&self, projection: RoleProjection) {
        self.sender.send_modify(|map| {
            map.insert(projection.operation_id, projection);
        });
    }

    /// Drops the projection for an operation.
    pub fn forget(&self, operation_id: OperationId) {
        self.sender.send_if_modified(|map| map.remove(&operation_id).is_some());
    }

    /// Returns the latest projection for an operation.
    #[must_use]
    pub fn latest(&self, operation_id: OperationId) -> Option<RoleProjection> {
        self.sender.borrow().get(&operation_id).cloned()
    }

    /// Creates a watcher that observes later publications.
    #[must_use]
    pub fn watch(&self) -> ProjectionWatcher {
        ProjectionWatcher {
            receiver: self.sender.subscribe(),
        }
    }

    /// Resolves once the coordinator has aborted `operation_id`.
    pub async fn aborted(&self, operation_id: OperationId) {
        let mut watcher = self.watch();
        while !watcher
            .latest(operation_id)
            .is_some_and(|p| p.global_state.is_aborted())
        {
            watcher.changed().await;
        }
    }
}

/// Runs `work` unless the coordinator aborts `operation_id` first.
///
/// # Errors
/// Returns `CoordinatorAborted` if the abort was published before `work`
/// finished, otherwise whatever `work` returns.
pub(crate) async fn unless_aborted<T, F>(
    feed: &ProjectionFeed,
    operation_id: OperationId,
    work: F,
) -> ServiceResult<T>
where
    F: Future<Output = ServiceResult<T>>,
{
    tokio::select! {
        biased;
        () = feed.aborted(operation_id) => Err(ServiceError::CoordinatorAborted),
        result = work => result,
    }
}

/// Receiving side of a [`ProjectionFeed`].
#[derive(Debug)]
pub struct ProjectionWatcher {
    receiver: watch::Receiver<ProjectionMap>,
}

impl ProjectionWatcher {
    /// Returns the latest projection and marks the feed as seen.
    pub fn latest(&mut self, operation_id: OperationId) -> Option<RoleProjection> {
        self.receiver.borrow_and_update().get(&operation_id).cloned()
    }

    /// Waits for a publication after the last `latest` call.
    ///
    /// Never resolves once every feed handle is dropped.
    pub async fn changed(&mut self) {
        if self.receiver.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
