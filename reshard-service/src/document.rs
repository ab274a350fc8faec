//! Persisted state documents.
//!
//! A document is the durable record of one instance's progress. Donor and
//! recipient documents share a [`CommonMetadata`] block that is identical on
//! every participant of the same operation.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use reshard_core::{CollectionId, Namespace, OperationId, ShardId, ShardKeyPattern, Timestamp};

use crate::codec::{self, CodecResult};

// -----------------------------------------------------------------------------
// Service Kind
// -----------------------------------------------------------------------------

/// The two state-machine families run by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServiceKind {
    /// Donor instances.
    Donor,
    /// Recipient instances.
    Recipient,
}

impl ServiceKind {
    /// All kinds, in registration order.
    pub const ALL: [Self; 2] = [Self::Donor, Self::Recipient];

    /// Namespace holding this kind's persisted documents.
    #[must_use]
    pub const fn namespace(self) -> &'static str {
        match self {
            Self::Donor => "config.localReshardingOperations.donor",
            Self::Recipient => "config.localReshardingOperations.recipient",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Donor => f.write_str("donor"),
            Self::Recipient => f.write_str("recipient"),
        }
    }
}

// -----------------------------------------------------------------------------
// Common Metadata
// -----------------------------------------------------------------------------

/// Metadata shared by every document of one operation. Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonMetadata {
    /// The resharding operation.
    pub operation_id: OperationId,
    /// Collection being resharded.
    pub source_namespace: Namespace,
    /// Incarnation of the source collection.
    pub source_collection_id: CollectionId,
    /// Collection being built under the new shard key.
    pub temporary_namespace: Namespace,
    /// The new shard key.
    pub new_shard_key: ShardKeyPattern,
}

impl CommonMetadata {
    /// Creates metadata, deriving the temporary namespace from the source.
    #[must_use]
    pub fn new(
        operation_id: OperationId,
        source_namespace: Namespace,
        source_collection_id: CollectionId,
        new_shard_key: ShardKeyPattern,
    ) -> Self {
        let temporary_namespace =
            Namespace::temporary_resharding(source_namespace.db(), source_collection_id);
        Self {
            operation_id,
            source_namespace,
            source_collection_id,
            temporary_namespace,
            new_shard_key,
        }
    }

    /// Placeholder metadata for an operation whose stored metadata could not
    /// be decoded. Only the operation id is meaningful.
    ///
    /// # Errors
    /// Returns an error if the placeholder names fail validation.
    pub fn unreadable(operation_id: OperationId) -> reshard_core::Result<Self> {
        Ok(Self::new(
            operation_id,
            Namespace::new("config", "localReshardingOperations")?,
            CollectionId::new(0),
            ShardKeyPattern::new(["_id"])?,
        ))
    }
}

// -----------------------------------------------------------------------------
// Donor
// -----------------------------------------------------------------------------

/// Donor states, in their fixed forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum DonorState {
    /// Assigned the donor role; nothing persisted beyond the document.
    PreparingToDonate = 0,
    /// `minFetchTimestamp` chosen; recipients clone from this shard.
    DonatingInitialData = 1,
    /// Recipients apply this shard's oplog.
    DonatingOplogEntries = 2,
    /// About to block writes.
    PreparingToBlockWrites = 3,
    /// Writes to the source collection are blocked on this shard.
    BlockingWrites = 4,
    /// Aborted.
    Error = 5,
    /// Finished.
    Done = 6,
}

impl DonorState {
    /// Decodes a persisted ordinal.
    #[must_use]
    pub const fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(Self::PreparingToDonate),
            1 => Some(Self::DonatingInitialData),
            2 => Some(Self::DonatingOplogEntries),
            3 => Some(Self::PreparingToBlockWrites),
            4 => Some(Self::BlockingWrites),
            5 => Some(Self::Error),
            6 => Some(Self::Done),
            _ => None,
        }
    }

    /// Persisted ordinal.
    #[must_use]
    pub const fn ordinal(self) -> u8 {
        self as u8
    }

    /// The state a successful transition leads to.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::PreparingToDonate => Some(Self::DonatingInitialData),
            Self::DonatingInitialData => Some(Self::DonatingOplogEntries),
            Self::DonatingOplogEntries => Some(Self::PreparingToBlockWrites),
            Self::PreparingToBlockWrites => Some(Self::BlockingWrites),
            Self::BlockingWrites => Some(Self::Done),
            Self::Error | Self::Done => None,
        }
    }

    /// Returns true for Error and Done.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Done)
    }

    /// Returns true if `to` is a legal single step from `self`.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == Self::Error || self.next() == Some(to)
    }

    /// Human-readable state name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::PreparingToDonate => "preparing-to-donate",
            Self::DonatingInitialData => "donating-initial-data",
            Self::DonatingOplogEntries => "donating-oplog-entries",
            Self::PreparingToBlockWrites => "preparing-to-block-writes",
            Self::BlockingWrites => "blocking-writes",
            Self::Error => "error",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for DonorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Persisted donor progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DonorDocument {
    /// Shared operation metadata.
    pub metadata: CommonMetadata,
    /// Current state.
    pub state: DonorState,
    /// Earliest timestamp recipients may fetch from. Set once.
    pub min_fetch_timestamp: Option<Timestamp>,
    /// Shards receiving this shard's data.
    pub recipient_shards: BTreeSet<ShardId>,
    /// Set exactly when `state` is Error.
    pub abort_reason: Option<String>,
}

impl DonorDocument {
    /// Creates a donor document in `PreparingToDonate`.
    #[must_use]
    pub const fn new(metadata: CommonMetadata, recipient_shards: BTreeSet<ShardId>) -> Self {
        Self {
            metadata,
            state: DonorState::PreparingToDonate,
            min_fetch_timestamp: None,
            recipient_shards,
            abort_reason: None,
        }
    }

    /// Returns a copy moved to `state`.
    ///
    /// # Panics
    ///
    /// Panics if the transition is not a legal forward step.
    #[must_use]
    pub fn advanced_to(&self, state: DonorState) -> Self {
        assert!(
            self.state.can_transition_to(state) && state != DonorState::Error,
            "illegal donor transition {} -> {}",
            self.state,
            state
        );
        Self {
            state,
            ..self.clone()
        }
    }

    /// Returns a copy moved to `DonatingInitialData` with `minFetchTimestamp`
    /// set, keeping an already-chosen timestamp.
    #[must_use]
    pub fn with_min_fetch_timestamp(&self, chosen: Timestamp) -> Self {
        let mut next = self.advanced_to(DonorState::DonatingInitialData);
        next.min_fetch_timestamp = Some(self.min_fetch_timestamp.unwrap_or(chosen));
        next
    }

    /// Returns the first invariant this document violates.
    #[must_use]
    pub fn invariant_violation(&self) -> Option<&'static str> {
        if self.state == DonorState::Error {
            if self.abort_reason.is_none() {
                return Some("donor in error state must carry an abort reason");
            }
        } else if self.abort_reason.is_some() {
            return Some("only a donor in error state may carry an abort reason");
        }
        if self.state >= DonorState::DonatingInitialData
            && self.state != DonorState::Error
            && self.min_fetch_timestamp.is_none()
        {
            return Some("donor past preparing-to-donate must carry minFetchTimestamp");
        }
        if self.min_fetch_timestamp.is_some_and(Timestamp::is_null) {
            return Some("minFetchTimestamp must not be null");
        }
        None
    }
}

// -----------------------------------------------------------------------------
// Recipient
// -----------------------------------------------------------------------------

/// Recipient states, in their fixed forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum RecipientState {
    /// Waiting for the coordinator to choose the fetch timestamp.
    AwaitingFetchTimestamp = 0,
    /// Creating the temporary collection.
    CreatingCollection = 1,
    /// Copying donor data as of the fetch timestamp.
    Cloning = 2,
    /// Catching up on donor oplog entries.
    Applying = 3,
    /// Applying continuously with bounded lag.
    SteadyState = 4,
    /// Exact mirror of every donor's cutover point.
    StrictConsistency = 5,
    /// Aborted.
    Error = 6,
    /// Finished.
    Done = 7,
}

impl RecipientState {
    /// Decodes a persisted ordinal.
    #[must_use]
    pub const fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(Self::AwaitingFetchTimestamp),
            1 => Some(Self::CreatingCollection),
            2 => Some(Self::Cloning),
            3 => Some(Self::Applying),
            4 => Some(Self::SteadyState),
            5 => Some(Self::StrictConsistency),
            6 => Some(Self::Error),
            7 => Some(Self::Done),
            _ => None,
        }
    }

    /// Persisted ordinal.
    #[must_use]
    pub const fn ordinal(self) -> u8 {
        self as u8
    }

    /// The state a successful transition leads to.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::AwaitingFetchTimestamp => Some(Self::CreatingCollection),
            Self::CreatingCollection => Some(Self::Cloning),
            Self::Cloning => Some(Self::Applying),
            Self::Applying => Some(Self::SteadyState),
            Self::SteadyState => Some(Self::StrictConsistency),
            Self::StrictConsistency => Some(Self::Done),
            Self::Error | Self::Done => None,
        }
    }

    /// Returns true for Error and Done.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Done)
    }

    /// Returns true if `to` is a legal single step from `self`.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == Self::Error || self.next() == Some(to)
    }

    /// Human-readable state name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::AwaitingFetchTimestamp => "awaiting-fetch-timestamp",
            Self::CreatingCollection => "creating-collection",
            Self::Cloning => "cloning",
            Self::Applying => "applying",
            Self::SteadyState => "steady-state",
            Self::StrictConsistency => "strict-consistency",
            Self::Error => "error",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for RecipientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Persisted recipient progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientDocument {
    /// Shared operation metadata.
    pub metadata: CommonMetadata,
    /// Current state.
    pub state: RecipientState,
    /// Timestamp to clone and apply from. Set once.
    pub fetch_timestamp: Option<Timestamp>,
    /// Shards this recipient copies from.
    pub donor_shards: BTreeSet<ShardId>,
    /// Minimum time spent cloning before moving on.
    pub minimum_operation_duration: Duration,
    /// Set exactly when `state` is Error.
    pub abort_reason: Option<String>,
}

impl RecipientDocument {
    /// Creates a recipient document in `AwaitingFetchTimestamp`.
    #[must_use]
    pub const fn new(
        metadata: CommonMetadata,
        donor_shards: BTreeSet<ShardId>,
        minimum_operation_duration: Duration,
    ) -> Self {
        Self {
            metadata,
            state: RecipientState::AwaitingFetchTimestamp,
            fetch_timestamp: None,
            donor_shards,
            minimum_operation_duration,
            abort_reason: None,
        }
    }

    /// Returns a copy moved to `state`.
    ///
    /// # Panics
    ///
    /// Panics if the transition is not a legal forward step.
    #[must_use]
    pub fn advanced_to(&self, state: RecipientState) -> Self {
        assert!(
            self.state.can_transition_to(state) && state != RecipientState::Error,
            "illegal recipient transition {} -> {}",
            self.state,
            state
        );
        Self {
            state,
            ..self.clone()
        }
    }

    /// Returns a copy moved to `CreatingCollection` with the fetch timestamp
    /// set, keeping an already-set timestamp.
    #[must_use]
    pub fn with_fetch_timestamp(&self, fetch_timestamp: Timestamp) -> Self {
        let mut next = self.advanced_to(RecipientState::CreatingCollection);
        next.fetch_timestamp = Some(self.fetch_timestamp.unwrap_or(fetch_timestamp));
        next
    }

    /// Returns the first invariant this document violates.
    #[must_use]
    pub fn invariant_violation(&self) -> Option<&'static str> {
        if self.state == RecipientState::Error {
            if self.abort_reason.is_none() {
                return Some("recipient in error state must carry an abort reason");
            }
        } else if self.abort_reason.is_some() {
            return Some("only a recipient in error state may carry an abort reason");
        }
        if self.state >= RecipientState::CreatingCollection
            && self.state != RecipientState::Error
            && self.fetch_timestamp.is_none()
        {
            return Some("recipient past awaiting-fetch-timestamp must carry fetchTimestamp");
        }
        if self.fetch_timestamp.is_some_and(Timestamp::is_null) {
            return Some("fetchTimestamp must not be null");
        }
        None
    }
}

// -----------------------------------------------------------------------------
// Generic Document Access
// -----------------------------------------------------------------------------

/// Operations shared by donor and recipient documents.
pub trait PersistedDocument: Clone + fmt::Debug + Send + Sync + 'static {
    /// Which service owns documents of this type.
    const KIND: ServiceKind;

    /// Operation the document belongs to.
    fn operation_id(&self) -> OperationId;

    /// Name of the current state.
    fn state_name(&self) -> &'static str;

    /// Returns true once the document reached Error or Done.
    fn is_terminal(&self) -> bool;

    /// Returns true once the document reached Done.
    fn is_done(&self) -> bool;

    /// The persisted abort reason, if any.
    fn abort_reason(&self) -> Option<&str>;

    /// Returns a copy moved to Error with `reason`.
    fn errored(&self, reason: String) -> Self;

    /// Builds the Error document that replaces an undecodable one.
    fn unreadable(metadata: CommonMetadata, reason: String) -> Self;

    /// Encodes the document.
    ///
    /// # Errors
    /// Returns an error if the document is too large or violates an invariant.
    fn encode(&self) -> CodecResult<Bytes>;

    /// Decodes a document of this type.
    ///
    /// # Errors
    /// Returns an error if the bytes are not a valid document of this type.
    fn decode(bytes: &[u8]) -> CodecResult<Self>;
}

impl PersistedDocument for DonorDocument {
    const KIND: ServiceKind = ServiceKind::Donor;

    fn operation_id(&self) -> OperationId {
        self.metadata.operation_id
    }

    fn state_name(&self) -> &'static str {
        self.state.name()
    }

    fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    fn is_done(&self) -> bool {
        self.state == DonorState::Done
    }

    fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    fn errored(&self, reason: String) -> Self {
        debug_assert!(self.state.can_transition_to(DonorState::Error));
        Self {
            state: DonorState::Error,
            abort_reason: Some(reason),
            ..self.clone()
        }
    }

    fn unreadable(metadata: CommonMetadata, reason: String) -> Self {
        Self {
            metadata,
            state: DonorState::Error,
            min_fetch_timestamp: None,
            recipient_shards: BTreeSet::new(),
            abort_reason: Some(reason),
        }
    }

    fn encode(&self) -> CodecResult<Bytes> {
        codec::encode_donor(self)
    }

    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        codec::decode_donor(bytes)
    }
}

impl PersistedDocument for RecipientDocument {
    const KIND: ServiceKind = ServiceKind::Recipient;

    fn operation_id(&self) -> OperationId {
        self.metadata.operation_id
    }

    fn state_name(&self) -> &'static str {
        self.state.name()
    }

    fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    fn is_done(&self) -> bool {
        self.state == RecipientState::Done
    }

    fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    fn errored(&self, reason: String) -> Self {
        debug_assert!(self.state.can_transition_to(RecipientState::Error));
        Self {
            state: RecipientState::Error,
            abort_reason: Some(reason),
            ..self.clone()
        }
    }

    fn unreadable(metadata: CommonMetadata, reason: String) -> Self {
        Self {
            metadata,
            state: RecipientState::Error,
            fetch_timestamp: None,
            donor_shards: BTreeSet::new(),
            minimum_operation_duration: Duration::ZERO,
            abort_reason: Some(reason),
        }
    }

    fn encode(&self) -> CodecResult<Bytes> {
        codec::encode_recipient(self)
    }

    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        codec::decode_recipient(bytes)
    }
}

/// A document of either kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantDocument {
    /// A donor document.
    Donor(DonorDocument),
    /// A recipient document.
    Recipient(RecipientDocument),
}

impl ParticipantDocument {
    /// Kind of the document.
    #[must_use]
    pub const fn kind(&self) -> ServiceKind {
        match self {
            Self::Donor(_) => ServiceKind::Donor,
            Self::Recipient(_) => ServiceKind::Recipient,
        }
    }

    /// Operation the document belongs to.
    #[must_use]
    pub const fn operation_id(&self) -> OperationId {
        match self {
            Self::Donor(doc) => doc.metadata.operation_id,
            Self::Recipient(doc) => doc.metadata.operation_id,
        }
    }

    /// Shared metadata.
    #[must_use]
    pub const fn metadata(&self) -> &CommonMetadata {
        match self {
            Self::Donor(doc) => &doc.metadata,
            Self::Recipient(doc) => &doc.metadata,
        }
    }

    /// Name of the current state.
    #[must_use]
    pub const fn state_name(&self) -> &'static str {
        match self {
            Self::Donor(doc) => doc.state.name(),
            Self::Recipient(doc) => doc.state.name(),
        }
    }

    /// Returns true once the document reached Done.
    #[must_use]
    pub fn is_done(&self) -> bool {
        match self {
            Self::Donor(doc) => doc.is_done(),
            Self::Recipient(doc) => doc.is_done(),
        }
    }
}

impl From<DonorDocument> for ParticipantDocument {
    fn from(doc: DonorDocument) -> Self {
        Self::Donor(doc)
    }
}

impl From<RecipientDocument> for ParticipantDocument {
    fn from(doc: RecipientDocument) -> Self {
        Self::Recipient(doc)
    }
}
