//! Property definitions and checkers for resharding simulations.
//!
//! Properties are checked against what a run leaves behind: every version
//! ever written of every participant document, and the data plane's record
//! of effects. Histories survive document removal, so a completed and
//! cleaned-up operation can still be checked.

use bytes::Bytes;
use reshard_core::{ShardId, Timestamp};
use reshard_service::{
    CommonMetadata, CoordinatorState, DonorDocument, DonorState, PersistedDocument,
    RecipientDocument, RecipientState, ServiceKind, SimulatedDataPlane,
};

use crate::cluster::{SimulatedCluster, OPERATION_ID};

// ============================================================================
// Property Violation Types
// ============================================================================

/// A violation of a resharding safety property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyViolation {
    /// Two consecutive document versions are not a legal forward step.
    IllegalTransition {
        /// Shard holding the document.
        shard: ShardId,
        /// Document kind.
        kind: ServiceKind,
        /// State before.
        from: &'static str,
        /// State after.
        to: &'static str,
    },
    /// A fetch timestamp changed after it was set.
    FetchTimestampChanged {
        /// Shard holding the document.
        shard: ShardId,
        /// Document kind.
        kind: ServiceKind,
        /// First value.
        from: Timestamp,
        /// Later value (`None` if it was cleared).
        to: Option<Timestamp>,
    },
    /// Operation metadata changed between versions.
    MetadataMismatch {
        /// Shard holding the document.
        shard: ShardId,
        /// Document kind.
        kind: ServiceKind,
        /// Index of the offending version in the history.
        version: usize,
    },
    /// A written version does not decode.
    UndecodableHistory {
        /// Shard holding the document.
        shard: ShardId,
        /// Document kind.
        kind: ServiceKind,
        /// Index of the offending version in the history.
        version: usize,
        /// Decode error.
        error: String,
    },
    /// A written version breaks a document invariant.
    InvariantBroken {
        /// Shard holding the document.
        shard: ShardId,
        /// Document kind.
        kind: ServiceKind,
        /// State of the offending version.
        state: &'static str,
        /// The invariant.
        invariant: &'static str,
    },
    /// The operation completed but a participant's last version is not Done.
    NotDone {
        /// Shard holding the document.
        shard: ShardId,
        /// Document kind.
        kind: ServiceKind,
        /// Last state written, if any.
        state: Option<&'static str>,
    },
    /// A recipient did not apply exactly up to a donor's cutover point.
    NotMirrored {
        /// The recipient.
        recipient: ShardId,
        /// The donor.
        donor: ShardId,
        /// Entries applied.
        applied: u64,
        /// Donor oplog position.
        position: u64,
    },
    /// A recipient did not clone a donor's whole snapshot.
    IncompleteClone {
        /// The recipient.
        recipient: ShardId,
        /// The donor.
        donor: ShardId,
        /// Documents cloned.
        cloned: u64,
        /// Documents in the donor snapshot.
        expected: u64,
    },
    /// An effect ran before the state gating it was majority committed.
    EffectBeforeDurable {
        /// What the data plane recorded.
        detail: String,
    },
}

impl std::fmt::Display for PropertyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IllegalTransition {
                shard,
                kind,
                from,
                to,
            } => write!(f, "Illegal {kind} transition on {shard}: {from} -> {to}"),
            Self::FetchTimestampChanged {
                shard,
                kind,
                from,
                to,
            } => write!(
                f,
                "Fetch timestamp of {kind} on {shard} changed from {from} to {to:?}"
            ),
            Self::MetadataMismatch {
                shard,
                kind,
                version,
            } => write!(f, "Metadata of {kind} on {shard} changed at version {version}"),
            Self::UndecodableHistory {
                shard,
                kind,
                version,
                error,
            } => write!(
                f,
                "Version {version} of {kind} on {shard} does not decode: {error}"
            ),
            Self::InvariantBroken {
                shard,
                kind,
                state,
                invariant,
            } => write!(f, "{kind} on {shard} in {state} breaks: {invariant}"),
            Self::NotDone { shard, kind, state } => write!(
                f,
                "Operation completed but {kind} on {shard} ended in {}",
                state.unwrap_or("no state")
            ),
            Self::NotMirrored {
                recipient,
                donor,
                applied,
                position,
            } => write!(
                f,
                "{recipient} applied {applied} of {donor}'s {position} oplog entries"
            ),
            Self::IncompleteClone {
                recipient,
                donor,
                cloned,
                expected,
            } => write!(
                f,
                "{recipient} cloned {cloned} of {donor}'s {expected} documents"
            ),
            Self::EffectBeforeDurable { detail } => {
                write!(f, "Effect before durability: {detail}")
            }
        }
    }
}

// ============================================================================
// Document Histories
// ============================================================================

/// What the history checker needs from a document type.
trait TrackedDocument: PersistedDocument {
    type State: Copy + PartialEq;

    fn state(&self) -> Self::State;
    fn is_legal_step(from: Self::State, to: Self::State) -> bool;
    fn is_done_state(state: Self::State) -> bool;
    fn pinned_timestamp(&self) -> Option<Timestamp>;
    fn common(&self) -> &CommonMetadata;
    fn broken_invariant(&self) -> Option<&'static str>;
}

impl TrackedDocument for DonorDocument {
    type State = DonorState;

    fn state(&self) -> DonorState {
        self.state
    }

    fn is_legal_step(from: DonorState, to: DonorState) -> bool {
        from.can_transition_to(to)
    }

    fn is_done_state(state: DonorState) -> bool {
        state == DonorState::Done
    }

    fn pinned_timestamp(&self) -> Option<Timestamp> {
        self.min_fetch_timestamp
    }

    fn common(&self) -> &CommonMetadata {
        &self.metadata
    }

    fn broken_invariant(&self) -> Option<&'static str> {
        self.invariant_violation()
    }
}

impl TrackedDocument for RecipientDocument {
    type State = RecipientState;

    fn state(&self) -> RecipientState {
        self.state
    }

    fn is_legal_step(from: RecipientState, to: RecipientState) -> bool {
        from.can_transition_to(to)
    }

    fn is_done_state(state: RecipientState) -> bool {
        state == RecipientState::Done
    }

    fn pinned_timestamp(&self) -> Option<Timestamp> {
        self.fetch_timestamp
    }

    fn common(&self) -> &CommonMetadata {
        &self.metadata
    }

    fn broken_invariant(&self) -> Option<&'static str> {
        self.invariant_violation()
    }
}

// ============================================================================
// Property Checker
// ============================================================================

/// Collects property violations across one or more runs.
#[derive(Debug, Default)]
pub struct PropertyChecker {
    violations: Vec<PropertyViolation>,
    versions_checked: usize,
}

impl PropertyChecker {
    /// Creates a new property checker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Violations found so far.
    #[must_use]
    pub fn violations(&self) -> &[PropertyViolation] {
        &self.violations
    }

    /// Returns true if nothing was violated.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }

    /// Number of document versions inspected.
    #[must_use]
    pub const fn versions_checked(&self) -> usize {
        self.versions_checked
    }

    /// Checks a donor document's write history. Returns the last decoded
    /// document.
    pub fn check_donor_history(
        &mut self,
        shard: &ShardId,
        history: &[Bytes],
    ) -> Option<DonorDocument> {
        self.check_history(shard, history)
    }

    /// Checks a recipient document's write history. Returns the last
    /// decoded document.
    pub fn check_recipient_history(
        &mut self,
        shard: &ShardId,
        history: &[Bytes],
    ) -> Option<RecipientDocument> {
        self.check_history(shard, history)
    }

    /// Forward order, pinned timestamps, stable metadata and per-version
    /// invariants. Repeated identical versions are legal: a write whose
    /// acknowledgement was lost is retried with the same bytes.
    fn check_history<D: TrackedDocument>(&mut self, shard: &ShardId, history: &[Bytes]) -> Option<D> {
        let mut previous: Option<D> = None;
        let mut pinned: Option<Timestamp> = None;

        for (version, bytes) in history.iter().enumerate() {
            self.versions_checked += 1;
            let doc = match D::decode(bytes) {
                Ok(doc) => doc,
                Err(e) => {
                    self.violations.push(PropertyViolation::UndecodableHistory {
                        shard: shard.clone(),
                        kind: D::KIND,
                        version,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            if let Some(invariant) = doc.broken_invariant() {
                self.violations.push(PropertyViolation::InvariantBroken {
                    shard: shard.clone(),
                    kind: D::KIND,
                    state: doc.state_name(),
                    invariant,
                });
            }

            if let Some(prev) = &previous {
                if prev.common() != doc.common() {
                    self.violations.push(PropertyViolation::MetadataMismatch {
                        shard: shard.clone(),
                        kind: D::KIND,
                        version,
                    });
                }
                if prev.state() != doc.state() && !D::is_legal_step(prev.state(), doc.state()) {
                    self.violations.push(PropertyViolation::IllegalTransition {
                        shard: shard.clone(),
                        kind: D::KIND,
                        from: prev.state_name(),
                        to: doc.state_name(),
                    });
                }
            }

            match (pinned, doc.pinned_timestamp()) {
                (Some(from), to) if to != Some(from) => {
                    self.violations.push(PropertyViolation::FetchTimestampChanged {
                        shard: shard.clone(),
                        kind: D::KIND,
                        from,
                        to,
                    });
                }
                (None, Some(first)) => pinned = Some(first),
                _ => {}
            }

            previous = Some(doc);
        }
        previous
    }

    /// Records every durability-order violation the data plane detected.
    pub fn check_effects(&mut self, plane: &SimulatedDataPlane) {
        for detail in plane.violations() {
            self.violations
                .push(PropertyViolation::EffectBeforeDurable { detail });
        }
    }

    /// Checks that every recipient holds every donor's full snapshot and
    /// exactly its oplog up to the cutover point.
    pub fn check_mirror(
        &mut self,
        plane: &SimulatedDataPlane,
        recipients: &[ShardId],
        donors: &[ShardId],
    ) {
        let expected = plane.config().documents_per_donor;
        for recipient in recipients {
            for donor in donors {
                let cloned = plane.cloned(OPERATION_ID, recipient, donor);
                if cloned != expected {
                    self.violations.push(PropertyViolation::IncompleteClone {
                        recipient: recipient.clone(),
                        donor: donor.clone(),
                        cloned,
                        expected,
                    });
                }
                let applied = plane.applied(OPERATION_ID, recipient, donor);
                let position = plane.donor_position(OPERATION_ID, donor);
                if applied != position {
                    self.violations.push(PropertyViolation::NotMirrored {
                        recipient: recipient.clone(),
                        donor: donor.clone(),
                        applied,
                        position,
                    });
                }
            }
        }
    }

    /// Checks everything a finished cluster left behind.
    ///
    /// Histories and effects are always checked. If the coordinator
    /// completed the operation, every participant must also have ended in
    /// Done and every recipient must mirror every donor.
    pub fn check_cluster(&mut self, cluster: &SimulatedCluster) {
        let donors: Vec<ShardId> = cluster.config().donor_shards().into_iter().collect();
        let recipients: Vec<ShardId> = cluster.config().recipient_shards().into_iter().collect();
        let completed = cluster.coordinator().state() == CoordinatorState::Done;

        for shard in cluster.shards() {
            let Some(store) = cluster.store(&shard) else {
                continue;
            };
            let donor_history = store.history(ServiceKind::Donor, OPERATION_ID);
            let last_donor = self.check_donor_history(&shard, &donor_history);
            let recipient_history = store.history(ServiceKind::Recipient, OPERATION_ID);
            let last_recipient = self.check_recipient_history(&shard, &recipient_history);

            if completed && donors.contains(&shard) {
                self.expect_done(&shard, last_donor.as_ref());
            }
            if completed && recipients.contains(&shard) {
                self.expect_done(&shard, last_recipient.as_ref());
            }
        }

        self.check_effects(cluster.plane());
        if completed {
            self.check_mirror(cluster.plane(), &recipients, &donors);
        }
    }

    fn expect_done<D: TrackedDocument>(&mut self, shard: &ShardId, last: Option<&D>) {
        if last.is_some_and(|doc| D::is_done_state(doc.state())) {
            return;
        }
        self.violations.push(PropertyViolation::NotDone {
            shard: shard.clone(),
            kind: D::KIND,
            state: last.map(PersistedDocument::state_name),
        });
    }
}
