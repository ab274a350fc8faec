//! Service error types.

use reshard_core::{OperationId, TermId};
use reshard_routing::RoutingError;
use thiserror::Error;

use crate::codec::CodecError;
use crate::document::ServiceKind;
use crate::effects::EffectError;
use crate::store::StoreError;

/// Result type for instance operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// How an error is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried with backoff; no state transition.
    Transient,
    /// Attached routing version is stale; the caller refreshes and retries.
    StaleRouting,
    /// Fatal to the instance only: it moves to Error.
    ProtocolViolation,
    /// Leadership was lost; the instance stops without touching its document.
    Interrupted,
    /// Programming or configuration error.
    Fatal,
}

/// Errors raised while driving an instance.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Document store failure.
    #[error("store: {0}")]
    Store(#[from] StoreError),

    /// A stored document could not be encoded or decoded.
    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    /// A shard effect failed.
    #[error("effect: {0}")]
    Effect(#[from] EffectError),

    /// The attached routing version does not match the local one.
    #[error("stale routing: {0}")]
    StaleRouting(RoutingError),

    /// Invalid core value or exceeded limit.
    #[error("{0}")]
    Core(#[from] reshard_core::Error),

    /// A required field is missing or a document changed underneath us.
    #[error("protocol violation in {operation_id}: {reason}")]
    ProtocolViolation {
        /// The operation.
        operation_id: OperationId,
        /// What was violated.
        reason: String,
    },

    /// The coordinator aborted the operation while the instance waited.
    #[error("aborted by coordinator")]
    CoordinatorAborted,

    /// Leadership was lost at a wait point.
    #[error("interrupted")]
    Interrupted,
}

impl ServiceError {
    /// Classifies the error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Store(e) if e.is_transient() => ErrorClass::Transient,
            Self::Store(StoreError::NotFound { .. }) | Self::Core(_) => ErrorClass::Fatal,
            Self::Effect(e) if e.is_transient() => ErrorClass::Transient,
            Self::Store(_)
            | Self::Codec(_)
            | Self::Effect(_)
            | Self::ProtocolViolation { .. }
            | Self::CoordinatorAborted => ErrorClass::ProtocolViolation,
            Self::StaleRouting(_) => ErrorClass::StaleRouting,
            Self::Interrupted => ErrorClass::Interrupted,
        }
    }

    /// Returns true if retrying may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }
}

/// Errors from the primary-only service registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// `register` after startup.
    #[error("registry already started")]
    AlreadyStarted,

    /// Leadership event before startup.
    #[error("registry not started")]
    NotStarted,

    /// The same service registered twice.
    #[error("{kind} service already registered")]
    DuplicateService {
        /// The service kind.
        kind: ServiceKind,
    },

    /// No service registered for the kind.
    #[error("{kind} service not registered")]
    UnknownService {
        /// The service kind.
        kind: ServiceKind,
    },

    /// Leadership acquired at a term older than one already seen.
    #[error("stale term {proposed} (current {current})")]
    StaleTerm {
        /// Highest term acquired so far.
        current: TermId,
        /// Term that was proposed.
        proposed: TermId,
    },

    /// The registry was shut down.
    #[error("registry shut down")]
    ShutDown,

    /// The operation requires leadership.
    #[error("not leader")]
    NotLeader,

    /// Completion requested for a document that is not Done.
    #[error("{kind} document {operation_id} is {state}, not done")]
    NotDone {
        /// The service kind.
        kind: ServiceKind,
        /// The operation.
        operation_id: OperationId,
        /// Its current state.
        state: &'static str,
    },

    /// Too many live instances for one service.
    #[error("too many {kind} instances: {count} >= {max}")]
    TooManyInstances {
        /// The service kind.
        kind: ServiceKind,
        /// Live instances.
        count: usize,
        /// Maximum allowed.
        max: u32,
    },

    /// No instance for the key.
    #[error("no {kind} instance for {operation_id}")]
    InstanceNotFound {
        /// The service kind.
        kind: ServiceKind,
        /// The operation.
        operation_id: OperationId,
    },

    /// An instance-level failure.
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl RegistryError {
    /// Returns true if the caller should refresh routing and retry.
    #[must_use]
    pub const fn is_stale_routing(&self) -> bool {
        matches!(self, Self::Service(ServiceError::StaleRouting(_)))
    }
}

impl From<StoreError> for RegistryError {
    fn from(err: StoreError) -> Self {
        Self::Service(ServiceError::Store(err))
    }
}

#[cfg(test)]
mod tests {
    use reshard_core::{Epoch, Namespace, ShardId};
    use reshard_routing::ChunkVersion;

    use super::*;

    #[test]
    fn test_classification() {
        let op = OperationId::new(1);
        let transient = ServiceError::Store(StoreError::Io {
            operation: "load",
            message: "disk".to_string(),
        });
        assert_eq!(transient.class(), ErrorClass::Transient);
        assert!(transient.is_transient());

        let conflict = ServiceError::Store(StoreError::Conflict {
            kind: ServiceKind::Donor,
            operation_id: op,
        });
        assert_eq!(conflict.class(), ErrorClass::ProtocolViolation);

        let missing = ServiceError::Store(StoreError::NotFound {
            kind: ServiceKind::Donor,
            operation_id: op,
        });
        assert_eq!(missing.class(), ErrorClass::Fatal);

        let unreachable = ServiceError::Effect(EffectError::DonorUnreachable {
            donor: ShardId::new("shard0"),
        });
        assert_eq!(unreachable.class(), ErrorClass::Transient);

        let codec = ServiceError::Codec(CodecError::TrailingBytes { count: 1 });
        assert_eq!(codec.class(), ErrorClass::ProtocolViolation);

        assert_eq!(
            ServiceError::CoordinatorAborted.class(),
            ErrorClass::ProtocolViolation
        );
        assert_eq!(ServiceError::Interrupted.class(), ErrorClass::Interrupted);
    }

    #[test]
    fn test_stale_routing_is_distinct() {
        let ns: Namespace = "db.foo".parse().unwrap();
        let epoch = Epoch::new(1);
        let err = ServiceError::StaleRouting(RoutingError::StaleEpoch {
            namespace: ns,
            received: ChunkVersion::new(1, 0, Epoch::new(2)),
            wanted: ChunkVersion::new(1, 0, epoch),
        });
        assert_eq!(err.class(), ErrorClass::StaleRouting);
        assert!(RegistryError::from(err).is_stale_routing());
        assert!(!RegistryError::NotLeader.is_stale_routing());
    }
}
