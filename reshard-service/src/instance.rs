//! Instances: one running state machine per (service kind, operation).

use reshard_core::OperationId;

use crate::context::ServiceContext;
use crate::document::ServiceKind;
use crate::donor::DonorStateMachine;
use crate::effects::ShardEffects;
use crate::interrupt::InterruptToken;
use crate::recipient::RecipientStateMachine;
use crate::store::StateDocumentStore;

/// How an instance stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceOutcome {
    /// The document reached Done.
    Completed,
    /// The document reached Error with this reason.
    Errored(String),
    /// Leadership was lost; the document is untouched and resumable.
    Interrupted,
}

/// A donor or recipient state machine.
pub enum Instance<S, E> {
    /// Donor role.
    Donor(DonorStateMachine<S, E>),
    /// Recipient role.
    Recipient(RecipientStateMachine<S, E>),
}

impl<S, E> Instance<S, E>
where
    S: StateDocumentStore,
    E: ShardEffects,
{
    /// Builds the instance for `kind`'s document of `operation_id`.
    pub fn new(
        kind: ServiceKind,
        ctx: ServiceContext<S, E>,
        operation_id: OperationId,
        token: InterruptToken,
    ) -> Self {
        match kind {
            ServiceKind::Donor => Self::Donor(DonorStateMachine::new(ctx, operation_id, token)),
            ServiceKind::Recipient => {
                Self::Recipient(RecipientStateMachine::new(ctx, operation_id, token))
            }
        }
    }

    /// The service kind.
    #[must_use]
    pub const fn kind(&self) -> ServiceKind {
        match self {
            Self::Donor(_) => ServiceKind::Donor,
            Self::Recipient(_) => ServiceKind::Recipient,
        }
    }

    /// The operation.
    #[must_use]
    pub const fn operation_id(&self) -> OperationId {
        match self {
            Self::Donor(donor) => donor.operation_id(),
            Self::Recipient(recipient) => recipient.operation_id(),
        }
    }

    /// Drives the instance until it is terminal or interrupted.
    pub async fn run(self) -> InstanceOutcome {
        match self {
            Self::Donor(donor) => donor.run().await,
            Self::Recipient(recipient) => recipient.run().await,
        }
    }
}
