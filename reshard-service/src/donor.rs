//! Donor state machine.
//!
//! A donor moves its shard's data out of the source collection:
//!
//! ```text
//! PreparingToDonate -> DonatingInitialData -> DonatingOplogEntries
//!     -> PreparingToBlockWrites -> BlockingWrites -> Done
//! ```
//!
//! with Error reachable from any non-terminal state. Only
//! `PreparingToBlockWrites -> BlockingWrites` is decided locally; every
//! other step follows the coordinator's global state.

use reshard_core::{Namespace, OperationId};
use tracing::{debug, info, warn};

use crate::backoff::retry_transient;
use crate::context::ServiceContext;
use crate::document::{DonorDocument, DonorState, PersistedDocument};
use crate::effects::ShardEffects;
use crate::error::{ServiceError, ServiceResult};
use crate::instance::InstanceOutcome;
use crate::interrupt::InterruptToken;
use crate::persist::DocumentCell;
use crate::projection::{unless_aborted, CoordinatorState, ProjectionWatcher};
use crate::store::StateDocumentStore;

/// Reason persisted when the coordinator aborts the operation.
pub(crate) const ABORTED_BY_COORDINATOR: &str = "aborted by coordinator";

/// Drives one donor document.
pub struct DonorStateMachine<S, E> {
    ctx: ServiceContext<S, E>,
    operation_id: OperationId,
    token: InterruptToken,
    watcher: ProjectionWatcher,
    cell: Option<DocumentCell<S, DonorDocument>>,
}

impl<S, E> DonorStateMachine<S, E>
where
    S: StateDocumentStore,
    E: ShardEffects,
{
    /// Creates a state machine for the donor document of `operation_id`.
    /// Nothing is read until the first call to `resume`, `advance` or `run`.
    pub fn new(ctx: ServiceContext<S, E>, operation_id: OperationId, token: InterruptToken) -> Self {
        let watcher = ctx.projections.watch();
        Self {
            ctx,
            operation_id,
            token,
            watcher,
            cell: None,
        }
    }

    /// The operation this donor belongs to.
    #[must_use]
    pub const fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    /// The last durable document, once loaded.
    #[must_use]
    pub fn document(&self) -> Option<&DonorDocument> {
        self.cell.as_ref().map(DocumentCell::doc)
    }

    /// Loads the document, waits for it to be majority committed, and
    /// re-establishes the effect of its state. Idempotent.
    ///
    /// # Errors
    /// Returns an error if the document cannot be loaded or decoded.
    pub async fn resume(&mut self) -> ServiceResult<()> {
        self.loaded().await.map(|_| ())
    }

    async fn loaded(&mut self) -> ServiceResult<&mut DocumentCell<S, DonorDocument>> {
        let cell = match self.cell.take() {
            Some(cell) => cell,
            None => {
                let cell: DocumentCell<S, DonorDocument> = DocumentCell::load(
                    self.ctx.store.clone(),
                    self.operation_id,
                    self.ctx.config.clone(),
                    self.token.clone(),
                )
                .await?;
                info!(
                    op = %self.operation_id,
                    shard = %self.ctx.shard,
                    state = %cell.doc().state,
                    "Resuming donor"
                );
                match cell.doc().state {
                    DonorState::BlockingWrites => self.block_writes(cell.doc()).await?,
                    DonorState::Error => {
                        self.unblock_writes(&cell.doc().metadata.source_namespace)
                            .await?;
                    }
                    _ => {}
                }
                cell
            }
        };
        Ok(self.cell.insert(cell))
    }

    async fn block_writes(&self, doc: &DonorDocument) -> ServiceResult<()> {
        let effects = &self.ctx.effects;
        let op = self.operation_id;
        let source = &doc.metadata.source_namespace;
        retry_transient("block_writes", &self.ctx.config.backoff, &self.token, || async move {
            effects
                .block_writes(op, source)
                .await
                .map_err(ServiceError::from)
        })
        .await
    }

    async fn unblock_writes(&self, source: &Namespace) -> ServiceResult<()> {
        let effects = &self.ctx.effects;
        let op = self.operation_id;
        retry_transient("unblock_writes", &self.ctx.config.backoff, &self.token, || async move {
            effects
                .unblock_writes(op, source)
                .await
                .map_err(ServiceError::from)
        })
        .await
    }

    /// Performs at most one transition. Returns true if a new state was
    /// persisted; calling again with unchanged inputs is a no-op.
    ///
    /// A coordinator abort seen before or during the transition's work moves
    /// the document to Error instead.
    ///
    /// # Errors
    /// Returns an error if the document cannot be read or written.
    pub async fn advance(&mut self) -> ServiceResult<bool> {
        match self.step().await {
            Err(ServiceError::CoordinatorAborted) => {
                self.fail(ABORTED_BY_COORDINATOR).await?;
                Ok(true)
            }
            result => result,
        }
    }

    async fn step(&mut self) -> ServiceResult<bool> {
        let op = self.operation_id;
        let feed = self.ctx.projections.clone();
        let global = self.watcher.latest(op).map(|p| p.global_state);
        let reached = |target| global.is_some_and(|g: CoordinatorState| g.has_reached(target));

        let doc = self.loaded().await?.doc().clone();
        if doc.state.is_terminal() {
            return Ok(false);
        }
        if global.is_some_and(CoordinatorState::is_aborted) {
            return Err(ServiceError::CoordinatorAborted);
        }

        let next = match doc.state {
            DonorState::PreparingToDonate => {
                if doc.recipient_shards.is_empty() {
                    self.fail("donor has no recipient shards").await?;
                    return Ok(true);
                }
                let effects = &self.ctx.effects;
                let chosen = unless_aborted(
                    &feed,
                    op,
                    retry_transient(
                        "majority_committed_timestamp",
                        &self.ctx.config.backoff,
                        &self.token,
                        || async move {
                            effects
                                .majority_committed_timestamp()
                                .await
                                .map_err(ServiceError::from)
                        },
                    ),
                )
                .await?;
                doc.with_min_fetch_timestamp(chosen)
            }
            DonorState::DonatingInitialData if reached(CoordinatorState::Applying) => {
                doc.advanced_to(DonorState::DonatingOplogEntries)
            }
            DonorState::DonatingOplogEntries if reached(CoordinatorState::BlockingWrites) => {
                doc.advanced_to(DonorState::PreparingToBlockWrites)
            }
            DonorState::PreparingToBlockWrites => doc.advanced_to(DonorState::BlockingWrites),
            DonorState::BlockingWrites if reached(CoordinatorState::DecisionPersisted) => {
                doc.advanced_to(DonorState::Done)
            }
            _ => return Ok(false),
        };

        let state = next.state;
        self.loaded().await?.commit(next.clone()).await?;
        info!(
            op = %op,
            shard = %self.ctx.shard,
            state = %state,
            min_fetch_ts = ?next.min_fetch_timestamp,
            "Donor transitioned"
        );

        // The transition is majority committed; only now may writes stop.
        if state == DonorState::BlockingWrites {
            unless_aborted(&feed, op, self.block_writes(&next)).await?;
        }
        Ok(true)
    }

    /// Moves the document to Error, then lets writes resume.
    async fn fail(&mut self, reason: &str) -> ServiceResult<String> {
        let cell = self.loaded().await?;
        let reason = cell.fail(reason).await?;
        if cell.doc().state != DonorState::Error {
            return Ok(reason);
        }
        let source = cell.doc().metadata.source_namespace.clone();
        self.unblock_writes(&source).await?;
        Ok(reason)
    }

    /// Drives the document to a terminal state, or until interrupted.
    pub async fn run(mut self) -> InstanceOutcome {
        match self.drive().await {
            Ok(()) => self.outcome(),
            Err(ServiceError::Interrupted) => {
                debug!(op = %self.operation_id, shard = %self.ctx.shard, "Donor interrupted");
                InstanceOutcome::Interrupted
            }
            Err(err) => self.abort(err).await,
        }
    }

    async fn drive(&mut self) -> ServiceResult<()> {
        loop {
            if self.advance().await? {
                continue;
            }
            if self.document().is_some_and(|doc| doc.state.is_terminal()) {
                return Ok(());
            }
            let poll = self.ctx.config.projection_poll_interval;
            // A timeout only means nothing was published; re-read anyway.
            let _ = self
                .token
                .guard(tokio::time::timeout(poll, self.watcher.changed()))
                .await
                .map_err(|_| ServiceError::Interrupted)?;
        }
    }

    fn outcome(&self) -> InstanceOutcome {
        match self.document() {
            Some(doc) if doc.state == DonorState::Done => InstanceOutcome::Completed,
            Some(doc) => InstanceOutcome::Errored(doc.abort_reason.clone().unwrap_or_default()),
            None => InstanceOutcome::Errored("donor document never loaded".to_string()),
        }
    }

    async fn abort(&mut self, err: ServiceError) -> InstanceOutcome {
        warn!(
            op = %self.operation_id,
            shard = %self.ctx.shard,
            class = ?err.class(),
            error = %err,
            "Donor failed"
        );
        if self.cell.is_none() {
            return InstanceOutcome::Errored(err.to_string());
        }
        match self.fail(&err.to_string()).await {
            Ok(reason) => InstanceOutcome::Errored(reason),
            Err(ServiceError::Interrupted) => InstanceOutcome::Interrupted,
            Err(second) => InstanceOutcome::Errored(second.to_string()),
        }
    }
}
