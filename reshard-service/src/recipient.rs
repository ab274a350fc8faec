//! Recipient state machine.
//!
//! A recipient builds the temporary collection from every donor:
//!
//! ```text
//! AwaitingFetchTimestamp -> CreatingCollection -> Cloning -> Applying
//!     -> SteadyState -> StrictConsistency -> Done
//! ```
//!
//! Each state's work runs after the state is majority committed and is safe
//! to repeat, so a resumed recipient simply redoes the work of the state it
//! finds persisted.

use reshard_core::{OperationId, Timestamp};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::retry_transient;
use crate::context::ServiceContext;
use crate::document::{PersistedDocument, RecipientDocument, RecipientState};
use crate::donor::ABORTED_BY_COORDINATOR;
use crate::effects::ShardEffects;
use crate::error::{ServiceError, ServiceResult};
use crate::instance::InstanceOutcome;
use crate::interrupt::InterruptToken;
use crate::persist::DocumentCell;
use crate::projection::{unless_aborted, CoordinatorState, ProjectionWatcher};
use crate::store::StateDocumentStore;

const MISSING_FETCH_TIMESTAMP: &str = "missing fetchTimestamp before CreatingCollection";

/// Drives one recipient document.
pub struct RecipientStateMachine<S, E> {
    ctx: ServiceContext<S, E>,
    operation_id: OperationId,
    token: InterruptToken,
    watcher: ProjectionWatcher,
    cell: Option<DocumentCell<S, RecipientDocument>>,
    /// When cloning began in this term.
    clone_started: Option<Instant>,
}

impl<S, E> RecipientStateMachine<S, E>
where
    S: StateDocumentStore,
    E: ShardEffects,
{
    /// Creates a state machine for the recipient document of `operation_id`.
    pub fn new(ctx: ServiceContext<S, E>, operation_id: OperationId, token: InterruptToken) -> Self {
        let watcher = ctx.projections.watch();
        Self {
            ctx,
            operation_id,
            token,
            watcher,
            cell: None,
            clone_started: None,
        }
    }

    /// The operation this recipient belongs to.
    #[must_use]
    pub const fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    /// The last durable document, once loaded.
    #[must_use]
    pub fn document(&self) -> Option<&RecipientDocument> {
        self.cell.as_ref().map(DocumentCell::doc)
    }

    /// Loads the document and waits for it to be majority committed.
    ///
    /// # Errors
    /// Returns an error if the document cannot be loaded or decoded.
    pub async fn resume(&mut self) -> ServiceResult<()> {
        self.loaded().await.map(|_| ())
    }

    async fn loaded(&mut self) -> ServiceResult<&mut DocumentCell<S, RecipientDocument>> {
        let cell = match self.cell.take() {
            Some(cell) => cell,
            None => {
                let cell: DocumentCell<S, RecipientDocument> = DocumentCell::load(
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
                    "Resuming recipient"
                );
                cell
            }
        };
        Ok(self.cell.insert(cell))
    }

    /// Moves `AwaitingFetchTimestamp` to `CreatingCollection` with the given
    /// fetch timestamp. A missing or null timestamp is a protocol violation
    /// and moves the document to Error instead.
    ///
    /// Returns true if a new state was persisted; false if the document is
    /// already past `AwaitingFetchTimestamp`.
    ///
    /// # Errors
    /// Returns an error if the document cannot be read or written.
    pub async fn transition_to_creating_collection(
        &mut self,
        fetch_timestamp: Option<Timestamp>,
    ) -> ServiceResult<bool> {
        let doc = self.loaded().await?.doc().clone();
        if doc.state != RecipientState::AwaitingFetchTimestamp {
            return Ok(false);
        }

        let Some(fetch_timestamp) = fetch_timestamp.filter(|ts| !ts.is_null()) else {
            self.fail(MISSING_FETCH_TIMESTAMP).await?;
            return Ok(true);
        };
        let next = doc.with_fetch_timestamp(fetch_timestamp);
        self.commit(next).await?;
        Ok(true)
    }

    /// Performs the work of the current state and at most one transition.
    /// Returns true if a new state was persisted.
    ///
    /// The work is abandoned as soon as the coordinator aborts, and the
    /// document moves to Error instead.
    ///
    /// # Errors
    /// Returns an error if the document cannot be read or written, or a
    /// non-transient effect fails.
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
        let projection = self.watcher.latest(op);
        let global = projection.as_ref().map(|p| p.global_state);
        let reached = |target| global.is_some_and(|g: CoordinatorState| g.has_reached(target));

        let doc = self.loaded().await?.doc().clone();
        if doc.state.is_terminal() {
            return Ok(false);
        }
        if global.is_some_and(CoordinatorState::is_aborted) {
            return Err(ServiceError::CoordinatorAborted);
        }

        let next = match doc.state {
            RecipientState::AwaitingFetchTimestamp => {
                if doc.donor_shards.is_empty() {
                    self.fail("recipient has no donor shards").await?;
                    return Ok(true);
                }
                if !reached(CoordinatorState::Cloning) {
                    return Ok(false);
                }
                let fetch = projection
                    .and_then(|p| p.recipient)
                    .and_then(|role| role.fetch_timestamp);
                return self.transition_to_creating_collection(fetch).await;
            }
            RecipientState::CreatingCollection => {
                unless_aborted(&feed, op, self.create_collection(&doc)).await?;
                doc.advanced_to(RecipientState::Cloning)
            }
            RecipientState::Cloning => {
                unless_aborted(&feed, op, self.clone_all(&doc)).await?;
                doc.advanced_to(RecipientState::Applying)
            }
            RecipientState::Applying => {
                unless_aborted(&feed, op, self.catch_up(&doc)).await?;
                doc.advanced_to(RecipientState::SteadyState)
            }
            RecipientState::SteadyState => {
                if !reached(CoordinatorState::BlockingWrites) {
                    unless_aborted(&feed, op, self.apply_round(&doc)).await?;
                    return Ok(false);
                }
                unless_aborted(&feed, op, self.apply_to_cutover(&doc)).await?;
                doc.advanced_to(RecipientState::StrictConsistency)
            }
            RecipientState::StrictConsistency if reached(CoordinatorState::DecisionPersisted) => {
                doc.advanced_to(RecipientState::Done)
            }
            _ => return Ok(false),
        };

        self.commit(next).await?;
        Ok(true)
    }

    async fn commit(&mut self, next: RecipientDocument) -> ServiceResult<()> {
        let state = next.state;
        let fetch_ts = next.fetch_timestamp;
        self.loaded().await?.commit(next).await?;
        info!(
            op = %self.operation_id,
            shard = %self.ctx.shard,
            state = %state,
            fetch_ts = ?fetch_ts,
            "Recipient transitioned"
        );
        Ok(())
    }

    async fn fail(&mut self, reason: &str) -> ServiceResult<String> {
        self.loaded().await?.fail(reason).await
    }

    fn fetch_timestamp(&self, doc: &RecipientDocument) -> ServiceResult<Timestamp> {
        doc.fetch_timestamp
            .ok_or_else(|| ServiceError::ProtocolViolation {
                operation_id: self.operation_id,
                reason: format!("missing fetchTimestamp in {}", doc.state),
            })
    }

    async fn create_collection(&self, doc: &RecipientDocument) -> ServiceResult<()> {
        self.fetch_timestamp(doc)?;
        let effects = &self.ctx.effects;
        let op = self.operation_id;
        let namespace = &doc.metadata.temporary_namespace;
        let shard_key = &doc.metadata.new_shard_key;
        retry_transient(
            "create_temporary_collection",
            &self.ctx.config.backoff,
            &self.token,
            || async move {
                effects
                    .create_temporary_collection(op, namespace, shard_key)
                    .await
                    .map_err(ServiceError::from)
            },
        )
        .await
    }

    async fn clone_all(&mut self, doc: &RecipientDocument) -> ServiceResult<()> {
        let fetch = self.fetch_timestamp(doc)?;
        let started = *self.clone_started.get_or_insert_with(Instant::now);
        let effects = &self.ctx.effects;
        let op = self.operation_id;

        for donor in &doc.donor_shards {
            let mut documents = 0;
            loop {
                let progress = retry_transient(
                    "clone_batch",
                    &self.ctx.config.backoff,
                    &self.token,
                    || async move {
                        effects
                            .clone_batch(op, donor, fetch)
                            .await
                            .map_err(ServiceError::from)
                    },
                )
                .await?;
                documents += progress.documents;
                if progress.exhausted {
                    break;
                }
            }
            debug!(op = %op, shard = %self.ctx.shard, donor = %donor, documents, "Cloned donor");
        }

        let remaining = doc
            .minimum_operation_duration
            .saturating_sub(started.elapsed());
        if !remaining.is_zero() {
            debug!(
                op = %op,
                remaining_ms = u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX),
                "Holding in cloning for minimum operation duration"
            );
            self.token
                .sleep(remaining)
                .await
                .map_err(|_| ServiceError::Interrupted)?;
        }
        Ok(())
    }

    /// Applies one batch from every donor. Returns the largest remaining lag.
    async fn apply_round(&self, doc: &RecipientDocument) -> ServiceResult<u64> {
        let effects = &self.ctx.effects;
        let op = self.operation_id;
        let mut max_lag = 0;
        for donor in &doc.donor_shards {
            let progress = retry_transient(
                "apply_batch",
                &self.ctx.config.backoff,
                &self.token,
                || async move { effects.apply_batch(op, donor).await.map_err(ServiceError::from) },
            )
            .await?;
            max_lag = max_lag.max(progress.lag);
        }
        Ok(max_lag)
    }

    async fn catch_up(&self, doc: &RecipientDocument) -> ServiceResult<()> {
        let threshold = self.ctx.config.apply_lag_threshold;
        loop {
            let lag = self.apply_round(doc).await?;
            debug!(op = %self.operation_id, shard = %self.ctx.shard, lag, "Applied round");
            if lag <= threshold {
                return Ok(());
            }
        }
    }

    async fn apply_to_cutover(&self, doc: &RecipientDocument) -> ServiceResult<()> {
        let effects = &self.ctx.effects;
        let op = self.operation_id;
        for donor in &doc.donor_shards {
            retry_transient(
                "apply_to_cutover",
                &self.ctx.config.backoff,
                &self.token,
                || async move {
                    effects
                        .apply_to_cutover(op, donor)
                        .await
                        .map_err(ServiceError::from)
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Drives the document to a terminal state, or until interrupted.
    pub async fn run(mut self) -> InstanceOutcome {
        match self.drive().await {
            Ok(()) => self.outcome(),
            Err(ServiceError::Interrupted) => {
                debug!(op = %self.operation_id, shard = %self.ctx.shard, "Recipient interrupted");
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
            let wait = match self.document().map(|doc| doc.state) {
                Some(state) if state.is_terminal() => return Ok(()),
                Some(RecipientState::SteadyState) => self.ctx.config.steady_state_batch_interval,
                _ => self.ctx.config.projection_poll_interval,
            };
            let _ = self
                .token
                .guard(tokio::time::timeout(wait, self.watcher.changed()))
                .await
                .map_err(|_| ServiceError::Interrupted)?;
        }
    }

    fn outcome(&self) -> InstanceOutcome {
        match self.document() {
            Some(doc) if doc.state == RecipientState::Done => InstanceOutcome::Completed,
            Some(doc) => InstanceOutcome::Errored(doc.abort_reason.clone().unwrap_or_default()),
            None => InstanceOutcome::Errored("recipient document never loaded".to_string()),
        }
    }

    async fn abort(&mut self, err: ServiceError) -> InstanceOutcome {
        warn!(
            op = %self.operation_id,
            shard = %self.ctx.shard,
            class = ?err.class(),
            error = %err,
            "Recipient failed"
        );
        let Some(cell) = self.cell.as_mut() else {
            return InstanceOutcome::Errored(err.to_string());
        };
        match cell.fail(&err.to_string()).await {
            Ok(reason) => InstanceOutcome::Errored(reason),
            Err(ServiceError::Interrupted) => InstanceOutcome::Interrupted,
            Err(second) => InstanceOutcome::Errored(second.to_string()),
        }
    }
}
