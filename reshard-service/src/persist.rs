//! Durable document access for one instance.
//!
//! Every write is a compare-and-swap against the bytes this instance last
//! saw, with majority write concern. A write whose acknowledgement was lost
//! is recognised on retry by finding our own bytes already stored.

use std::sync::Arc;

use bytes::Bytes;
use reshard_core::OperationId;
use tracing::{debug, error};

use crate::backoff::retry_transient;
use crate::codec::{salvage_metadata, CodecError};
use crate::config::ServiceConfig;
use crate::document::{CommonMetadata, PersistedDocument};
use crate::error::{ServiceError, ServiceResult};
use crate::interrupt::InterruptToken;
use crate::store::{StateDocumentStore, StoreError, WriteConcern};

/// The last durable version of one instance's document.
pub(crate) struct DocumentCell<S, D> {
    store: Arc<S>,
    operation_id: OperationId,
    config: ServiceConfig,
    token: InterruptToken,
    doc: D,
    stored: Bytes,
}

impl<S, D> DocumentCell<S, D>
where
    S: StateDocumentStore,
    D: PersistedDocument,
{
    /// Loads the document and waits until it is majority committed.
    ///
    /// Only majority-committed state may gate an effect, and the loaded
    /// version may have been written by a primary that never got its
    /// acknowledgement.
    ///
    /// A stored document that does not decode is replaced with an Error
    /// document, keeping its metadata if that much still decodes.
    pub(crate) async fn load(
        store: Arc<S>,
        operation_id: OperationId,
        config: ServiceConfig,
        token: InterruptToken,
    ) -> ServiceResult<Self> {
        let stored = load_raw::<S, D>(&store, operation_id, &config, &token)
            .await?
            .ok_or(StoreError::NotFound {
                kind: D::KIND,
                operation_id,
            })?;

        let (doc, unreadable) = match D::decode(&stored) {
            Ok(doc) => (doc, None),
            Err(err) => {
                let metadata = match salvage_metadata(&stored) {
                    Ok(metadata) if metadata.operation_id == operation_id => metadata,
                    _ => CommonMetadata::unreadable(operation_id)?,
                };
                let reason = config
                    .limits
                    .truncate_reason(&format!("unreadable {} document: {err}", D::KIND));
                (D::unreadable(metadata, reason), Some(err))
            }
        };

        let mut cell = Self {
            store,
            operation_id,
            config,
            token,
            doc,
            stored,
        };
        match unreadable {
            None => cell.await_majority().await?,
            Some(err) => cell.replace_unreadable(&err).await?,
        }
        Ok(cell)
    }

    async fn replace_unreadable(&mut self, err: &CodecError) -> ServiceResult<()> {
        let bytes = self.doc.encode()?;
        let expected = self.stored.clone();
        self.swap(&expected, &bytes).await?;

        error!(
            op = %self.operation_id,
            kind = %D::KIND,
            error = %err,
            "Replaced unreadable document with an error document"
        );
        self.stored = bytes;
        Ok(())
    }

    /// The last durable document.
    pub(crate) const fn doc(&self) -> &D {
        &self.doc
    }

    /// Persists `next` with majority write concern.
    pub(crate) async fn commit(&mut self, next: D) -> ServiceResult<()> {
        let bytes = next.encode()?;
        let expected = self.stored.clone();
        self.swap(&expected, &bytes).await?;

        debug!(
            op = %self.operation_id,
            kind = %D::KIND,
            from = self.doc.state_name(),
            to = next.state_name(),
            "Persisted transition"
        );
        self.doc = next;
        self.stored = bytes;
        Ok(())
    }

    /// Moves the document to Error with `reason`, overwriting whatever is
    /// stored (possibly corrupt bytes) with a document rebuilt from the last
    /// good copy. Returns the persisted reason.
    pub(crate) async fn fail(&mut self, reason: &str) -> ServiceResult<String> {
        if self.doc.is_terminal() {
            return Ok(self
                .doc
                .abort_reason()
                .map_or_else(|| reason.to_string(), str::to_string));
        }

        let reason = self.config.limits.truncate_reason(reason);
        let errored = self.doc.errored(reason.clone());
        let bytes = errored.encode()?;
        let op = self.operation_id;

        let expected = load_raw::<S, D>(&self.store, op, &self.config, &self.token)
            .await?
            .ok_or(StoreError::NotFound {
                kind: D::KIND,
                operation_id: op,
            })?;
        self.swap(&expected, &bytes).await?;

        error!(
            op = %op,
            kind = %D::KIND,
            from = self.doc.state_name(),
            reason = %reason,
            "Instance moved to error"
        );
        self.doc = errored;
        self.stored = bytes;
        Ok(reason)
    }

    /// Replaces `expected` with `bytes` and waits for majority.
    async fn swap(&self, expected: &Bytes, bytes: &Bytes) -> ServiceResult<()> {
        let op = self.operation_id;
        let store = &self.store;
        let result = retry_transient("persist", &self.config.backoff, &self.token, || async move {
            store
                .compare_and_swap(D::KIND, op, expected, bytes.clone(), WriteConcern::Majority)
                .await
                .map_err(ServiceError::from)
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            // An earlier attempt applied locally but lost its acknowledgement.
            Err(ServiceError::Store(StoreError::Conflict { .. })) => {
                let current =
                    load_raw::<S, D>(&self.store, op, &self.config, &self.token).await?;
                if current.as_ref() != Some(bytes) {
                    return Err(ServiceError::ProtocolViolation {
                        operation_id: op,
                        reason: format!("{} document changed underneath its instance", D::KIND),
                    });
                }
                self.await_majority().await
            }
            Err(e) => Err(e),
        }
    }

    async fn await_majority(&self) -> ServiceResult<()> {
        let store = &self.store;
        let op = self.operation_id;
        let timeout = self.config.durability_timeout;
        retry_transient("wait-for-majority", &self.config.backoff, &self.token, || async move {
            match tokio::time::timeout(timeout, store.wait_for_majority(D::KIND, op)).await {
                Ok(result) => result.map_err(ServiceError::from),
                Err(_) => Err(ServiceError::Store(StoreError::WriteConcernTimeout {
                    operation: "wait_for_majority",
                })),
            }
        })
        .await
    }
}

async fn load_raw<S, D>(
    store: &Arc<S>,
    operation_id: OperationId,
    config: &ServiceConfig,
    token: &InterruptToken,
) -> ServiceResult<Option<Bytes>>
where
    S: StateDocumentStore,
    D: PersistedDocument,
{
    retry_transient("load", &config.backoff, token, || async move {
        store
            .load(D::KIND, operation_id)
            .await
            .map_err(ServiceError::from)
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use reshard_core::{CollectionId, ShardId, ShardKeyPattern, Timestamp};

    use super::*;
    use crate::document::{CommonMetadata, DonorDocument, DonorState, ServiceKind};
    use crate::interrupt::InterruptSource;
    use crate::store::{SimulatedStateStore, StoreFaultConfig};

    const OP: OperationId = OperationId::new(3);

    fn doc() -> DonorDocument {
        DonorDocument::new(
            CommonMetadata::new(
                OP,
                "db.foo".parse().unwrap(),
                CollectionId::new(1),
                ShardKeyPattern::new(["k"]).unwrap(),
            ),
            BTreeSet::from([ShardId::new("shard1")]),
        )
    }

    async fn seeded_store(faults: StoreFaultConfig) -> SimulatedStateStore {
        let store = SimulatedStateStore::with_faults(5, faults);
        store
            .insert(ServiceKind::Donor, OP, doc().encode().unwrap(), WriteConcern::Majority)
            .await
            .unwrap();
        store
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_advances_stored_document() {
        let store = seeded_store(StoreFaultConfig::none()).await;
        let source = InterruptSource::new();
        let mut cell: DocumentCell<_, DonorDocument> = DocumentCell::load(
            Arc::new(store.clone()),
            OP,
            ServiceConfig::fast_for_testing(),
            source.token(),
        )
        .await
        .unwrap();

        let next = cell.doc().with_min_fetch_timestamp(Timestamp::new(4, 1));
        cell.commit(next.clone()).await.unwrap();

        assert_eq!(cell.doc(), &next);
        assert_eq!(store.raw(ServiceKind::Donor, OP), Some(next.encode().unwrap()));
        assert_eq!(store.majority_committed(ServiceKind::Donor, OP), store.raw(ServiceKind::Donor, OP));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_survives_lost_acknowledgement() {
        let store = seeded_store(StoreFaultConfig::none()).await;
        let source = InterruptSource::new();
        let mut cell: DocumentCell<_, DonorDocument> = DocumentCell::load(
            Arc::new(store.clone()),
            OP,
            ServiceConfig::fast_for_testing(),
            source.token(),
        )
        .await
        .unwrap();

        store.fault_config().force_write_concern_timeout = true;
        let next = cell.doc().with_min_fetch_timestamp(Timestamp::new(4, 1));
        cell.commit(next.clone()).await.unwrap();

        assert_eq!(cell.doc().state, DonorState::DonatingInitialData);
        assert_eq!(store.majority_committed(ServiceKind::Donor, OP), Some(next.encode().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_detects_foreign_write_and_fail_repairs() {
        let store = seeded_store(StoreFaultConfig::none()).await;
        let source = InterruptSource::new();
        let mut cell: DocumentCell<_, DonorDocument> = DocumentCell::load(
            Arc::new(store.clone()),
            OP,
            ServiceConfig::fast_for_testing(),
            source.token(),
        )
        .await
        .unwrap();

        store.corrupt(ServiceKind::Donor, OP, Bytes::from_static(b"garbage"));
        let next = cell.doc().with_min_fetch_timestamp(Timestamp::new(4, 1));
        let err = cell.commit(next).await.unwrap_err();
        assert!(matches!(err, ServiceError::ProtocolViolation { .. }));

        let reason = cell.fail(&err.to_string()).await.unwrap();
        let stored = DonorDocument::decode(&store.raw(ServiceKind::Donor, OP).unwrap()).unwrap();
        assert_eq!(stored.state, DonorState::Error);
        assert_eq!(stored.abort_reason.as_deref(), Some(reason.as_str()));
        assert_eq!(stored.metadata, doc().metadata);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_truncates_reason() {
        let store = seeded_store(StoreFaultConfig::none()).await;
        let source = InterruptSource::new();
        let config = ServiceConfig::fast_for_testing();
        let max = config.limits.max_abort_reason_bytes as usize;
        let mut cell: DocumentCell<_, DonorDocument> =
            DocumentCell::load(Arc::new(store), OP, config, source.token())
                .await
                .unwrap();

        let reason = cell.fail(&"x".repeat(max * 2)).await.unwrap();
        assert_eq!(reason.len(), max);

        // Terminal documents keep their first reason.
        let again = cell.fail("other").await.unwrap();
        assert_eq!(again, reason);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_missing_document() {
        let store = SimulatedStateStore::new(1);
        let source = InterruptSource::new();
        let result: ServiceResult<DocumentCell<_, DonorDocument>> = DocumentCell::load(
            Arc::new(store),
            OP,
            ServiceConfig::fast_for_testing(),
            source.token(),
        )
        .await;
        assert!(matches!(
            result,
            Err(ServiceError::Store(StoreError::NotFound { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_replaces_garbage_with_error_document() {
        let store = SimulatedStateStore::new(1);
        store.corrupt(ServiceKind::Donor, OP, Bytes::from_static(b"garbage"));
        let source = InterruptSource::new();
        let cell: DocumentCell<_, DonorDocument> = DocumentCell::load(
            Arc::new(store.clone()),
            OP,
            ServiceConfig::fast_for_testing(),
            source.token(),
        )
        .await
        .unwrap();

        let stored = DonorDocument::decode(&store.raw(ServiceKind::Donor, OP).unwrap()).unwrap();
        assert_eq!(&stored, cell.doc());
        assert_eq!(stored.state, DonorState::Error);
        assert_eq!(stored.metadata.operation_id, OP);
        assert!(stored.abort_reason.unwrap().starts_with("unreadable donor document"));
        assert_eq!(
            store.majority_committed(ServiceKind::Donor, OP),
            store.raw(ServiceKind::Donor, OP)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_keeps_metadata_of_invalid_document() {
        let store = seeded_store(StoreFaultConfig::none()).await;
        // Past PreparingToDonate without a minFetchTimestamp.
        let bytes = doc().encode().unwrap();
        let state_offset = bytes.len() - (1 + 1 + 4 + 4 + "shard1".len() + 1);
        let mut patched = bytes.to_vec();
        patched[state_offset] = DonorState::DonatingOplogEntries.ordinal();
        store.corrupt(ServiceKind::Donor, OP, Bytes::from(patched));

        let source = InterruptSource::new();
        let cell: DocumentCell<_, DonorDocument> = DocumentCell::load(
            Arc::new(store.clone()),
            OP,
            ServiceConfig::fast_for_testing(),
            source.token(),
        )
        .await
        .unwrap();

        let stored = DonorDocument::decode(&store.raw(ServiceKind::Donor, OP).unwrap()).unwrap();
        assert_eq!(cell.doc(), &stored);
        assert_eq!(stored.state, DonorState::Error);
        assert_eq!(stored.metadata, doc().metadata);
        assert!(stored.abort_reason.unwrap().contains("minFetchTimestamp"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_retries_flaky_reads() {
        let store = seeded_store(StoreFaultConfig::none()).await;
        store.fault_config().force_read_fail = true;
        let source = InterruptSource::new();
        let cell: DocumentCell<_, DonorDocument> = DocumentCell::load(
            Arc::new(store),
            OP,
            ServiceConfig::fast_for_testing(),
            source.token(),
        )
        .await
        .unwrap();
        assert_eq!(cell.doc(), &doc());
    }
}
