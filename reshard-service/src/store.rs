//! State document storage.
//!
//! Provides the `StateDocumentStore` trait for persisting instance documents,
//! and `SimulatedStateStore` for deterministic simulation testing.
//!
//! Documents are opaque bytes here; the store never decodes them. Writes are
//! compare-and-swap on the exact encoded bytes, which serializes concurrent
//! writers of the same document.

#![allow(clippy::significant_drop_tightening)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reshard_core::OperationId;
use thiserror::Error;

use crate::document::ServiceKind;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from the document store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No document for the key.
    #[error("{kind} document {operation_id} not found")]
    NotFound {
        /// Document kind.
        kind: ServiceKind,
        /// Document key.
        operation_id: OperationId,
    },

    /// Insert of an existing key.
    #[error("{kind} document {operation_id} already exists")]
    AlreadyExists {
        /// Document kind.
        kind: ServiceKind,
        /// Document key.
        operation_id: OperationId,
    },

    /// Compare-and-swap found different bytes.
    #[error("{kind} document {operation_id} changed concurrently")]
    Conflict {
        /// Document kind.
        kind: ServiceKind,
        /// Document key.
        operation_id: OperationId,
    },

    /// The write was applied locally but majority acknowledgement timed out.
    #[error("write concern timeout: {operation}")]
    WriteConcernTimeout {
        /// The operation that timed out.
        operation: &'static str,
    },

    /// I/O error during storage operation.
    #[error("I/O error: {operation}: {message}")]
    Io {
        /// The operation that failed.
        operation: &'static str,
        /// Error message.
        message: String,
    },
}

impl StoreError {
    /// Returns true if retrying the operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::WriteConcernTimeout { .. })
    }
}

/// Durability requested for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteConcern {
    /// Acknowledge once applied locally.
    Local,
    /// Acknowledge once replicated to a majority.
    Majority,
}

// -----------------------------------------------------------------------------
// State Document Store Trait
// -----------------------------------------------------------------------------

/// Durable storage for instance documents: one collection per service kind,
/// keyed by operation id.
#[async_trait]
pub trait StateDocumentStore: Send + Sync + 'static {
    /// Loads a document. Returns `None` if absent.
    async fn load(&self, kind: ServiceKind, operation_id: OperationId)
        -> StoreResult<Option<Bytes>>;

    /// Lists every document of a kind, ordered by operation id.
    async fn list(&self, kind: ServiceKind) -> StoreResult<Vec<(OperationId, Bytes)>>;

    /// Inserts a new document.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if a document with this key exists.
    async fn insert(
        &self,
        kind: ServiceKind,
        operation_id: OperationId,
        document: Bytes,
        write_concern: WriteConcern,
    ) -> StoreResult<()>;

    /// Replaces a document if its stored bytes equal `expected`.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the bytes differ and `NotFound` if absent.
    async fn compare_and_swap(
        &self,
        kind: ServiceKind,
        operation_id: OperationId,
        expected: &Bytes,
        document: Bytes,
        write_concern: WriteConcern,
    ) -> StoreResult<()>;

    /// Waits until the document's current version is majority committed.
    async fn wait_for_majority(
        &self,
        kind: ServiceKind,
        operation_id: OperationId,
    ) -> StoreResult<()>;

    /// Removes a document. Returns true if it existed.
    async fn remove(
        &self,
        kind: ServiceKind,
        operation_id: OperationId,
        write_concern: WriteConcern,
    ) -> StoreResult<bool>;
}

// -----------------------------------------------------------------------------
// Fault Configuration
// -----------------------------------------------------------------------------

/// Fault configuration for the simulated store.
#[derive(Debug, Clone, Default)]
pub struct StoreFaultConfig {
    /// Probability of reads failing (0.0 - 1.0).
    pub read_fail_rate: f64,
    /// Probability of writes failing before being applied (0.0 - 1.0).
    pub write_fail_rate: f64,
    /// Probability of majority writes being applied but timing out (0.0 - 1.0).
    pub write_concern_timeout_rate: f64,
    /// Force next read to fail (one-shot).
    pub force_read_fail: bool,
    /// Force next write to fail (one-shot).
    pub force_write_fail: bool,
    /// Force next majority write to time out after applying (one-shot).
    pub force_write_concern_timeout: bool,
    /// Time for a write to become majority committed.
    pub durability_delay: Duration,
}

impl StoreFaultConfig {
    /// No faults (all operations succeed).
    #[must_use]
    pub const fn none() -> Self {
        Self {
            read_fail_rate: 0.0,
            write_fail_rate: 0.0,
            write_concern_timeout_rate: 0.0,
            force_read_fail: false,
            force_write_fail: false,
            force_write_concern_timeout: false,
            durability_delay: Duration::ZERO,
        }
    }

    /// Flaky configuration for stress testing.
    #[must_use]
    pub const fn flaky() -> Self {
        Self {
            read_fail_rate: 0.05,
            write_fail_rate: 0.05,
            write_concern_timeout_rate: 0.05,
            force_read_fail: false,
            force_write_fail: false,
            force_write_concern_timeout: false,
            durability_delay: Duration::from_millis(2),
        }
    }

    /// Builder: set read fail rate.
    #[must_use]
    pub const fn with_read_fail_rate(mut self, rate: f64) -> Self {
        self.read_fail_rate = rate;
        self
    }

    /// Builder: set write fail rate.
    #[must_use]
    pub const fn with_write_fail_rate(mut self, rate: f64) -> Self {
        self.write_fail_rate = rate;
        self
    }

    /// Builder: set write-concern timeout rate.
    #[must_use]
    pub const fn with_write_concern_timeout_rate(mut self, rate: f64) -> Self {
        self.write_concern_timeout_rate = rate;
        self
    }

    /// Builder: set durability delay.
    #[must_use]
    pub const fn with_durability_delay(mut self, delay: Duration) -> Self {
        self.durability_delay = delay;
        self
    }
}

// -----------------------------------------------------------------------------
// Simulated State Store
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredDocument {
    /// Latest locally applied bytes.
    current: Bytes,
    /// Latest majority-committed bytes.
    majority: Option<Bytes>,
}

#[derive(Debug, Default)]
struct StoreState {
    documents: HashMap<(ServiceKind, OperationId), StoredDocument>,
    /// Every version ever written, per key, in write order.
    history: HashMap<(ServiceKind, OperationId), Vec<Bytes>>,
}

impl StoreState {
    fn record(&mut self, key: (ServiceKind, OperationId), bytes: &Bytes) {
        self.history.entry(key).or_default().push(bytes.clone());
    }
}

/// In-memory simulated document store for DST.
///
/// Clones share state via `Arc`, so one clone can be handed to a registry
/// while the test keeps another for inspection. Majority writes become
/// committed after `durability_delay`; if the writer is cancelled during the
/// delay the write stays applied but uncommitted until someone waits for
/// majority.
#[derive(Debug, Clone)]
pub struct SimulatedStateStore {
    state: Arc<Mutex<StoreState>>,
    /// Fault configuration.
    fault_config: Arc<Mutex<StoreFaultConfig>>,
    /// RNG seed for deterministic faults.
    seed: u64,
    /// Operation counter for deterministic RNG.
    counter: Arc<AtomicU64>,
}

impl SimulatedStateStore {
    /// Creates a new simulated store with no faults.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_faults(seed, StoreFaultConfig::none())
    }

    /// Creates a simulated store with fault injection.
    #[must_use]
    pub fn with_faults(seed: u64, config: StoreFaultConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            fault_config: Arc::new(Mutex::new(config)),
            seed,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns fault config for modification.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    pub fn fault_config(&self) -> std::sync::MutexGuard<'_, StoreFaultConfig> {
        self.fault_config.lock().expect("fault config lock poisoned")
    }

    /// Deterministic RNG using the `(seed + counter) * M` formula for
    /// reproducible fault injection.
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

    fn check_read_fault(&self, operation: &'static str) -> StoreResult<()> {
        let rate = {
            let mut config = self.fault_config.lock().expect("lock poisoned");
            if config.force_read_fail {
                config.force_read_fail = false;
                return Err(StoreError::Io {
                    operation,
                    message: "simulated failure (forced)".into(),
                });
            }
            config.read_fail_rate
        };
        if self.should_inject_fault(rate) {
            return Err(StoreError::Io {
                operation,
                message: "simulated failure (random)".into(),
            });
        }
        Ok(())
    }

    fn check_write_fault(&self, operation: &'static str) -> StoreResult<()> {
        let rate = {
            let mut config = self.fault_config.lock().expect("lock poisoned");
            if config.force_write_fail {
                config.force_write_fail = false;
                return Err(StoreError::Io {
                    operation,
                    message: "simulated failure (forced)".into(),
                });
            }
            config.write_fail_rate
        };
        if self.should_inject_fault(rate) {
            return Err(StoreError::Io {
                operation,
                message: "simulated failure (random)".into(),
            });
        }
        Ok(())
    }

    /// Completes a write that was already applied locally.
    async fn acknowledge(
        &self,
        key: (ServiceKind, OperationId),
        write_concern: WriteConcern,
        operation: &'static str,
    ) -> StoreResult<()> {
        if write_concern == WriteConcern::Local {
            return Ok(());
        }

        let (delay, timeout_rate) = {
            let mut config = self.fault_config.lock().expect("lock poisoned");
            if config.force_write_concern_timeout {
                config.force_write_concern_timeout = false;
                return Err(StoreError::WriteConcernTimeout { operation });
            }
            (config.durability_delay, config.write_concern_timeout_rate)
        };
        if self.should_inject_fault(timeout_rate) {
            return Err(StoreError::WriteConcernTimeout { operation });
        }

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.commit_majority(key);
        Ok(())
    }

    fn commit_majority(&self, key: (ServiceKind, OperationId)) {
        let mut state = self.state.lock().expect("store lock poisoned");
        if let Some(doc) = state.documents.get_mut(&key) {
            doc.majority = Some(doc.current.clone());
        }
    }

    /// Returns the locally applied bytes (bypasses faults, for tests).
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn raw(&self, kind: ServiceKind, operation_id: OperationId) -> Option<Bytes> {
        let state = self.state.lock().expect("store lock poisoned");
        state
            .documents
            .get(&(kind, operation_id))
            .map(|doc| doc.current.clone())
    }

    /// Returns the majority-committed bytes (bypasses faults, for tests).
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn majority_committed(&self, kind: ServiceKind, operation_id: OperationId) -> Option<Bytes> {
        let state = self.state.lock().expect("store lock poisoned");
        state
            .documents
            .get(&(kind, operation_id))
            .and_then(|doc| doc.majority.clone())
    }

    /// Returns every document of a kind, ordered by key (bypasses faults).
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn all_documents(&self, kind: ServiceKind) -> BTreeMap<OperationId, Bytes> {
        let state = self.state.lock().expect("store lock poisoned");
        state
            .documents
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|((_, op), doc)| (*op, doc.current.clone()))
            .collect()
    }

    /// Returns every version written for a key, in order.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn history(&self, kind: ServiceKind, operation_id: OperationId) -> Vec<Bytes> {
        let state = self.state.lock().expect("store lock poisoned");
        state
            .history
            .get(&(kind, operation_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the total number of documents (bypasses faults).
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn document_count(&self) -> usize {
        let state = self.state.lock().expect("store lock poisoned");
        state.documents.len()
    }

    /// Overwrites a document's bytes without any checks, as storage
    /// corruption would. The corrupt bytes count as committed.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    pub fn corrupt(&self, kind: ServiceKind, operation_id: OperationId, bytes: Bytes) {
        let mut state = self.state.lock().expect("store lock poisoned");
        state.documents.insert(
            (kind, operation_id),
            StoredDocument {
                current: bytes.clone(),
                majority: Some(bytes),
            },
        );
    }
}

#[async_trait]
impl StateDocumentStore for SimulatedStateStore {
    async fn load(
        &self,
        kind: ServiceKind,
        operation_id: OperationId,
    ) -> StoreResult<Option<Bytes>> {
        self.check_read_fault("load")?;
        Ok(self.raw(kind, operation_id))
    }

    async fn list(&self, kind: ServiceKind) -> StoreResult<Vec<(OperationId, Bytes)>> {
        self.check_read_fault("list")?;
        Ok(self.all_documents(kind).into_iter().collect())
    }

    async fn insert(
        &self,
        kind: ServiceKind,
        operation_id: OperationId,
        document: Bytes,
        write_concern: WriteConcern,
    ) -> StoreResult<()> {
        self.check_write_fault("insert")?;

        let key = (kind, operation_id);
        {
            let mut state = self.state.lock().expect("store lock poisoned");
            if state.documents.contains_key(&key) {
                return Err(StoreError::AlreadyExists { kind, operation_id });
            }
            state.record(key, &document);
            state.documents.insert(
                key,
                StoredDocument {
                    current: document,
                    majority: None,
                },
            );
        }

        self.acknowledge(key, write_concern, "insert").await
    }

    async fn compare_and_swap(
        &self,
        kind: ServiceKind,
        operation_id: OperationId,
        expected: &Bytes,
        document: Bytes,
        write_concern: WriteConcern,
    ) -> StoreResult<()> {
        self.check_write_fault("compare_and_swap")?;

        let key = (kind, operation_id);
        {
            let mut state = self.state.lock().expect("store lock poisoned");
            let stored = state
                .documents
                .get_mut(&key)
                .ok_or(StoreError::NotFound { kind, operation_id })?;
            if stored.current != *expected {
                return Err(StoreError::Conflict { kind, operation_id });
            }
            stored.current = document.clone();
            state.record(key, &document);
        }

        self.acknowledge(key, write_concern, "compare_and_swap").await
    }

    async fn wait_for_majority(
        &self,
        kind: ServiceKind,
        operation_id: OperationId,
    ) -> StoreResult<()> {
        let key = (kind, operation_id);
        if self.raw(kind, operation_id).is_none() {
            return Err(StoreError::NotFound { kind, operation_id });
        }
        self.acknowledge(key, WriteConcern::Majority, "wait_for_majority")
            .await
    }

    async fn remove(
        &self,
        kind: ServiceKind,
        operation_id: OperationId,
        write_concern: WriteConcern,
    ) -> StoreResult<bool> {
        self.check_write_fault("remove")?;

        let existed = {
            let mut state = self.state.lock().expect("store lock poisoned");
            state.documents.remove(&(kind, operation_id)).is_some()
        };
        if write_concern == WriteConcern::Majority {
            let delay = self.fault_config().durability_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(existed)
    }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
