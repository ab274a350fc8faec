//! Resharding participant services.
//!
//! This crate runs the per-shard side of a resharding operation: the donor
//! and recipient state machines, the durable documents that record their
//! progress, and the primary-only service registry that rebuilds them every
//! time the local node becomes leader.
//!
//! # Overview
//!
//! - **Documents**: Each instance owns one persisted document
//!   ([`DonorDocument`] or [`RecipientDocument`]) keyed by operation id. The
//!   document is the only state that survives a leadership change.
//! - **Durability before effect**: Every transition is a compare-and-swap with
//!   majority write concern. Externally visible effects (blocking writes,
//!   creating the temporary collection) happen only after that write is
//!   majority committed, and are re-established on resume.
//! - **Interruption**: Leadership loss fires an [`InterruptToken`]; instances
//!   observe it at their wait points and stop without touching their
//!   documents.
//! - **Coordinator view**: Instances never call peers. They pull the latest
//!   [`RoleProjection`] from a [`ProjectionFeed`] and act on its global state.
//!
//! # Example
//!
//! ```ignore
//! use reshard_service::{
//!     PrimaryOnlyServiceRegistry, ProjectionFeed, ServiceConfig, ServiceContext,
//!     ServiceDescriptor, SimulatedStateStore,
//! };
//!
//! let ctx = ServiceContext::new(shard, store, effects, ProjectionFeed::new(), ServiceConfig::default());
//! let mut registry = PrimaryOnlyServiceRegistry::new(ctx);
//! registry.register(ServiceDescriptor::donor())?;
//! registry.register(ServiceDescriptor::recipient())?;
//! registry.on_startup();
//!
//! // Invoked by the replication layer.
//! registry.on_leadership_acquired(TermId::new(1)).await?;
//! registry.on_leadership_lost().await;
//! ```
//!
//! # Testing
//!
//! [`SimulatedStateStore`] and [`SimulatedDataPlane`] provide deterministic
//! fault injection (seeded store failures, write-concern timeouts, unreachable
//! donors) and record enough history to check ordering invariants.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod backoff;
mod codec;
mod config;
mod context;
mod document;
mod donor;
mod effects;
mod error;
mod instance;
mod interrupt;
mod participant;
mod persist;
mod projection;
mod recipient;
mod registry;
mod store;

pub use backoff::{retry_transient, Backoff};
pub use codec::{decode_document, encode_document, CodecError, CodecResult, FORMAT_VERSION};
pub use config::{BackoffConfig, ConfigError, ServiceConfig};
pub use context::ServiceContext;
pub use document::{
    CommonMetadata, DonorDocument, DonorState, ParticipantDocument, PersistedDocument,
    RecipientDocument, RecipientState, ServiceKind,
};
pub use donor::DonorStateMachine;
pub use effects::{
    ApplyProgress, CloneProgress, DataPlaneConfig, EffectError, EffectEvent, EffectKind,
    EffectResult, ShardEffects, SimulatedDataPlane, SimulatedShardEffects,
};
pub use error::{ErrorClass, RegistryError, RegistryResult, ServiceError, ServiceResult};
pub use instance::{Instance, InstanceOutcome};
pub use interrupt::{InterruptSource, InterruptToken, Interrupted};
pub use participant::{ProcessOutcome, ReshardingParticipant};
pub use projection::{
    CoordinatorState, DonorRole, ProjectionFeed, ProjectionWatcher, RecipientRole, RoleProjection,
};
pub use recipient::RecipientStateMachine;
pub use registry::{PrimaryOnlyServiceRegistry, ServiceDescriptor};
pub use store::{
    SimulatedStateStore, StateDocumentStore, StoreError, StoreFaultConfig, StoreResult,
    WriteConcern,
};
