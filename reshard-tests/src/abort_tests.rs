//! Abort and protocol-violation tests.
//!
//! A coordinator abort or a participant reaching Error must leave every
//! participant in Error with a persisted reason, without leaking effects.

// Test-specific lint allowances.
#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeSet;
use std::time::Duration;

use bytes::Bytes;
use reshard_core::{CollectionId, OperationId, ShardId, ShardKeyPattern, TermId};
use reshard_service::{
    CommonMetadata, CoordinatorState, DataPlaneConfig, DonorDocument, DonorState, EffectKind,
    InstanceOutcome, PersistedDocument, PrimaryOnlyServiceRegistry, ProjectionFeed,
    RecipientDocument, RecipientRole, RecipientState, RoleProjection, ServiceConfig,
    ServiceContext, ServiceDescriptor, ServiceKind, SimulatedDataPlane, SimulatedShardEffects,
    SimulatedStateStore,
};

use crate::cluster::{shard_id, SimulatedCluster, SimulatedRegistry, OPERATION_ID};
use crate::properties::PropertyChecker;
use crate::scenarios::clusters;
use crate::scenarios::seeds::MAX_STEPS;

const ABORTED: &str = "aborted by coordinator";

fn assert_all_errored(cluster: &SimulatedCluster, reason: Option<&str>) {
    for shard in cluster.config().donor_shards() {
        if let Some(doc) = cluster.donor_document(&shard) {
            assert_eq!(doc.state, DonorState::Error, "donor on {}", shard);
            let persisted = doc.abort_reason.as_deref().unwrap();
            if let Some(reason) = reason {
                assert_eq!(persisted, reason);
            }
        }
    }
    for shard in cluster.config().recipient_shards() {
        if let Some(doc) = cluster.recipient_document(&shard) {
            assert_eq!(doc.state, RecipientState::Error, "recipient on {}", shard);
            let persisted = doc.abort_reason.as_deref().unwrap();
            if let Some(reason) = reason {
                assert_eq!(persisted, reason);
            }
        }
    }
}

fn assert_properties(cluster: &SimulatedCluster) {
    let mut checker = PropertyChecker::new();
    checker.check_cluster(cluster);
    assert!(checker.is_ok(), "{:?}", checker.violations());
}

// ============================================================================
// Coordinator Aborts
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_abort_during_cloning_errors_every_participant() {
    let mut cluster = SimulatedCluster::start(clusters::overlapping(42)).await.unwrap();
    cluster
        .run_until(MAX_STEPS, |c| c.coordinator().state() == CoordinatorState::Cloning)
        .await
        .unwrap();
    assert!(cluster.coordinator_mut().abort());

    let outcome = cluster.run_to_completion(MAX_STEPS).await.unwrap();
    assert!(outcome.finished);
    assert_eq!(outcome.final_state, CoordinatorState::Error);
    assert_all_errored(&cluster, Some(ABORTED));

    // Writes were never blocked.
    assert!(!cluster
        .plane()
        .events()
        .iter()
        .any(|e| e.kind == EffectKind::BlockWrites));
    assert_properties(&cluster);
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_abort_while_blocking_writes() {
    let mut cluster = SimulatedCluster::start(clusters::overlapping(7777)).await.unwrap();
    let donor = shard_id(0);
    cluster
        .run_until(MAX_STEPS, |c| {
            c.donor_document(&donor)
                .is_some_and(|doc| doc.state == DonorState::BlockingWrites)
        })
        .await
        .unwrap();
    assert!(cluster.coordinator_mut().abort());

    let outcome = cluster.run_to_completion(MAX_STEPS).await.unwrap();
    assert_eq!(outcome.final_state, CoordinatorState::Error);
    assert_all_errored(&cluster, Some(ABORTED));

    // Writes resume once the donor's Error document is durable.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!cluster.plane().is_blocked(OPERATION_ID, &donor));
    assert!(cluster
        .plane()
        .events()
        .iter()
        .any(|e| e.shard == donor && e.kind == EffectKind::UnblockWrites));
    assert_properties(&cluster);
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_abort_after_decision_refused() {
    let mut cluster = SimulatedCluster::start(clusters::one_to_one(1)).await.unwrap();
    cluster
        .run_until(MAX_STEPS, |c| {
            c.coordinator()
                .state()
                .has_reached(CoordinatorState::DecisionPersisted)
        })
        .await
        .unwrap();
    assert!(!cluster.coordinator_mut().abort());

    let outcome = cluster.run_to_completion(MAX_STEPS).await.unwrap();
    assert_eq!(outcome.final_state, CoordinatorState::Done);
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_abort_survives_leadership_flaps() {
    let mut cluster = SimulatedCluster::start(clusters::overlapping(0xDEAD_BEEF))
        .await
        .unwrap();
    cluster
        .run_until(MAX_STEPS, |c| c.coordinator().state() == CoordinatorState::Applying)
        .await
        .unwrap();
    assert!(cluster.coordinator_mut().abort());
    for shard in cluster.shards() {
        cluster.flap(&shard).await.unwrap();
    }

    let outcome = cluster.run_to_completion(MAX_STEPS).await.unwrap();
    assert_eq!(outcome.final_state, CoordinatorState::Error);
    assert_all_errored(&cluster, Some(ABORTED));
    cluster.shutdown().await;
}

// ============================================================================
// Participant Errors
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_corrupted_document_aborts_operation() {
    let mut cluster = SimulatedCluster::start(clusters::overlapping(999)).await.unwrap();
    let recipient = shard_id(2);
    cluster
        .run_until(MAX_STEPS, |c| {
            c.recipient_document(&recipient)
                .is_some_and(|doc| doc.state == RecipientState::Cloning)
        })
        .await
        .unwrap();
    cluster
        .store(&recipient)
        .unwrap()
        .corrupt(ServiceKind::Recipient, OPERATION_ID, Bytes::from_static(b"garbage"));

    let outcome = cluster.run_to_completion(MAX_STEPS).await.unwrap();
    assert!(outcome.finished);
    assert_eq!(outcome.final_state, CoordinatorState::Error);

    // The corrupted recipient records why; everyone else was aborted.
    let corrupted = cluster.recipient_document(&recipient).unwrap();
    assert_eq!(corrupted.state, RecipientState::Error);
    assert!(corrupted
        .abort_reason
        .as_deref()
        .unwrap()
        .contains("changed underneath"));
    assert_all_errored(&cluster, None);
    assert_properties(&cluster);
    cluster.shutdown().await;
}

// ============================================================================
// Single-Shard Protocol Violations
// ============================================================================

const OP: OperationId = OperationId::new(77);

async fn single_shard_registry() -> (SimulatedRegistry, SimulatedStateStore) {
    let shard = ShardId::new("shard0");
    let store = SimulatedStateStore::new(3);
    let plane = SimulatedDataPlane::new(3, DataPlaneConfig::default());
    let effects: SimulatedShardEffects = plane.shard(shard.clone(), store.clone());
    let ctx = ServiceContext::new(
        shard,
        store.clone(),
        effects,
        ProjectionFeed::new(),
        ServiceConfig::fast_for_testing(),
    );
    let mut registry = PrimaryOnlyServiceRegistry::new(ctx);
    registry.register(ServiceDescriptor::donor()).unwrap();
    registry.register(ServiceDescriptor::recipient()).unwrap();
    registry.on_startup();
    registry.on_leadership_acquired(TermId::new(1)).await.unwrap();
    (registry, store)
}

fn metadata() -> CommonMetadata {
    CommonMetadata::new(
        OP,
        "test.orders".parse().unwrap(),
        CollectionId::new(5),
        ShardKeyPattern::new(["customer_id"]).unwrap(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_recipient_without_fetch_timestamp_errors() {
    let (mut registry, store) = single_shard_registry().await;
    let doc = RecipientDocument::new(
        metadata(),
        BTreeSet::from([ShardId::new("shard1")]),
        Duration::ZERO,
    );
    assert!(registry.start_instance(doc.into()).await.unwrap());

    // Cloning without a fetch timestamp is a coordinator bug.
    let projection = RoleProjection::new(OP, CoordinatorState::Cloning).with_recipient(
        RecipientRole {
            source_namespace: "test.orders".parse().unwrap(),
            source_collection_id: CollectionId::new(5),
            donor_shards: BTreeSet::from([ShardId::new("shard1")]),
            fetch_timestamp: None,
            minimum_operation_duration: Duration::ZERO,
        },
    );
    registry.context().projections.publish(projection);

    let outcome = registry
        .instance_outcome(ServiceKind::Recipient, OP)
        .await
        .unwrap();
    let InstanceOutcome::Errored(reason) = outcome else {
        panic!("expected error, got {:?}", outcome);
    };
    assert!(reason.contains("fetchTimestamp"), "{}", reason);

    let stored =
        RecipientDocument::decode(&store.raw(ServiceKind::Recipient, OP).unwrap()).unwrap();
    assert_eq!(stored.state, RecipientState::Error);
    assert_eq!(stored.abort_reason.as_deref(), Some(reason.as_str()));
    registry.on_shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_donor_without_recipients_errors() {
    let (mut registry, store) = single_shard_registry().await;
    let doc = DonorDocument::new(metadata(), BTreeSet::new());
    assert!(registry.start_instance(doc.into()).await.unwrap());

    let outcome = registry
        .instance_outcome(ServiceKind::Donor, OP)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        InstanceOutcome::Errored("donor has no recipient shards".to_string())
    );
    let stored = DonorDocument::decode(&store.raw(ServiceKind::Donor, OP).unwrap()).unwrap();
    assert_eq!(stored.state, DonorState::Error);

    // Errored documents are kept; completion cleanup refuses them.
    assert!(registry.on_operation_completed(OP).await.is_err());
    assert_eq!(store.document_count(), 1);
    registry.on_shutdown().await;
}
