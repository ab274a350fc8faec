//! Crash-and-restart tests.
//!
//! Restarts a shard as soon as one of its documents reaches each state and
//! checks that the operation still converges to the same terminal outcome
//! as an uninterrupted run. A restart drops every in-memory structure on
//! the shard (instances, projections) and keeps only its store.

// Test-specific lint allowances.
#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]

use reshard_core::ShardId;
use reshard_service::{CoordinatorState, DonorState, RecipientState, ServiceKind};

use crate::cluster::{shard_id, ClusterConfig, SimulatedCluster, OPERATION_ID};
use crate::properties::PropertyChecker;
use crate::scenarios::clusters;
use crate::scenarios::seeds::MAX_STEPS;

const DONOR_STATES: [DonorState; 5] = [
    DonorState::PreparingToDonate,
    DonorState::DonatingInitialData,
    DonorState::DonatingOplogEntries,
    DonorState::PreparingToBlockWrites,
    DonorState::BlockingWrites,
];

const RECIPIENT_STATES: [RecipientState; 6] = [
    RecipientState::AwaitingFetchTimestamp,
    RecipientState::CreatingCollection,
    RecipientState::Cloning,
    RecipientState::Applying,
    RecipientState::SteadyState,
    RecipientState::StrictConsistency,
];

async fn baseline(config: ClusterConfig) -> Vec<CoordinatorState> {
    let mut cluster = SimulatedCluster::start(config).await.unwrap();
    let outcome = cluster.run_to_completion(MAX_STEPS).await.unwrap();
    assert!(outcome.finished);
    let transitions = cluster.coordinator().transitions().to_vec();
    cluster.shutdown().await;
    transitions
}

async fn finish_and_check(mut cluster: SimulatedCluster, expected: &[CoordinatorState]) {
    let outcome = cluster.run_to_completion(MAX_STEPS).await.unwrap();
    assert!(outcome.finished, "did not finish: {:?}", outcome);
    assert_eq!(cluster.coordinator().transitions(), expected);

    let mut checker = PropertyChecker::new();
    checker.check_cluster(&cluster);
    assert!(checker.is_ok(), "{:?}", checker.violations());
    cluster.shutdown().await;
}

async fn restart_when_donor_reaches(
    config: ClusterConfig,
    shard: &ShardId,
    state: DonorState,
) -> SimulatedCluster {
    let mut cluster = SimulatedCluster::start(config).await.unwrap();
    let reached = cluster
        .run_until(MAX_STEPS, |c| {
            c.donor_document(shard).is_some_and(|doc| doc.state >= state)
        })
        .await
        .unwrap();
    assert!(reached, "{} never reached {}", shard, state);
    cluster.restart(shard).await.unwrap();
    cluster
}

async fn restart_when_recipient_reaches(
    config: ClusterConfig,
    shard: &ShardId,
    state: RecipientState,
) -> SimulatedCluster {
    let mut cluster = SimulatedCluster::start(config).await.unwrap();
    let reached = cluster
        .run_until(MAX_STEPS, |c| {
            c.recipient_document(shard)
                .is_some_and(|doc| doc.state >= state)
        })
        .await
        .unwrap();
    assert!(reached, "{} never reached {}", shard, state);
    cluster.restart(shard).await.unwrap();
    cluster
}

#[tokio::test(start_paused = true)]
async fn test_restart_donor_in_every_state() {
    let expected = baseline(clusters::overlapping(42)).await;
    let donor = shard_id(0);

    for state in DONOR_STATES {
        let cluster = restart_when_donor_reaches(clusters::overlapping(42), &donor, state).await;
        finish_and_check(cluster, &expected).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_restart_recipient_in_every_state() {
    let expected = baseline(clusters::overlapping(42)).await;
    let recipient = shard_id(2);

    for state in RECIPIENT_STATES {
        let cluster =
            restart_when_recipient_reaches(clusters::overlapping(42), &recipient, state).await;
        finish_and_check(cluster, &expected).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_restart_shard_playing_both_roles() {
    let expected = baseline(clusters::overlapping(7)).await;
    let both = shard_id(1);

    for state in RECIPIENT_STATES {
        let cluster = restart_when_recipient_reaches(clusters::overlapping(7), &both, state).await;
        finish_and_check(cluster, &expected).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_restart_every_shard_repeatedly() {
    let config = clusters::overlapping(0xDEAD_BEEF);
    let expected = baseline(config.clone()).await;
    let mut cluster = SimulatedCluster::start(config).await.unwrap();

    // Restart one shard every few steps until the decision is persisted.
    let mut restarts = 0;
    while !cluster
        .coordinator()
        .state()
        .has_reached(CoordinatorState::DecisionPersisted)
    {
        cluster.run_until(8, |_| false).await.unwrap();
        let shard = shard_id(restarts % 3);
        cluster.restart(&shard).await.unwrap();
        restarts += 1;
        assert!(restarts < 1_000, "operation stalled under restarts");
    }
    finish_and_check(cluster, &expected).await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_preserves_documents_byte_for_byte() {
    let mut cluster = SimulatedCluster::start(clusters::overlapping(1)).await.unwrap();
    let shard = shard_id(1);
    cluster
        .run_until(MAX_STEPS, |c| {
            c.recipient_document(&shard)
                .is_some_and(|doc| doc.state >= RecipientState::Cloning)
        })
        .await
        .unwrap();

    // Stepping down stops every instance; nothing may be written after.
    cluster.lose_leadership(&shard).await.unwrap();
    let store = cluster.store(&shard).unwrap().clone();
    let donor_before = store.raw(ServiceKind::Donor, OPERATION_ID);
    let recipient_before = store.raw(ServiceKind::Recipient, OPERATION_ID);
    let history_len = store.history(ServiceKind::Recipient, OPERATION_ID).len();

    cluster.restart(&shard).await.unwrap();
    assert_eq!(store.raw(ServiceKind::Donor, OPERATION_ID), donor_before);
    assert_eq!(store.raw(ServiceKind::Recipient, OPERATION_ID), recipient_before);
    assert_eq!(
        store.history(ServiceKind::Recipient, OPERATION_ID).len(),
        history_len
    );

    let registry = cluster.registry(&shard).unwrap();
    assert!(registry.is_leader());
    assert!(registry.has_instance(ServiceKind::Donor, OPERATION_ID));
    assert!(registry.has_instance(ServiceKind::Recipient, OPERATION_ID));

    let expected = baseline(clusters::overlapping(1)).await;
    finish_and_check(cluster, &expected).await;
}
