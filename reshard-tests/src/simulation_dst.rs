//! Resharding DST tests.
//!
//! Runs complete operations on simulated clusters and checks every property
//! against the recorded histories:
//! - Forward-only state order and pinned fetch timestamps
//! - Effects only after their gating state is majority committed
//! - Every recipient mirrors every donor at cutover
//! - Convergence under store faults, unreachable donors and leadership flaps

// Test-specific lint allowances.
#![allow(clippy::too_many_lines)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]

use reshard_service::{CoordinatorState, EffectKind};

use crate::cluster::{ClusterConfig, SimulatedCluster};
use crate::properties::PropertyChecker;
use crate::scenarios::seeds::{MAX_STEPS, REGRESSION_SEEDS};
use crate::scenarios::{clusters, faults};

async fn run_and_check(config: ClusterConfig) -> SimulatedCluster {
    let seed = config.seed;
    let mut cluster = SimulatedCluster::start(config).await.unwrap();
    let outcome = cluster.run_to_completion(MAX_STEPS).await.unwrap();
    assert!(outcome.finished, "seed {} did not finish: {:?}", seed, outcome);
    assert_eq!(
        outcome.final_state,
        CoordinatorState::Done,
        "seed {} ended in {}",
        seed,
        outcome.final_state
    );

    let mut checker = PropertyChecker::new();
    checker.check_cluster(&cluster);
    assert!(
        checker.is_ok(),
        "seed {} violated properties:\n{}",
        seed,
        checker
            .violations()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    );
    assert!(checker.versions_checked() > 0);
    cluster
}

// ============================================================================
// Fault-Free Runs
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_dst_resharding_one_to_one() {
    let mut cluster = run_and_check(clusters::one_to_one(42)).await;

    // Completed operations leave no documents behind.
    for shard in cluster.shards() {
        assert_eq!(cluster.store(&shard).unwrap().document_count(), 0);
    }
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_dst_resharding_overlapping_roles() {
    let mut cluster = run_and_check(clusters::overlapping(7777)).await;
    let transitions = cluster.coordinator().transitions().to_vec();
    assert_eq!(
        transitions,
        vec![
            CoordinatorState::Initializing,
            CoordinatorState::PreparingToDonate,
            CoordinatorState::Cloning,
            CoordinatorState::Applying,
            CoordinatorState::BlockingWrites,
            CoordinatorState::DecisionPersisted,
            CoordinatorState::Done,
        ]
    );
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_dst_resharding_all_to_all() {
    let mut cluster = run_and_check(clusters::all_to_all(0x1337)).await;
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_dst_effects_follow_protocol_order() {
    let mut cluster = run_and_check(clusters::overlapping(12345)).await;
    let events = cluster.plane().events();

    // Every donor blocks writes exactly once, and only after every recipient
    // created its collection.
    let blocks: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.kind == EffectKind::BlockWrites)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(blocks.len(), cluster.config().donors);
    let last_create = events
        .iter()
        .rposition(|e| e.kind == EffectKind::CreateCollection)
        .unwrap();
    assert!(blocks.iter().all(|&b| b > last_create));

    // Cutover happens only after writes are blocked on that donor.
    for (index, event) in events.iter().enumerate() {
        if let EffectKind::Cutover { donor } = &event.kind {
            let blocked = events[..index]
                .iter()
                .any(|e| &e.shard == donor && e.kind == EffectKind::BlockWrites);
            assert!(blocked, "cutover on {} before its writes were blocked", donor);
        }
    }
    cluster.shutdown().await;
}

// ============================================================================
// Faulty Runs
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_dst_resharding_flaky_store_regression_seeds() {
    for &seed in REGRESSION_SEEDS {
        let mut cluster = run_and_check(faults::flaky_store(clusters::overlapping(seed))).await;
        cluster.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_dst_resharding_unreachable_donors_regression_seeds() {
    for &seed in REGRESSION_SEEDS {
        let mut cluster =
            run_and_check(faults::unreachable_donors(clusters::overlapping(seed))).await;
        cluster.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_dst_resharding_leadership_flaps_regression_seeds() {
    let mut total_flaps = 0;
    for &seed in REGRESSION_SEEDS {
        let config = clusters::overlapping(seed).with_leadership_flap_rate(0.1);
        let mut cluster = run_and_check(config).await;
        total_flaps += cluster.flaps();
        cluster.shutdown().await;
    }
    assert!(total_flaps > 0, "no seed injected a leadership flap");
}

#[tokio::test(start_paused = true)]
async fn test_dst_resharding_all_faults_regression_seeds() {
    for &seed in REGRESSION_SEEDS {
        let mut cluster = run_and_check(faults::everything(clusters::overlapping(seed))).await;
        cluster.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_dst_resharding_all_faults_all_to_all() {
    for &seed in &REGRESSION_SEEDS[..3] {
        let mut cluster = run_and_check(faults::everything(clusters::all_to_all(seed))).await;
        cluster.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_dst_same_seed_same_run() {
    let mut first = SimulatedCluster::start(clusters::overlapping(999)).await.unwrap();
    let a = first.run_to_completion(MAX_STEPS).await.unwrap();
    first.shutdown().await;

    let mut second = SimulatedCluster::start(clusters::overlapping(999)).await.unwrap();
    let b = second.run_to_completion(MAX_STEPS).await.unwrap();
    second.shutdown().await;

    assert_eq!(a.final_state, b.final_state);
    assert_eq!(
        first.coordinator().fetch_timestamp(),
        second.coordinator().fetch_timestamp()
    );
}
