//! Reusable test scenarios for resharding simulation.
//!
//! Scenarios define common cluster shapes and fault patterns that can be
//! composed to build a [`ClusterConfig`](crate::cluster::ClusterConfig).

/// Standard cluster shapes.
pub mod clusters {
    use crate::cluster::ClusterConfig;

    /// One donor resharding into one other shard.
    #[must_use]
    pub fn one_to_one(seed: u64) -> ClusterConfig {
        ClusterConfig::new(seed).with_shards(2, 1, 1)
    }

    /// Two donors and two recipients; the middle shard plays both roles.
    #[must_use]
    pub fn overlapping(seed: u64) -> ClusterConfig {
        ClusterConfig::new(seed).with_shards(3, 2, 2)
    }

    /// Every shard donates to and receives from every shard.
    #[must_use]
    pub fn all_to_all(seed: u64) -> ClusterConfig {
        ClusterConfig::new(seed).with_shards(4, 4, 4)
    }
}

/// Common fault injection patterns.
pub mod faults {
    use reshard_service::StoreFaultConfig;

    use crate::cluster::ClusterConfig;

    /// Probability per step of a leadership flap in the default profile.
    pub const FLAP_RATE: f64 = 0.02;

    /// Probability of a donor call failing as unreachable in the default
    /// profile.
    pub const UNREACHABLE_RATE: f64 = 0.05;

    /// Store reads and writes fail at random and majority writes sometimes
    /// time out after applying.
    #[must_use]
    pub fn flaky_store(config: ClusterConfig) -> ClusterConfig {
        config.with_store_faults(StoreFaultConfig::flaky())
    }

    /// Donors are intermittently unreachable from recipients.
    #[must_use]
    pub fn unreachable_donors(config: ClusterConfig) -> ClusterConfig {
        config.with_unreachable_rate(UNREACHABLE_RATE)
    }

    /// Shards lose and regain leadership at random steps.
    #[must_use]
    pub fn leadership_flaps(config: ClusterConfig) -> ClusterConfig {
        config.with_leadership_flap_rate(FLAP_RATE)
    }

    /// All of the above at once.
    #[must_use]
    pub fn everything(config: ClusterConfig) -> ClusterConfig {
        leadership_flaps(unreachable_donors(flaky_store(config)))
    }
}

/// Seeds for reproducible testing.
pub mod seeds {
    /// Standard test seeds that have historically found bugs.
    pub const REGRESSION_SEEDS: &[u64] = &[
        42,
        12345,
        0xDEAD_BEEF,
        999,
        7777,
        0x1337,
        0xCAFE_BABE,
        1,
        u64::MAX,
        0,
    ];

    /// Number of random seeds to test in CI.
    pub const CI_SEED_COUNT: u32 = 100;

    /// Step budget that every healthy run finishes well within.
    pub const MAX_STEPS: u64 = 20_000;
}
