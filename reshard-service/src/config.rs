//! Service configuration.
//!
//! Timing and sizing knobs for donor and recipient instances.

use std::time::Duration;

use reshard_core::Limits;

/// Retry backoff for transient errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(5),
            multiplier: 2,
        }
    }
}

impl BackoffConfig {
    /// Backoff suitable for testing (short delays).
    #[must_use]
    pub const fn fast_for_testing() -> Self {
        Self {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(100),
            multiplier: 2,
        }
    }
}

/// Configuration shared by every instance on a shard.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Backoff for transient store, durability and peer errors.
    pub backoff: BackoffConfig,
    /// How long an instance waits for a projection change before re-reading it.
    pub projection_poll_interval: Duration,
    /// Maximum per-donor oplog lag (entries) for a recipient to reach steady state.
    pub apply_lag_threshold: u64,
    /// Pause between apply rounds while a recipient is in steady state.
    pub steady_state_batch_interval: Duration,
    /// Bound on a single wait for majority durability.
    pub durability_timeout: Duration,
    /// Resource limits.
    pub limits: Limits,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            projection_poll_interval: Duration::from_secs(1),
            apply_lag_threshold: 10,
            steady_state_batch_interval: Duration::from_millis(100),
            durability_timeout: Duration::from_secs(10),
            limits: Limits::new(),
        }
    }
}

impl ServiceConfig {
    /// Creates config suitable for testing (faster polling and retries).
    #[must_use]
    pub fn fast_for_testing() -> Self {
        Self {
            backoff: BackoffConfig::fast_for_testing(),
            projection_poll_interval: Duration::from_millis(20),
            apply_lag_threshold: 10,
            steady_state_batch_interval: Duration::from_millis(10),
            durability_timeout: Duration::from_secs(1),
            limits: Limits::new(),
        }
    }

    /// Sets the backoff configuration.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the projection poll interval.
    #[must_use]
    pub const fn with_projection_poll_interval(mut self, interval: Duration) -> Self {
        self.projection_poll_interval = interval;
        self
    }

    /// Sets the apply lag threshold.
    #[must_use]
    pub const fn with_apply_lag_threshold(mut self, threshold: u64) -> Self {
        self.apply_lag_threshold = threshold;
        self
    }

    /// Sets the steady-state batch interval.
    #[must_use]
    pub const fn with_steady_state_batch_interval(mut self, interval: Duration) -> Self {
        self.steady_state_batch_interval = interval;
        self
    }

    /// Sets the durability timeout.
    #[must_use]
    pub const fn with_durability_timeout(mut self, timeout: Duration) -> Self {
        self.durability_timeout = timeout;
        self
    }

    /// Sets the limits.
    #[must_use]
    pub const fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff.initial.is_zero() {
            return Err(ConfigError::InvalidBackoff {
                message: "initial delay must be positive".to_string(),
            });
        }
        if self.backoff.max < self.backoff.initial {
            return Err(ConfigError::InvalidBackoff {
                message: "max delay must be >= initial delay".to_string(),
            });
        }
        if self.backoff.multiplier == 0 {
            return Err(ConfigError::InvalidBackoff {
                message: "multiplier must be >= 1".to_string(),
            });
        }

        for (name, value) in [
            ("projection_poll_interval", self.projection_poll_interval),
            ("steady_state_batch_interval", self.steady_state_batch_interval),
            ("durability_timeout", self.durability_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidTiming {
                    message: format!("{name} must be positive"),
                });
            }
        }

        self.limits.validate().map_err(|err| ConfigError::InvalidLimits {
            message: err.to_string(),
        })
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid backoff configuration.
    InvalidBackoff {
        /// Error description.
        message: String,
    },
    /// Invalid timing configuration.
    InvalidTiming {
        /// Error description.
        message: String,
    },
    /// Invalid limits.
    InvalidLimits {
        /// Error description.
        message: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBackoff { message } => write!(f, "invalid backoff: {message}"),
            Self::InvalidTiming { message } => write!(f, "invalid timing: {message}"),
            Self::InvalidLimits { message } => write!(f, "invalid limits: {message}"),
        }
    }
}

impl std::error::Error for ConfigError {}
