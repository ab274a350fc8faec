//! Exponential backoff with jitter, and the retry loop for transient errors.

use std::future::Future;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

use crate::config::BackoffConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::interrupt::InterruptToken;

/// Delay generator: grows by `multiplier` per attempt up to `max`, each delay
/// jittered into `[d/2, d]`.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    attempts: u32,
    rng: StdRng,
}

impl Backoff {
    /// Creates a backoff seeded from OS entropy.
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Creates a deterministic backoff.
    #[must_use]
    pub fn seeded(config: BackoffConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: BackoffConfig, rng: StdRng) -> Self {
        Self {
            current: config.initial,
            config,
            attempts: 0,
            rng,
        }
    }

    /// Returns the next delay and advances.
    pub fn next_delay(&mut self) -> Duration {
        let full = self.current.min(self.config.max);
        #[allow(clippy::cast_possible_truncation)]
        let full_ms = full.as_millis() as u64;
        let delay = if full_ms < 2 {
            full
        } else {
            Duration::from_millis(self.rng.gen_range(full_ms / 2..=full_ms))
        };

        self.attempts += 1;
        self.current = self
            .current
            .saturating_mul(self.config.multiplier)
            .min(self.config.max);
        delay
    }

    /// Number of delays handed out since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Restarts from the initial delay.
    pub fn reset(&mut self) {
        self.current = self.config.initial;
        self.attempts = 0;
    }
}

/// Runs `attempt` until it succeeds, retrying transient errors with backoff.
///
/// Every attempt and every backoff sleep is a wait point.
///
/// # Errors
/// Returns the first non-transient error, or `Interrupted` if the token fired.
pub async fn retry_transient<T, F, Fut>(
    what: &'static str,
    config: &BackoffConfig,
    token: &InterruptToken,
    mut attempt: F,
) -> ServiceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ServiceResult<T>>,
{
    let mut backoff = Backoff::new(*config);
    loop {
        let result = token
            .guard(attempt())
            .await
            .map_err(|_| ServiceError::Interrupted)?;
        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                let delay = backoff.next_delay();
                warn!(
                    what,
                    attempt = backoff.attempts(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Transient failure, will retry"
                );
                token
                    .sleep(delay)
                    .await
                    .map_err(|_| ServiceError::Interrupted)?;
            }
            Err(e) => return Err(e),
        }
    }
}
