//! Cooperative interruption.
//!
//! Leadership loss fires an [`InterruptSource`]. Instances hold an
//! [`InterruptToken`] and race every wait point against it; nothing outside
//! a wait point is ever cancelled.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

/// Returned by a wait point when leadership was lost.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("interrupted by leadership loss")]
pub struct Interrupted;

/// Fires the interrupt for every token it handed out.
#[derive(Debug)]
pub struct InterruptSource {
    sender: watch::Sender<bool>,
}

impl Default for InterruptSource {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptSource {
    /// Creates a source that has not fired.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    /// Returns a token observing this source.
    #[must_use]
    pub fn token(&self) -> InterruptToken {
        InterruptToken {
            receiver: self.sender.subscribe(),
        }
    }

    /// Fires the interrupt. Idempotent.
    pub fn interrupt(&self) {
        self.sender.send_replace(true);
    }

    /// Returns true once fired.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        *self.sender.borrow()
    }
}

/// Observes an [`InterruptSource`]. Dropping the source counts as an
/// interrupt.
#[derive(Debug, Clone)]
pub struct InterruptToken {
    receiver: watch::Receiver<bool>,
}

impl InterruptToken {
    /// Returns true once the source fired or was dropped.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }

    /// Waits until the interrupt fires.
    pub async fn interrupted(&self) {
        let mut receiver = self.receiver.clone();
        // Err means the source was dropped.
        let _ = receiver.wait_for(|fired| *fired).await;
    }

    /// Runs `future` unless the interrupt fires first.
    ///
    /// # Errors
    /// Returns `Interrupted` if the interrupt fired before `future` finished.
    pub async fn guard<F: Future>(&self, future: F) -> Result<F::Output, Interrupted> {
        if self.is_interrupted() {
            return Err(Interrupted);
        }
        tokio::select! {
            biased;
            () = self.interrupted() => Err(Interrupted),
            output = future => Ok(output),
        }
    }

    /// Sleeps for `duration` unless interrupted.
    ///
    /// # Errors
    /// Returns `Interrupted` if the interrupt fired first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        self.guard(tokio::time::sleep(duration)).await
    }
}
