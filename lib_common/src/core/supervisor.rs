//! # Reconnect Supervisor
//!
//! Retries a [`Connector`] with exponential backoff until it succeeds or the relay shuts down.
//! The attempt counter lives on the stack of a single `reconnect` call, so every outage starts
//! again from the initial delay.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::backoff::BackoffPolicy;
use crate::core::error::RelayError;

/// Something that can (re)establish the upstream link.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// One connection attempt. `Ok` means the link is up (dialed and join sent).
    async fn connect(&self) -> Result<(), RelayError>;
}

/// How a reconnect cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// The link is back after `attempts` tries.
    Connected {
        /// Tries it took, starting at 1.
        attempts: u32,
    },
    /// Shutdown was requested first.
    Cancelled,
}

/// Drives reconnect attempts under a [`BackoffPolicy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconnectSupervisor {
    policy: BackoffPolicy,
}

impl ReconnectSupervisor {
    /// Supervisor using `policy`.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy }
    }

    /// Waits `delay(n)` before attempt `n`, repeating until `connector` succeeds.
    ///
    /// Cancellation is checked during every wait and before every attempt.
    pub async fn reconnect<C>(&self, connector: &C, shutdown: &CancellationToken) -> ReconnectOutcome
    where
        C: Connector + ?Sized,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let delay = self.policy.delay(attempt);
            log::info!("Reconnecting in {:?} (attempt {})", delay, attempt);

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return ReconnectOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
            if shutdown.is_cancelled() {
                return ReconnectOutcome::Cancelled;
            }

            match connector.connect().await {
                Ok(()) => {
                    log::info!("Upstream reconnected after {} attempt(s)", attempt);
                    return ReconnectOutcome::Connected { attempts: attempt };
                }
                Err(e) => log::warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }
    }
}
