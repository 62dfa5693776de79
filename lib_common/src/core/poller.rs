//! # Fallback Poller
//!
//! Keeps a low-frequency loop alive while the upstream link is down. At most one loop runs
//! at a time: `activate` while active and `deactivate` while inactive are no-ops.
//!
//! The loop itself only ticks. Nothing is fetched yet, so the relay delivers no events while
//! it is in `polling` status. The tick counter feeds the debug log and tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::timer_period;

/// Default poll cadence.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Single-instance polling loop used during upstream outages.
#[derive(Debug)]
pub struct FallbackPoller {
    interval: Duration,
    shutdown: CancellationToken,
    running: Mutex<Option<CancellationToken>>,
    activations: AtomicU64,
    deactivations: AtomicU64,
    ticks: Arc<AtomicU64>,
}

impl FallbackPoller {
    /// Creates an inactive poller. Its loop also stops when `shutdown` is cancelled.
    ///
    /// Intervals below [`MIN_TIMER_PERIOD`](crate::core::MIN_TIMER_PERIOD) are raised to it.
    pub fn new(interval: Duration, shutdown: &CancellationToken) -> Self {
        Self {
            interval: timer_period(interval),
            shutdown: shutdown.clone(),
            running: Mutex::new(None),
            activations: AtomicU64::new(0),
            deactivations: AtomicU64::new(0),
            ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Starts the loop. Returns `false` if it was already running.
    pub fn activate(&self) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return false;
        }
        let stop = self.shutdown.child_token();
        *running = Some(stop.clone());
        self.activations.fetch_add(1, Ordering::Relaxed);

        let period = self.interval;
        let ticks = Arc::clone(&self.ticks);
        tokio::spawn(async move {
            log::info!("Fallback polling started (every {:?})", period);
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let n = ticks.fetch_add(1, Ordering::Relaxed) + 1;
                        log::debug!("Fallback poll #{} (no poll source configured)", n);
                    }
                }
            }
            log::info!("Fallback polling stopped");
        });
        true
    }

    /// Stops the loop. Returns `false` if it was not running.
    pub fn deactivate(&self) -> bool {
        let stop = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match stop {
            Some(stop) => {
                stop.cancel();
                self.deactivations.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Whether the loop is running.
    pub fn is_active(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// How many times the loop was started.
    pub fn activations(&self) -> u64 {
        self.activations.load(Ordering::Relaxed)
    }

    /// How many times the loop was stopped.
    pub fn deactivations(&self) -> u64 {
        self.deactivations.load(Ordering::Relaxed)
    }

    /// Ticks across all runs.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}
