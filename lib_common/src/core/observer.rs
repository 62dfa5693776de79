//! # Relay Observers
//!
//! Injected observability for the relay. Anything that wants to follow status changes or see
//! every relayed event implements [`RelayObserver`] and registers it on an [`ObserverSet`].
//!
//! Each registered observer gets its own task fed by its own channel, so observers run
//! concurrently and independently of each other (a slow or panicking observer never holds up
//! another one), while a single observer still sees notifications in the order they were
//! raised.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;

use crate::core::codec::Event;
use crate::core::status::StatusValue;

/// Receives relay notifications. Both methods default to no-ops.
pub trait RelayObserver: Send + Sync + 'static {
    /// Called when the relay status changes class.
    fn on_status_change(&self, _status: StatusValue) {}

    /// Called for every event decoded from the upstream.
    fn on_event(&self, _event: &Event) {}
}

#[derive(Debug, Clone)]
enum Notification {
    Status(StatusValue),
    Event(Arc<Event>),
}

/// The set of registered observers.
#[derive(Default)]
pub struct ObserverSet {
    senders: RwLock<Vec<mpsc::UnboundedSender<Notification>>>,
}

impl ObserverSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer and starts its delivery task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn register(&self, observer: Arc<dyn RelayObserver>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                match notification {
                    Notification::Status(status) => observer.on_status_change(status),
                    Notification::Event(event) => observer.on_event(&event),
                }
            }
        });
        self.senders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.senders.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no observer is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Notifies every observer of a status change.
    pub fn notify_status(&self, status: StatusValue) {
        self.fan_out(Notification::Status(status));
    }

    /// Notifies every observer of an event.
    pub fn notify_event(&self, event: &Arc<Event>) {
        self.fan_out(Notification::Event(Arc::clone(event)));
    }

    fn fan_out(&self, notification: Notification) {
        let senders = self.senders.read().unwrap_or_else(PoisonError::into_inner);
        for tx in senders.iter() {
            if tx.send(notification.clone()).is_err() {
                log::debug!("Observer task is gone; skipping notification");
            }
        }
    }
}
