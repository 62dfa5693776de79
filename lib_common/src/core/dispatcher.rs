//! # Downstream Dispatcher
//!
//! The `Dispatcher` owns the client registry and is the only consumer of the event channel.
//! For every event it notifies the observers, encodes the record once and offers the same
//! `Bytes` buffer to every registered client.
//!
//! ## Fan-out rules
//!
//! 1.  **Zero-copy**: the encoded frame is a `Bytes`; each client gets a refcounted handle to
//!     the same allocation.
//! 2.  **Never blocks**: each offer is a `try_send`. A client whose queue is full loses that
//!     frame and only that frame; the other clients and the event channel are unaffected.
//! 3.  **Shared-lock iteration**: fan-out walks the registry under the read lock. Every offer
//!     is non-blocking, so the lock is never held across a wait, and once `unregister`
//!     returns no fan-out can still reach the removed client.
//! 4.  **Unregister closes**: removing a client also closes it, which stops its pumps and
//!     runs the session teardown.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::codec::Event;
use crate::core::connection::{ClientConnection, ClientId, Offer};
use crate::core::observer::ObserverSet;

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Clients the frame was offered to.
    pub attempted: usize,
    /// Clients whose queue accepted the frame.
    pub queued: usize,
    /// Clients whose queue was full.
    pub dropped: usize,
}

/// Client registry and event fan-out.
pub struct Dispatcher {
    clients: RwLock<HashMap<ClientId, Arc<ClientConnection>>>,
    observers: Arc<ObserverSet>,
}

impl Dispatcher {
    /// Creates an empty dispatcher that reports events to `observers`.
    pub fn new(observers: Arc<ObserverSet>) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            observers,
        }
    }

    /// Adds a client. Returns the new client count.
    pub fn register(&self, client: Arc<ClientConnection>) -> usize {
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        let id = client.id();
        clients.insert(id, client);
        log::info!("Client {} registered. Total clients: {}", id, clients.len());
        clients.len()
    }

    /// Removes and closes a client. Returns `false` if it was not registered, so repeated
    /// teardown is a no-op.
    pub fn unregister(&self, id: ClientId) -> bool {
        let removed = {
            let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
            clients.remove(&id).map(|client| (client, clients.len()))
        };
        match removed {
            Some((client, remaining)) => {
                client.close();
                log::info!(
                    "Client {} unregistered ({} frames dropped). Total clients: {}",
                    id,
                    client.dropped_frames(),
                    remaining
                );
                true
            }
            None => false,
        }
    }

    /// Number of registered clients.
    pub fn client_count(&self) -> usize {
        self.clients.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Offers one already-encoded frame to every registered client.
    pub fn offer_all(&self, frame: Bytes) -> FanoutReport {
        let clients = self.clients.read().unwrap_or_else(PoisonError::into_inner);

        let mut report = FanoutReport {
            attempted: clients.len(),
            ..FanoutReport::default()
        };
        for client in clients.values() {
            match client.offer(frame.clone()) {
                Offer::Queued => report.queued += 1,
                Offer::Dropped => {
                    report.dropped += 1;
                    log::debug!("Client {} queue full; frame dropped", client.id());
                }
                Offer::Closed => log::debug!("Client {} is closing; frame skipped", client.id()),
            }
        }
        report
    }

    /// Encodes `event` and fans it out.
    pub fn broadcast(&self, event: &Event) -> FanoutReport {
        match event.frame() {
            Ok(frame) => self.offer_all(frame),
            Err(e) => {
                log::error!("Failed to encode {} event on '{}': {}", event.kind, event.topic, e);
                FanoutReport::default()
            }
        }
    }

    /// Drains the event channel until it closes or `shutdown` fires.
    pub async fn run(&self, mut events: mpsc::Receiver<Arc<Event>>, shutdown: CancellationToken) {
        log::info!("Dispatcher started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = events.recv() => match next {
                    Some(event) => {
                        self.observers.notify_event(&event);
                        let report = self.broadcast(&event);
                        log::debug!(
                            "{} event fanned out to {}/{} clients",
                            event.kind,
                            report.queued,
                            report.attempted
                        );
                    }
                    None => break,
                },
            }
        }
        log::info!("Dispatcher stopped");
    }
}
