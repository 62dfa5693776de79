//! # Upstream Manager
//!
//! The coordinator for the upstream side of the relay. It consumes link notifications from
//! the subscriber and moves the process-wide status between `connected`, `polling` and
//! `disconnected`:
//!
//! - **Link up**: stop the fallback poller, status `connected`.
//! - **Link down**: start the fallback poller, status `polling`, then let the reconnect
//!   supervisor retry until a new link is up or the relay shuts down.
//! - **Shutdown**: stop the poller, status `disconnected`.
//!
//! Observers only hear about real changes; repeating a status is silent.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::observer::ObserverSet;
use crate::core::poller::FallbackPoller;
use crate::core::status::{LinkEvent, StatusCell, StatusValue};
use crate::core::supervisor::{Connector, ReconnectOutcome, ReconnectSupervisor};

/// Owns the relay status, the fallback poller and the reconnect cycle.
pub struct UpstreamManager<C: Connector> {
    connector: Arc<C>,
    supervisor: ReconnectSupervisor,
    poller: FallbackPoller,
    status: Arc<StatusCell>,
    observers: Arc<ObserverSet>,
    shutdown: CancellationToken,
}

impl<C: Connector> UpstreamManager<C> {
    /// Creates a manager in `disconnected` status.
    pub fn new(
        connector: Arc<C>,
        supervisor: ReconnectSupervisor,
        poll_interval: Duration,
        observers: Arc<ObserverSet>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            connector,
            supervisor,
            poller: FallbackPoller::new(poll_interval, &shutdown),
            status: Arc::new(StatusCell::new()),
            observers,
            shutdown,
        }
    }

    /// Current relay status.
    pub fn status(&self) -> StatusValue {
        self.status.get()
    }

    /// Shared handle to the status, for the health endpoint.
    pub fn status_handle(&self) -> Arc<StatusCell> {
        Arc::clone(&self.status)
    }

    /// The fallback poller.
    pub fn poller(&self) -> &FallbackPoller {
        &self.poller
    }

    /// Requests shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Connects, then follows link notifications until shutdown or until the subscriber
    /// goes away.
    pub async fn run(&self, mut links: mpsc::UnboundedReceiver<LinkEvent>) {
        log::info!("Upstream manager started");
        if let Err(e) = self.connector.connect().await {
            log::warn!("Initial upstream connection failed: {}", e);
            self.recover().await;
        }

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                link = links.recv() => match link {
                    Some(LinkEvent::Up) => {
                        if self.poller.deactivate() {
                            log::info!("Upstream is back; fallback polling stopped");
                        }
                        self.set_status(StatusValue::Connected);
                    }
                    Some(LinkEvent::Down(e)) => {
                        log::warn!("Upstream link lost: {}", e);
                        self.recover().await;
                    }
                    None => break,
                },
            }
        }

        self.poller.deactivate();
        self.set_status(StatusValue::Disconnected);
        log::info!("Upstream manager stopped");
    }

    async fn recover(&self) {
        self.poller.activate();
        self.set_status(StatusValue::Polling);
        if self.supervisor.reconnect(&*self.connector, &self.shutdown).await
            == ReconnectOutcome::Cancelled
        {
            log::info!("Reconnect abandoned: shutting down");
        }
    }

    fn set_status(&self, status: StatusValue) {
        if self.status.set(status) {
            log::info!("Relay status: {}", status);
            self.observers.notify_status(status);
        }
    }
}
