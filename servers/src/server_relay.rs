mod relay_logic;

use anyhow::{Context, Result};
use lib_common::core::{
    Dispatcher, NoopPeerDirectory, ObserverSet, PeerDirectory, ReconnectSupervisor, RelayObserver,
    StatusValue, UpstreamManager,
};
use lib_common::core::codec::Event;
use lib_common::ingestors::{TungsteniteDialer, UpstreamSubscriber};
use relay_logic::{config, downstream, logger, peer_directory};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

/// How long shutdown waits for the relay tasks to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

struct LogObserver;

impl RelayObserver for LogObserver {
    fn on_status_change(&self, status: StatusValue) {
        log::debug!("Observed status change to {}", status);
    }

    fn on_event(&self, event: &Event) {
        log::debug!("{} on '{}': {:?}", event.kind, event.topic, event.record);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    dotenvy::dotenv().ok();
    let config = config::load_config();
    logger::setup_logging(&config.log_dir(), &config.log_level())?;
    config.validate().context("Invalid configuration")?;

    log::info!("Relay server starting...");

    let realtime = config.realtime_config()?;

    let shutdown = CancellationToken::new();
    let observers = Arc::new(ObserverSet::new());
    observers.register(Arc::new(LogObserver));
    let dispatcher = Arc::new(Dispatcher::new(observers.clone()));

    let peers: Arc<dyn PeerDirectory> = match config.peer_directory() {
        Some((base_url, api_key)) => Arc::new(peer_directory::RestPeerDirectory::new(
            base_url,
            api_key,
            peer_directory::REQUEST_TIMEOUT,
        )?),
        None => {
            log::info!("Peer directory disabled");
            Arc::new(NoopPeerDirectory)
        }
    };

    let (events_tx, events_rx) = mpsc::channel(config.event_channel_capacity());
    let (subscriber, links) = UpstreamSubscriber::new(realtime, TungsteniteDialer, events_tx, shutdown.clone());
    log::info!(
        "Following '{}' at {}",
        subscriber.config().topic,
        subscriber.config().redacted_endpoint()
    );
    let manager = Arc::new(UpstreamManager::new(
        Arc::new(subscriber),
        ReconnectSupervisor::new(config.backoff_policy()),
        config.poll_interval(),
        observers,
        shutdown.clone(),
    ));

    let dispatcher_task = {
        let dispatcher = dispatcher.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { dispatcher.run(events_rx, shutdown).await })
    };
    let manager_task = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run(links).await })
    };

    let app_state = downstream::AppState {
        dispatcher,
        peers,
        status: manager.status_handle(),
        session_config: config.session_config(),
        max_message_bytes: config.max_message_bytes(),
        shutdown: shutdown.clone(),
    };
    let mut server_task = tokio::spawn(downstream::run(config.clone(), app_state));

    let server_finished = tokio::select! {
        _ = shutdown_signal() => {
            log::info!("Shutdown signal received, stopping relay.");
            false
        }
        result = &mut server_task => {
            match result {
                Ok(Ok(())) => log::warn!("Downstream server stopped unexpectedly"),
                Ok(Err(e)) => log::error!("Downstream server failed: {:#}", e),
                Err(e) => log::error!("Downstream server task panicked: {}", e),
            }
            true
        }
    };

    shutdown.cancel();

    let drain = async {
        if !server_finished {
            if let Some(Err(e)) = joined("Downstream server", server_task.await) {
                log::error!("Downstream server failed during shutdown: {:#}", e);
            }
        }
        let (dispatcher_result, manager_result) = tokio::join!(dispatcher_task, manager_task);
        joined("Dispatcher", dispatcher_result);
        joined("Upstream manager", manager_result);
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        log::warn!("Timed out waiting for relay tasks to stop");
    }

    log::info!("Relay server shut down.");
    Ok(())
}

/// Unwraps a finished task, logging it if it panicked or was cancelled.
fn joined<T>(task: &str, result: Result<T, JoinError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) if e.is_panic() => {
            log::error!("{} task panicked: {}", task, e);
            None
        }
        Err(e) => {
            log::warn!("{} task did not finish: {}", task, e);
            None
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("Received Ctrl+C"),
        _ = terminate => log::info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn joined_surfaces_panics_instead_of_dropping_them() {
        let finished = tokio::spawn(async { 7 });
        assert_eq!(joined("finished", finished.await), Some(7));

        let panicked = tokio::spawn(async {
            let fail = true;
            if fail {
                panic!("dispatcher blew up");
            }
        });
        assert!(joined("panicked", panicked.await).is_none());

        let aborted = tokio::spawn(std::future::pending::<()>());
        aborted.abort();
        assert!(joined("aborted", aborted.await).is_none());
    }
}
