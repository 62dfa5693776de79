use crate::relay_logic::config::Config;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use futures_util::{future, SinkExt, StreamExt};
use lib_common::core::{Dispatcher, PeerDirectory, Session, SessionConfig, StatusValue, WsFrame};
use lib_common::core::status::StatusCell;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Grace period for open TLS connections once shutdown starts.
const TLS_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub peers: Arc<dyn PeerDirectory>,
    pub status: Arc<StatusCell>,
    pub session_config: SessionConfig,
    pub max_message_bytes: usize,
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

pub async fn run(config: Config, state: AppState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port()));

    if let Some((cert_path, key_path)) = config.tls_paths() {
        let tls_config = RustlsConfig::from_pem_file(&cert_path, &key_path)
            .await
            .with_context(|| format!("Failed to load TLS configuration from {}", cert_path.display()))?;

        let handle = axum_server::Handle::new();
        let graceful = handle.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            log::info!("Downstream server shutting down.");
            graceful.graceful_shutdown(Some(TLS_SHUTDOWN_GRACE));
        });

        log::info!("Downstream server listening on wss://{}", addr);
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .context("TLS server failed")?;
    } else {
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        log::info!("Downstream server listening on ws://{}", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                log::info!("Downstream server shutting down.");
            })
            .await
            .context("Server failed")?;
    }
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let upstream: StatusValue = state.status.get();
    Json(json!({
        "status": "ok",
        "upstream": upstream,
        "clients": state.dispatcher.client_count(),
    }))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (session, outbound) = Session::open(
        state.dispatcher.clone(),
        state.peers.clone(),
        state.session_config,
        &state.shutdown,
    );
    let id = session.connection().id();
    log::info!("Client {} connected", id);

    let (write, read) = socket.split();
    let sink = Box::pin(write.with(|frame: WsFrame| future::ready(Ok::<_, axum::Error>(to_message(frame)))));
    let stream = read.map(|message| message.map(from_message));

    session.run(outbound, stream, sink).await;
    log::info!("Client {} disconnected", id);
}

fn to_message(frame: WsFrame) -> Message {
    match frame {
        WsFrame::Text(text) => Message::Text(text.into()),
        WsFrame::Binary(data) => Message::Binary(data.into()),
        WsFrame::Ping(data) => Message::Ping(data.into()),
        WsFrame::Pong(data) => Message::Pong(data.into()),
        WsFrame::Close => Message::Close(None),
    }
}

fn from_message(message: Message) -> WsFrame {
    match message {
        Message::Text(text) => WsFrame::Text(text.as_str().to_owned()),
        Message::Binary(data) => WsFrame::Binary(data.to_vec()),
        Message::Ping(data) => WsFrame::Ping(data.to_vec()),
        Message::Pong(data) => WsFrame::Pong(data.to_vec()),
        Message::Close(_) => WsFrame::Close,
    }
}
