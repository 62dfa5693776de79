//! # Relay Errors
//!
//! One error type for the whole engine. A failure is always local to one upstream link or one
//! downstream connection: the caller either retries (upstream) or tears the connection down
//! (downstream). Nothing here is fatal to the process.
//!
//! Per-client backpressure is not an error: a full outbound queue is reported through
//! [`crate::core::connection::Offer::Dropped`], never as an error.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the relay engine.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Dial or handshake failure. Retried by the reconnect supervisor.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A frame that could not be interpreted. The frame is discarded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON encode/decode failure, a flavour of protocol error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A heartbeat or liveness deadline was missed.
    #[error("Liveness deadline of {0:?} missed")]
    LivenessTimeout(Duration),

    /// Read or write failure on an established transport.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An external collaborator (peer directory) call failed.
    #[error("Collaborator call failed: {0}")]
    Collaborator(String),

    /// The relay is shutting down; no new work is started.
    #[error("Relay is shutting down")]
    Shutdown,
}
