//! # Peer Directory
//!
//! The external record of which downstream peers are connected and when they were last seen.
//! Sessions call it fire-and-forget: a failed call is logged and never affects the client.

use async_trait::async_trait;

use crate::core::error::RelayError;

/// Collaborator that tracks peer presence.
#[async_trait]
pub trait PeerDirectory: Send + Sync + 'static {
    /// Records that `identity` is connected (called on `subscribe`).
    async fn mark_peer_active(&self, identity: &str) -> Result<(), RelayError>;

    /// Refreshes the last-seen time of `identity` (called on `ping`).
    async fn refresh_peer_liveness(&self, identity: &str) -> Result<(), RelayError>;

    /// Records that `identity` went away (called on teardown).
    async fn mark_peer_inactive(&self, _identity: &str) -> Result<(), RelayError> {
        Ok(())
    }
}

/// Directory that accepts every call and records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPeerDirectory;

#[async_trait]
impl PeerDirectory for NoopPeerDirectory {
    async fn mark_peer_active(&self, identity: &str) -> Result<(), RelayError> {
        log::debug!("Peer '{}' active (no directory configured)", identity);
        Ok(())
    }

    async fn refresh_peer_liveness(&self, _identity: &str) -> Result<(), RelayError> {
        Ok(())
    }
}
