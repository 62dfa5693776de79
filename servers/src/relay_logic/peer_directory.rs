//! REST-backed peer directory.
//!
//! Presence rows live in the `websocket_connections` table behind the project's REST API.
//! Every request carries the API key twice, as `apikey` and as a bearer token.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lib_common::core::{PeerDirectory, RelayError};
use reqwest::{Client, RequestBuilder};
use serde::Serialize;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const TABLE_PATH: &str = "rest/v1/websocket_connections";

#[derive(Serialize, Debug, PartialEq)]
struct PeerRow<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    machine_id: Option<&'a str>,
    is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_ping_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    connected_at: Option<String>,
}

pub struct RestPeerDirectory {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl RestPeerDirectory {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build the peer directory HTTP client")?;
        Ok(Self {
            client,
            endpoint: table_endpoint(base_url),
            api_key: api_key.to_string(),
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }

    fn patch(&self, identity: &str) -> RequestBuilder {
        self.authorized(self.client.patch(&self.endpoint))
            .query(&[("machine_id", format!("eq.{}", identity))])
    }

    async fn send(&self, request: RequestBuilder, what: &str, identity: &str) -> Result<(), RelayError> {
        let response = request
            .send()
            .await
            .map_err(|e| RelayError::Collaborator(format!("{} for '{}': {}", what, identity, e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Collaborator(format!(
                "{} for '{}' returned {}: {}",
                what, identity, status, body
            )));
        }
        log::debug!("{} for '{}' succeeded", what, identity);
        Ok(())
    }
}

fn table_endpoint(base_url: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), TABLE_PATH)
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[async_trait]
impl PeerDirectory for RestPeerDirectory {
    async fn mark_peer_active(&self, identity: &str) -> Result<(), RelayError> {
        let stamp = now();
        let row = PeerRow {
            machine_id: Some(identity),
            is_active: true,
            last_ping_at: Some(stamp.clone()),
            connected_at: Some(stamp),
        };
        let request = self
            .authorized(self.client.post(&self.endpoint))
            .header("Prefer", "resolution=merge-duplicates")
            .json(&row);
        self.send(request, "Peer upsert", identity).await
    }

    async fn refresh_peer_liveness(&self, identity: &str) -> Result<(), RelayError> {
        let row = PeerRow {
            machine_id: None,
            is_active: true,
            last_ping_at: Some(now()),
            connected_at: None,
        };
        self.send(self.patch(identity).json(&row), "Peer refresh", identity).await
    }

    async fn mark_peer_inactive(&self, identity: &str) -> Result<(), RelayError> {
        let row = PeerRow {
            machine_id: None,
            is_active: false,
            last_ping_at: None,
            connected_at: None,
        };
        self.send(self.patch(identity).json(&row), "Peer deactivation", identity).await
    }
}
