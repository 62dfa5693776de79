//! # Wire Codec
//!
//! Stateless encoding and decoding for both sides of the relay:
//!
//! - **Upstream**: the Phoenix channel envelope `{event, topic, payload, ref}` used by the
//!   realtime change feed (`phx_join`, `heartbeat`, `phx_reply`, `phx_error`,
//!   `postgres_changes`).
//! - **Downstream**: the small JSON command set clients send (`subscribe`, `ping`) and the
//!   replies the relay sends back (`subscribed`, `pong`).
//! - **Batching**: several queued downstream messages are coalesced into one transport frame,
//!   newline-delimited, so a consumer must split every frame on `\n`.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

use crate::core::error::RelayError;

/// Channel join request.
pub const EVENT_JOIN: &str = "phx_join";
/// Acknowledgment of a join or heartbeat.
pub const EVENT_REPLY: &str = "phx_reply";
/// Channel-level error pushed by the upstream.
pub const EVENT_ERROR: &str = "phx_error";
/// Keepalive sent on the `phoenix` topic.
pub const EVENT_HEARTBEAT: &str = "heartbeat";
/// A database change notification.
pub const EVENT_CHANGES: &str = "postgres_changes";
/// Topic heartbeats are sent on.
pub const HEARTBEAT_TOPIC: &str = "phoenix";

/// Transport-neutral WebSocket frame.
///
/// Both the upstream dialer (tokio-tungstenite) and the downstream server (axum) map their
/// own message types onto this, which keeps the pumps testable over in-memory channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsFrame {
    /// UTF-8 application frame.
    Text(String),
    /// Binary application frame.
    Binary(Vec<u8>),
    /// Transport-level liveness ping.
    Ping(Vec<u8>),
    /// Acknowledgment of a liveness ping.
    Pong(Vec<u8>),
    /// Close handshake.
    Close,
}

/// The Phoenix channel envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name, e.g. `phx_join` or `postgres_changes`.
    pub event: String,
    /// Channel topic. Absent on some server pushes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Event payload.
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Correlation token. Servers send it as a string, a number or `null`.
    #[serde(
        default,
        rename = "ref",
        deserialize_with = "ref_as_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub reference: Option<String>,
}

fn ref_as_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

impl Envelope {
    /// `payload.status` of a `phx_reply`, if present.
    pub fn reply_status(&self) -> Option<&str> {
        self.payload.get("status").and_then(Value::as_str)
    }
}

/// Which row operations a change subscription listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Row inserts.
    #[serde(rename = "INSERT")]
    Insert,
    /// Row updates.
    #[serde(rename = "UPDATE")]
    Update,
    /// Row deletes.
    #[serde(rename = "DELETE")]
    Delete,
    /// Every operation.
    #[serde(rename = "*")]
    All,
}

impl std::str::FromStr for ChangeKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Ok(ChangeKind::Insert),
            "UPDATE" => Ok(ChangeKind::Update),
            "DELETE" => Ok(ChangeKind::Delete),
            "*" | "ALL" => Ok(ChangeKind::All),
            other => Err(RelayError::Protocol(format!("unknown change kind '{}'", other))),
        }
    }
}

/// One entry of `payload.config.postgres_changes` in a join request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFilter {
    /// Row operation to listen to.
    pub event: ChangeKind,
    /// Database schema.
    pub schema: String,
    /// Table name.
    pub table: String,
    /// Optional row filter such as `machine_id=eq.host-1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl ChangeFilter {
    /// Subscription to `kind` changes on `schema.table`.
    pub fn new(kind: ChangeKind, schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            event: kind,
            schema: schema.into(),
            table: table.into(),
            filter: None,
        }
    }

    /// Restricts the subscription with a row filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// Encodes the `phx_join` request for `topic`.
pub fn encode_join(topic: &str, changes: &[ChangeFilter], reference: &str) -> Result<String, RelayError> {
    let envelope = Envelope {
        event: EVENT_JOIN.to_string(),
        topic: Some(topic.to_string()),
        payload: into_map(json!({ "config": { "postgres_changes": changes } })),
        reference: Some(reference.to_string()),
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Encodes a `heartbeat` on the `phoenix` topic.
pub fn encode_heartbeat(reference: &str) -> Result<String, RelayError> {
    let envelope = Envelope {
        event: EVENT_HEARTBEAT.to_string(),
        topic: Some(HEARTBEAT_TOPIC.to_string()),
        payload: Map::new(),
        reference: Some(reference.to_string()),
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Reference token for heartbeats: the current Unix time in milliseconds.
pub fn heartbeat_ref() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
        .to_string()
}

/// Decodes one upstream text frame.
pub fn decode_envelope(text: &str) -> Result<Envelope, RelayError> {
    Ok(serde_json::from_str(text)?)
}

fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// A decoded change event. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Topic the change arrived on.
    pub topic: String,
    /// Row operation (`INSERT`, `UPDATE`, ...), `UNKNOWN` when the feed omits it.
    pub kind: String,
    /// The changed row.
    pub record: Map<String, Value>,
    /// When the relay decoded the frame.
    pub received_at: DateTime<Utc>,
}

impl Event {
    /// Builds an event from a `postgres_changes` envelope.
    ///
    /// The record is read from `payload.record`, falling back to `payload.data.record` which
    /// newer feeds use. Returns `None` when the payload carries no record object.
    pub fn from_envelope(envelope: &Envelope, received_at: DateTime<Utc>) -> Option<Self> {
        let data = envelope.payload.get("data").and_then(Value::as_object);
        let record = envelope
            .payload
            .get("record")
            .or_else(|| data.and_then(|d| d.get("record")))
            .and_then(Value::as_object)?
            .clone();

        let kind = ["type", "eventType"]
            .iter()
            .find_map(|key| {
                envelope
                    .payload
                    .get(*key)
                    .or_else(|| data.and_then(|d| d.get(*key)))
                    .and_then(Value::as_str)
            })
            .unwrap_or("UNKNOWN")
            .to_string();

        Some(Self {
            topic: envelope.topic.clone().unwrap_or_default(),
            kind,
            record,
            received_at,
        })
    }

    /// The downstream frame for this event: the record as compact JSON.
    pub fn frame(&self) -> Result<Bytes, RelayError> {
        Ok(Bytes::from(serde_json::to_vec(&self.record)?))
    }
}

/// Commands a downstream client can send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientCommand {
    /// Binds the connection to a peer identity.
    Subscribe {
        /// Peer id. Older agents send it as `machine_id`.
        #[serde(alias = "machine_id")]
        identity: String,
    },
    /// Application-level keepalive.
    Ping,
}

/// Decodes one downstream command.
pub fn decode_command(text: &str) -> Result<ClientCommand, RelayError> {
    Ok(serde_json::from_str(text)?)
}

/// Replies the relay sends to a downstream client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerReply {
    /// Acknowledges a `subscribe`.
    Subscribed {
        /// Always `ok`.
        status: String,
        /// The identity now bound to the connection.
        identity: String,
    },
    /// Answers a `ping`.
    Pong {
        /// Always `ok`.
        status: String,
    },
}

impl ServerReply {
    /// `{"type":"subscribed","status":"ok","identity":...}`
    pub fn subscribed(identity: impl Into<String>) -> Self {
        ServerReply::Subscribed {
            status: "ok".to_string(),
            identity: identity.into(),
        }
    }

    /// `{"type":"pong","status":"ok"}`
    pub fn pong() -> Self {
        ServerReply::Pong {
            status: "ok".to_string(),
        }
    }

    /// Serialized reply ready for an outbound queue.
    pub fn frame(&self) -> Result<Bytes, RelayError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// Joins queued messages into one newline-delimited frame, preserving order.
pub fn coalesce(batch: &[Bytes]) -> Bytes {
    match batch {
        [] => Bytes::new(),
        [single] => single.clone(),
        _ => {
            let len = batch.iter().map(Bytes::len).sum::<usize>() + batch.len() - 1;
            let mut buf = BytesMut::with_capacity(len);
            for (i, message) in batch.iter().enumerate() {
                if i > 0 {
                    buf.put_u8(b'\n');
                }
                buf.extend_from_slice(message);
            }
            buf.freeze()
        }
    }
}

/// Turns a coalesced payload into a text frame, or a binary one if it is not UTF-8.
pub fn text_frame(payload: Bytes) -> WsFrame {
    match String::from_utf8(payload.to_vec()) {
        Ok(text) => WsFrame::Text(text),
        Err(e) => WsFrame::Binary(e.into_bytes()),
    }
}
