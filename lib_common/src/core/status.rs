//! # Connection State and Status
//!
//! `ConnectionState` is the upstream link's lifecycle, written only by the upstream subscriber.
//! `StatusValue` is the coarse, process-wide status observers see, written only by the
//! upstream manager. Both live in atomics so observers on other tasks never read a torn value.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

use crate::core::error::RelayError;

/// Lifecycle of the upstream link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// No link, not trying.
    Disconnected = 0,
    /// Dialing.
    Connecting = 1,
    /// Join request sent, waiting for the reply.
    Joined = 2,
    /// Join acknowledged, events flowing.
    Active = 3,
    /// Link lost, the supervisor is retrying.
    Reconnecting = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Joined,
            3 => ConnectionState::Active,
            4 => ConnectionState::Reconnecting,
            _ => ConnectionState::Disconnected,
        }
    }

    /// Whether a link is established (joined or active).
    pub fn is_linked(self) -> bool {
        matches!(self, ConnectionState::Joined | ConnectionState::Active)
    }
}

/// Atomic holder for the upstream [`ConnectionState`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    /// Starts in `Disconnected`.
    pub fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Disconnected as u8))
    }

    /// Current state.
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Unconditionally stores `next`, returning the previous state.
    pub fn set(&self, next: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(next as u8, Ordering::AcqRel))
    }

    /// Moves `from -> to` only if the current state is `from`.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves to `to` if the current state satisfies `accept`. Returns the state left.
    pub fn transition_if(
        &self,
        accept: impl Fn(ConnectionState) -> bool,
        to: ConnectionState,
    ) -> Option<ConnectionState> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                accept(ConnectionState::from_u8(current)).then_some(to as u8)
            })
            .ok()
            .map(ConnectionState::from_u8)
    }
}

/// Coarse relay status broadcast to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum StatusValue {
    /// Upstream link active.
    Connected = 0,
    /// Upstream down, fallback poller running.
    Polling = 1,
    /// Not connected and not recovering (startup or shutdown).
    Disconnected = 2,
}

impl StatusValue {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => StatusValue::Connected,
            1 => StatusValue::Polling,
            _ => StatusValue::Disconnected,
        }
    }

    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            StatusValue::Connected => "connected",
            StatusValue::Polling => "polling",
            StatusValue::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for StatusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic holder for the process-wide [`StatusValue`].
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCell {
    /// Starts in `Disconnected`.
    pub fn new() -> Self {
        Self(AtomicU8::new(StatusValue::Disconnected as u8))
    }

    /// Current status.
    pub fn get(&self) -> StatusValue {
        StatusValue::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Stores `next`; returns `true` when the value actually changed.
    pub fn set(&self, next: StatusValue) -> bool {
        self.0.swap(next as u8, Ordering::AcqRel) != next as u8
    }
}

/// Link notifications the upstream subscriber sends to the upstream manager.
#[derive(Debug)]
pub enum LinkEvent {
    /// The join was acknowledged; the link is `Active`.
    Up,
    /// The link was lost. Sent at most once per link.
    Down(RelayError),
}
