//! # Core Relay Engine
//!
//! Everything between the upstream link and the downstream sockets, independent of any
//! concrete transport.
//!
//! ## Core Components:
//!
//! - **`codec`**: the upstream channel envelope, the downstream command set and the
//!   newline batching of outbound frames.
//!
//! - **`dispatcher`**: the client registry and the zero-copy fan-out. The only consumer of
//!   the event channel.
//!
//! - **`session`**: the inbound and outbound pumps of one downstream client, with liveness
//!   probing and exactly-once teardown.
//!
//! - **`upstream_manager`**: the status owner. It reacts to link loss by starting the
//!   `poller` and handing the link to the reconnect `supervisor`.
//!
//! The transports themselves live elsewhere: the upstream dialer in `crate::ingestors`, the
//! downstream HTTP/WebSocket server in the `servers` crate.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Exponential reconnect delays.
pub mod backoff;
/// Wire formats for both sides of the relay.
pub mod codec;
/// Per-client queue, identity and close flag.
pub mod connection;
/// Client registry and event fan-out.
pub mod dispatcher;
/// The relay error type.
pub mod error;
/// Injected status and event observers.
pub mod observer;
/// Presence tracking collaborator.
pub mod peers;
/// Placeholder loop run while the upstream is down.
pub mod poller;
/// Per-client read and write pumps.
pub mod session;
/// Link state and relay status.
pub mod status;
/// Backoff-driven reconnect loop.
pub mod supervisor;
/// Status owner and outage handling.
pub mod upstream_manager;

// --- Public API Re-exports ---
pub use backoff::BackoffPolicy;
pub use codec::{ChangeFilter, ChangeKind, Event, WsFrame};
pub use connection::{ClientConnection, ClientId, Offer};
pub use dispatcher::{Dispatcher, FanoutReport};
pub use error::RelayError;
pub use observer::{ObserverSet, RelayObserver};
pub use peers::{NoopPeerDirectory, PeerDirectory};
pub use poller::FallbackPoller;
pub use session::{CloseReason, Session, SessionConfig};
pub use status::{ConnectionState, LinkEvent, StatusValue};
pub use supervisor::{Connector, ReconnectOutcome, ReconnectSupervisor};
pub use upstream_manager::UpstreamManager;

/// Shortest period any relay timer runs at. Tokio intervals reject a zero period.
pub const MIN_TIMER_PERIOD: std::time::Duration = std::time::Duration::from_millis(10);

/// `period`, raised to [`MIN_TIMER_PERIOD`] when shorter.
pub(crate) fn timer_period(period: std::time::Duration) -> std::time::Duration {
    period.max(MIN_TIMER_PERIOD)
}
