//! # Upstream Ingestors
//!
//! The "front door" of the relay: clients for the upstream change feed.
//!
//! - **`dialer`**: opens the upstream WebSocket (tokio-tungstenite) behind a trait so the
//!   subscriber can be driven over in-memory channels in tests.
//! - **`realtime_wss`**: the change-feed subscriber. Joins the channel topic, keeps the link
//!   alive with heartbeats and turns change notifications into events.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Upstream transport abstraction.
pub mod dialer;
/// The realtime change-feed subscriber.
pub mod realtime_wss;

// --- Public API Re-exports ---
pub use dialer::{FrameSink, FrameStream, TungsteniteDialer, UpstreamDialer};
pub use realtime_wss::{RealtimeConfig, UpstreamSubscriber};
