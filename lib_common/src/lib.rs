//! Change-feed relay engine.
//!
//! Modules are feature-gated: `core` carries the transport-independent engine, `ingestors`
//! adds the tokio-tungstenite upstream subscriber.

#![forbid(unsafe_code)]

#[cfg(feature = "core")]
pub mod core;

#[cfg(feature = "ingestors")]
pub mod ingestors;
