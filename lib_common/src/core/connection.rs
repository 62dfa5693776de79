//! # Client Connection
//!
//! One `ClientConnection` per downstream peer. It owns the sending half of the peer's bounded
//! outbound queue, the optional peer identity, liveness bookkeeping and the close flag that
//! makes teardown happen exactly once. The pumps that move bytes live in
//! [`crate::core::session`].

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Default outbound queue capacity per client.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque client handle used as the registry key.
pub type ClientId = u64;

/// Session lifecycle: `Accepted -> Active -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Transport accepted, pumps not started.
    Accepted = 0,
    /// Pumps running.
    Active = 1,
    /// Torn down. Terminal.
    Closed = 2,
}

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// The frame is in the queue.
    Queued,
    /// The queue was full; the frame was dropped for this client only.
    Dropped,
    /// The connection is gone.
    Closed,
}

/// A downstream peer.
pub struct ClientConnection {
    id: ClientId,
    outbound: mpsc::Sender<Bytes>,
    identity: RwLock<Option<String>>,
    last_liveness_at: Mutex<Instant>,
    state: AtomicU8,
    closed: AtomicBool,
    cancel: CancellationToken,
    dropped: AtomicU64,
}

impl ClientConnection {
    /// Creates a connection with an outbound queue of `capacity` frames.
    ///
    /// Returns the receiving half of the queue, which belongs to the outbound pump. The
    /// connection's cancellation is a child of `shutdown`, so cancelling `shutdown` unblocks
    /// both pumps.
    pub fn new(capacity: usize, shutdown: &CancellationToken) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let connection = Arc::new(Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            outbound: tx,
            identity: RwLock::new(None),
            last_liveness_at: Mutex::new(Instant::now()),
            state: AtomicU8::new(SessionState::Accepted as u8),
            closed: AtomicBool::new(false),
            cancel: shutdown.child_token(),
            dropped: AtomicU64::new(0),
        });
        (connection, rx)
    }

    /// Registry key.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Non-blocking enqueue onto the outbound queue.
    ///
    /// A full queue drops the frame for this client and bumps its drop counter.
    pub fn offer(&self, frame: Bytes) -> Offer {
        match self.outbound.try_send(frame) {
            Ok(()) => Offer::Queued,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Offer::Dropped
            }
            Err(TrySendError::Closed(_)) => Offer::Closed,
        }
    }

    /// Frames dropped because the queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// The bound peer identity, if a `subscribe` was received.
    pub fn identity(&self) -> Option<String> {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Binds (or rebinds) the peer identity. Returns the previous one.
    pub fn bind_identity(&self, identity: String) -> Option<String> {
        self.identity
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(identity)
    }

    /// Records a liveness acknowledgment from the peer.
    pub fn touch(&self) {
        *self
            .last_liveness_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// When the peer last answered a liveness ping (or connected).
    pub fn last_liveness_at(&self) -> Instant {
        *self
            .last_liveness_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::Acquire) {
            0 => SessionState::Accepted,
            1 => SessionState::Active,
            _ => SessionState::Closed,
        }
    }

    /// `Accepted -> Active`. Returns `false` if the connection is no longer `Accepted`.
    pub fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Accepted as u8,
                SessionState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Marks the connection closed and cancels its pumps.
    ///
    /// Only the first call returns `true`; later calls are no-ops.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.state.store(SessionState::Closed as u8, Ordering::Release);
        self.cancel.cancel();
        true
    }

    /// Whether teardown has happened.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves when the connection is closed or the relay shuts down.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("identity", &self.identity())
            .field("state", &self.state())
            .field("dropped", &self.dropped_frames())
            .finish()
    }
}
