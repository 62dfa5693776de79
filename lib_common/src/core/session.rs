//! # Client Session
//!
//! Drives one downstream connection with two concurrent pumps:
//!
//! - **Inbound**: reads client frames under a liveness deadline. A transport pong pushes the
//!   deadline forward; text frames carry the `subscribe`/`ping` commands. A missed deadline,
//!   a read error or a close from the peer tears the session down.
//! - **Outbound**: drains the client's bounded queue, coalescing everything already waiting
//!   into one newline-delimited frame, and sends a transport ping once `ping_period` passes
//!   without an outbound frame. Every write has its own deadline.
//!
//! Teardown runs exactly once, whether a pump fails first or the dispatcher unregisters the
//! client: the client leaves the dispatcher, both pumps stop, the transport is closed and the
//! peer directory is told the identity went away.
//!
//! The pumps are generic over a `Stream` of [`WsFrame`] results and a `Sink` of [`WsFrame`],
//! so the axum server and the tests drive the same code.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::codec::{coalesce, decode_command, text_frame, ClientCommand, ServerReply, WsFrame};
use crate::core::connection::{ClientConnection, Offer, DEFAULT_QUEUE_CAPACITY};
use crate::core::dispatcher::Dispatcher;
use crate::core::error::RelayError;
use crate::core::peers::PeerDirectory;
use crate::core::timer_period;

/// Shortest liveness window [`SessionConfig::with_pong_wait`] accepts.
pub const MIN_PONG_WAIT: Duration = Duration::from_secs(1);

/// Downstream timing and sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Deadline for a single outbound write.
    pub write_timeout: Duration,
    /// How long the peer may stay silent before the session is closed.
    pub pong_wait: Duration,
    /// Transport ping cadence. Must be shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Outbound queue capacity.
    pub queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(10),
            pong_wait: Duration::from_secs(60),
            ping_period: Duration::from_secs(54),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl SessionConfig {
    /// Sets `pong_wait` and derives `ping_period` as nine tenths of it.
    ///
    /// `pong_wait` is raised to [`MIN_PONG_WAIT`] when shorter.
    pub fn with_pong_wait(mut self, pong_wait: Duration) -> Self {
        let pong_wait = pong_wait.max(MIN_PONG_WAIT);
        self.pong_wait = pong_wait;
        self.ping_period = pong_wait * 9 / 10;
        self
    }
}

/// Why a session ended.
#[derive(Debug, Error)]
pub enum CloseReason {
    /// The peer closed the transport.
    #[error("peer closed the connection")]
    PeerClosed,
    /// The relay closed the connection: shutdown or explicit unregistration.
    #[error("closed by the relay")]
    Closed,
    /// A read, write or liveness failure.
    #[error(transparent)]
    Failed(#[from] RelayError),
}

/// One downstream client session.
pub struct Session {
    conn: Arc<ClientConnection>,
    dispatcher: Arc<Dispatcher>,
    peers: Arc<dyn PeerDirectory>,
    config: SessionConfig,
    torn_down: AtomicBool,
}

impl Session {
    /// Creates a connection, registers it with the dispatcher and wraps it in a session.
    ///
    /// Returns the session together with the receiving half of the client's queue, to be
    /// handed to [`Session::run`].
    pub fn open(
        dispatcher: Arc<Dispatcher>,
        peers: Arc<dyn PeerDirectory>,
        config: SessionConfig,
        shutdown: &CancellationToken,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (conn, rx) = ClientConnection::new(config.queue_capacity, shutdown);
        dispatcher.register(Arc::clone(&conn));
        (
            Self {
                conn,
                dispatcher,
                peers,
                config,
                torn_down: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Arc<ClientConnection> {
        &self.conn
    }

    /// Runs both pumps until the session is torn down.
    pub async fn run<St, E, Si>(&self, outbound: mpsc::Receiver<Bytes>, stream: St, sink: Si)
    where
        St: Stream<Item = Result<WsFrame, E>> + Unpin,
        E: Display,
        Si: Sink<WsFrame> + Unpin,
        Si::Error: Display,
    {
        self.conn.activate();
        tokio::join!(self.read_pump(stream), self.write_pump(outbound, sink));
        log::debug!("Client {} pumps finished", self.conn.id());
    }

    async fn read_pump<St, E>(&self, mut stream: St)
    where
        St: Stream<Item = Result<WsFrame, E>> + Unpin,
        E: Display,
    {
        let pong_wait = self.config.pong_wait;
        let mut deadline = Instant::now() + pong_wait;

        let reason: CloseReason = loop {
            let next = tokio::select! {
                _ = self.conn.cancelled() => break CloseReason::Closed,
                next = timeout_at(deadline, stream.next()) => next,
            };
            let frame = match next {
                Err(_) => break RelayError::LivenessTimeout(pong_wait).into(),
                Ok(None) => break CloseReason::PeerClosed,
                Ok(Some(Err(e))) => break RelayError::Transport(e.to_string()).into(),
                Ok(Some(Ok(frame))) => frame,
            };
            match frame {
                WsFrame::Pong(_) => {
                    self.conn.touch();
                    deadline = Instant::now() + pong_wait;
                }
                WsFrame::Text(text) => self.handle_command(&text),
                WsFrame::Binary(data) => match std::str::from_utf8(&data) {
                    Ok(text) => self.handle_command(text),
                    Err(_) => log::warn!("Client {}: ignoring non-UTF-8 frame", self.conn.id()),
                },
                WsFrame::Ping(_) => {}
                WsFrame::Close => break CloseReason::PeerClosed,
            }
        };
        self.teardown(reason);
    }

    async fn write_pump<Si>(&self, mut outbound: mpsc::Receiver<Bytes>, mut sink: Si)
    where
        Si: Sink<WsFrame> + Unpin,
        Si::Error: Display,
    {
        let period = timer_period(self.config.ping_period);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let batch_limit = self.config.queue_capacity.max(1);

        let reason: CloseReason = loop {
            tokio::select! {
                _ = self.conn.cancelled() => break CloseReason::Closed,
                _ = ticker.tick() => {
                    if let Err(e) = self.write(&mut sink, WsFrame::Ping(Vec::new())).await {
                        break e.into();
                    }
                }
                next = outbound.recv() => {
                    let Some(first) = next else { break CloseReason::Closed };
                    let mut batch = vec![first];
                    while batch.len() < batch_limit {
                        match outbound.try_recv() {
                            Ok(message) => batch.push(message),
                            Err(_) => break,
                        }
                    }
                    if let Err(e) = self.write(&mut sink, text_frame(coalesce(&batch))).await {
                        break e.into();
                    }
                    // A frame just went out; the next ping is due a full period from now.
                    ticker.reset();
                }
            }
        };
        self.teardown(reason);

        let write_timeout = self.config.write_timeout;
        if let Ok(Err(e)) = timeout(write_timeout, sink.send(WsFrame::Close)).await {
            log::debug!("Client {}: close frame not sent: {}", self.conn.id(), e);
        }
        let _ = timeout(write_timeout, sink.close()).await;
    }

    async fn write<Si>(&self, sink: &mut Si, frame: WsFrame) -> Result<(), RelayError>
    where
        Si: Sink<WsFrame> + Unpin,
        Si::Error: Display,
    {
        match timeout(self.config.write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RelayError::Transport(e.to_string())),
            Err(_) => Err(RelayError::Transport(format!(
                "write timed out after {:?}",
                self.config.write_timeout
            ))),
        }
    }

    fn handle_command(&self, text: &str) {
        let id = self.conn.id();
        match decode_command(text) {
            Ok(ClientCommand::Subscribe { identity }) => {
                if let Some(previous) = self.conn.bind_identity(identity.clone()) {
                    if previous != identity {
                        log::info!("Client {} rebound from '{}' to '{}'", id, previous, identity);
                    }
                } else {
                    log::info!("Client {} subscribed as '{}'", id, identity);
                }
                let peers = Arc::clone(&self.peers);
                let peer = identity.clone();
                tokio::spawn(async move {
                    if let Err(e) = peers.mark_peer_active(&peer).await {
                        log::warn!("Failed to mark peer '{}' active: {}", peer, e);
                    }
                });
                self.reply(ServerReply::subscribed(identity));
            }
            Ok(ClientCommand::Ping) => {
                if let Some(identity) = self.conn.identity() {
                    let peers = Arc::clone(&self.peers);
                    tokio::spawn(async move {
                        if let Err(e) = peers.refresh_peer_liveness(&identity).await {
                            log::warn!("Failed to refresh liveness of peer '{}': {}", identity, e);
                        }
                    });
                }
                self.reply(ServerReply::pong());
            }
            Err(e) => log::warn!("Client {}: ignoring malformed command: {}", id, e),
        }
    }

    fn reply(&self, reply: ServerReply) {
        match reply.frame() {
            Ok(frame) => {
                if self.conn.offer(frame) == Offer::Dropped {
                    log::warn!("Client {} queue full; reply dropped", self.conn.id());
                }
            }
            Err(e) => log::error!("Failed to encode reply: {}", e),
        }
    }

    fn teardown(&self, reason: CloseReason) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let id = self.conn.id();
        self.conn.close();
        self.dispatcher.unregister(id);
        match &reason {
            CloseReason::Failed(e) => log::warn!("Client {} closed: {}", id, e),
            _ => log::info!("Client {} closed: {}", id, reason),
        }
        if let Some(identity) = self.conn.identity() {
            let peers = Arc::clone(&self.peers);
            tokio::spawn(async move {
                if let Err(e) = peers.mark_peer_inactive(&identity).await {
                    log::warn!("Failed to mark peer '{}' inactive: {}", identity, e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::observer::ObserverSet;
    use async_trait::async_trait;
    use futures_channel::mpsc as fmpsc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPeers {
        calls: Mutex<Vec<(&'static str, String)>>,
    }

    impl RecordingPeers {
        fn calls(&self) -> Vec<(&'static str, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PeerDirectory for RecordingPeers {
        async fn mark_peer_active(&self, identity: &str) -> Result<(), RelayError> {
            self.calls.lock().unwrap().push(("active", identity.to_string()));
            Ok(())
        }

        async fn refresh_peer_liveness(&self, identity: &str) -> Result<(), RelayError> {
            self.calls.lock().unwrap().push(("refresh", identity.to_string()));
            Ok(())
        }

        async fn mark_peer_inactive(&self, identity: &str) -> Result<(), RelayError> {
            self.calls.lock().unwrap().push(("inactive", identity.to_string()));
            Ok(())
        }
    }

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        peers: Arc<RecordingPeers>,
        to_server: fmpsc::UnboundedSender<Result<WsFrame, String>>,
        from_server: fmpsc::UnboundedReceiver<WsFrame>,
        session: Arc<Session>,
        shutdown: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(config: SessionConfig, preload: &[&'static [u8]]) -> Harness {
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(ObserverSet::new())));
        let peers = Arc::new(RecordingPeers::default());
        let shutdown = CancellationToken::new();
        let (session, rx) = Session::open(dispatcher.clone(), peers.clone(), config, &shutdown);
        for frame in preload {
            session.connection().offer(Bytes::from_static(frame));
        }
        let session = Arc::new(session);
        let (to_server, stream) = fmpsc::unbounded();
        let (sink, from_server) = fmpsc::unbounded();
        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.run(rx, stream, sink).await })
        };
        Harness {
            dispatcher,
            peers,
            to_server,
            from_server,
            session,
            shutdown,
            task,
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn send_text(h: &Harness, text: &str) {
        h.to_server.unbounded_send(Ok(WsFrame::Text(text.to_string()))).unwrap();
    }

    async fn next_text(h: &mut Harness) -> String {
        loop {
            match h.from_server.next().await.unwrap() {
                WsFrame::Text(text) => return text,
                WsFrame::Ping(_) => continue,
                other => panic!("unexpected frame {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn queued_messages_are_coalesced_into_one_frame() {
        let mut h = start(SessionConfig::default(), &[br#"{"a":1}"#, br#"{"b":2}"#, br#"{"c":3}"#]);
        let frame = next_text(&mut h).await;
        let parts: Vec<&str> = frame.split('\n').collect();
        assert_eq!(parts, vec![r#"{"a":1}"#, r#"{"b":2}"#, r#"{"c":3}"#]);
        h.shutdown.cancel();
        h.task.await.unwrap();
        assert_eq!(h.dispatcher.client_count(), 0);
    }

    #[tokio::test]
    async fn ping_before_subscribe_is_answered_without_a_refresh() {
        let mut h = start(SessionConfig::default(), &[]);
        send_text(&h, r#"{"type":"ping"}"#);
        assert_eq!(next_text(&mut h).await, r#"{"type":"pong","status":"ok"}"#);
        settle().await;
        assert!(h.peers.calls().is_empty());

        send_text(&h, r#"{"type":"subscribe","identity":"m1"}"#);
        assert_eq!(
            next_text(&mut h).await,
            r#"{"type":"subscribed","status":"ok","identity":"m1"}"#
        );
        send_text(&h, r#"{"type":"ping"}"#);
        assert_eq!(next_text(&mut h).await, r#"{"type":"pong","status":"ok"}"#);
        settle().await;
        assert_eq!(
            h.peers.calls(),
            vec![("active", "m1".to_string()), ("refresh", "m1".to_string())]
        );
    }

    #[tokio::test]
    async fn malformed_commands_are_ignored() {
        let mut h = start(SessionConfig::default(), &[]);
        send_text(&h, "{not json");
        send_text(&h, r#"{"type":"unsubscribe"}"#);
        send_text(&h, r#"{"type":"ping"}"#);
        assert_eq!(next_text(&mut h).await, r#"{"type":"pong","status":"ok"}"#);
        assert!(!h.session.connection().is_closed());
    }

    #[tokio::test]
    async fn peer_close_tears_down_once() {
        let mut h = start(SessionConfig::default(), &[]);
        send_text(&h, r#"{"type":"subscribe","machine_id":"m7"}"#);
        next_text(&mut h).await;
        assert_eq!(h.dispatcher.client_count(), 1);

        h.to_server.unbounded_send(Ok(WsFrame::Close)).unwrap();
        h.task.await.unwrap();
        settle().await;

        assert_eq!(h.dispatcher.client_count(), 0);
        assert!(h.session.connection().is_closed());
        let inactive: Vec<_> = h.peers.calls().into_iter().filter(|(k, _)| *k == "inactive").collect();
        assert_eq!(inactive, vec![("inactive", "m7".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_dropped_after_pong_wait() {
        let h = start(SessionConfig::default(), &[]);
        let conn = h.session.connection().clone();

        tokio::time::sleep(Duration::from_secs(50)).await;
        h.to_server.unbounded_send(Ok(WsFrame::Pong(Vec::new()))).unwrap();
        tokio::time::sleep(Duration::from_secs(50)).await;
        assert!(!conn.is_closed(), "pong should have pushed the deadline to t=110s");

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(conn.is_closed());
        assert_eq!(h.dispatcher.client_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pings_are_sent_every_ping_period() {
        let config = SessionConfig::default().with_pong_wait(Duration::from_secs(10));
        assert_eq!(config.ping_period, Duration::from_secs(9));
        let mut h = start(config, &[]);

        let started = Instant::now();
        assert_eq!(h.from_server.next().await.unwrap(), WsFrame::Ping(Vec::new()));
        assert_eq!(started.elapsed(), Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn application_frames_postpone_the_next_ping() {
        let mut h = start(SessionConfig::default().with_pong_wait(Duration::from_secs(20)), &[]);
        let started = Instant::now();

        tokio::time::sleep(Duration::from_secs(10)).await;
        h.to_server.unbounded_send(Ok(WsFrame::Pong(Vec::new()))).unwrap();
        h.session.connection().offer(Bytes::from_static(br#"{"n":1}"#));
        assert_eq!(h.from_server.next().await.unwrap(), WsFrame::Text(r#"{"n":1}"#.into()));

        assert_eq!(h.from_server.next().await.unwrap(), WsFrame::Ping(Vec::new()));
        assert_eq!(started.elapsed(), Duration::from_secs(28));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_pong_wait_is_raised_to_the_minimum() {
        let config = SessionConfig::default().with_pong_wait(Duration::ZERO);
        assert_eq!(config.pong_wait, MIN_PONG_WAIT);
        assert_eq!(config.ping_period, Duration::from_millis(900));
        let mut h = start(config, &[]);

        assert_eq!(h.from_server.next().await.unwrap(), WsFrame::Ping(Vec::new()));
        h.task.await.unwrap();
        assert!(h.session.connection().is_closed());
        assert_eq!(h.dispatcher.client_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_ping_period_still_pings() {
        let config = SessionConfig {
            ping_period: Duration::ZERO,
            ..SessionConfig::default()
        };
        let mut h = start(config, &[]);

        let started = Instant::now();
        assert_eq!(h.from_server.next().await.unwrap(), WsFrame::Ping(Vec::new()));
        assert_eq!(started.elapsed(), crate::core::MIN_TIMER_PERIOD);
        assert_eq!(h.dispatcher.client_count(), 1);
    }

    #[tokio::test]
    async fn dispatcher_unregister_stops_the_session() {
        let mut h = start(SessionConfig::default(), &[]);
        send_text(&h, r#"{"type":"subscribe","identity":"m1"}"#);
        next_text(&mut h).await;

        assert!(h.dispatcher.unregister(h.session.connection().id()));
        h.task.await.unwrap();
        settle().await;

        assert_eq!(h.from_server.next().await, Some(WsFrame::Close));
        assert_eq!(h.dispatcher.client_count(), 0);
        let inactive: Vec<_> = h.peers.calls().into_iter().filter(|(k, _)| *k == "inactive").collect();
        assert_eq!(inactive, vec![("inactive", "m1".to_string())]);
    }

    #[tokio::test]
    async fn read_error_closes_the_transport() {
        let mut h = start(SessionConfig::default(), &[]);
        h.to_server.unbounded_send(Err("reset by peer".to_string())).unwrap();
        h.task.await.unwrap();
        assert_eq!(h.from_server.next().await, Some(WsFrame::Close));
        assert_eq!(h.dispatcher.client_count(), 0);
    }
}
