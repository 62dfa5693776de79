//! # Realtime Change-Feed Subscriber
//!
//! Holds the upstream link to the realtime change feed. One successful
//! [`Connector::connect`] produces one *link*:
//!
//! 1.  Dial under the handshake deadline (`Connecting`).
//! 2.  Send the `phx_join` request for the configured topic (`Joined`).
//! 3.  Spawn the read loop and the heartbeat loop for the link.
//! 4.  A `phx_reply` to the join moves the link to `Active` and reports [`LinkEvent::Up`].
//!
//! Every `postgres_changes` push becomes an [`Event`] on the bounded event channel. A read
//! error, a missed liveness deadline, a failed heartbeat write, a rejected join or a
//! `phx_error` ends the link. Whichever of the loops notices first reports
//! [`LinkEvent::Down`]; the other one finds the link already down and stays quiet.
//!
//! Reconnecting is not done here. The upstream manager owns that decision and calls
//! `connect` again through the reconnect supervisor.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval_at, timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::codec::{
    decode_envelope, encode_heartbeat, encode_join, heartbeat_ref, ChangeFilter, ChangeKind, Event,
    WsFrame, EVENT_CHANGES, EVENT_ERROR, EVENT_REPLY,
};
use crate::core::error::RelayError;
use crate::core::status::{ConnectionState, LinkEvent, StateCell};
use crate::core::supervisor::Connector;
use crate::core::timer_period;
use crate::ingestors::dialer::{FrameSink, FrameStream, UpstreamDialer};

/// Upstream subscription settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeConfig {
    /// Full WebSocket endpoint, credentials included. Never logged.
    pub endpoint: String,
    /// Channel topic, e.g. `realtime:public:admin_alerts`.
    pub topic: String,
    /// Change subscriptions sent with the join.
    pub changes: Vec<ChangeFilter>,
    /// Heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Silence allowed on the link before it is declared dead.
    pub liveness_timeout: Duration,
    /// Deadline for the WebSocket handshake.
    pub handshake_timeout: Duration,
    /// Deadline for a single upstream write.
    pub write_timeout: Duration,
    /// How long a decoded event may wait for room on a full event channel.
    pub publish_grace: Duration,
}

impl RealtimeConfig {
    /// Subscribes to inserts and updates on `schema.table`.
    pub fn for_table(endpoint: impl Into<String>, schema: &str, table: &str) -> Self {
        Self {
            endpoint: endpoint.into(),
            topic: format!("realtime:{}:{}", schema, table),
            changes: vec![
                ChangeFilter::new(ChangeKind::Insert, schema, table),
                ChangeFilter::new(ChangeKind::Update, schema, table),
            ],
            heartbeat_interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            publish_grace: Duration::from_secs(1),
        }
    }

    /// Narrows every change subscription with `filter` (e.g. `machine_id=eq.host-1`) and
    /// gives the channel a topic of its own.
    pub fn with_filter(mut self, filter: &str) -> Self {
        self.topic = format!("{}:{}", self.topic, filter);
        for change in &mut self.changes {
            change.filter = Some(filter.to_string());
        }
        self
    }

    /// Derives the realtime WebSocket endpoint from the project base URL.
    ///
    /// `https://x.supabase.co` becomes
    /// `wss://x.supabase.co/realtime/v1/websocket?apikey=<key>&vsn=1.0.0`.
    pub fn endpoint_for(base_url: &str, api_key: &str) -> Result<String, RelayError> {
        let mut url = Url::parse(base_url)?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => {
                return Err(RelayError::Connection(format!(
                    "unsupported URL scheme '{}'",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| RelayError::Connection(format!("cannot use scheme '{}'", scheme)))?;
        let path = format!("{}/realtime/v1/websocket", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.query_pairs_mut()
            .clear()
            .append_pair("apikey", api_key)
            .append_pair("vsn", "1.0.0");
        Ok(url.into())
    }

    /// Endpoint without its query string, safe to log.
    pub fn redacted_endpoint(&self) -> String {
        match Url::parse(&self.endpoint) {
            Ok(url) => format!("{}://{}{}", url.scheme(), url.host_str().unwrap_or("?"), url.path()),
            Err(_) => "<invalid endpoint>".to_string(),
        }
    }
}

struct Link {
    id: u64,
    sink: tokio::sync::Mutex<FrameSink>,
    cancel: CancellationToken,
    down: AtomicBool,
}

impl Link {
    async fn send(&self, frame: WsFrame, deadline: Duration) -> Result<(), RelayError> {
        let mut sink = self.sink.lock().await;
        match timeout(deadline, sink.send(frame)).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::Transport(format!(
                "upstream write timed out after {:?}",
                deadline
            ))),
        }
    }
}

struct Shared {
    config: RealtimeConfig,
    state: StateCell,
    events: mpsc::Sender<Arc<Event>>,
    links: mpsc::UnboundedSender<LinkEvent>,
    shutdown: CancellationToken,
    current: Mutex<Option<Arc<Link>>>,
    next_link_id: AtomicU64,
    next_join_ref: AtomicU64,
}

/// The upstream change-feed subscriber.
pub struct UpstreamSubscriber<D: UpstreamDialer> {
    shared: Arc<Shared>,
    dialer: D,
}

impl<D: UpstreamDialer> UpstreamSubscriber<D> {
    /// Creates a disconnected subscriber publishing onto `events`.
    ///
    /// Returns the receiver of link notifications, which belongs to the upstream manager.
    pub fn new(
        config: RealtimeConfig,
        dialer: D,
        events: mpsc::Sender<Arc<Event>>,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (links, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config,
            state: StateCell::new(),
            events,
            links,
            shutdown,
            current: Mutex::new(None),
            next_link_id: AtomicU64::new(1),
            next_join_ref: AtomicU64::new(1),
        });
        (Self { shared, dialer }, rx)
    }

    /// Current link state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// The subscription settings.
    pub fn config(&self) -> &RealtimeConfig {
        &self.shared.config
    }

    async fn establish(&self) -> Result<(), RelayError> {
        let shared = &self.shared;
        let config = &shared.config;

        let (mut sink, stream) = timeout(config.handshake_timeout, self.dialer.dial(&config.endpoint))
            .await
            .map_err(|_| {
                RelayError::Connection(format!(
                    "handshake timed out after {:?}",
                    config.handshake_timeout
                ))
            })??;

        let join_ref = shared.next_join_ref.fetch_add(1, Ordering::Relaxed).to_string();
        let join = encode_join(&config.topic, &config.changes, &join_ref)?;
        match timeout(config.write_timeout, sink.send(WsFrame::Text(join))).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(RelayError::Transport(format!(
                    "join write timed out after {:?}",
                    config.write_timeout
                )))
            }
        }

        let link = Arc::new(Link {
            id: shared.next_link_id.fetch_add(1, Ordering::Relaxed),
            sink: tokio::sync::Mutex::new(sink),
            cancel: shared.shutdown.child_token(),
            down: AtomicBool::new(false),
        });
        shared.state.set(ConnectionState::Joined);
        if let Some(stale) = shared.install(Arc::clone(&link)) {
            stale.down.store(true, Ordering::Release);
            stale.cancel.cancel();
        }
        log::info!(
            "Upstream link {} joined '{}' (ref {})",
            link.id,
            config.topic,
            join_ref
        );

        tokio::spawn(read_loop(Arc::clone(shared), Arc::clone(&link), stream));
        tokio::spawn(heartbeat_loop(Arc::clone(shared), link));
        Ok(())
    }
}

#[async_trait]
impl<D: UpstreamDialer> Connector for UpstreamSubscriber<D> {
    async fn connect(&self) -> Result<(), RelayError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(RelayError::Shutdown);
        }
        let previous = self.shared.state.set(ConnectionState::Connecting);
        log::info!("Connecting upstream: {}", self.shared.config.redacted_endpoint());

        let result = self.establish().await;
        if let Err(e) = &result {
            // A retry after a lost link is still a reconnect; only a first dial fails to Disconnected.
            let settled = if previous == ConnectionState::Reconnecting {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Disconnected
            };
            self.shared.state.transition(ConnectionState::Connecting, settled);
            log::warn!("Upstream connection failed: {}", e);
        }
        result
    }
}

impl Shared {
    fn install(&self, link: Arc<Link>) -> Option<Arc<Link>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(link)
    }

    /// Ends `link` once. Reports the loss unless the relay is shutting down.
    fn handle_disconnect(&self, link: &Link, cause: RelayError) {
        if link.down.swap(true, Ordering::AcqRel) {
            return;
        }
        link.cancel.cancel();
        {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            if current.as_ref().is_some_and(|c| c.id == link.id) {
                *current = None;
            }
        }

        if self.shutdown.is_cancelled() {
            self.state.set(ConnectionState::Disconnected);
            log::info!("Upstream link {} closed for shutdown", link.id);
            return;
        }
        self.state
            .transition_if(ConnectionState::is_linked, ConnectionState::Reconnecting);
        log::warn!("Upstream link {} lost: {}", link.id, cause);
        if self.links.send(LinkEvent::Down(cause)).is_err() {
            log::debug!("Upstream manager is gone; link loss not reported");
        }
    }

    async fn dispatch(&self, text: &str) -> Result<(), RelayError> {
        let envelope = match decode_envelope(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Discarding undecodable upstream frame: {}", e);
                return Ok(());
            }
        };

        match envelope.event.as_str() {
            EVENT_CHANGES => match Event::from_envelope(&envelope, Utc::now()) {
                Some(event) => self.publish(event).await,
                None => log::warn!("Discarding change notification without a record"),
            },
            EVENT_REPLY if envelope.topic.as_deref() == Some(self.config.topic.as_str()) => {
                if envelope.reply_status() == Some("error") {
                    let response = envelope
                        .payload
                        .get("response")
                        .map(|r| r.to_string())
                        .unwrap_or_default();
                    return Err(RelayError::Protocol(format!("join rejected: {}", response)));
                }
                if self
                    .state
                    .transition(ConnectionState::Joined, ConnectionState::Active)
                {
                    log::info!("Upstream subscription to '{}' is active", self.config.topic);
                    if self.links.send(LinkEvent::Up).is_err() {
                        log::debug!("Upstream manager is gone; link up not reported");
                    }
                }
            }
            EVENT_REPLY => log::trace!("Heartbeat acknowledged"),
            EVENT_ERROR => {
                return Err(RelayError::Protocol(format!(
                    "channel error on '{}'",
                    envelope.topic.unwrap_or_default()
                )))
            }
            other => log::debug!("Ignoring upstream '{}' message", other),
        }
        Ok(())
    }

    async fn publish(&self, event: Event) {
        match self.events.try_send(Arc::new(event)) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let grace = self.config.publish_grace;
                log::warn!("Event channel full; waiting up to {:?}", grace);
                if self.events.send_timeout(event, grace).await.is_err() {
                    log::error!("Event dropped: channel still full after {:?}", grace);
                }
            }
            Err(TrySendError::Closed(_)) => log::debug!("Event channel closed; event dropped"),
        }
    }
}

async fn read_loop(shared: Arc<Shared>, link: Arc<Link>, mut stream: FrameStream) {
    let liveness = shared.config.liveness_timeout;
    let mut deadline = Instant::now() + liveness;

    let cause = loop {
        let next = tokio::select! {
            _ = link.cancel.cancelled() => break RelayError::Shutdown,
            next = timeout_at(deadline, stream.next()) => next,
        };
        let frame = match next {
            Err(_) => break RelayError::LivenessTimeout(liveness),
            Ok(None) => break RelayError::Transport("upstream closed the stream".into()),
            Ok(Some(Err(e))) => break e,
            Ok(Some(Ok(frame))) => frame,
        };
        deadline = Instant::now() + liveness;
        match frame {
            WsFrame::Text(text) => {
                if let Err(e) = shared.dispatch(&text).await {
                    break e;
                }
            }
            WsFrame::Close => break RelayError::Transport("upstream sent close".into()),
            WsFrame::Binary(_) => log::debug!("Ignoring binary upstream frame"),
            WsFrame::Ping(_) | WsFrame::Pong(_) => {}
        }
    };

    shared.handle_disconnect(&link, cause);
    if shared.shutdown.is_cancelled() {
        if let Err(e) = link.send(WsFrame::Close, shared.config.write_timeout).await {
            log::debug!("Upstream close frame not sent: {}", e);
        }
    }
}

async fn heartbeat_loop(shared: Arc<Shared>, link: Arc<Link>) {
    let period = timer_period(shared.config.heartbeat_interval);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = link.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let frame = match encode_heartbeat(&heartbeat_ref()) {
            Ok(text) => WsFrame::Text(text),
            Err(e) => {
                log::error!("Failed to encode heartbeat: {}", e);
                continue;
            }
        };
        if let Err(e) = link.send(frame, shared.config.write_timeout).await {
            shared.handle_disconnect(&link, e);
            return;
        }
    }
}
