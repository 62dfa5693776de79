//! In-memory fakes shared by the relay scenario tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_channel::mpsc as fmpsc;
use futures_util::{SinkExt, StreamExt};
use tokio::time::Instant;

use lib_common::core::codec::{Event, WsFrame};
use lib_common::core::{PeerDirectory, RelayError, RelayObserver, StatusValue};
use lib_common::ingestors::{FrameSink, FrameStream, UpstreamDialer};

/// What the next dial does.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    /// Dial fails.
    Refuse,
    /// Dial succeeds and the join is acknowledged right away.
    Accept,
    /// Dial succeeds; the test acknowledges the join itself.
    AcceptSilently,
}

/// The far end of one fake upstream link.
pub struct FakeUpstream {
    pub to_relay: Option<fmpsc::UnboundedSender<Result<WsFrame, RelayError>>>,
    pub from_relay: fmpsc::UnboundedReceiver<WsFrame>,
}

impl FakeUpstream {
    /// Pushes a text frame to the relay.
    pub fn push(&self, text: &str) {
        if let Some(tx) = &self.to_relay {
            tx.unbounded_send(Ok(WsFrame::Text(text.to_string())))
                .expect("relay side dropped");
        }
    }

    /// Ends the stream as if the network went away.
    pub fn sever(&mut self) {
        self.to_relay = None;
    }

    /// Next text frame the relay wrote.
    pub async fn next_text(&mut self) -> String {
        loop {
            match self.from_relay.next().await {
                Some(WsFrame::Text(text)) => return text,
                Some(_) => continue,
                None => panic!("relay closed the link"),
            }
        }
    }
}

/// Dialer that follows a script and records when it was called.
pub struct ScriptedDialer {
    topic: String,
    script: Mutex<VecDeque<Step>>,
    pub links: Mutex<Vec<FakeUpstream>>,
    pub dialed_at: Mutex<Vec<Instant>>,
}

impl ScriptedDialer {
    pub fn new(topic: &str, script: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            topic: topic.to_string(),
            script: Mutex::new(script.into_iter().collect()),
            links: Mutex::new(Vec::new()),
            dialed_at: Mutex::new(Vec::new()),
        })
    }

    pub fn push_steps(&self, steps: impl IntoIterator<Item = Step>) {
        self.script.lock().unwrap().extend(steps);
    }

    pub fn dial_count(&self) -> usize {
        self.dialed_at.lock().unwrap().len()
    }

    /// Runs `f` against link `index`.
    pub fn with_link<R>(&self, index: usize, f: impl FnOnce(&mut FakeUpstream) -> R) -> R {
        let mut links = self.links.lock().unwrap();
        f(&mut links[index])
    }

    /// Takes link `index` out, e.g. to await frames on it.
    pub fn take_link(&self, index: usize) -> FakeUpstream {
        let mut links = self.links.lock().unwrap();
        let (tx, _) = fmpsc::unbounded();
        let (_, rx) = fmpsc::unbounded();
        std::mem::replace(
            &mut links[index],
            FakeUpstream {
                to_relay: Some(tx),
                from_relay: rx,
            },
        )
    }

    pub fn join_reply(&self) -> String {
        format!(
            r#"{{"event":"phx_reply","topic":"{}","payload":{{"status":"ok","response":{{}}}},"ref":"1"}}"#,
            self.topic
        )
    }
}

/// Shares one script between the test and the subscriber.
pub struct SharedDialer(pub Arc<ScriptedDialer>);

#[async_trait]
impl UpstreamDialer for SharedDialer {
    async fn dial(&self, _endpoint: &str) -> Result<(FrameSink, FrameStream), RelayError> {
        let dialer = &self.0;
        dialer.dialed_at.lock().unwrap().push(Instant::now());
        let step = dialer.script.lock().unwrap().pop_front().unwrap_or(Step::Refuse);
        if let Step::Refuse = step {
            return Err(RelayError::Connection("connection refused".into()));
        }

        let (to_relay, stream) = fmpsc::unbounded::<Result<WsFrame, RelayError>>();
        let (sink, from_relay) = fmpsc::unbounded::<WsFrame>();
        if let Step::Accept = step {
            to_relay
                .unbounded_send(Ok(WsFrame::Text(dialer.join_reply())))
                .expect("fresh channel");
        }
        dialer.links.lock().unwrap().push(FakeUpstream {
            to_relay: Some(to_relay),
            from_relay,
        });

        let sink = sink.sink_map_err(|e| RelayError::Transport(e.to_string()));
        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

/// Observer that remembers everything it saw.
#[derive(Default)]
pub struct RecordingObserver {
    pub statuses: Mutex<Vec<StatusValue>>,
    pub events: Mutex<Vec<Event>>,
}

impl RecordingObserver {
    pub fn statuses(&self) -> Vec<StatusValue> {
        self.statuses.lock().unwrap().clone()
    }
}

impl RelayObserver for RecordingObserver {
    fn on_status_change(&self, status: StatusValue) {
        self.statuses.lock().unwrap().push(status);
    }

    fn on_event(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Peer directory that records calls as `(operation, identity)`.
#[derive(Default)]
pub struct RecordingPeers {
    pub calls: Mutex<Vec<(String, String)>>,
}

impl RecordingPeers {
    pub fn calls_of(&self, operation: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(op, _)| op == operation)
            .map(|(_, identity)| identity.clone())
            .collect()
    }

    fn record(&self, operation: &str, identity: &str) {
        self.calls
            .lock()
            .unwrap()
            .push((operation.to_string(), identity.to_string()));
    }
}

#[async_trait]
impl PeerDirectory for RecordingPeers {
    async fn mark_peer_active(&self, identity: &str) -> Result<(), RelayError> {
        self.record("active", identity);
        Ok(())
    }

    async fn refresh_peer_liveness(&self, identity: &str) -> Result<(), RelayError> {
        self.record("refresh", identity);
        Ok(())
    }

    async fn mark_peer_inactive(&self, identity: &str) -> Result<(), RelayError> {
        self.record("inactive", identity);
        Ok(())
    }
}

/// An in-memory downstream client: what the relay writes and what the test sends.
pub struct FakeClient {
    pub to_relay: fmpsc::UnboundedSender<Result<WsFrame, String>>,
    pub from_relay: fmpsc::UnboundedReceiver<WsFrame>,
}

impl FakeClient {
    pub fn send_text(&self, text: &str) {
        self.to_relay
            .unbounded_send(Ok(WsFrame::Text(text.to_string())))
            .expect("relay side dropped");
    }

    /// Next application frame, split on newlines.
    pub async fn next_messages(&mut self) -> Vec<String> {
        loop {
            match self.from_relay.next().await {
                Some(WsFrame::Text(text)) => return text.split('\n').map(str::to_string).collect(),
                Some(WsFrame::Ping(_)) => continue,
                other => panic!("unexpected frame {:?}", other),
            }
        }
    }
}

/// Creates the two channel pairs of a downstream transport.
pub fn client_transport() -> (
    FakeClient,
    fmpsc::UnboundedReceiver<Result<WsFrame, String>>,
    fmpsc::UnboundedSender<WsFrame>,
) {
    let (to_relay, stream) = fmpsc::unbounded();
    let (sink, from_relay) = fmpsc::unbounded();
    (FakeClient { to_relay, from_relay }, stream, sink)
}

/// Polls `condition` every 10ms until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Awaits `future` with a generous test deadline.
pub async fn within<F: Future>(limit: Duration, future: F) -> F::Output {
    tokio::time::timeout(limit, future)
        .await
        .expect("timed out waiting in test")
}
