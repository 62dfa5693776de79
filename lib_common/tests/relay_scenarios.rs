//! End-to-end relay scenarios over in-memory transports.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use common::{
    client_transport, wait_until, within, FakeClient, RecordingObserver, RecordingPeers,
    ScriptedDialer, SharedDialer, Step,
};
use lib_common::core::{
    BackoffPolicy, Dispatcher, ObserverSet, ReconnectSupervisor, Session, SessionConfig,
    StatusValue, UpstreamManager,
};
use lib_common::ingestors::{RealtimeConfig, UpstreamSubscriber};

const TOPIC: &str = "realtime:public:admin_alerts";

struct Relay {
    shutdown: CancellationToken,
    observers: Arc<ObserverSet>,
    recorder: Arc<RecordingObserver>,
    dispatcher: Arc<Dispatcher>,
    peers: Arc<RecordingPeers>,
    dialer: Arc<ScriptedDialer>,
    manager: Arc<UpstreamManager<UpstreamSubscriber<SharedDialer>>>,
    manager_task: tokio::task::JoinHandle<()>,
}

fn quiet_config() -> RealtimeConfig {
    let mut config = RealtimeConfig::for_table("ws://upstream.test", "public", "admin_alerts");
    config.heartbeat_interval = Duration::from_secs(3_600);
    config.liveness_timeout = Duration::from_secs(3_600);
    config
}

fn start_relay(config: RealtimeConfig, script: Vec<Step>) -> Relay {
    let shutdown = CancellationToken::new();
    let observers = Arc::new(ObserverSet::new());
    let recorder = Arc::new(RecordingObserver::default());
    observers.register(recorder.clone());
    let dispatcher = Arc::new(Dispatcher::new(observers.clone()));

    let dialer = ScriptedDialer::new(&config.topic, script);
    let (events_tx, events_rx) = mpsc::channel(256);
    let (subscriber, links) = UpstreamSubscriber::new(
        config,
        SharedDialer(dialer.clone()),
        events_tx,
        shutdown.clone(),
    );
    let manager = Arc::new(UpstreamManager::new(
        Arc::new(subscriber),
        ReconnectSupervisor::new(BackoffPolicy::default()),
        Duration::from_secs(2),
        observers.clone(),
        shutdown.clone(),
    ));

    {
        let dispatcher = dispatcher.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { dispatcher.run(events_rx, shutdown).await });
    }
    let manager_task = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run(links).await })
    };

    Relay {
        shutdown,
        observers,
        recorder,
        dispatcher,
        peers: Arc::new(RecordingPeers::default()),
        dialer,
        manager,
        manager_task,
    }
}

fn connect_client(relay: &Relay) -> FakeClient {
    let (session, rx) = Session::open(
        relay.dispatcher.clone(),
        relay.peers.clone(),
        SessionConfig::default(),
        &relay.shutdown,
    );
    let (client, stream, sink) = client_transport();
    tokio::spawn(async move { session.run(rx, stream, sink).await });
    client
}

#[tokio::test]
async fn a_change_reaches_every_client() {
    let relay = start_relay(quiet_config(), vec![Step::Accept]);
    assert!(wait_until(Duration::from_secs(5), || relay.manager.status() == StatusValue::Connected).await);

    let mut clients = Vec::new();
    for i in 1..=3 {
        let mut client = connect_client(&relay);
        client.send_text(&format!(r#"{{"type":"subscribe","identity":"m{}"}}"#, i));
        let ack = within(Duration::from_secs(5), client.next_messages()).await;
        assert!(ack[0].contains(r#""type":"subscribed""#), "{:?}", ack);
        clients.push(client);
    }
    assert_eq!(relay.dispatcher.client_count(), 3);

    let mut upstream = relay.dialer.take_link(0);
    let join: Value = serde_json::from_str(&upstream.next_text().await).unwrap();
    assert_eq!(join["event"], "phx_join");
    assert_eq!(join["topic"], TOPIC);

    upstream.push(
        r#"{"event":"postgres_changes","topic":"realtime:public:admin_alerts","payload":{"data":{"type":"INSERT","record":{"domain":"evil.example","machine_id":"m1"}}},"ref":null}"#,
    );

    for client in clients.iter_mut() {
        let messages = within(Duration::from_secs(5), client.next_messages()).await;
        assert_eq!(messages.len(), 1);
        let record: Value = serde_json::from_str(&messages[0]).unwrap();
        assert_eq!(record["domain"], "evil.example");
        assert_eq!(record["machine_id"], "m1");
    }
    assert!(
        wait_until(Duration::from_secs(5), || relay.recorder.events.lock().unwrap().len() == 1).await
    );
    assert_eq!(relay.recorder.events.lock().unwrap()[0].kind, "INSERT");

    relay.shutdown.cancel();
    within(Duration::from_secs(5), relay.manager_task).await.unwrap();
    assert_eq!(relay.manager.status(), StatusValue::Disconnected);
    assert!(wait_until(Duration::from_secs(5), || relay.dispatcher.client_count() == 0).await);
}

#[tokio::test(start_paused = true)]
async fn link_loss_backs_off_and_recovers() {
    let relay = start_relay(quiet_config(), vec![Step::Accept]);
    assert!(wait_until(Duration::from_secs(5), || relay.manager.status() == StatusValue::Connected).await);

    relay
        .dialer
        .push_steps([Step::Refuse, Step::Refuse, Step::Refuse, Step::Accept]);
    let severed_at = Instant::now();
    relay.dialer.with_link(0, |link| link.sever());

    assert!(
        wait_until(Duration::from_secs(60), || {
            relay.dialer.dial_count() == 5 && relay.manager.status() == StatusValue::Connected
        })
        .await
    );

    let dialed_at = relay.dialer.dialed_at.lock().unwrap().clone();
    let secs = |d: Duration| (d.as_millis() + 500) / 1_000;
    let gaps: Vec<u128> = std::iter::once(secs(dialed_at[1] - severed_at))
        .chain(dialed_at[1..].windows(2).map(|w| secs(w[1] - w[0])))
        .collect();
    assert_eq!(gaps, vec![1, 2, 4, 8]);

    assert!(wait_until(Duration::from_secs(5), || relay.recorder.statuses().len() == 3).await);
    assert_eq!(
        relay.recorder.statuses(),
        vec![StatusValue::Connected, StatusValue::Polling, StatusValue::Connected]
    );
    assert_eq!(relay.manager.poller().activations(), 1);
    assert_eq!(relay.manager.poller().deactivations(), 1);
    assert_eq!(relay.observers.len(), 1);

    relay.shutdown.cancel();
    relay.manager_task.await.unwrap();
}

#[tokio::test]
async fn ping_refreshes_liveness_only_after_subscribe() {
    let relay = start_relay(quiet_config(), vec![Step::Accept]);
    let mut client = connect_client(&relay);

    client.send_text(r#"{"type":"ping"}"#);
    let pong = within(Duration::from_secs(5), client.next_messages()).await;
    assert_eq!(pong, vec![r#"{"type":"pong","status":"ok"}"#.to_string()]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(relay.peers.calls_of("refresh").is_empty());

    client.send_text(r#"{"type":"subscribe","identity":"m1"}"#);
    within(Duration::from_secs(5), client.next_messages()).await;
    client.send_text(r#"{"type":"ping"}"#);
    let pong = within(Duration::from_secs(5), client.next_messages()).await;
    assert_eq!(pong, vec![r#"{"type":"pong","status":"ok"}"#.to_string()]);

    assert!(wait_until(Duration::from_secs(5), || relay.peers.calls_of("refresh") == ["m1"]).await);
    assert_eq!(relay.peers.calls_of("active"), vec!["m1".to_string()]);

    drop(client);
    assert!(wait_until(Duration::from_secs(5), || relay.peers.calls_of("inactive") == ["m1"]).await);
    assert_eq!(relay.dispatcher.client_count(), 0);

    relay.shutdown.cancel();
}
