use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Connects to a relay, subscribes and reports what arrives", long_about = None)]
struct Args {
    /// Relay WebSocket URL
    #[clap(short, long, default_value = "ws://127.0.0.1:8765/ws")]
    url: String,

    /// Identity sent in the subscribe command
    #[clap(short, long, default_value = "test-client")]
    identity: String,

    /// Record field used to group the report
    #[clap(short, long, default_value = "machine_id")]
    group_by: String,

    /// Application ping interval in seconds
    #[clap(short, long, default_value_t = 30)]
    ping_interval_seconds: u64,

    /// Report interval in minutes
    #[clap(short, long, default_value_t = 1)]
    report_interval_minutes: u64,
}

#[derive(Default)]
struct Stats {
    global_timestamps: VecDeque<chrono::DateTime<Utc>>,
    group_timestamps: HashMap<String, VecDeque<chrono::DateTime<Utc>>>,
    frames: u64,
    pongs: u64,
}

impl Stats {
    fn record(&mut self, message: &str, group_by: &str) {
        let Ok(value) = serde_json::from_str::<Value>(message) else {
            println!("Unparseable message: {}", message);
            return;
        };
        match value.get("type").and_then(Value::as_str) {
            Some("pong") => self.pongs += 1,
            Some("subscribed") => println!("Subscribed: {}", value),
            _ => {
                let now = Utc::now();
                let group = value
                    .get(group_by)
                    .map(|v| v.as_str().map(str::to_owned).unwrap_or_else(|| v.to_string()))
                    .unwrap_or_else(|| "<none>".to_string());
                self.global_timestamps.push_back(now);
                self.group_timestamps.entry(group).or_default().push_back(now);
            }
        }
    }

    fn report(&mut self) {
        let one_minute_ago = Utc::now() - Duration::minutes(1);

        while self.global_timestamps.front().is_some_and(|&t| t < one_minute_ago) {
            self.global_timestamps.pop_front();
        }

        let mut rates: Vec<(String, usize)> = Vec::new();
        for (group, dq) in self.group_timestamps.iter_mut() {
            while dq.front().is_some_and(|&t| t < one_minute_ago) {
                dq.pop_front();
            }
            if !dq.is_empty() {
                rates.push((group.clone(), dq.len()));
            }
        }
        rates.sort_by(|a, b| b.1.cmp(&a.1));

        let report = rates
            .iter()
            .map(|(g, r)| format!("{}: {} rec/min", g, r))
            .collect::<Vec<_>>()
            .join(", ");

        println!("\n----- 1-Minute Summary -----");
        println!("Frames: {} total, pongs: {}", self.frames, self.pongs);
        println!("Record rate: {} rec/min", self.global_timestamps.len());
        println!("Groups: {}", if report.is_empty() { "No data" } else { &report });
        println!("----------------------------\n");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    println!("Connecting to {}...", args.url);
    let (ws_stream, _) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("Failed to connect to {}", args.url))?;
    let (mut write, mut read) = ws_stream.split();

    let subscribe = json!({ "type": "subscribe", "identity": args.identity }).to_string();
    write.send(Message::Text(subscribe.into())).await.context("Failed to send subscribe")?;
    println!("Subscribed as '{}'. Press Ctrl+C to stop.", args.identity);

    let ping = json!({ "type": "ping" }).to_string();
    let mut ping_ticker = interval(std::time::Duration::from_secs(args.ping_interval_seconds.max(1)));
    ping_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping_ticker.tick().await;
    let mut report_ticker = interval(std::time::Duration::from_secs(args.report_interval_minutes.max(1) * 60));
    report_ticker.tick().await;

    let mut stats = Stats::default();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            _ = ping_ticker.tick() => {
                write.send(Message::Text(ping.clone().into())).await.context("Failed to send ping")?;
            }
            _ = report_ticker.tick() => stats.report(),
            next = read.next() => match next {
                Some(Ok(Message::Text(text))) => {
                    stats.frames += 1;
                    for line in text.as_str().split('\n').filter(|l| !l.is_empty()) {
                        stats.record(line, &args.group_by);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    println!("Relay closed the connection: {:?}", frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    println!("Read error: {}", e);
                    break;
                }
                None => break,
            },
        }
    }

    stats.report();
    Ok(())
}
