use anyhow::{bail, Context, Result};
use clap::Parser;
use lib_common::core::{BackoffPolicy, ChangeFilter, ChangeKind, SessionConfig};
use lib_common::ingestors::RealtimeConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file, next to the working directory.
const CONFIG_FILE: &str = "server_relay.conf";

/// Shortest accepted fallback poll cadence.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Change-feed relay: realtime upstream to WebSocket clients", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "RELAY_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "RELAY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "RELAY_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "RELAY_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "SUPABASE_URL", help = "Project base URL, e.g. https://xyz.supabase.co.")]
    pub supabase_url: Option<String>,

    #[clap(long, env = "SUPABASE_ANON_KEY", help = "API key sent upstream and to the peer directory.")]
    pub api_key: Option<String>,

    #[clap(long, env = "RELAY_UPSTREAM_URL", help = "Full upstream WebSocket URL. Overrides the one derived from SUPABASE_URL.")]
    pub upstream_url: Option<String>,

    #[clap(long, env = "RELAY_SCHEMA", help = "Database schema to follow.")]
    pub schema: Option<String>,

    #[clap(long, env = "RELAY_TABLE", help = "Table to follow.")]
    pub table: Option<String>,

    #[clap(long, env = "RELAY_TOPIC", help = "Channel topic. Defaults to realtime:<schema>:<table>.")]
    pub topic: Option<String>,

    #[clap(long, env = "RELAY_CHANGE_EVENTS", help = "Comma-separated row operations (INSERT,UPDATE,DELETE,*).")]
    pub change_events: Option<String>,

    #[clap(long, env = "RELAY_FILTER", help = "Optional row filter, e.g. machine_id=eq.host-1.")]
    pub filter: Option<String>,

    #[clap(long, env = "RELAY_HEARTBEAT_INTERVAL_SECONDS", help = "Upstream heartbeat interval in seconds.")]
    pub heartbeat_interval_seconds: Option<u64>,

    #[clap(long, env = "RELAY_UPSTREAM_LIVENESS_SECONDS", help = "Seconds of upstream silence before the link is declared dead.")]
    pub upstream_liveness_seconds: Option<u64>,

    #[clap(long, env = "RELAY_HANDSHAKE_TIMEOUT_SECONDS", help = "Upstream handshake timeout in seconds.")]
    pub handshake_timeout_seconds: Option<u64>,

    #[clap(long, env = "RELAY_WRITE_TIMEOUT_SECONDS", help = "Deadline for a single write, upstream or downstream.")]
    pub write_timeout_seconds: Option<u64>,

    #[clap(long, env = "RELAY_PONG_WAIT_SECONDS", help = "Seconds a client may stay silent. Pings go out at 9/10 of this.")]
    pub pong_wait_seconds: Option<u64>,

    #[clap(long, env = "RELAY_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for upstream reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "RELAY_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds for upstream reconnect attempts.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(long, env = "RELAY_POLL_INTERVAL_MS", help = "Fallback poll interval in milliseconds while the upstream is down.")]
    pub poll_interval_ms: Option<u64>,

    #[clap(long, env = "RELAY_CLIENT_QUEUE_CAPACITY", help = "Outbound queue size per client.")]
    pub client_queue_capacity: Option<usize>,

    #[clap(long, env = "RELAY_EVENT_CHANNEL_CAPACITY", help = "Size of the upstream event channel.")]
    pub event_channel_capacity: Option<usize>,

    #[clap(long, env = "RELAY_MAX_MESSAGE_BYTES", help = "Largest client frame accepted, in bytes.")]
    pub max_message_bytes: Option<usize>,

    #[clap(long, env = "RELAY_PEER_DIRECTORY", help = "Record peer presence over REST (true/false).")]
    pub peer_directory: Option<bool>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            supabase_url: other.supabase_url.or(self.supabase_url),
            api_key: other.api_key.or(self.api_key),
            upstream_url: other.upstream_url.or(self.upstream_url),
            schema: other.schema.or(self.schema),
            table: other.table.or(self.table),
            topic: other.topic.or(self.topic),
            change_events: other.change_events.or(self.change_events),
            filter: other.filter.or(self.filter),
            heartbeat_interval_seconds: other.heartbeat_interval_seconds.or(self.heartbeat_interval_seconds),
            upstream_liveness_seconds: other.upstream_liveness_seconds.or(self.upstream_liveness_seconds),
            handshake_timeout_seconds: other.handshake_timeout_seconds.or(self.handshake_timeout_seconds),
            write_timeout_seconds: other.write_timeout_seconds.or(self.write_timeout_seconds),
            pong_wait_seconds: other.pong_wait_seconds.or(self.pong_wait_seconds),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            poll_interval_ms: other.poll_interval_ms.or(self.poll_interval_ms),
            client_queue_capacity: other.client_queue_capacity.or(self.client_queue_capacity),
            event_channel_capacity: other.event_channel_capacity.or(self.event_channel_capacity),
            max_message_bytes: other.max_message_bytes.or(self.max_message_bytes),
            peer_directory: other.peer_directory.or(self.peer_directory),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(8765),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            schema: Some("public".to_string()),
            table: Some("admin_alerts".to_string()),
            change_events: Some("INSERT,UPDATE".to_string()),
            heartbeat_interval_seconds: Some(30),
            upstream_liveness_seconds: Some(60),
            handshake_timeout_seconds: Some(10),
            write_timeout_seconds: Some(10),
            pong_wait_seconds: Some(60),
            reconnect_base_delay_ms: Some(1_000),
            reconnect_max_delay_ms: Some(60_000),
            poll_interval_ms: Some(2_000),
            client_queue_capacity: Some(256),
            event_channel_capacity: Some(256),
            max_message_bytes: Some(512 * 1024),
            peer_directory: Some(true),
            ..Default::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(8765)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> String {
        self.log_level.clone().unwrap_or_else(|| "info".to_string())
    }

    fn secs(value: Option<u64>, default: u64) -> Duration {
        Duration::from_secs(value.unwrap_or(default))
    }

    fn millis(value: Option<u64>, default: u64) -> Duration {
        Duration::from_millis(value.unwrap_or(default))
    }

    /// Rejects timer and sizing settings the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        let positive_seconds = [
            ("heartbeatIntervalSeconds", self.heartbeat_interval_seconds),
            ("upstreamLivenessSeconds", self.upstream_liveness_seconds),
            ("handshakeTimeoutSeconds", self.handshake_timeout_seconds),
            ("writeTimeoutSeconds", self.write_timeout_seconds),
            ("pongWaitSeconds", self.pong_wait_seconds),
        ];
        for (name, value) in positive_seconds {
            if value == Some(0) {
                bail!("{} must be at least 1", name);
            }
        }

        let poll = self.poll_interval();
        if poll < MIN_POLL_INTERVAL {
            bail!("pollIntervalMs must be at least {}", MIN_POLL_INTERVAL.as_millis());
        }

        let base = Self::millis(self.reconnect_base_delay_ms, 1_000);
        let max = Self::millis(self.reconnect_max_delay_ms, 60_000);
        if base.is_zero() {
            bail!("reconnectBaseDelayMs must be at least 1");
        }
        if max < base {
            bail!("reconnectMaxDelayMs ({:?}) is below reconnectBaseDelayMs ({:?})", max, base);
        }

        let heartbeat = Self::secs(self.heartbeat_interval_seconds, 30);
        let liveness = Self::secs(self.upstream_liveness_seconds, 60);
        if heartbeat >= liveness {
            bail!(
                "heartbeatIntervalSeconds ({:?}) must be shorter than upstreamLivenessSeconds ({:?})",
                heartbeat,
                liveness
            );
        }

        let sizes = [
            ("clientQueueCapacity", self.client_queue_capacity),
            ("eventChannelCapacity", self.event_channel_capacity),
            ("maxMessageBytes", self.max_message_bytes),
        ];
        for (name, value) in sizes {
            if value == Some(0) {
                bail!("{} must be at least 1", name);
            }
        }
        Ok(())
    }

    /// The upstream subscription built from the merged settings.
    pub fn realtime_config(&self) -> Result<RealtimeConfig> {
        let endpoint = match (&self.upstream_url, &self.supabase_url, &self.api_key) {
            (Some(url), _, _) => url.clone(),
            (None, Some(base), Some(key)) => RealtimeConfig::endpoint_for(base, key)
                .with_context(|| format!("Cannot derive the realtime endpoint from '{}'", base))?,
            _ => bail!("SUPABASE_URL and SUPABASE_ANON_KEY (or RELAY_UPSTREAM_URL) must be set"),
        };

        let schema = self.schema.as_deref().unwrap_or("public");
        let table = self.table.as_deref().unwrap_or("admin_alerts");
        let mut config = RealtimeConfig::for_table(endpoint, schema, table);

        if let Some(events) = &self.change_events {
            let kinds = events
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(str::parse::<ChangeKind>)
                .collect::<Result<Vec<_>, _>>()
                .context("Invalid changeEvents")?;
            if kinds.is_empty() {
                bail!("changeEvents must name at least one operation");
            }
            config.changes = kinds
                .into_iter()
                .map(|kind| ChangeFilter::new(kind, schema, table))
                .collect();
        }
        if let Some(filter) = self.filter.as_deref().filter(|f| !f.is_empty()) {
            config = config.with_filter(filter);
        }
        if let Some(topic) = &self.topic {
            config.topic = topic.clone();
        }

        config.heartbeat_interval = Self::secs(self.heartbeat_interval_seconds, 30);
        config.liveness_timeout = Self::secs(self.upstream_liveness_seconds, 60);
        config.handshake_timeout = Self::secs(self.handshake_timeout_seconds, 10);
        config.write_timeout = Self::secs(self.write_timeout_seconds, 10);
        Ok(config)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Self::millis(self.reconnect_base_delay_ms, 1_000),
            Self::millis(self.reconnect_max_delay_ms, 60_000),
        )
    }

    pub fn session_config(&self) -> SessionConfig {
        let mut session =
            SessionConfig::default().with_pong_wait(Self::secs(self.pong_wait_seconds, 60));
        session.write_timeout = Self::secs(self.write_timeout_seconds, 10);
        session.queue_capacity = self.client_queue_capacity.unwrap_or(256).max(1);
        session
    }

    pub fn poll_interval(&self) -> Duration {
        Self::millis(self.poll_interval_ms, 2_000)
    }

    pub fn event_channel_capacity(&self) -> usize {
        self.event_channel_capacity.unwrap_or(256).max(1)
    }

    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes.unwrap_or(512 * 1024)
    }

    /// Base URL and key for the REST peer directory, when enabled and configured.
    pub fn peer_directory(&self) -> Option<(&str, &str)> {
        if !self.peer_directory.unwrap_or(true) {
            return None;
        }
        Some((self.supabase_url.as_deref()?, self.api_key.as_deref()?))
    }

    /// Certificate and key paths, only when both files exist.
    pub fn tls_paths(&self) -> Option<(PathBuf, PathBuf)> {
        let cert = self.tls_cert_path.clone()?;
        let key = self.tls_key_path.clone()?;
        if cert.exists() && key.exists() {
            Some((cert, key))
        } else {
            log::info!(
                "TLS files not found ({} / {}). Serving plain HTTP.",
                cert.display(),
                key.display()
            );
            None
        }
    }
}

/// defaults < config file < environment/CLI.
pub fn load_config() -> Config {
    load_config_from(Config::parse())
}

fn load_config_from(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }
    current_config = current_config.merge(cli);

    // Apply default TLS paths if not already set
    if current_config.tls_cert_path.is_none() || current_config.tls_key_path.is_none() {
        if let Some(home_dir) = dirs::home_dir() {
            let letsencrypt_dir = home_dir.join(".letsencrypt");
            if current_config.tls_cert_path.is_none() {
                current_config.tls_cert_path = Some(letsencrypt_dir.join("fullchain.pem"));
            }
            if current_config.tls_key_path.is_none() {
                current_config.tls_key_path = Some(letsencrypt_dir.join("privkey.pem"));
            }
        } else {
            log::warn!("Could not determine home directory for default TLS paths.");
        }
    }

    current_config
}

fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            path.display()
        );
        return None;
    }
    let config_str = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str::<Config>(&config_str) {
        Ok(config) => Some(config),
        Err(e) => {
            log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}
