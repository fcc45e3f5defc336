use std::time::Duration;

use crate::error::{AppError, Result};
use crate::types::Topic;

pub const ODDS_API_URL: &str = "https://api.the-odds-api.com/v4";

/// Bookmakers kept after every fetch; everything else is filtered out.
pub const DEFAULT_BOOKMAKERS: &[&str] = &["draftkings", "fanduel", "betmgm"];

/// Time allowed to flush one outbound frame to a client.
pub const WS_WRITE_WAIT_SECS: u64 = 10;

/// Idle read deadline. Any inbound frame (including pongs) renews it.
pub const WS_PONG_WAIT_SECS: u64 = 60;

/// Keepalive ping period. Must be shorter than the pong wait.
pub const WS_PING_PERIOD_SECS: u64 = WS_PONG_WAIT_SECS * 9 / 10;

/// Maximum inbound frame size in bytes. Control messages are tiny.
pub const WS_MAX_FRAME_BYTES: usize = 1024;

/// Bounded per-client outbound mailbox.
pub const WS_MAILBOX_CAPACITY: usize = 256;

/// Upper bound on queued messages coalesced into one physical frame.
pub const WS_MAX_COALESCE: usize = 64;

/// A suppressed alert re-fires once the line moves at least this much.
pub const RE_ALERT_EPSILON: f64 = 0.5;

/// Cooldowns per confidence tier (seconds). Stronger signals re-fire sooner.
pub mod cooldowns {
    pub const HIGH_SECS: i64 = 3_600;
    pub const MEDIUM_SECS: i64 = 2 * 3_600;
    pub const LOW_SECS: i64 = 4 * 3_600;
}

/// Confidence ratio cut-offs (|diff| / threshold).
pub mod confidence_ratios {
    pub const HIGH_MIN: f64 = 2.0;
    pub const MEDIUM_MIN: f64 = 1.5;
}

/// Push channel name used for rate-limit windows.
pub const PUSH_CHANNEL: &str = "push";

/// Store maintenance interval (seconds).
pub const MAINTENANCE_INTERVAL_SECS: u64 = 3_600;

/// How long shutdown waits for the dispatcher's final flush.
pub const SHUTDOWN_FLUSH_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    pub odds_api_url: String,
    pub odds_api_key: String,
    /// Allow-listed bookmaker keys (ODDS_BOOKMAKERS, comma-separated)
    pub bookmakers: Vec<String>,
    pub fetch_timeout_secs: u64,
    /// Start with polling switched on (POLL_ENABLED=true)
    pub poll_enabled: bool,
    pub poll_interval_secs: u64,
    /// Topics polled each tick, in order (POLL_TOPICS, e.g. "nba,nfl")
    pub poll_topics: Vec<Topic>,
    pub poll_max_retries: u32,
    pub poll_retry_base_ms: u64,
    /// Consecutive exhausted polls before a topic enters recovery mode
    pub poll_max_consecutive_errors: u32,
    pub poll_recovery_interval_secs: u64,
    pub ws_max_connections: usize,
    pub notify_enabled: bool,
    pub notify_batch_secs: u64,
    /// VAPID `sub` claim, mailto: or https: (PUSH_SUBJECT)
    pub push_subject: Option<String>,
    /// Base64url VAPID key pair (VAPID_PUBLIC_KEY / VAPID_PRIVATE_KEY)
    pub vapid_public_key: Option<String>,
    pub vapid_private_key: Option<String>,
    pub push_ttl_secs: u64,
    pub push_timeout_secs: u64,
    /// Fetch per-event player props and run value detection (PROPS_ENABLED)
    pub props_enabled: bool,
    /// JSON baseline document for value detection (BASELINES_PATH)
    pub baselines_path: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let odds_api_key = std::env::var("ODDS_API_KEY")
            .map_err(|_| AppError::Config("ODDS_API_KEY is required".to_string()))?;

        Ok(Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "linefinder.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            odds_api_url: std::env::var("ODDS_API_URL")
                .unwrap_or_else(|_| ODDS_API_URL.to_string()),
            odds_api_key,
            bookmakers: parse_list(
                &std::env::var("ODDS_BOOKMAKERS").unwrap_or_else(|_| DEFAULT_BOOKMAKERS.join(",")),
            ),
            fetch_timeout_secs: env_or("FETCH_TIMEOUT_SECS", 30),
            poll_enabled: env_flag("POLL_ENABLED", false),
            poll_interval_secs: env_or("POLL_INTERVAL_SECS", 60),
            poll_topics: parse_topics(
                &std::env::var("POLL_TOPICS").unwrap_or_else(|_| "nba,nfl".to_string()),
            ),
            poll_max_retries: env_or("POLL_MAX_RETRIES", 3),
            poll_retry_base_ms: env_or("POLL_RETRY_BASE_MS", 2_000),
            poll_max_consecutive_errors: env_or("POLL_MAX_CONSECUTIVE_ERRORS", 5),
            poll_recovery_interval_secs: env_or("POLL_RECOVERY_INTERVAL_SECS", 300),
            ws_max_connections: env_or("WS_MAX_CONNECTIONS", 1_000),
            notify_enabled: env_flag("NOTIFY_ENABLED", true),
            notify_batch_secs: env_or("NOTIFY_BATCH_SECS", 60),
            push_subject: std::env::var("PUSH_SUBJECT").ok().filter(|s| !s.is_empty()),
            vapid_public_key: std::env::var("VAPID_PUBLIC_KEY").ok().filter(|s| !s.is_empty()),
            vapid_private_key: std::env::var("VAPID_PRIVATE_KEY").ok().filter(|s| !s.is_empty()),
            push_ttl_secs: env_or("PUSH_TTL_SECS", 3_600),
            push_timeout_secs: env_or("PUSH_TIMEOUT_SECS", 10),
            props_enabled: env_flag("PROPS_ENABLED", false),
            baselines_path: std::env::var("BASELINES_PATH").ok().filter(|s| !s.is_empty()),
        })
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn poller(&self) -> PollerConfig {
        PollerConfig {
            enabled: self.poll_enabled,
            interval: Duration::from_secs(self.poll_interval_secs),
            topics: self.poll_topics.clone(),
            max_retries: self.poll_max_retries.max(1),
            retry_base_delay: Duration::from_millis(self.poll_retry_base_ms),
            max_consecutive_errors: self.poll_max_consecutive_errors.max(1),
            recovery_interval: Duration::from_secs(self.poll_recovery_interval_secs),
            fetch_timeout: self.fetch_timeout(),
        }
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            enabled: self.notify_enabled,
            batch_interval: Duration::from_secs(self.notify_batch_secs.max(1)),
            push_subject: self.push_ready().then(|| self.push_subject.clone()).flatten(),
            push_ttl_secs: self.push_ttl_secs,
            push_timeout: Duration::from_secs(self.push_timeout_secs),
        }
    }

    /// Push needs the full VAPID key pair and a subject.
    pub fn push_ready(&self) -> bool {
        self.push_subject.is_some() && self.vapid_public_key.is_some() && self.vapid_private_key.is_some()
    }

    pub fn hub(&self) -> HubConfig {
        HubConfig {
            max_connections: if self.ws_max_connections == 0 { 1_000 } else { self.ws_max_connections },
            mailbox_capacity: WS_MAILBOX_CAPACITY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub topics: Vec<Topic>,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub max_consecutive_errors: u32,
    pub recovery_interval: Duration,
    pub fetch_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(60),
            topics: vec![Topic::Nba, Topic::Nfl],
            max_retries: 3,
            retry_base_delay: Duration::from_secs(2),
            max_consecutive_errors: 5,
            recovery_interval: Duration::from_secs(300),
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub enabled: bool,
    pub batch_interval: Duration,
    /// Set only when VAPID keys are configured too; without it push
    /// delivery is skipped entirely.
    pub push_subject: Option<String>,
    pub push_ttl_secs: u64,
    pub push_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_interval: Duration::from_secs(60),
            push_subject: None,
            push_ttl_secs: 3_600,
            push_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub max_connections: usize,
    pub mailbox_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 1_000,
            mailbox_capacity: WS_MAILBOX_CAPACITY,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Unknown names are skipped; an empty result falls back to every topic.
fn parse_topics(raw: &str) -> Vec<Topic> {
    let mut topics: Vec<Topic> = Vec::new();
    for name in parse_list(raw) {
        if let Ok(topic) = name.parse::<Topic>() {
            if !topics.contains(&topic) {
                topics.push(topic);
            }
        }
    }
    if topics.is_empty() {
        topics = Topic::ALL.to_vec();
    }
    topics
}
