use std::collections::BTreeMap;

use serde::Deserialize;

// ---------------------------------------------------------------------------
// API response types (mirror the /health shape)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HealthResponse {
    pub status: String,
    pub warnings: Vec<String>,
    pub hub: HubStats,
    pub polling: PollingStatus,
    pub pending_alerts: u64,
    pub metrics: Metrics,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HubStats {
    pub connections: u64,
    pub max_connections: u64,
    pub subscribers: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PollingStatus {
    pub enabled: bool,
    pub recovery_mode: bool,
    pub interval_secs: u64,
    pub current_interval_secs: u64,
    pub topics: BTreeMap<String, TopicStatus>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TopicStatus {
    pub in_recovery: bool,
    pub consecutive_errors: u32,
    pub last_poll_age_secs: Option<i64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Metrics {
    pub uptime_secs: u64,
    pub polling: PollingMetrics,
    pub websocket: WebSocketMetrics,
    pub notifications: NotificationMetrics,
    pub quota: QuotaMetrics,
    pub topics: BTreeMap<String, TopicMetrics>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PollingMetrics {
    pub total: u64,
    pub failed: u64,
    pub success_rate_pct: f64,
    pub changes_detected: u64,
    pub latency_p50_ms: Option<f64>,
    pub latency_p95_ms: Option<f64>,
    pub latency_p99_ms: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WebSocketMetrics {
    pub peak_connections: u64,
    pub total_connections: u64,
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub delivery_rate_pct: f64,
    pub broadcasts: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct NotificationMetrics {
    pub alerts_queued: u64,
    pub pushes_sent: u64,
    pub pushes_failed: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct QuotaMetrics {
    pub remaining: u64,
    pub used: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TopicMetrics {
    pub polls: u64,
    pub errors: u64,
    pub changes: u64,
}

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    Connected,
    Error(String),
    Connecting,
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub status: ConnectionStatus,
    pub health: HealthResponse,
    pub base_url: String,
}

impl AppState {
    pub fn new(base_url: String) -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            health: HealthResponse::default(),
            base_url,
        }
    }

    /// One row per polled topic: (name, status, metrics).
    pub fn topic_rows(&self) -> Vec<(&str, TopicStatus, TopicMetrics)> {
        self.health
            .polling
            .topics
            .iter()
            .map(|(name, status)| {
                let metrics = self.health.metrics.topics.get(name).cloned().unwrap_or_default();
                (name.as_str(), status.clone(), metrics)
            })
            .collect()
    }

    pub async fn refresh(&mut self, client: &reqwest::Client) {
        let url = format!("{}/health", self.base_url);
        let resp = match client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                self.status = ConnectionStatus::Error(format!("{e}"));
                return;
            }
        };
        match resp.json::<HealthResponse>().await {
            Ok(health) => {
                self.health = health;
                self.status = ConnectionStatus::Connected;
            }
            Err(e) => self.status = ConnectionStatus::Error(format!("parse error: {e}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

pub fn format_age(secs: Option<i64>) -> String {
    match secs {
        Some(s) if s < 60 => format!("{}s ago", s.max(0)),
        Some(s) if s < 3_600 => format!("{}m ago", s / 60),
        Some(s) => format!("{}h ago", s / 3_600),
        None => "never".to_string(),
    }
}

pub fn format_uptime(secs: u64) -> String {
    let h = secs / 3_600;
    let m = (secs / 60) % 60;
    let s = secs % 60;
    if h > 0 {
        format!("{h}h {m:02}m")
    } else {
        format!("{m}m {s:02}s")
    }
}

pub fn format_ms(v: Option<f64>) -> String {
    v.map_or("—".to_string(), |ms| format!("{ms:.0}ms"))
}

pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{head}…")
    }
}

#[allow(dead_code)]
fn main() {
    // Loaded as a module by tui.rs; also discovered as a bin target.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ages_scale_units() {
        assert_eq!(format_age(Some(12)), "12s ago");
        assert_eq!(format_age(Some(125)), "2m ago");
        assert_eq!(format_age(Some(7_300)), "2h ago");
        assert_eq!(format_age(None), "never");
    }

    #[test]
    fn uptime_and_truncate() {
        assert_eq!(format_uptime(65), "1m 05s");
        assert_eq!(format_uptime(3_720), "1h 02m");
        assert_eq!(truncate("connection refused", 8), "connect…");
        assert_eq!(truncate("ok", 8), "ok");
    }

    #[test]
    fn partial_health_documents_parse() {
        let h: HealthResponse = serde_json::from_str(
            r#"{"status":"degraded","polling":{"enabled":true,"topics":{"nba":{"in_recovery":true,"consecutive_errors":5}}}}"#,
        )
        .unwrap();
        assert_eq!(h.status, "degraded");
        assert!(h.polling.topics["nba"].in_recovery);
        assert_eq!(h.metrics.uptime_secs, 0);
    }
}
