//! Process-wide counters behind the /health endpoint.
//! Components write through `MetricsSink`; only the API reads back.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::api::latency::LatencyStats;
use crate::types::Topic;

/// Fire-and-forget observer handed to the hub, scheduler and dispatcher.
pub trait MetricsSink: Send + Sync {
    fn poll_finished(&self, topic: Topic, ok: bool, elapsed: Duration, error: Option<&str>);
    fn data_changed(&self, topic: Topic);
    fn connection_opened(&self);
    fn connection_closed(&self);
    fn messages_sent(&self, count: u64, bytes: u64);
    fn message_failed(&self);
    fn broadcast(&self, recipients: usize);
    fn subscribers_changed(&self, topic: Topic, count: usize);
    fn alert_queued(&self);
    fn push_delivered(&self, ok: bool);
    fn quota_observed(&self, remaining: u64, used: u64);
}

/// Discards everything. Used where nobody reads the numbers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn poll_finished(&self, _: Topic, _: bool, _: Duration, _: Option<&str>) {}
    fn data_changed(&self, _: Topic) {}
    fn connection_opened(&self) {}
    fn connection_closed(&self) {}
    fn messages_sent(&self, _: u64, _: u64) {}
    fn message_failed(&self) {}
    fn broadcast(&self, _: usize) {}
    fn subscribers_changed(&self, _: Topic, _: usize) {}
    fn alert_queued(&self) {}
    fn push_delivered(&self, _: bool) {}
    fn quota_observed(&self, _: u64, _: u64) {}
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct TopicMetrics {
    pub polls: u64,
    pub errors: u64,
    pub changes: u64,
    pub subscribers: usize,
    pub last_poll_at: Option<DateTime<Utc>>,
}

/// Atomic counters plus a poll-latency histogram.
pub struct HealthMetrics {
    started_at: Instant,

    polls_total: AtomicU64,
    polls_success: AtomicU64,
    polls_failed: AtomicU64,
    consecutive_errors: AtomicU64,
    last_poll_ms: AtomicU64,
    last_poll_at: Mutex<Option<DateTime<Utc>>>,
    last_change_at: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
    changes_detected: AtomicU64,

    connections_current: AtomicU64,
    connections_peak: AtomicU64,
    connections_total: AtomicU64,
    messages_sent: AtomicU64,
    messages_failed: AtomicU64,
    bytes_sent: AtomicU64,
    broadcasts: AtomicU64,

    alerts_queued: AtomicU64,
    pushes_sent: AtomicU64,
    pushes_failed: AtomicU64,

    quota_remaining: AtomicU64,
    quota_used: AtomicU64,

    topics: DashMap<Topic, TopicMetrics>,
    poll_latency: LatencyStats,
}

impl HealthMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            polls_total: AtomicU64::new(0),
            polls_success: AtomicU64::new(0),
            polls_failed: AtomicU64::new(0),
            consecutive_errors: AtomicU64::new(0),
            last_poll_ms: AtomicU64::new(0),
            last_poll_at: Mutex::new(None),
            last_change_at: Mutex::new(None),
            last_error: Mutex::new(None),
            changes_detected: AtomicU64::new(0),
            connections_current: AtomicU64::new(0),
            connections_peak: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
            alerts_queued: AtomicU64::new(0),
            pushes_sent: AtomicU64::new(0),
            pushes_failed: AtomicU64::new(0),
            quota_remaining: AtomicU64::new(0),
            quota_used: AtomicU64::new(0),
            topics: DashMap::new(),
            poll_latency: LatencyStats::new(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let polls_total = self.polls_total.load(Ordering::Relaxed);
        let polls_success = self.polls_success.load(Ordering::Relaxed);
        let messages_sent = self.messages_sent.load(Ordering::Relaxed);
        let messages_failed = self.messages_failed.load(Ordering::Relaxed);
        let (p50, p95, p99) = self.poll_latency.percentiles();

        let topics = self
            .topics
            .iter()
            .map(|e| (e.key().to_string(), e.value().clone()))
            .collect();

        MetricsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            polling: PollingMetrics {
                total: polls_total,
                success: polls_success,
                failed: self.polls_failed.load(Ordering::Relaxed),
                success_rate_pct: percent(polls_success, polls_total),
                consecutive_errors: self.consecutive_errors.load(Ordering::Relaxed),
                last_duration_ms: self.last_poll_ms.load(Ordering::Relaxed),
                last_poll_at: *lock(&self.last_poll_at),
                last_change_at: *lock(&self.last_change_at),
                last_error: lock(&self.last_error).clone(),
                changes_detected: self.changes_detected.load(Ordering::Relaxed),
                latency_p50_ms: p50.map(us_to_ms),
                latency_p95_ms: p95.map(us_to_ms),
                latency_p99_ms: p99.map(us_to_ms),
            },
            websocket: WebSocketMetrics {
                current_connections: self.connections_current.load(Ordering::Relaxed),
                peak_connections: self.connections_peak.load(Ordering::Relaxed),
                total_connections: self.connections_total.load(Ordering::Relaxed),
                messages_sent,
                messages_failed,
                delivery_rate_pct: percent(messages_sent, messages_sent + messages_failed),
                bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
                broadcasts: self.broadcasts.load(Ordering::Relaxed),
            },
            notifications: NotificationMetrics {
                alerts_queued: self.alerts_queued.load(Ordering::Relaxed),
                pushes_sent: self.pushes_sent.load(Ordering::Relaxed),
                pushes_failed: self.pushes_failed.load(Ordering::Relaxed),
            },
            quota: QuotaMetrics {
                remaining: self.quota_remaining.load(Ordering::Relaxed),
                used: self.quota_used.load(Ordering::Relaxed),
            },
            topics,
        }
    }
}

impl Default for HealthMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for HealthMetrics {
    fn poll_finished(&self, topic: Topic, ok: bool, elapsed: Duration, error: Option<&str>) {
        let now = Utc::now();
        self.polls_total.fetch_add(1, Ordering::Relaxed);
        self.last_poll_ms.store(elapsed.as_millis() as u64, Ordering::Relaxed);
        self.poll_latency.record(elapsed);
        *lock(&self.last_poll_at) = Some(now);

        if ok {
            self.polls_success.fetch_add(1, Ordering::Relaxed);
            self.consecutive_errors.store(0, Ordering::Relaxed);
        } else {
            self.polls_failed.fetch_add(1, Ordering::Relaxed);
            self.consecutive_errors.fetch_add(1, Ordering::Relaxed);
            *lock(&self.last_error) = error.map(str::to_string);
        }

        let mut entry = self.topics.entry(topic).or_default();
        entry.polls += 1;
        entry.last_poll_at = Some(now);
        if !ok {
            entry.errors += 1;
        }
    }

    fn data_changed(&self, topic: Topic) {
        self.changes_detected.fetch_add(1, Ordering::Relaxed);
        *lock(&self.last_change_at) = Some(Utc::now());
        self.topics.entry(topic).or_default().changes += 1;
    }

    fn connection_opened(&self) {
        let current = self.connections_current.fetch_add(1, Ordering::Relaxed) + 1;
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_peak.fetch_max(current, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        let _ = self
            .connections_current
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    fn messages_sent(&self, count: u64, bytes: u64) {
        self.messages_sent.fetch_add(count, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    fn message_failed(&self) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn broadcast(&self, _recipients: usize) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
    }

    fn subscribers_changed(&self, topic: Topic, count: usize) {
        self.topics.entry(topic).or_default().subscribers = count;
    }

    fn alert_queued(&self) {
        self.alerts_queued.fetch_add(1, Ordering::Relaxed);
    }

    fn push_delivered(&self, ok: bool) {
        if ok {
            self.pushes_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.pushes_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn quota_observed(&self, remaining: u64, used: u64) {
        self.quota_remaining.store(remaining, Ordering::Relaxed);
        self.quota_used.store(used, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub polling: PollingMetrics,
    pub websocket: WebSocketMetrics,
    pub notifications: NotificationMetrics,
    pub quota: QuotaMetrics,
    pub topics: BTreeMap<String, TopicMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollingMetrics {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub success_rate_pct: f64,
    pub consecutive_errors: u64,
    pub last_duration_ms: u64,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_change_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub changes_detected: u64,
    pub latency_p50_ms: Option<f64>,
    pub latency_p95_ms: Option<f64>,
    pub latency_p99_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebSocketMetrics {
    pub current_connections: u64,
    pub peak_connections: u64,
    pub total_connections: u64,
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub delivery_rate_pct: f64,
    pub bytes_sent: u64,
    pub broadcasts: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationMetrics {
    pub alerts_queued: u64,
    pub pushes_sent: u64,
    pub pushes_failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaMetrics {
    pub remaining: u64,
    pub used: u64,
}

/// Overall service status.
/// Ordered healthy < degraded < unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Classify from poll error streaks, recovery mode, and staleness.
/// Returns the status plus human-readable warnings.
pub fn classify(
    snapshot: &MetricsSnapshot,
    polling_enabled: bool,
    any_recovery: bool,
    now: DateTime<Utc>,
) -> (HealthStatus, Vec<String>) {
    let mut status = HealthStatus::Healthy;
    let mut warnings = Vec::new();

    let streak = snapshot.polling.consecutive_errors;
    if streak >= 5 {
        status = HealthStatus::Unhealthy;
        warnings.push("high consecutive poll errors".to_string());
    } else if streak >= 3 {
        status = HealthStatus::Degraded;
        warnings.push("multiple consecutive poll errors".to_string());
    }

    if any_recovery {
        status = status.max(HealthStatus::Degraded);
        warnings.push("polling in recovery mode".to_string());
    }

    if let (true, Some(last)) = (polling_enabled, snapshot.polling.last_poll_at) {
        if now - last > chrono::Duration::minutes(5) {
            status = status.max(HealthStatus::Degraded);
            warnings.push("polling appears stale (>5 min since last poll)".to_string());
        }
    }

    let ws = &snapshot.websocket;
    if ws.messages_sent > 100 && ws.delivery_rate_pct < 95.0 {
        warnings.push("message delivery rate below 95%".to_string());
    }

    (status, warnings)
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 / whole as f64 * 100.0
}

fn us_to_ms(us: u64) -> f64 {
    us as f64 / 1_000.0
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
