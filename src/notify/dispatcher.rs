//! Alert fan-out: immediate in-app relay plus a timed, throttled push batch.

use std::sync::{Arc, Mutex};

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::health::MetricsSink;
use crate::clock::Clock;
use crate::config::{DispatcherConfig, PUSH_CHANNEL};
use crate::db::store::hour_bucket;
use crate::db::Store;
use crate::notify::format::{push_payload, title};
use crate::notify::push::{PushError, PushOptions, PushSender};
use crate::notify::quiet_hours::QuietHours;
use crate::types::ValueAlert;
use crate::ws::{Hub, ServerMessage};

/// What a batch drain did with the alerts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Empty,
    QuietHours(usize),
    RateLimited(usize),
    /// Push not configured or not opted into.
    Skipped(usize),
    Delivered(usize),
    SubscriptionRemoved(usize),
    Failed(usize),
}

pub struct Dispatcher {
    config: DispatcherConfig,
    hub: Arc<Hub>,
    store: Arc<dyn Store>,
    sender: Arc<dyn PushSender>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    pending: Mutex<Vec<ValueAlert>>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        hub: Arc<Hub>,
        store: Arc<dyn Store>,
        sender: Arc<dyn PushSender>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            config,
            hub,
            store,
            sender,
            clock,
            metrics,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Queue for the next push batch and relay in-app right away.
    pub async fn queue_alert(&self, alert: ValueAlert) {
        if !self.config.enabled {
            debug!(alert_id = %alert.id, "notifications disabled, alert ignored");
            return;
        }

        self.lock_pending().push(alert.clone());
        self.metrics.alert_queued();
        info!(
            player = %alert.player,
            category = %alert.category,
            direction = %alert.direction,
            confidence = %alert.confidence,
            "alert queued"
        );

        let relay = match self.store.preferences().await {
            Ok(prefs) => prefs.enable_websocket,
            Err(e) => {
                warn!("preferences lookup failed, relaying alert anyway: {e}");
                true
            }
        };
        if relay {
            self.hub.broadcast_all(&ServerMessage::value_alert(alert));
        }
    }

    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    /// Drain the queue and attempt one push for everything in it.
    pub async fn flush(&self) -> FlushOutcome {
        let batch = std::mem::take(&mut *self.lock_pending());
        if batch.is_empty() {
            return FlushOutcome::Empty;
        }
        let n = batch.len();

        let prefs = match self.store.preferences().await {
            Ok(p) => p,
            Err(e) => {
                warn!(alerts = n, "preferences unavailable, dropping push batch: {e}");
                return FlushOutcome::Failed(n);
            }
        };

        let now = self.clock.now();
        if QuietHours::from_prefs(&prefs).contains(now) {
            info!(alerts = n, summary = %title(&batch), "quiet hours, push skipped");
            return FlushOutcome::QuietHours(n);
        }

        let window = hour_bucket(now);
        match self.store.rate_limit_count(PUSH_CHANNEL, window).await {
            Ok(sent) if sent >= prefs.rate_limit_push => {
                info!(alerts = n, sent, limit = prefs.rate_limit_push, "push rate limit reached, batch dropped");
                return FlushOutcome::RateLimited(n);
            }
            Ok(_) => {}
            Err(e) => warn!("rate limit lookup failed, sending anyway: {e}"),
        }

        let Some(subject) = self.config.push_subject.clone() else {
            debug!(alerts = n, "push signing identity not configured, skipping push");
            return FlushOutcome::Skipped(n);
        };
        let subscription = match (&prefs.push_subscription, prefs.enable_push) {
            (Some(sub), true) => sub.clone(),
            _ => {
                debug!(alerts = n, "push not enabled");
                return FlushOutcome::Skipped(n);
            }
        };

        let opts = PushOptions { ttl_secs: self.config.push_ttl_secs, subject };
        let payload = push_payload(batch);
        let result = tokio::time::timeout(
            self.config.push_timeout,
            self.sender.send(&subscription, &payload, &opts),
        )
        .await
        .unwrap_or_else(|_| Err(PushError::Transient("push timed out".to_string())));

        match result {
            Ok(()) => {
                self.metrics.push_delivered(true);
                if let Err(e) = self.store.increment_rate_limit(PUSH_CHANNEL, window).await {
                    warn!("rate limit increment failed: {e}");
                }
                info!(alerts = n, title = %payload.title, "push sent");
                FlushOutcome::Delivered(n)
            }
            Err(PushError::InvalidSubscription(reason)) => {
                self.metrics.push_delivered(false);
                warn!(%reason, "push subscription invalid, disabling push");
                if let Err(e) = self.store.disable_push().await {
                    error!("failed to disable push: {e}");
                }
                FlushOutcome::SubscriptionRemoved(n)
            }
            Err(PushError::Transient(reason)) => {
                self.metrics.push_delivered(false);
                warn!(alerts = n, %reason, "push failed, batch dropped");
                FlushOutcome::Failed(n)
            }
        }
    }

    /// Batch timer. Performs one last flush when cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.config.batch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // consume immediate first tick
        info!(interval_secs = self.config.batch_interval.as_secs(), "notification dispatcher started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let outcome = self.flush().await;
                    info!(?outcome, "notification dispatcher stopped after final flush");
                    return;
                }
                _ = ticker.tick() => {
                    let outcome = self.flush().await;
                    if outcome != FlushOutcome::Empty {
                        debug!(?outcome, "batch flushed");
                    }
                }
            }
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<ValueAlert>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}
