use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::RE_ALERT_EPSILON;
use crate::db::Store;
use crate::detector::classifier::cooldown_for;
use crate::detector::value::{detect_value, ValueSignal};
use crate::error::Result;
use crate::types::{AlertHistoryRecord, Thresholds, ValueAlert};

/// Why an alert was let through or held back.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    New,
    CooldownExpired,
    LineMoved(f64),
    /// History unavailable; fail open.
    LookupFailed,
    Suppressed { until: DateTime<Utc> },
}

impl Decision {
    pub fn notify(&self) -> bool {
        !matches!(self, Decision::Suppressed { .. })
    }
}

/// Threshold lookup plus history-backed dedup.
pub struct ValueDetector {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    thresholds: RwLock<Thresholds>,
}

impl ValueDetector {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, thresholds: Thresholds) -> Self {
        Self { store, clock, thresholds: RwLock::new(thresholds) }
    }

    pub fn thresholds(&self) -> Thresholds {
        *self.thresholds.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Swap thresholds without a restart. Non-positive values are rejected.
    pub fn update_thresholds(&self, thresholds: Thresholds) -> Result<()> {
        thresholds.validate()?;
        *self.thresholds.write().unwrap_or_else(|e| e.into_inner()) = thresholds;
        debug!(?thresholds, "thresholds updated");
        Ok(())
    }

    pub fn detect(&self, category: &str, observed: f64, baseline: f64) -> Option<ValueSignal> {
        detect_value(observed, baseline, self.thresholds().for_category(category))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn should_notify(&self, alert: &ValueAlert) -> Decision {
        let record = match self.store.alert_history(&alert.key()).await {
            Ok(Some(r)) => r,
            Ok(None) => return Decision::New,
            Err(e) => {
                warn!(alert_id = %alert.id, "alert history lookup failed, notifying anyway: {e}");
                return Decision::LookupFailed;
            }
        };

        if self.clock.now() >= record.cooldown_until {
            return Decision::CooldownExpired;
        }

        let moved = (alert.line - record.line).abs();
        if moved >= RE_ALERT_EPSILON {
            Decision::LineMoved(moved)
        } else {
            Decision::Suppressed { until: record.cooldown_until }
        }
    }

    /// Upsert history with a confidence-scaled cooldown.
    pub async fn record_alert(&self, alert: &ValueAlert) -> Result<()> {
        let record = AlertHistoryRecord {
            key: alert.key(),
            line: alert.line,
            average: alert.average,
            difference: alert.difference,
            confidence: alert.confidence,
            cooldown_until: self.clock.now() + cooldown_for(alert.confidence),
        };
        self.store.upsert_alert_history(&record).await
    }
}
