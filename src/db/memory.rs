//! DashMap-backed store for tests. Can be switched into a failing mode
//! to exercise fail-open paths.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::db::store::{CleanupStats, Store, HISTORY_RETENTION_SECS, RATE_WINDOW_RETENTION_SECS};
use crate::error::{AppError, Result};
use crate::types::{AlertHistoryRecord, AlertKey, Preferences};

#[derive(Default)]
pub struct MemoryStore {
    history: DashMap<AlertKey, AlertHistoryRecord>,
    windows: DashMap<(String, i64), u32>,
    prefs: Mutex<Preferences>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_preferences(prefs: Preferences) -> Self {
        Self { prefs: Mutex::new(prefs), ..Self::default() }
    }

    /// Every call errors while set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(AppError::Io(std::io::Error::other("store unavailable")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn alert_history(&self, key: &AlertKey) -> Result<Option<AlertHistoryRecord>> {
        self.check()?;
        Ok(self.history.get(key).map(|r| r.clone()))
    }

    async fn upsert_alert_history(&self, record: &AlertHistoryRecord) -> Result<()> {
        self.check()?;
        self.history.insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn rate_limit_count(&self, channel: &str, window_start: i64) -> Result<u32> {
        self.check()?;
        Ok(self
            .windows
            .get(&(channel.to_string(), window_start))
            .map_or(0, |c| *c))
    }

    async fn increment_rate_limit(&self, channel: &str, window_start: i64) -> Result<u32> {
        self.check()?;
        let mut count = self.windows.entry((channel.to_string(), window_start)).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn preferences(&self) -> Result<Preferences> {
        self.check()?;
        Ok(self.prefs.lock().unwrap().clone())
    }

    async fn update_preferences(&self, prefs: &Preferences) -> Result<()> {
        self.check()?;
        *self.prefs.lock().unwrap() = prefs.clone();
        Ok(())
    }

    async fn set_push_subscription(&self, subscription: &str) -> Result<()> {
        self.check()?;
        let mut prefs = self.prefs.lock().unwrap();
        prefs.enable_push = true;
        prefs.push_subscription = Some(subscription.to_string());
        Ok(())
    }

    async fn disable_push(&self) -> Result<()> {
        self.check()?;
        let mut prefs = self.prefs.lock().unwrap();
        prefs.enable_push = false;
        prefs.push_subscription = None;
        Ok(())
    }

    async fn unsubscribe_all(&self) -> Result<()> {
        self.disable_push().await?;
        self.prefs.lock().unwrap().enable_websocket = false;
        Ok(())
    }

    async fn cleanup(&self, now: DateTime<Utc>) -> Result<CleanupStats> {
        self.check()?;
        let history_before = self.history.len();
        let windows_before = self.windows.len();
        let history_cutoff = now - chrono::Duration::seconds(HISTORY_RETENTION_SECS);
        let window_cutoff = now.timestamp() - RATE_WINDOW_RETENTION_SECS;
        self.history.retain(|_, r| r.cooldown_until >= history_cutoff);
        self.windows.retain(|(_, start), _| *start >= window_cutoff);
        Ok(CleanupStats {
            history_removed: (history_before - self.history.len()) as u64,
            windows_removed: (windows_before - self.windows.len()) as u64,
        })
    }
}
