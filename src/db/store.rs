use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{AlertHistoryRecord, AlertKey, Preferences};

/// Durable keyed state consumed by the detector and dispatcher.
#[async_trait]
pub trait Store: Send + Sync {
    async fn alert_history(&self, key: &AlertKey) -> Result<Option<AlertHistoryRecord>>;

    /// Insert or overwrite the record for `record.key`.
    async fn upsert_alert_history(&self, record: &AlertHistoryRecord) -> Result<()>;

    /// Sends recorded on `channel` in the hour starting at `window_start`.
    async fn rate_limit_count(&self, channel: &str, window_start: i64) -> Result<u32>;

    /// Bump the window counter, returning the new count.
    async fn increment_rate_limit(&self, channel: &str, window_start: i64) -> Result<u32>;

    async fn preferences(&self) -> Result<Preferences>;

    async fn update_preferences(&self, prefs: &Preferences) -> Result<()>;

    /// Store a browser subscription and opt into push.
    async fn set_push_subscription(&self, subscription: &str) -> Result<()>;

    /// Turn push off and forget the subscription endpoint.
    async fn disable_push(&self) -> Result<()>;

    /// Opt out of every channel, in-app relay included.
    async fn unsubscribe_all(&self) -> Result<()>;

    /// Drop history whose cooldown ended over a day ago and rate windows
    /// older than two hours.
    async fn cleanup(&self, now: DateTime<Utc>) -> Result<CleanupStats>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub history_removed: u64,
    pub windows_removed: u64,
}

pub const HISTORY_RETENTION_SECS: i64 = 24 * 3_600;
pub const RATE_WINDOW_RETENTION_SECS: i64 = 2 * 3_600;

/// Start of the UTC hour containing `now`, in unix seconds.
pub fn hour_bucket(now: DateTime<Utc>) -> i64 {
    let ts = now.timestamp();
    ts - ts.rem_euclid(3_600)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn hour_bucket_truncates_to_the_hour() {
        let t = Utc.with_ymd_and_hms(2025, 1, 15, 19, 42, 17).unwrap();
        let start = Utc.with_ymd_and_hms(2025, 1, 15, 19, 0, 0).unwrap();
        assert_eq!(hour_bucket(t), start.timestamp());
        assert_eq!(hour_bucket(start), start.timestamp());
    }
}
