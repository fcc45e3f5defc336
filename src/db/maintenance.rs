use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::db::store::{CleanupStats, Store};
use crate::error::Result;

/// Background task that prunes expired alert history and stale
/// rate-limit windows on a fixed interval.
pub struct StoreMaintenance {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl StoreMaintenance {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self { store, clock, interval }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await; // consume immediate first tick

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("store maintenance stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!("Store maintenance error: {e}");
                    }
                }
            }
        }
    }

    pub async fn run_once(&self) -> Result<CleanupStats> {
        let stats = self.store.cleanup(self.clock.now()).await?;
        if stats.history_removed > 0 || stats.windows_removed > 0 {
            info!(
                history_removed = stats.history_removed,
                windows_removed = stats.windows_removed,
                "store cleanup"
            );
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::db::memory::MemoryStore;
    use crate::types::{AlertHistoryRecord, AlertKey, Confidence, Direction};
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn run_once_prunes_through_the_store() {
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap();
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_alert_history(&AlertHistoryRecord {
                key: AlertKey {
                    player: "Player 2".into(),
                    category: "Assists".into(),
                    direction: Direction::Under,
                    event_id: "evt9".into(),
                },
                line: 9.5,
                average: 7.0,
                difference: 2.5,
                confidence: Confidence::High,
                cooldown_until: now - chrono::Duration::hours(30),
            })
            .await
            .unwrap();

        let task = StoreMaintenance::new(
            store.clone(),
            Arc::new(FixedClock::new(now)),
            Duration::from_secs(3_600),
        );
        let stats = task.run_once().await.unwrap();
        assert_eq!(stats.history_removed, 1);
        assert_eq!(store.history_len(), 0);
    }

    #[tokio::test]
    async fn run_exits_on_cancel() {
        let task = StoreMaintenance::new(
            Arc::new(MemoryStore::new()),
            Arc::new(crate::clock::SystemClock),
            Duration::from_secs(3_600),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(task.run(cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
