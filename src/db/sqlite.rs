use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::db::models::{AlertHistoryRow, PreferencesRow};
use crate::db::store::{CleanupStats, Store, HISTORY_RETENTION_SECS, RATE_WINDOW_RETENTION_SECS};
use crate::error::Result;
use crate::types::{AlertHistoryRecord, AlertKey, Preferences};

/// SQLite-backed store. Schema lives in `migrations/`.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) and migrate the database at `path`.
    pub async fn open(path: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(5).connect_with(opts).await?;
        let store = Self::from_pool(pool).await?;
        info!("Database ready at {path}");
        Ok(store)
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn alert_history(&self, key: &AlertKey) -> Result<Option<AlertHistoryRecord>> {
        let row = sqlx::query_as::<_, AlertHistoryRow>(
            r#"
            SELECT player_name, prop_category, direction, event_id,
                   line_value, average_value, difference, confidence, cooldown_until
            FROM alert_history
            WHERE player_name = ? AND prop_category = ? AND direction = ? AND event_id = ?
            "#,
        )
        .bind(&key.player)
        .bind(&key.category)
        .bind(key.direction.to_string())
        .bind(&key.event_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AlertHistoryRecord::try_from).transpose()
    }

    async fn upsert_alert_history(&self, record: &AlertHistoryRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alert_history (
                player_name, prop_category, direction, event_id,
                line_value, average_value, difference, confidence, cooldown_until
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (player_name, prop_category, direction, event_id) DO UPDATE SET
                line_value = excluded.line_value,
                average_value = excluded.average_value,
                difference = excluded.difference,
                confidence = excluded.confidence,
                cooldown_until = excluded.cooldown_until,
                created_at = strftime('%s', 'now')
            "#,
        )
        .bind(&record.key.player)
        .bind(&record.key.category)
        .bind(record.key.direction.to_string())
        .bind(&record.key.event_id)
        .bind(record.line)
        .bind(record.average)
        .bind(record.difference)
        .bind(record.confidence.to_string())
        .bind(record.cooldown_until.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn rate_limit_count(&self, channel: &str, window_start: i64) -> Result<u32> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT count FROM rate_limits WHERE channel = ? AND window_start = ?",
        )
        .bind(channel)
        .bind(window_start)
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.unwrap_or(0).max(0) as u32)
    }

    async fn increment_rate_limit(&self, channel: &str, window_start: i64) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO rate_limits (channel, window_start, count) VALUES (?, ?, 1)
            ON CONFLICT (channel, window_start) DO UPDATE SET count = count + 1
            RETURNING count
            "#,
        )
        .bind(channel)
        .bind(window_start)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u32)
    }

    async fn preferences(&self) -> Result<Preferences> {
        let row = sqlx::query_as::<_, PreferencesRow>(
            r#"
            SELECT enable_websocket, enable_push, push_subscription,
                   threshold_points, threshold_rebounds, threshold_assists,
                   threshold_threes, threshold_default,
                   quiet_start, quiet_end, timezone, rate_limit_push
            FROM preferences WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Preferences::from).unwrap_or_default())
    }

    async fn update_preferences(&self, p: &Preferences) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO preferences (
                id, enable_websocket, enable_push, push_subscription,
                threshold_points, threshold_rebounds, threshold_assists,
                threshold_threes, threshold_default,
                quiet_start, quiet_end, timezone, rate_limit_push, updated_at
            ) VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, strftime('%s', 'now'))
            ON CONFLICT (id) DO UPDATE SET
                enable_websocket = excluded.enable_websocket,
                enable_push = excluded.enable_push,
                push_subscription = excluded.push_subscription,
                threshold_points = excluded.threshold_points,
                threshold_rebounds = excluded.threshold_rebounds,
                threshold_assists = excluded.threshold_assists,
                threshold_threes = excluded.threshold_threes,
                threshold_default = excluded.threshold_default,
                quiet_start = excluded.quiet_start,
                quiet_end = excluded.quiet_end,
                timezone = excluded.timezone,
                rate_limit_push = excluded.rate_limit_push,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(p.enable_websocket)
        .bind(p.enable_push)
        .bind(p.push_subscription.as_deref())
        .bind(p.thresholds.points)
        .bind(p.thresholds.rebounds)
        .bind(p.thresholds.assists)
        .bind(p.thresholds.threes)
        .bind(p.thresholds.default)
        .bind(&p.quiet_start)
        .bind(&p.quiet_end)
        .bind(&p.timezone)
        .bind(i64::from(p.rate_limit_push))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_push_subscription(&self, subscription: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE preferences
            SET push_subscription = ?, enable_push = 1, updated_at = strftime('%s', 'now')
            WHERE id = 1
            "#,
        )
        .bind(subscription)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unsubscribe_all(&self) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE preferences
            SET enable_websocket = 0, enable_push = 0, push_subscription = NULL,
                updated_at = strftime('%s', 'now')
            WHERE id = 1
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn disable_push(&self) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE preferences
            SET enable_push = 0, push_subscription = NULL, updated_at = strftime('%s', 'now')
            WHERE id = 1
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cleanup(&self, now: DateTime<Utc>) -> Result<CleanupStats> {
        let now = now.timestamp();
        let history = sqlx::query("DELETE FROM alert_history WHERE cooldown_until < ?")
            .bind(now - HISTORY_RETENTION_SECS)
            .execute(&self.pool)
            .await?;
        let windows = sqlx::query("DELETE FROM rate_limits WHERE window_start < ?")
            .bind(now - RATE_WINDOW_RETENTION_SECS)
            .execute(&self.pool)
            .await?;
        Ok(CleanupStats {
            history_removed: history.rows_affected(),
            windows_removed: windows.rows_affected(),
        })
    }
}
