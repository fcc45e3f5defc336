/// Database row types matching migrations/0001_init.sql.
/// Used by sqlx for typed queries.
use chrono::{DateTime, Utc};

use crate::error::{AppError, Result};
use crate::types::{AlertHistoryRecord, AlertKey, Preferences, Thresholds};

#[derive(Debug, sqlx::FromRow)]
pub struct PreferencesRow {
    pub enable_websocket: bool,
    pub enable_push: bool,
    pub push_subscription: Option<String>,
    pub threshold_points: f64,
    pub threshold_rebounds: f64,
    pub threshold_assists: f64,
    pub threshold_threes: f64,
    pub threshold_default: f64,
    pub quiet_start: String,
    pub quiet_end: String,
    pub timezone: String,
    pub rate_limit_push: i64,
}

impl From<PreferencesRow> for Preferences {
    fn from(r: PreferencesRow) -> Self {
        Preferences {
            enable_websocket: r.enable_websocket,
            enable_push: r.enable_push,
            push_subscription: r.push_subscription.filter(|s| !s.is_empty()),
            thresholds: Thresholds {
                points: r.threshold_points,
                rebounds: r.threshold_rebounds,
                assists: r.threshold_assists,
                threes: r.threshold_threes,
                default: r.threshold_default,
            },
            quiet_start: r.quiet_start,
            quiet_end: r.quiet_end,
            timezone: r.timezone,
            rate_limit_push: r.rate_limit_push.clamp(0, i64::from(u32::MAX)) as u32,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct AlertHistoryRow {
    pub player_name: String,
    pub prop_category: String,
    pub direction: String,
    pub event_id: String,
    pub line_value: f64,
    pub average_value: f64,
    pub difference: f64,
    pub confidence: String,
    pub cooldown_until: i64,
}

impl TryFrom<AlertHistoryRow> for AlertHistoryRecord {
    type Error = AppError;

    fn try_from(r: AlertHistoryRow) -> Result<Self> {
        let direction = r.direction.parse().map_err(decode_err)?;
        let confidence = r.confidence.parse().map_err(decode_err)?;
        let cooldown_until = DateTime::<Utc>::from_timestamp(r.cooldown_until, 0)
            .ok_or_else(|| decode_err(format!("cooldown_until out of range: {}", r.cooldown_until)))?;

        Ok(AlertHistoryRecord {
            key: AlertKey {
                player: r.player_name,
                category: r.prop_category,
                direction,
                event_id: r.event_id,
            },
            line: r.line_value,
            average: r.average_value,
            difference: r.difference,
            confidence,
            cooldown_until,
        })
    }
}

fn decode_err(msg: String) -> AppError {
    AppError::Database(sqlx::Error::Decode(msg.into()))
}
