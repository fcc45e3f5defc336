use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

/// A subscription channel. One per supported sport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Nba,
    Nfl,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::Nba, Topic::Nfl];

    /// Sport key used by the odds provider.
    pub fn api_key(&self) -> &'static str {
        match self {
            Topic::Nba => "basketball_nba",
            Topic::Nfl => "americanfootball_nfl",
        }
    }

    /// Player prop markets requested per event for this sport.
    pub fn prop_markets(&self) -> &'static [&'static str] {
        match self {
            Topic::Nba => &[
                "player_points",
                "player_rebounds",
                "player_assists",
                "player_threes",
            ],
            Topic::Nfl => &[
                "player_pass_yds",
                "player_rush_yds",
                "player_reception_yds",
                "player_receptions",
            ],
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Topic::Nba => "nba",
            Topic::Nfl => "nfl",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Topic {
    type Err = AppError;

    /// Accepts the short wire name or the provider sport key.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nba" | "basketball_nba" => Ok(Topic::Nba),
            "nfl" | "americanfootball_nfl" => Ok(Topic::Nfl),
            other => Err(AppError::InvalidTopic(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Odds provider dataset
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Game {
    pub id: String,
    #[serde(default)]
    pub sport_key: String,
    #[serde(default)]
    pub sport_title: String,
    pub commence_time: DateTime<Utc>,
    pub home_team: String,
    pub away_team: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bookmakers: Vec<Bookmaker>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bookmaker {
    pub key: String,
    pub title: String,
    /// Volatile; excluded from fingerprints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub markets: Vec<MarketData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketData {
    /// "h2h", "spreads", "totals", or a player market such as "player_points".
    pub key: String,
    #[serde(default)]
    pub outcomes: Vec<Outcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub name: String,
    /// American odds, e.g. -110 or +150.
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point: Option<f64>,
    /// Player name on player prop markets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Player props
// ---------------------------------------------------------------------------

/// One bookmaker's line on a player prop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropQuote {
    pub bookmaker: String,
    pub point: f64,
    pub over_price: f64,
    pub under_price: f64,
}

/// All bookmaker quotes for one player and one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerProps {
    pub player: String,
    pub category: String,
    pub quotes: Vec<PropQuote>,
}

impl PlayerProps {
    /// Quote with the best over price. Ties keep the first bookmaker seen.
    pub fn best_quote(&self) -> Option<&PropQuote> {
        let mut best: Option<&PropQuote> = None;
        for quote in &self.quotes {
            match best {
                Some(b) if quote.over_price <= b.over_price => {}
                _ => best = Some(quote),
            }
        }
        best
    }
}

// ---------------------------------------------------------------------------
// Value alerts
// ---------------------------------------------------------------------------

/// Which side the value favors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Line sits below the baseline.
    Over,
    /// Line sits above the baseline.
    Under,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Over => write!(f, "over"),
            Direction::Under => write!(f, "under"),
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "over" => Ok(Direction::Over),
            "under" => Ok(Direction::Under),
            other => Err(format!("unknown direction '{other}'")),
        }
    }
}

/// Ordered low < medium < high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Confidence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Confidence::Low),
            "medium" => Ok(Confidence::Medium),
            "high" => Ok(Confidence::High),
            other => Err(format!("unknown confidence '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueAlert {
    pub id: String,
    pub player: String,
    pub topic: Topic,
    pub event_id: String,
    pub home_team: String,
    pub away_team: String,
    pub category: String,

    /// Observed line.
    pub line: f64,
    /// Baseline (season average).
    pub average: f64,
    pub difference: f64,
    pub abs_difference: f64,

    pub direction: Direction,
    pub confidence: Confidence,

    pub best_price: f64,
    pub bookmaker: String,

    pub detected_at: DateTime<Utc>,
    /// Event start; the alert is meaningless afterwards.
    pub expires_at: DateTime<Utc>,
}

impl ValueAlert {
    pub fn key(&self) -> AlertKey {
        AlertKey {
            player: self.player.clone(),
            category: self.category.clone(),
            direction: self.direction,
            event_id: self.event_id.clone(),
        }
    }
}

/// Deduplication key for alert history.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlertKey {
    pub player: String,
    pub category: String,
    pub direction: Direction,
    pub event_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertHistoryRecord {
    pub key: AlertKey,
    pub line: f64,
    pub average: f64,
    pub difference: f64,
    pub confidence: Confidence,
    pub cooldown_until: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Thresholds & preferences
// ---------------------------------------------------------------------------

/// Per-category minimum |line - average| before an alert fires.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub points: f64,
    pub rebounds: f64,
    pub assists: f64,
    pub threes: f64,
    pub default: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            points: 2.0,
            rebounds: 1.5,
            assists: 1.0,
            threes: 0.5,
            default: 2.0,
        }
    }
}

impl Thresholds {
    pub fn for_category(&self, category: &str) -> f64 {
        match category {
            "Points" => self.points,
            "Rebounds" => self.rebounds,
            "Assists" => self.assists,
            "Threes" => self.threes,
            _ => self.default,
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let all = [self.points, self.rebounds, self.assists, self.threes, self.default];
        if all.iter().all(|t| t.is_finite() && *t > 0.0) {
            Ok(())
        } else {
            Err(AppError::InvalidPreferences(
                "thresholds must be positive numbers".to_string(),
            ))
        }
    }
}

/// Single-user notification preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    pub enable_websocket: bool,
    pub enable_push: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_subscription: Option<String>,
    pub thresholds: Thresholds,
    /// "HH:MM"
    pub quiet_start: String,
    /// "HH:MM"
    pub quiet_end: String,
    /// IANA zone name, e.g. "America/New_York"
    pub timezone: String,
    /// Pushes allowed per hour.
    pub rate_limit_push: u32,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            enable_websocket: true,
            enable_push: false,
            push_subscription: None,
            thresholds: Thresholds::default(),
            quiet_start: "23:00".to_string(),
            quiet_end: "08:00".to_string(),
            timezone: "America/New_York".to_string(),
            rate_limit_push: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_accepts_short_and_provider_names() {
        assert_eq!("NBA".parse::<Topic>().unwrap(), Topic::Nba);
        assert_eq!("americanfootball_nfl".parse::<Topic>().unwrap(), Topic::Nfl);
        assert!("mlb".parse::<Topic>().is_err());
    }

    #[test]
    fn thresholds_fall_back_to_default_category() {
        let t = Thresholds::default();
        assert_eq!(t.for_category("Rebounds"), 1.5);
        assert_eq!(t.for_category("Pass Yards"), 2.0);
    }

    #[test]
    fn non_positive_thresholds_are_rejected() {
        let t = Thresholds { assists: 0.0, ..Thresholds::default() };
        assert!(t.validate().is_err());
        assert!(Thresholds::default().validate().is_ok());
    }

    #[test]
    fn best_quote_picks_highest_over_price() {
        let props = PlayerProps {
            player: "Player 1".to_string(),
            category: "Points".to_string(),
            quotes: vec![
                PropQuote { bookmaker: "DraftKings".into(), point: 25.5, over_price: -115.0, under_price: -105.0 },
                PropQuote { bookmaker: "BetMGM".into(), point: 26.5, over_price: -105.0, under_price: -115.0 },
                PropQuote { bookmaker: "FanDuel".into(), point: 25.5, over_price: -110.0, under_price: -110.0 },
            ],
        };
        let best = props.best_quote().unwrap();
        assert_eq!(best.bookmaker, "BetMGM");
        assert_eq!(best.point, 26.5);
    }

    #[test]
    fn confidence_orders_low_to_high() {
        assert!(Confidence::Low < Confidence::Medium);
        assert!(Confidence::Medium < Confidence::High);
    }
}
