use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::api::health::MetricsSink;
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::types::{Game, PlayerProps, PropQuote, Topic};

/// Odds snapshot provider polled by the scheduler.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn fetch_odds(&self, topic: Topic) -> Result<Vec<Game>>;
}

/// Per-event player prop lines, consumed by alert detection.
#[async_trait]
pub trait PropSource: Send + Sync {
    async fn props_for_game(&self, topic: Topic, game: &Game) -> Result<Vec<PlayerProps>>;
}

/// Client for the odds provider REST API.
pub struct OddsApiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    bookmakers: Vec<String>,
    metrics: Arc<dyn MetricsSink>,
}

impl OddsApiClient {
    pub fn new(cfg: &Config, metrics: Arc<dyn MetricsSink>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.fetch_timeout())
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: cfg.odds_api_url.trim_end_matches('/').to_string(),
            api_key: cfg.odds_api_key.clone(),
            bookmakers: cfg.bookmakers.clone(),
            metrics,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str, markets: &str) -> Result<T> {
        let resp = self
            .client
            .get(url)
            .query(&[
                ("apiKey", self.api_key.as_str()),
                ("regions", "us"),
                ("markets", markets),
                ("oddsFormat", "american"),
            ])
            .send()
            .await?;

        self.record_quota(resp.headers());

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(AppError::Fetch(format!("odds API returned {status}: {snippet}")));
        }

        Ok(resp.json::<T>().await?)
    }

    fn record_quota(&self, headers: &reqwest::header::HeaderMap) {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<f64>().ok())
                .map(|v| v.max(0.0) as u64)
        };
        if let (Some(remaining), Some(used)) = (read("x-requests-remaining"), read("x-requests-used")) {
            debug!(remaining, used, "odds API quota");
            if remaining < 50 {
                warn!(remaining, "odds API quota running low");
            }
            self.metrics.quota_observed(remaining, used);
        }
    }
}

#[async_trait]
impl DataSource for OddsApiClient {
    async fn fetch_odds(&self, topic: Topic) -> Result<Vec<Game>> {
        let url = format!("{}/sports/{}/odds/", self.base_url, topic.api_key());
        let games: Vec<Game> = self.get_json(&url, "h2h,spreads,totals").await?;
        let games = filter_bookmakers(games, &self.bookmakers);
        info!(%topic, games = games.len(), "fetched odds");
        Ok(games)
    }
}

#[async_trait]
impl PropSource for OddsApiClient {
    async fn props_for_game(&self, topic: Topic, game: &Game) -> Result<Vec<PlayerProps>> {
        let url = format!(
            "{}/sports/{}/events/{}/odds",
            self.base_url,
            topic.api_key(),
            game.id
        );
        let markets = topic.prop_markets().join(",");
        let event: Game = self.get_json(&url, &markets).await?;
        let event = filter_bookmakers(vec![event], &self.bookmakers)
            .into_iter()
            .next();
        Ok(event.map(|e| group_props(&e)).unwrap_or_default())
    }
}

/// Keep only allow-listed bookmakers. An empty list keeps everything.
pub fn filter_bookmakers(mut games: Vec<Game>, allowed: &[String]) -> Vec<Game> {
    if allowed.is_empty() {
        return games;
    }
    for game in &mut games {
        game.bookmakers
            .retain(|b| allowed.iter().any(|a| a.eq_ignore_ascii_case(&b.key)));
    }
    games
}

/// Display category for a provider player market key.
pub fn category_for_market(market: &str) -> Option<&'static str> {
    Some(match market {
        "player_points" => "Points",
        "player_rebounds" => "Rebounds",
        "player_assists" => "Assists",
        "player_threes" => "Threes",
        "player_pass_yds" => "Pass Yards",
        "player_rush_yds" => "Rush Yards",
        "player_reception_yds" => "Receiving Yards",
        "player_receptions" => "Receptions",
        _ => return None,
    })
}

#[derive(Default)]
struct PartialQuote {
    point: Option<f64>,
    over: Option<f64>,
    under: Option<f64>,
}

/// Fold Over/Under outcomes into one quote per (player, category, bookmaker).
/// Quotes missing either side are dropped. Output is ordered by player,
/// category, then bookmaker.
pub fn group_props(event: &Game) -> Vec<PlayerProps> {
    let mut groups: BTreeMap<(String, &'static str), BTreeMap<&str, PartialQuote>> = BTreeMap::new();

    for book in &event.bookmakers {
        for market in &book.markets {
            let Some(category) = category_for_market(&market.key) else { continue };
            for outcome in &market.outcomes {
                let Some(player) = outcome.description.as_deref() else { continue };
                let quote = groups
                    .entry((player.to_string(), category))
                    .or_default()
                    .entry(book.title.as_str())
                    .or_default();
                quote.point = quote.point.or(outcome.point);
                if outcome.name.eq_ignore_ascii_case("over") {
                    quote.over = Some(outcome.price);
                } else if outcome.name.eq_ignore_ascii_case("under") {
                    quote.under = Some(outcome.price);
                }
            }
        }
    }

    groups
        .into_iter()
        .filter_map(|((player, category), partials)| {
            let quotes: Vec<PropQuote> = partials
                .into_iter()
                .filter_map(|(bookmaker, q)| {
                    Some(PropQuote {
                        bookmaker: bookmaker.to_string(),
                        point: q.point?,
                        over_price: q.over?,
                        under_price: q.under?,
                    })
                })
                .collect();
            (!quotes.is_empty()).then(|| PlayerProps {
                player,
                category: category.to_string(),
                quotes,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENT: &str = r#"{
        "id": "evt1",
        "sport_key": "basketball_nba",
        "sport_title": "NBA",
        "commence_time": "2025-01-15T19:30:00Z",
        "home_team": "Boston Celtics",
        "away_team": "Miami Heat",
        "bookmakers": [
            {"key": "draftkings", "title": "DraftKings", "last_update": "2025-01-15T17:00:00Z", "markets": [
                {"key": "player_points", "outcomes": [
                    {"name": "Over", "description": "Player 1", "price": -115, "point": 25.5},
                    {"name": "Under", "description": "Player 1", "price": -105, "point": 25.5},
                    {"name": "Over", "description": "Player 2", "price": -110, "point": 18.5}
                ]}
            ]},
            {"key": "fanduel", "title": "FanDuel", "markets": [
                {"key": "player_points", "outcomes": [
                    {"name": "Over", "description": "Player 1", "price": -108, "point": 24.5},
                    {"name": "Under", "description": "Player 1", "price": -112, "point": 24.5}
                ]},
                {"key": "player_blocks", "outcomes": [
                    {"name": "Over", "description": "Player 1", "price": 120, "point": 1.5},
                    {"name": "Under", "description": "Player 1", "price": -150, "point": 1.5}
                ]}
            ]},
            {"key": "bovada", "title": "Bovada", "markets": []}
        ]
    }"#;

    #[test]
    fn groups_over_under_pairs_per_player() {
        let event: Game = serde_json::from_str(EVENT).unwrap();
        let props = group_props(&event);

        // Player 2 has no under side; blocks is not a tracked market.
        assert_eq!(props.len(), 1);
        let p = &props[0];
        assert_eq!(p.player, "Player 1");
        assert_eq!(p.category, "Points");
        assert_eq!(p.quotes.len(), 2);
        assert_eq!(p.quotes[0].bookmaker, "DraftKings");
        assert_eq!(p.quotes[0].over_price, -115.0);
        assert_eq!(p.quotes[1].point, 24.5);
    }

    #[test]
    fn grouping_orders_players_and_books() {
        let mut event: Game = serde_json::from_str(EVENT).unwrap();
        // A FanDuel under for Player 2 completes its quote there only.
        event.bookmakers[1].markets[0].outcomes.push(crate::types::Outcome {
            name: "Under".into(),
            description: Some("Player 2".into()),
            price: -120.0,
            point: Some(18.5),
        });
        event.bookmakers[1].markets[0].outcomes.push(crate::types::Outcome {
            name: "Over".into(),
            description: Some("Player 2".into()),
            price: 100.0,
            point: Some(18.5),
        });

        let props = group_props(&event);
        let players: Vec<_> = props.iter().map(|p| p.player.as_str()).collect();
        assert_eq!(players, vec!["Player 1", "Player 2"]);
        assert_eq!(props[1].quotes.len(), 1);
        assert_eq!(props[1].quotes[0].bookmaker, "FanDuel");
        assert_eq!(props[1].quotes[0].under_price, -120.0);
    }

    #[test]
    fn bookmaker_filter_is_case_insensitive() {
        let event: Game = serde_json::from_str(EVENT).unwrap();
        let allowed = vec!["DraftKings".to_string(), "fanduel".to_string()];
        let games = filter_bookmakers(vec![event.clone()], &allowed);
        let keys: Vec<_> = games[0].bookmakers.iter().map(|b| b.key.as_str()).collect();
        assert_eq!(keys, vec!["draftkings", "fanduel"]);

        let untouched = filter_bookmakers(vec![event], &[]);
        assert_eq!(untouched[0].bookmakers.len(), 3);
    }

    #[test]
    fn unknown_markets_have_no_category() {
        assert_eq!(category_for_market("player_threes"), Some("Threes"));
        assert_eq!(category_for_market("h2h"), None);
    }
}
