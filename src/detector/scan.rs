//! Turns a fresh odds snapshot into value alerts.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::baseline::BaselineLookup;
use crate::detector::dedup::ValueDetector;
use crate::detector::format::format_alert;
use crate::fetcher::PropSource;
use crate::notify::Dispatcher;
use crate::types::{Game, PlayerProps, Topic, ValueAlert};

pub struct AlertScanner {
    props: Arc<dyn PropSource>,
    baselines: Arc<dyn BaselineLookup>,
    detector: Arc<ValueDetector>,
    dispatcher: Arc<Dispatcher>,
    /// One scan per topic at a time, so history writes land before the
    /// next scan's dedup check.
    in_flight: DashMap<Topic, Arc<Mutex<()>>>,
}

impl AlertScanner {
    pub fn new(
        props: Arc<dyn PropSource>,
        baselines: Arc<dyn BaselineLookup>,
        detector: Arc<ValueDetector>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self { props, baselines, detector, dispatcher, in_flight: DashMap::new() }
    }

    /// Scan and hand every passing alert to the dispatcher.
    pub async fn run(&self, topic: Topic, games: Vec<Game>) {
        let alerts = self.scan(topic, &games).await;
        if alerts.is_empty() {
            debug!(%topic, games = games.len(), "scan found no value");
            return;
        }
        info!(%topic, alerts = alerts.len(), "value alerts detected");
        for alert in alerts {
            self.dispatcher.queue_alert(alert).await;
        }
    }

    /// Alerts that cleared thresholds and dedup. Each one is recorded in history.
    /// Games already under way are skipped.
    pub async fn scan(&self, topic: Topic, games: &[Game]) -> Vec<ValueAlert> {
        let guard = Arc::clone(self.in_flight.entry(topic).or_default().value());
        let _scanning = guard.lock().await;

        let now = self.detector.now();
        let mut out = Vec::new();

        for game in games.iter().filter(|g| g.commence_time > now) {
            let props = match self.props.props_for_game(topic, game).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(%topic, event_id = %game.id, "prop fetch failed: {e}");
                    continue;
                }
            };

            for player in &props {
                let Some(alert) = self.evaluate(topic, game, player) else { continue };

                let decision = self.detector.should_notify(&alert).await;
                if !decision.notify() {
                    debug!(alert_id = %alert.id, ?decision, "alert suppressed");
                    continue;
                }
                if let Err(e) = self.detector.record_alert(&alert).await {
                    warn!(alert_id = %alert.id, "failed to record alert history: {e}");
                }
                info!(%topic, confidence = %alert.confidence, ?decision, "{}", format_alert(&alert));
                out.push(alert);
            }
        }
        out
    }

    fn evaluate(&self, topic: Topic, game: &Game, props: &PlayerProps) -> Option<ValueAlert> {
        let quote = props.best_quote()?;
        let baseline = self.baselines.baseline(topic, &props.player, &props.category)?;
        let signal = self.detector.detect(&props.category, quote.point, baseline)?;

        Some(ValueAlert {
            id: format!("{}-{}-{}-{}", game.id, props.player, props.category, signal.direction),
            player: props.player.clone(),
            topic,
            event_id: game.id.clone(),
            home_team: game.home_team.clone(),
            away_team: game.away_team.clone(),
            category: props.category.clone(),
            line: quote.point,
            average: baseline,
            difference: signal.difference,
            abs_difference: signal.abs_difference,
            direction: signal.direction,
            confidence: signal.confidence,
            best_price: quote.over_price,
            bookmaker: quote.bookmaker.clone(),
            detected_at: self.detector.now(),
            expires_at: game.commence_time,
        })
    }
}
