//! Periodic odds polling with change detection and recovery mode.
//!
//! One task polls every configured topic in sequence per tick. A topic that
//! fails `max_consecutive_errors` polls in a row enters recovery mode, which
//! stretches the tick to `recovery_interval` until any poll of that topic
//! succeeds again.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::health::MetricsSink;
use crate::config::PollerConfig;
use crate::detector::AlertScanner;
use crate::error::{AppError, Result};
use crate::fetcher::DataSource;
use crate::polling::fingerprint::fingerprint;
use crate::types::{Game, Topic};
use crate::ws::{Hub, ServerMessage};

pub const STATUS_DEGRADED: &str = "polling_degraded";
pub const STATUS_HEALTHY: &str = "polling_healthy";

#[derive(Debug, Clone, Default, Serialize)]
pub struct TopicStatus {
    pub in_recovery: bool,
    pub consecutive_errors: u32,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_poll_age_secs: Option<i64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollerStatus {
    pub enabled: bool,
    pub recovery_mode: bool,
    pub interval_secs: u64,
    pub current_interval_secs: u64,
    pub topics: BTreeMap<String, TopicStatus>,
}

#[derive(Default)]
struct TopicState {
    status: TopicStatus,
    fingerprint: Option<String>,
    /// Last published snapshot.
    latest: Arc<Vec<Game>>,
}

pub struct Poller {
    config: PollerConfig,
    source: Arc<dyn DataSource>,
    hub: Arc<Hub>,
    metrics: Arc<dyn MetricsSink>,
    scanner: Option<Arc<AlertScanner>>,
    states: DashMap<Topic, TopicState>,
    /// Latest enable intent. A watch slot keeps only the newest value.
    control: watch::Sender<bool>,
}

impl Poller {
    pub fn new(
        config: PollerConfig,
        source: Arc<dyn DataSource>,
        hub: Arc<Hub>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let (control, _) = watch::channel(config.enabled);
        Self {
            config,
            source,
            hub,
            metrics,
            scanner: None,
            states: DashMap::new(),
            control,
        }
    }

    /// Run alert detection after every detected change.
    pub fn with_scanner(mut self, scanner: Arc<AlertScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn is_enabled(&self) -> bool {
        *self.control.borrow()
    }

    pub fn enable(&self) {
        self.control.send_replace(true);
    }

    pub fn disable(&self) {
        self.control.send_replace(false);
    }

    /// Flip the enable flag, returning the new value.
    pub fn toggle(&self) -> bool {
        let mut now = false;
        self.control.send_modify(|enabled| {
            *enabled = !*enabled;
            now = *enabled;
        });
        now
    }

    /// Most recently published games for `topic`; empty before the first poll.
    pub fn latest(&self, topic: Topic) -> Arc<Vec<Game>> {
        self.states
            .get(&topic)
            .map(|s| Arc::clone(&s.latest))
            .unwrap_or_default()
    }

    pub fn in_recovery(&self) -> bool {
        self.states.iter().any(|s| s.status.in_recovery)
    }

    pub fn current_interval(&self) -> Duration {
        if self.in_recovery() {
            self.config.recovery_interval
        } else {
            self.config.interval
        }
    }

    pub fn status(&self) -> PollerStatus {
        let now = Utc::now();
        let topics = self
            .config
            .topics
            .iter()
            .map(|topic| {
                let mut status = self
                    .states
                    .get(topic)
                    .map(|s| s.status.clone())
                    .unwrap_or_default();
                status.last_poll_age_secs = status.last_poll_at.map(|t| (now - t).num_seconds());
                (topic.to_string(), status)
            })
            .collect();

        PollerStatus {
            enabled: self.is_enabled(),
            recovery_mode: self.in_recovery(),
            interval_secs: self.config.interval.as_secs(),
            current_interval_secs: self.current_interval().as_secs(),
            topics,
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut control = self.control.subscribe();
        let mut enabled = *control.borrow_and_update();
        let mut next_tick = tokio::time::Instant::now();
        info!(
            enabled,
            interval_secs = self.config.interval.as_secs(),
            topics = ?self.config.topics,
            "poller started"
        );

        loop {
            if enabled {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = control.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = sleep_until(next_tick) => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = self.tick() => {}
                        }
                        next_tick = tokio::time::Instant::now() + self.current_interval();
                    }
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = control.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }

            let want = *control.borrow_and_update();
            if want != enabled {
                enabled = want;
                if enabled {
                    info!("polling enabled");
                    next_tick = tokio::time::Instant::now();
                } else {
                    info!("polling disabled");
                }
            }
        }
        info!("poller stopped");
    }

    /// Poll every configured topic once, in order.
    pub async fn tick(&self) {
        for topic in &self.config.topics {
            self.poll_topic(*topic).await;
        }
    }

    async fn poll_topic(&self, topic: Topic) {
        let started = Instant::now();
        match self.poll_with_retry(topic).await {
            Ok(games) => {
                self.metrics.poll_finished(topic, true, started.elapsed(), None);
                self.record_success(topic);
                let fp = fingerprint(&games);
                if self.swap_fingerprint(topic, fp) {
                    self.publish(topic, games, true);
                } else {
                    debug!(%topic, "no changes");
                }
            }
            Err(e) => {
                let msg = e.to_string();
                self.metrics.poll_finished(topic, false, started.elapsed(), Some(&msg));
                self.record_failure(topic, msg);
            }
        }
    }

    /// Fetch with exponential backoff between attempts.
    pub async fn poll_with_retry(&self, topic: Topic) -> Result<Vec<Game>> {
        let attempts = self.config.max_retries.max(1);
        let mut last = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.config.retry_base_delay * 2u32.saturating_pow(attempt - 1);
                debug!(%topic, attempt, delay_ms = delay.as_millis() as u64, "retrying fetch");
                sleep(delay).await;
            }

            let result = timeout(self.config.fetch_timeout, self.source.fetch_odds(topic))
                .await
                .unwrap_or_else(|_| Err(AppError::Fetch("fetch timed out".to_string())));
            match result {
                Ok(games) => return Ok(games),
                Err(e) => {
                    warn!(%topic, attempt = attempt + 1, "fetch failed: {e}");
                    last = Some(e);
                }
            }
        }

        Err(AppError::RetriesExhausted {
            attempts,
            last: Box::new(last.unwrap_or_else(|| AppError::Fetch("no attempts made".to_string()))),
        })
    }

    /// Poll now and publish regardless of change. Failures leave the
    /// recovery counters alone.
    pub async fn force_refresh(&self, topic: Topic) -> Result<usize> {
        if !self.is_enabled() {
            return Err(AppError::PollingDisabled);
        }
        info!(%topic, "forced refresh");
        let games = self.poll_with_retry(topic).await?;
        let changed = self.swap_fingerprint(topic, fingerprint(&games));
        Ok(self.publish(topic, games, changed))
    }

    fn publish(&self, topic: Topic, games: Vec<Game>, scan: bool) -> usize {
        self.metrics.data_changed(topic);
        let count = games.len();
        self.states.entry(topic).or_default().latest = Arc::new(games.clone());

        if scan {
            if let Some(scanner) = &self.scanner {
                let scanner = Arc::clone(scanner);
                let snapshot = games.clone();
                tokio::spawn(async move { scanner.run(topic, snapshot).await });
            }
        }

        let delivered = self.hub.publish(topic, &ServerMessage::odds_update(topic, games));
        info!(%topic, games = count, delivered, "odds update published");
        delivered
    }

    /// Store `fp` and report whether it differs from the previous one.
    fn swap_fingerprint(&self, topic: Topic, fp: String) -> bool {
        let mut state = self.states.entry(topic).or_default();
        if state.fingerprint.as_deref() == Some(fp.as_str()) {
            return false;
        }
        state.fingerprint = Some(fp);
        true
    }

    fn record_success(&self, topic: Topic) {
        let now = Utc::now();
        let recovered = {
            let mut state = self.states.entry(topic).or_default();
            let s = &mut state.status;
            s.consecutive_errors = 0;
            s.last_poll_at = Some(now);
            s.last_success_at = Some(now);
            std::mem::replace(&mut s.in_recovery, false)
        };

        if recovered {
            info!(%topic, "poll succeeded, leaving recovery mode");
            self.hub.broadcast_all(&ServerMessage::status(STATUS_HEALTHY));
        }
    }

    fn record_failure(&self, topic: Topic, error: String) {
        let (entered, streak) = {
            let mut state = self.states.entry(topic).or_default();
            let s = &mut state.status;
            s.consecutive_errors = s.consecutive_errors.saturating_add(1);
            s.last_poll_at = Some(Utc::now());
            s.last_error = Some(error);
            let entered = !s.in_recovery && s.consecutive_errors >= self.config.max_consecutive_errors;
            if entered {
                s.in_recovery = true;
            }
            (entered, s.consecutive_errors)
        };

        if entered {
            warn!(
                %topic,
                consecutive_errors = streak,
                recovery_interval_secs = self.config.recovery_interval.as_secs(),
                "entering recovery mode"
            );
            self.hub.broadcast_all(&ServerMessage::status(STATUS_DEGRADED));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use tokio::sync::mpsc;

    use super::*;
    use crate::api::health::NoopMetrics;
    use crate::baseline::BaselineLookup;
    use crate::clock::FixedClock;
    use crate::config::{DispatcherConfig, HubConfig};
    use crate::db::memory::MemoryStore;
    use crate::detector::ValueDetector;
    use crate::fetcher::PropSource;
    use crate::notify::push::testing::RecordingSender;
    use crate::notify::Dispatcher;
    use crate::types::{PlayerProps, PropQuote, Thresholds};
    use crate::ws::hub::{Frame, Registration};

    /// Serves `games` (or fails when `None`), after failing `fail_next` times.
    #[derive(Default)]
    struct ScriptedSource {
        games: Mutex<Option<Vec<Game>>>,
        fail_next: AtomicUsize,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn serving(games: Vec<Game>) -> Self {
            Self { games: Mutex::new(Some(games)), ..Self::default() }
        }

        fn set(&self, games: Option<Vec<Game>>) {
            *self.games.lock().unwrap() = games;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DataSource for ScriptedSource {
        async fn fetch_odds(&self, _: Topic) -> Result<Vec<Game>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(AppError::Fetch("scripted failure".into()));
            }
            self.games
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| AppError::Fetch("source down".into()))
        }
    }

    fn game(id: &str) -> Game {
        Game {
            id: id.into(),
            sport_key: "basketball_nba".into(),
            sport_title: "NBA".into(),
            commence_time: Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap(),
            home_team: "Home".into(),
            away_team: "Away".into(),
            bookmakers: vec![],
        }
    }

    fn config() -> PollerConfig {
        PollerConfig {
            enabled: true,
            interval: Duration::from_millis(20),
            topics: vec![Topic::Nba],
            max_retries: 1,
            retry_base_delay: Duration::from_millis(1),
            max_consecutive_errors: 2,
            recovery_interval: Duration::from_millis(200),
            fetch_timeout: Duration::from_secs(1),
        }
    }

    fn setup(config: PollerConfig, source: Arc<ScriptedSource>) -> (Arc<Poller>, Registration) {
        let hub = Arc::new(Hub::new(HubConfig::default(), Arc::new(NoopMetrics)));
        let client = hub.register();
        hub.subscribe(client.id, Topic::Nba);
        let poller = Arc::new(Poller::new(config, source, hub, Arc::new(NoopMetrics)));
        (poller, client)
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<(String, String)> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
            let kind = v["type"].as_str().unwrap_or_default().to_string();
            let payload = v["payload"].as_str().unwrap_or_default().to_string();
            out.push((kind, payload));
        }
        out
    }

    #[tokio::test]
    async fn unchanged_snapshot_is_published_once() {
        let source = Arc::new(ScriptedSource::serving(vec![game("g1"), game("g2")]));
        let (poller, mut client) = setup(config(), source.clone());

        poller.tick().await;
        poller.tick().await;
        let frames = drain(&mut client.rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, "odds_update");

        source.set(Some(vec![game("g1")]));
        poller.tick().await;
        assert_eq!(drain(&mut client.rx).len(), 1);
    }

    /// One over-line prop per game, counting lookups.
    #[derive(Default)]
    struct CountingProps {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PropSource for CountingProps {
        async fn props_for_game(&self, _: Topic, _: &Game) -> Result<Vec<PlayerProps>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![PlayerProps {
                player: "Player 1".into(),
                category: "Points".into(),
                quotes: vec![PropQuote {
                    bookmaker: "DraftKings".into(),
                    point: 20.5,
                    over_price: -110.0,
                    under_price: -110.0,
                }],
            }])
        }
    }

    struct FlatBaseline;

    impl BaselineLookup for FlatBaseline {
        fn baseline(&self, _: Topic, _: &str, _: &str) -> Option<f64> {
            Some(25.5)
        }
    }

    async fn wait_until(what: &str, cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn detection_runs_only_on_changed_data() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2025, 1, 14, 12, 0, 0).unwrap()));
        let detector = Arc::new(ValueDetector::new(store.clone(), clock.clone(), Thresholds::default()));
        let hub = Arc::new(Hub::new(HubConfig::default(), Arc::new(NoopMetrics)));
        let dispatcher = Arc::new(Dispatcher::new(
            DispatcherConfig::default(),
            hub.clone(),
            store,
            Arc::new(RecordingSender::default()),
            clock,
            Arc::new(NoopMetrics),
        ));
        let props = Arc::new(CountingProps::default());
        let scanner = AlertScanner::new(props.clone(), Arc::new(FlatBaseline), detector, dispatcher.clone());

        let source = Arc::new(ScriptedSource::serving(vec![game("g1")]));
        let poller = Poller::new(config(), source.clone(), hub, Arc::new(NoopMetrics))
            .with_scanner(Arc::new(scanner));

        poller.tick().await;
        wait_until("first scan", || dispatcher.pending_len() == 1).await;
        poller.tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(props.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.pending_len(), 1);

        source.set(Some(vec![game("g1"), game("g2")]));
        poller.tick().await;
        wait_until("second scan", || dispatcher.pending_len() == 2).await;
        assert_eq!(props.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn recovery_is_announced_once_each_way() {
        let source = Arc::new(ScriptedSource::default());
        let (poller, mut client) = setup(config(), source.clone());

        poller.tick().await;
        assert!(!poller.in_recovery());
        poller.tick().await;
        assert!(poller.in_recovery());
        assert_eq!(poller.current_interval(), Duration::from_millis(200));
        poller.tick().await;

        let frames = drain(&mut client.rx);
        assert_eq!(frames, vec![("status".to_string(), STATUS_DEGRADED.to_string())]);
        assert_eq!(poller.status().topics["nba"].consecutive_errors, 3);

        source.set(Some(vec![game("g1")]));
        poller.tick().await;
        poller.tick().await;
        assert!(!poller.in_recovery());
        assert_eq!(poller.current_interval(), Duration::from_millis(20));

        let frames = drain(&mut client.rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], ("status".to_string(), STATUS_HEALTHY.to_string()));
        assert_eq!(frames[1].0, "odds_update");
    }

    #[tokio::test]
    async fn retries_with_backoff_until_success() {
        let source = Arc::new(ScriptedSource::serving(vec![game("g1")]));
        source.fail_next.store(2, Ordering::SeqCst);
        let (poller, _client) = setup(PollerConfig { max_retries: 3, ..config() }, source.clone());

        let games = poller.poll_with_retry(Topic::Nba).await.unwrap();
        assert_eq!(games.len(), 1);
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_report_attempts() {
        let source = Arc::new(ScriptedSource::default());
        let (poller, _client) = setup(PollerConfig { max_retries: 3, ..config() }, source.clone());

        let err = poller.poll_with_retry(Topic::Nba).await.unwrap_err();
        assert!(matches!(err, AppError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn force_refresh_always_publishes() {
        let source = Arc::new(ScriptedSource::serving(vec![game("g1")]));
        let (poller, mut client) = setup(config(), source.clone());

        assert!(poller.latest(Topic::Nba).is_empty());
        poller.tick().await;
        assert_eq!(poller.latest(Topic::Nba).len(), 1);
        assert_eq!(poller.force_refresh(Topic::Nba).await.unwrap(), 1);
        assert_eq!(drain(&mut client.rx).len(), 2);

        poller.disable();
        assert!(matches!(poller.force_refresh(Topic::Nba).await, Err(AppError::PollingDisabled)));
    }

    #[tokio::test]
    async fn forced_failure_leaves_streak_untouched() {
        let source = Arc::new(ScriptedSource::default());
        let (poller, _client) = setup(config(), source.clone());

        assert!(poller.force_refresh(Topic::Nba).await.is_err());
        assert_eq!(poller.status().topics["nba"].consecutive_errors, 0);
    }

    #[tokio::test]
    async fn toggles_coalesce_and_enabling_polls_immediately() {
        let source = Arc::new(ScriptedSource::serving(vec![game("g1")]));
        let config = PollerConfig { enabled: false, interval: Duration::from_secs(3600), ..config() };
        let (poller, _client) = setup(config, source.clone());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poller.clone().run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(source.calls(), 0);

        assert!(poller.toggle());
        assert!(!poller.toggle());
        assert!(poller.toggle());

        let waited = tokio::time::timeout(Duration::from_secs(2), async {
            while source.calls() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "enable should trigger an immediate poll");
        assert!(poller.status().enabled);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(source.calls(), 1);
    }
}
