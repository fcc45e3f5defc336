mod api;
mod baseline;
mod clock;
mod config;
mod db;
mod detector;
mod error;
mod fetcher;
mod notify;
mod polling;
mod types;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::health::{HealthMetrics, MetricsSink};
use crate::api::routes::{router, ApiState};
use crate::baseline::StaticBaselines;
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, MAINTENANCE_INTERVAL_SECS, SHUTDOWN_FLUSH_TIMEOUT_SECS};
use crate::db::maintenance::StoreMaintenance;
use crate::db::{SqliteStore, Store};
use crate::detector::{AlertScanner, ValueDetector};
use crate::error::Result;
use crate::fetcher::OddsApiClient;
use crate::notify::push::WebPushSender;
use crate::notify::Dispatcher;
use crate::polling::Poller;
use crate::ws::session::SessionSettings;
use crate::ws::Hub;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // --- Database setup ---
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&cfg.db_path).await?);
    info!("Database ready at {}", cfg.db_path);

    // --- Metrics + hub ---
    let metrics = Arc::new(HealthMetrics::new());
    let sink: Arc<dyn MetricsSink> = metrics.clone();
    let hub = Arc::new(Hub::new(cfg.hub(), sink.clone()));

    // --- Detector, seeded with stored thresholds ---
    let thresholds = match store.preferences().await {
        Ok(prefs) => prefs.thresholds,
        Err(e) => {
            warn!("could not load preferences, using default thresholds: {e}");
            Default::default()
        }
    };
    let detector = Arc::new(ValueDetector::new(store.clone(), clock.clone(), thresholds));

    // --- Notification dispatcher ---
    let dispatcher_cfg = cfg.dispatcher();
    if !cfg.push_ready() {
        warn!("PUSH_SUBJECT or VAPID keys not set, push notifications disabled (in-app alerts still delivered)");
    }
    let sender = Arc::new(WebPushSender::new(cfg.vapid_private_key.clone(), dispatcher_cfg.push_timeout)?);
    let dispatcher = Arc::new(Dispatcher::new(
        dispatcher_cfg,
        hub.clone(),
        store.clone(),
        sender,
        clock.clone(),
        sink.clone(),
    ));
    let dispatcher_task = tokio::spawn(dispatcher.clone().run(shutdown.clone()));

    // --- Scheduler ---
    let odds = Arc::new(OddsApiClient::new(&cfg, sink.clone())?);
    let mut poller = Poller::new(cfg.poller(), odds.clone(), hub.clone(), sink.clone());
    let scanner = match (cfg.props_enabled, cfg.baselines_path.as_deref()) {
        (true, Some(path)) => {
            let baselines = Arc::new(StaticBaselines::load(path)?);
            let scanner = Arc::new(AlertScanner::new(odds, baselines, detector.clone(), dispatcher.clone()));
            poller = poller.with_scanner(scanner.clone());
            info!("value alert detection enabled");
            Some(scanner)
        }
        (true, None) => {
            warn!("PROPS_ENABLED set without BASELINES_PATH, value alerts disabled");
            None
        }
        _ => None,
    };
    let poller = Arc::new(poller);
    tokio::spawn(poller.clone().run(shutdown.clone()));

    // --- Store maintenance ---
    let maintenance = StoreMaintenance::new(
        store.clone(),
        clock.clone(),
        Duration::from_secs(MAINTENANCE_INTERVAL_SECS),
    );
    tokio::spawn(maintenance.run(shutdown.clone()));

    // --- HTTP API server ---
    let api_state = ApiState {
        hub,
        poller,
        dispatcher,
        detector,
        scanner,
        store,
        metrics,
        session: SessionSettings::default(),
        vapid_public_key: cfg.vapid_public_key.clone(),
        shutdown: shutdown.clone(),
    };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    tokio::spawn(watch_signals(shutdown.clone()));
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await?;

    // The server may exit on its own; make sure every task sees the signal.
    shutdown.cancel();
    match tokio::time::timeout(Duration::from_secs(SHUTDOWN_FLUSH_TIMEOUT_SECS), dispatcher_task).await {
        Ok(Ok(())) => info!("shutdown complete"),
        Ok(Err(e)) => error!("dispatcher task failed: {e}"),
        Err(_) => warn!("dispatcher did not finish its final flush in time"),
    }
    Ok(())
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
    shutdown.cancel();
}
