use std::sync::Arc;

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::health::{classify, HealthMetrics, HealthStatus, MetricsSink, MetricsSnapshot};
use crate::config::WS_MAX_FRAME_BYTES;
use crate::db::Store;
use crate::detector::{AlertScanner, ValueDetector};
use crate::error::AppError;
use crate::notify::push::parse_subscription;
use crate::notify::Dispatcher;
use crate::polling::scheduler::PollerStatus;
use crate::polling::Poller;
use crate::types::{Preferences, Topic, ValueAlert};
use crate::ws::hub::HubStats;
use crate::ws::session::{run_session, SessionSettings};
use crate::ws::Hub;

#[derive(Clone)]
pub struct ApiState {
    pub hub: Arc<Hub>,
    pub poller: Arc<Poller>,
    pub dispatcher: Arc<Dispatcher>,
    pub detector: Arc<ValueDetector>,
    /// Present when prop-based detection is configured.
    pub scanner: Option<Arc<AlertScanner>>,
    pub store: Arc<dyn Store>,
    pub metrics: Arc<HealthMetrics>,
    pub session: SessionSettings,
    pub vapid_public_key: Option<String>,
    pub shutdown: CancellationToken,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(get_health))
        .route("/polling/status", get(get_polling_status))
        .route("/polling/enable", post(enable_polling))
        .route("/polling/disable", post(disable_polling))
        .route("/polling/toggle", post(toggle_polling))
        .route("/polling/refresh/:topic", post(refresh_topic))
        .route("/preferences", get(get_preferences).put(put_preferences))
        .route("/push/vapid-public-key", get(get_vapid_public_key))
        .route("/push/subscribe", post(subscribe_push))
        .route("/push/unsubscribe", post(unsubscribe_all))
        .route("/alerts/check/:topic", post(check_alerts))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub warnings: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub hub: HubStats,
    pub polling: PollerStatus,
    pub pending_alerts: usize,
    pub metrics: MetricsSnapshot,
}

#[derive(Serialize)]
pub struct PollingToggleResponse {
    pub enabled: bool,
}

#[derive(Serialize)]
pub struct RefreshResponse {
    pub topic: Topic,
    pub delivered: usize,
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VapidKeyResponse {
    pub public_key: String,
}

/// `subscription` is the browser `PushSubscription`, as an object or as
/// its JSON string.
#[derive(Deserialize)]
pub struct SubscribeRequest {
    pub subscription: serde_json::Value,
}

#[derive(Serialize)]
pub struct AlertCheckResponse {
    pub topic: Topic,
    pub games: usize,
    pub alert_count: usize,
    pub alerts: Vec<ValueAlert>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn ws_upgrade(State(state): State<ApiState>, ws: WebSocketUpgrade) -> Response {
    if !state.hub.can_accept() {
        warn!("websocket upgrade refused: hub at capacity");
        return (StatusCode::SERVICE_UNAVAILABLE, "server at capacity").into_response();
    }

    let metrics: Arc<dyn MetricsSink> = state.metrics.clone();
    ws.max_message_size(WS_MAX_FRAME_BYTES)
        .max_frame_size(WS_MAX_FRAME_BYTES)
        .on_upgrade(move |socket| {
            run_session(socket, state.hub, metrics, state.session, state.shutdown)
        })
}

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let snapshot = state.metrics.snapshot();
    let polling = state.poller.status();
    let now = Utc::now();
    let (status, warnings) = classify(&snapshot, polling.enabled, polling.recovery_mode, now);

    Json(HealthResponse {
        status,
        warnings,
        timestamp: now,
        hub: state.hub.stats(),
        polling,
        pending_alerts: state.dispatcher.pending_len(),
        metrics: snapshot,
    })
}

async fn get_polling_status(State(state): State<ApiState>) -> Json<PollerStatus> {
    Json(state.poller.status())
}

async fn enable_polling(State(state): State<ApiState>) -> Json<PollingToggleResponse> {
    state.poller.enable();
    Json(PollingToggleResponse { enabled: true })
}

async fn disable_polling(State(state): State<ApiState>) -> Json<PollingToggleResponse> {
    state.poller.disable();
    Json(PollingToggleResponse { enabled: false })
}

async fn toggle_polling(State(state): State<ApiState>) -> Json<PollingToggleResponse> {
    let enabled = state.poller.toggle();
    Json(PollingToggleResponse { enabled })
}

async fn refresh_topic(
    State(state): State<ApiState>,
    Path(topic): Path<String>,
) -> Result<Json<RefreshResponse>, AppError> {
    let topic: Topic = topic.parse()?;
    let delivered = state.poller.force_refresh(topic).await?;
    Ok(Json(RefreshResponse { topic, delivered }))
}

async fn get_preferences(State(state): State<ApiState>) -> Result<Json<Preferences>, AppError> {
    Ok(Json(state.store.preferences().await?))
}

async fn put_preferences(
    State(state): State<ApiState>,
    Json(prefs): Json<Preferences>,
) -> Result<Json<Preferences>, AppError> {
    prefs.thresholds.validate()?;
    state.store.update_preferences(&prefs).await?;
    state.detector.update_thresholds(prefs.thresholds)?;
    info!(
        enable_push = prefs.enable_push,
        quiet_start = %prefs.quiet_start,
        quiet_end = %prefs.quiet_end,
        "preferences updated"
    );
    Ok(Json(prefs))
}

async fn get_vapid_public_key(State(state): State<ApiState>) -> Result<Json<VapidKeyResponse>, AppError> {
    let public_key = state
        .vapid_public_key
        .clone()
        .ok_or_else(|| AppError::Unavailable("VAPID keys not configured".to_string()))?;
    Ok(Json(VapidKeyResponse { public_key }))
}

async fn subscribe_push(
    State(state): State<ApiState>,
    Json(req): Json<SubscribeRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    let subscription = match req.subscription {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    };
    parse_subscription(&subscription).map_err(|e| AppError::InvalidSubscription(e.to_string()))?;
    state.store.set_push_subscription(&subscription).await?;
    info!("push subscription stored");
    Ok(Json(MessageResponse { message: "subscribed to push notifications" }))
}

async fn unsubscribe_all(State(state): State<ApiState>) -> Result<Json<MessageResponse>, AppError> {
    state.store.unsubscribe_all().await?;
    info!("all notification channels disabled");
    Ok(Json(MessageResponse { message: "unsubscribed from all notifications" }))
}

/// Run detection now over the last published snapshot, queueing any hits.
async fn check_alerts(
    State(state): State<ApiState>,
    Path(topic): Path<String>,
) -> Result<Json<AlertCheckResponse>, AppError> {
    let topic: Topic = topic.parse()?;
    let scanner = state
        .scanner
        .as_ref()
        .ok_or_else(|| AppError::Unavailable("alert detection not configured".to_string()))?;

    let games = state.poller.latest(topic);
    let alerts = scanner.scan(topic, &games).await;
    for alert in &alerts {
        state.dispatcher.queue_alert(alert.clone()).await;
    }
    info!(%topic, games = games.len(), alerts = alerts.len(), "on-demand alert check");
    Ok(Json(AlertCheckResponse { topic, games: games.len(), alert_count: alerts.len(), alerts }))
}
