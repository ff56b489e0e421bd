//! HTTP request handlers.

use super::AppState;
use crate::db::{DbError, Device, StatusUpdate, DEFAULT_CATEGORY};
use crate::events::{CategoryEvent, ConnectionInfo, Event, EventKind, HISTORY_CAPACITY};
use crate::probe::{run_probe, PROBE_TIMEOUT};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, Sse},
        IntoResponse, Json, Response,
    },
};
use futures::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::IpAddr;

// ============================================================================
// Health
// ============================================================================

pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "monitoring": state.engine.is_running(),
        "subscribers": state.bus.subscriber_count(),
    }))
}

// ============================================================================
// API: Devices
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct DeviceRequest {
    pub device_id: String,
    pub ip: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl DeviceRequest {
    fn validate(&self) -> Result<(), &'static str> {
        let device_id = self.device_id.trim();
        if device_id.is_empty() {
            return Err("device_id is required");
        }
        if device_id.chars().any(char::is_whitespace) {
            return Err("device_id must not contain whitespace");
        }
        let ip = self.ip.trim();
        if ip.is_empty() || ip.chars().any(char::is_whitespace) {
            return Err("ip must be a single address");
        }
        Ok(())
    }

    fn into_device(self) -> Device {
        Device {
            device_id: self.device_id.trim().to_string(),
            ip: self.ip.trim().to_string(),
            description: self.description,
            category: self
                .category
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            enabled: self.enabled,
            ..Default::default()
        }
    }
}

fn db_error_response(e: DbError) -> Response {
    match e {
        DbError::NotFound => (StatusCode::NOT_FOUND, "Device not found").into_response(),
        DbError::Duplicate(_) => (StatusCode::CONFLICT, e.to_string()).into_response(),
        other => {
            tracing::error!("Database error: {}", other);
            (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response()
        }
    }
}

/// Pick up device changes in a running engine.
async fn reload_after_change(state: &AppState) {
    if !state.engine.is_running() {
        return;
    }
    if let Err(e) = state.engine.reload_configuration().await {
        tracing::warn!("Device saved but monitoring reload failed: {}", e);
    }
}

pub async fn handle_get_devices(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get_devices() {
        Ok(devices) => Json(devices).into_response(),
        Err(e) => db_error_response(e),
    }
}

pub async fn handle_get_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_device(&device_id) {
        Ok(device) => Json(device).into_response(),
        Err(e) => db_error_response(e),
    }
}

pub async fn handle_create_device(
    State(state): State<AppState>,
    Json(req): Json<DeviceRequest>,
) -> impl IntoResponse {
    if let Err(msg) = req.validate() {
        return (StatusCode::BAD_REQUEST, msg).into_response();
    }

    let mut device = req.into_device();
    if let Err(e) = state.store.add_device(&mut device) {
        return db_error_response(e);
    }

    tracing::info!("Device {} ({}) created", device.device_id, device.ip);
    reload_after_change(&state).await;
    (StatusCode::CREATED, Json(device)).into_response()
}

pub async fn handle_update_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(req): Json<DeviceRequest>,
) -> impl IntoResponse {
    if let Err(msg) = req.validate() {
        return (StatusCode::BAD_REQUEST, msg).into_response();
    }

    let device = req.into_device();
    if let Err(e) = state.store.update_device(&device_id, &device) {
        return db_error_response(e);
    }

    tracing::info!("Device {} updated", device_id);
    reload_after_change(&state).await;
    match state.store.get_device(&device.device_id) {
        Ok(updated) => Json(updated).into_response(),
        Err(e) => db_error_response(e),
    }
}

pub async fn handle_delete_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = state.store.delete_device(&device_id) {
        return db_error_response(e);
    }

    tracing::info!("Device {} deleted", device_id);
    reload_after_change(&state).await;
    StatusCode::NO_CONTENT.into_response()
}

// ============================================================================
// API: Monitoring
// ============================================================================

pub async fn handle_monitoring_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.get_status().await)
}

pub async fn handle_monitoring_start(State(state): State<AppState>) -> impl IntoResponse {
    state.engine.start().await;
    Json(state.engine.get_status().await)
}

pub async fn handle_monitoring_stop(State(state): State<AppState>) -> impl IntoResponse {
    state.engine.stop().await;
    Json(state.engine.get_status().await)
}

pub async fn handle_ping_now(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.ping_now().await {
        Some(report) => Json(report).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "Cycle cancelled: monitoring stopped").into_response(),
    }
}

pub async fn handle_reload_config(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.reload_configuration().await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

// ============================================================================
// API: Events
// ============================================================================

/// Server-sent events: a `connection` event, the replayed history, then
/// live events until the client goes away.
pub async fn handle_event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let subscription = state.bus.subscribe();
    let hello = Event::new(EventKind::Connection(ConnectionInfo {
        subscription_id: subscription.id(),
        replayed: subscription.pending(),
    }));
    tracing::info!("SSE client connected ({})", subscription.id());

    let stream = async_stream::stream! {
        yield Ok(to_sse(&hello));
        while let Some(event) = subscription.recv().await {
            yield Ok(to_sse(&event));
        }
    };

    Sse::new(stream)
}

fn to_sse(event: &Event) -> SseEvent {
    SseEvent::default().json_data(event).unwrap_or_else(|e| {
        tracing::error!("Failed to serialize {} event: {}", event.type_name(), e);
        SseEvent::default().comment("serialization error")
    })
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

pub async fn handle_recent_events(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(20).min(HISTORY_CAPACITY);
    Json(state.bus.get_recent(limit))
}

#[derive(Debug, Deserialize)]
pub struct CategoryEventRequest {
    pub category_id: i64,
    pub name: String,
    pub action: String,
}

/// Publish a change made to an event category by an external service.
pub async fn handle_category_event(
    State(state): State<AppState>,
    Json(req): Json<CategoryEventRequest>,
) -> impl IntoResponse {
    if !["created", "updated", "deleted"].contains(&req.action.as_str()) {
        return (StatusCode::BAD_REQUEST, "Invalid action").into_response();
    }

    let event = Event::new(EventKind::CategoryEvent(CategoryEvent {
        category_id: req.category_id,
        name: req.name,
        action: req.action,
    }));
    state.bus.publish(event.clone());
    (StatusCode::ACCEPTED, Json(event)).into_response()
}

// ============================================================================
// API: Ad-hoc probe
// ============================================================================

pub async fn handle_ping_ip(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> impl IntoResponse {
    if ip.parse::<IpAddr>().is_err() {
        return (StatusCode::BAD_REQUEST, "Invalid IP address").into_response();
    }

    let result = run_probe(state.prober.as_ref(), &ip, &ip, PROBE_TIMEOUT).await;
    Json(result).into_response()
}

/// Probe one stored device outside the monitoring cycle. The result is
/// persisted but the engine's monitors are left alone.
pub async fn handle_ping_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> impl IntoResponse {
    let device = match state.store.get_device(&device_id) {
        Ok(device) => device,
        Err(e) => return db_error_response(e),
    };

    let result = run_probe(
        state.prober.as_ref(),
        &device.device_id,
        &device.ip,
        PROBE_TIMEOUT,
    )
    .await;
    let update = StatusUpdate::from_probe(&result);
    if let Err(e) = state.store.apply_status_batch(&[update]) {
        tracing::error!("Failed to record ping of {}: {}", device.device_id, e);
    }
    Json(result).into_response()
}
