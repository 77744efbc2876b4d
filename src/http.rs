//! REST control surface of the kernel.
//!
//! Thin read/write facade over the scheduler and the traffic analyzer:
//! scheduler status and lifecycle, device registration, configuration
//! mutation, top-talkers and chart queries, and the external ingestion path.
//! Every route except `/health` requires the `x-api-key` header to match
//! `ATO_API_KEY`.
//!
//! Queries always answer with a well-formed body, possibly reflecting stale
//! or zeroed data; only lookups against an unknown device id return 404.

use crate::analyzer::chart::ChartData;
use crate::analyzer::TrafficAnalyzer;
use crate::config::{validate_max_concurrent, validate_polling_interval, SchedulerConfig};
use crate::devices::{Device, NewDevice, PollOutcome};
use crate::error::RegistryError;
use crate::health::{HealthTracker, KernelHealth};
use crate::scheduler::{InitOutcome, PollScheduler};
use crate::state::Shared;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: PollScheduler,
    pub analyzer: TrafficAnalyzer,
    pub cfg: Shared<SchedulerConfig>,
    pub health: HealthTracker,
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var("ATO_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        warn!("ATO_API_KEY not set, API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/scheduler/status", get(get_scheduler_status))
        .route("/scheduler/start", post(start_scheduler))
        .route("/scheduler/stop", post(stop_scheduler))
        .route("/scheduler/config", post(update_scheduler_config))
        .route("/scheduler/devices", get(get_devices).post(register_device))
        .route("/scheduler/devices/{id}", get(get_device).delete(deregister_device))
        .route("/traffic/top-talkers", get(get_top_talkers))
        .route("/traffic/chart", get(get_traffic_chart))
        .route("/traffic/ingest", post(ingest_traffic))
        .with_state(state)
        .layer(middleware::from_fn(require_api_key))
}

// ---- scheduler views ------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SchedulerStatusView {
    active: bool,
    metrics: SchedulerMetricsView,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SchedulerMetricsView {
    devices: usize,
    interfaces: u64,
    discovered_devices: usize,
    in_flight: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceStatusView {
    device: String,
    active: bool,
    last_polled: Option<String>,
    next_poll: String,
    in_flight: bool,
    consecutive_failures: u32,
    last_error: Option<String>,
    discovered: bool,
    ip: Option<String>,
    hostname: Option<String>,
}

fn to_device_view(d: &Device) -> DeviceStatusView {
    let until_due = d.next_poll.saturating_duration_since(Instant::now());
    let next_poll = OffsetDateTime::now_utc()
        + time::Duration::try_from(until_due).unwrap_or(time::Duration::ZERO);
    DeviceStatusView {
        device: d.id.clone(),
        active: d.enabled,
        last_polled: d.last_polled.and_then(|t| t.format(&Rfc3339).ok()),
        next_poll: next_poll.format(&Rfc3339).unwrap_or_default(),
        in_flight: d.in_flight,
        consecutive_failures: d.consecutive_failures,
        last_error: match &d.last_outcome {
            Some(PollOutcome::Failed(msg)) => Some(msg.clone()),
            _ => None,
        },
        discovered: d.discovered,
        ip: d.ip.clone(),
        hostname: d.hostname.clone(),
    }
}

// GET /scheduler/status
async fn get_scheduler_status(State(app): State<AppState>) -> Json<SchedulerStatusView> {
    let status = app.scheduler.status();
    Json(SchedulerStatusView {
        active: status.active,
        metrics: SchedulerMetricsView {
            devices: status.devices,
            interfaces: status.interfaces,
            discovered_devices: status.discovered_devices,
            in_flight: status.in_flight,
        },
    })
}

// POST /scheduler/start
async fn start_scheduler(State(app): State<AppState>) -> Json<serde_json::Value> {
    let outcome = match app.scheduler.initialize() {
        InitOutcome::Started => "started",
        InitOutcome::AlreadyRunning => "already-running",
    };
    Json(json!({ "status": outcome }))
}

// POST /scheduler/stop
async fn stop_scheduler(State(app): State<AppState>) -> Json<serde_json::Value> {
    let outcome = if app.scheduler.shutdown() { "stopping" } else { "not-running" };
    Json(json!({ "status": outcome }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigPatch {
    polling_interval_seconds: Option<i64>,
    max_concurrent_devices: Option<i64>,
    auto_discovery_enabled: Option<bool>,
}

// POST /scheduler/config — validates the whole patch before applying any of
// it, so a rejected mutation leaves every prior value in effect.
async fn update_scheduler_config(
    State(app): State<AppState>,
    Json(patch): Json<ConfigPatch>,
) -> (StatusCode, Json<serde_json::Value>) {
    let interval = match patch.polling_interval_seconds.map(validate_polling_interval).transpose() {
        Ok(v) => v,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))),
    };
    let cap = match patch.max_concurrent_devices.map(validate_max_concurrent).transpose() {
        Ok(v) => v,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))),
    };

    let applied = {
        let mut cfg = app.cfg.lock();
        if let Some(secs) = interval {
            cfg.polling_interval_secs = secs;
        }
        if let Some(n) = cap {
            cfg.max_concurrent_devices = n;
        }
        if let Some(enabled) = patch.auto_discovery_enabled {
            cfg.auto_discovery_enabled = enabled;
        }
        json!({
            "pollingIntervalSeconds": cfg.polling_interval_secs,
            "maxConcurrentDevices": cfg.max_concurrent_devices,
            "autoDiscoveryEnabled": cfg.auto_discovery_enabled,
        })
    };
    (StatusCode::OK, Json(json!({ "status": "ok", "config": applied })))
}

// ---- device routes --------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterBody {
    device: String,
    ip: Option<String>,
    hostname: Option<String>,
    poll_interval_seconds: Option<i64>,
}

// POST /scheduler/devices
async fn register_device(
    State(app): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    let interval_override = match body.poll_interval_seconds.map(validate_polling_interval).transpose() {
        Ok(v) => v.map(Duration::from_secs),
        Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))),
    };
    let spec = NewDevice {
        ip: body.ip,
        hostname: body.hostname,
        interval_override,
        discovered: false,
    };
    match app.scheduler.register_device(&body.device, spec) {
        Ok(()) => (
            StatusCode::CREATED,
            Json(json!({ "status": "registered", "device": body.device })),
        ),
        Err(e @ RegistryError::AlreadyRegistered(_)) => {
            (StatusCode::CONFLICT, Json(json!({ "error": e.to_string() })))
        }
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({ "error": e.to_string() }))),
    }
}

// DELETE /scheduler/devices/{id}
async fn deregister_device(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match app.scheduler.deregister_device(&id) {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "deregistered", "device": id }))),
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({ "error": e.to_string() }))),
    }
}

// GET /scheduler/devices
async fn get_devices(State(app): State<AppState>) -> Json<Vec<DeviceStatusView>> {
    let views = app.scheduler.devices().iter().map(to_device_view).collect();
    Json(views)
}

// GET /scheduler/devices/{id}
async fn get_device(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeviceStatusView>, StatusCode> {
    match app.scheduler.device_polling_status(&id) {
        Ok(dev) => Ok(Json(to_device_view(&dev))),
        Err(_) => Err(StatusCode::NOT_FOUND),
    }
}

// ---- traffic routes -------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TalkersParams {
    limit: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TopTalkerView {
    ip: String,
    hostname: String,
    bytes_in: u64,
    bytes_out: u64,
}

// GET /traffic/top-talkers?limit=10
async fn get_top_talkers(
    State(app): State<AppState>,
    Query(params): Query<TalkersParams>,
) -> Json<Vec<TopTalkerView>> {
    let limit = params.limit.unwrap_or(10);
    let talkers = app.analyzer.top_talkers(limit, Instant::now());

    let meta: HashMap<String, (Option<String>, Option<String>)> = app
        .scheduler
        .devices()
        .into_iter()
        .map(|d| (d.id, (d.ip, d.hostname)))
        .collect();

    let views = talkers
        .into_iter()
        .map(|t| {
            let (ip, hostname) = meta.get(&t.device).cloned().unwrap_or_default();
            TopTalkerView {
                ip: ip.unwrap_or_else(|| t.device.clone()),
                hostname: hostname.unwrap_or_else(|| t.device.clone()),
                bytes_in: t.bytes_in,
                bytes_out: t.bytes_out,
            }
        })
        .collect();
    Json(views)
}

// GET /traffic/chart
async fn get_traffic_chart(State(app): State<AppState>) -> Json<ChartData> {
    Json(app.analyzer.traffic_chart(Instant::now()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IngestBody {
    device: String,
    ip: Option<String>,
    hostname: Option<String>,
    data: serde_json::Value,
}

// POST /traffic/ingest — out-of-band samples from an external collector.
// Unknown devices are auto-registered when discovery is enabled, otherwise
// the sample is rejected.
async fn ingest_traffic(
    State(app): State<AppState>,
    Json(body): Json<IngestBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    if !app.scheduler.ensure_known(&body.device, body.ip, body.hostname) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown device {} (auto-discovery off)", body.device) })),
        );
    }
    let sample = app.analyzer.parse_traffic_data(&body.device, &body.data, Instant::now());
    (
        StatusCode::OK,
        Json(json!({ "parsed": true, "device": sample.device, "metrics": sample.counters })),
    )
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health.get_health(&app.scheduler))
}
