//! HTTP/JSON API.

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::env;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::info;

use crate::calendar::{parse_days, parse_time_of_day};
use crate::db::{Crop, Db, Schedule, Sensor, WateringEvent};
use crate::error::{WateringError, WateringResult};
use crate::hardware::MoistureProbe;
use crate::moisture::round1;
use crate::scheduler::AutoMode;
use crate::state::SharedState;
use crate::watering;

/// Entries returned by the history endpoint.
const HISTORY_LIMIT: i64 = 50;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub probe: Arc<dyn MoistureProbe>,
    pub shared: SharedState,
    pub auto: AutoMode,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/crops", get(list_crops))
        .route("/api/sensors", get(list_sensors))
        .route("/api/sensor/{id}/moisture", get(read_moisture))
        .route("/api/sensor/{id}/water", post(water_sensor))
        .route("/api/sensor/{id}/crop", put(assign_crop))
        .route("/api/auto-mode", get(get_auto_mode).post(set_auto_mode))
        .route("/api/history/{id}", get(history))
        .route("/api/schedules", get(list_schedules).post(create_schedule))
        .route("/api/schedules/{id}", delete(delete_schedule))
        .route("/api/export/{id}", get(export_csv))
        .route("/api/stats", get(stats))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status(state.auto.status()))
}

async fn list_crops(State(state): State<AppState>) -> WateringResult<Json<Vec<Crop>>> {
    Ok(Json(state.db.load_crops().await?))
}

async fn list_sensors(State(state): State<AppState>) -> WateringResult<Json<Vec<Sensor>>> {
    Ok(Json(state.db.load_sensors().await?))
}

// -- Sensor actions ----------------------------------------------------------

#[derive(Serialize)]
struct MoistureResponse {
    sensor_id: i64,
    moisture: f64,
    timestamp: String,
}

async fn read_moisture(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> WateringResult<Json<MoistureResponse>> {
    let reading = watering::read_moisture(&state.db, state.probe.as_ref(), &state.shared, id).await?;
    Ok(Json(MoistureResponse {
        sensor_id: reading.sensor_id,
        moisture: round1(reading.moisture),
        timestamp: rfc3339(reading.ts),
    }))
}

#[derive(Serialize)]
struct WaterResponse {
    success: bool,
    moisture_before: f64,
    moisture_after: f64,
    amount: i64,
}

async fn water_sensor(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> WateringResult<Json<WaterResponse>> {
    let outcome = watering::water_now(&state.db, &state.shared, id).await?.rounded();
    Ok(Json(WaterResponse {
        success: true,
        moisture_before: outcome.moisture_before,
        moisture_after: outcome.moisture_after,
        amount: outcome.amount,
    }))
}

#[derive(Deserialize)]
struct AssignCrop {
    crop_id: Option<i64>,
}

async fn assign_crop(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<AssignCrop>,
) -> WateringResult<Json<serde_json::Value>> {
    if let Some(crop_id) = body.crop_id {
        if state.db.get_crop(crop_id).await?.is_none() {
            return Err(WateringError::CropNotFound(crop_id));
        }
    }
    if !state.db.set_sensor_crop(id, body.crop_id).await? {
        return Err(WateringError::SensorNotFound(id));
    }
    info!(sensor_id = id, crop_id = ?body.crop_id, "crop assigned");
    Ok(Json(json!({ "success": true })))
}

// -- Auto mode ---------------------------------------------------------------

#[derive(Deserialize)]
struct AutoModeRequest {
    #[serde(default)]
    enabled: bool,
}

#[derive(Serialize)]
struct AutoModeResponse {
    auto_mode: bool,
    running: bool,
}

async fn get_auto_mode(State(state): State<AppState>) -> Json<AutoModeResponse> {
    let st = state.auto.status();
    Json(AutoModeResponse {
        auto_mode: st.enabled,
        running: st.running,
    })
}

async fn set_auto_mode(
    State(state): State<AppState>,
    Json(body): Json<AutoModeRequest>,
) -> Json<AutoModeResponse> {
    state.auto.set_enabled(body.enabled).await;
    let st = state.auto.status();
    Json(AutoModeResponse {
        auto_mode: st.enabled,
        running: st.running,
    })
}

// -- History -----------------------------------------------------------------

async fn history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> WateringResult<Json<Vec<WateringEvent>>> {
    Ok(Json(state.db.watering_history(id, HISTORY_LIMIT).await?))
}

async fn export_csv(State(state): State<AppState>, Path(id): Path<i64>) -> WateringResult<Response> {
    let log = state.db.watering_log(id).await?;
    let body = render_csv(&log);
    let disposition = format!("attachment; filename=sensor_{id}_data.csv");
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

fn render_csv(log: &[WateringEvent]) -> String {
    let mut out = String::from("Timestamp,Moisture Before (%),Moisture After (%),Amount (ml),Trigger\n");
    for e in log {
        out.push_str(&format!(
            "{},{},{},{},{}\n",
            rfc3339(e.ts),
            round1(e.moisture_before),
            round1(e.moisture_after),
            e.amount,
            e.source
        ));
    }
    out
}

// -- Schedules ---------------------------------------------------------------

/// `days` may be sent as `["Mon", "Wed"]` or `"Monday,Wednesday"`.
#[derive(Deserialize)]
#[serde(untagged)]
enum DaysInput {
    List(Vec<String>),
    Text(String),
}

#[derive(Deserialize)]
struct NewSchedule {
    sensor_id: i64,
    time: String,
    days: DaysInput,
}

async fn list_schedules(State(state): State<AppState>) -> WateringResult<Json<Vec<Schedule>>> {
    Ok(Json(state.db.active_schedules().await?))
}

async fn create_schedule(
    State(state): State<AppState>,
    Json(body): Json<NewSchedule>,
) -> WateringResult<(StatusCode, Json<Schedule>)> {
    let time = parse_time_of_day(&body.time).map_err(WateringError::InvalidSchedule)?;
    let days = match &body.days {
        DaysInput::List(items) => parse_days(items.iter().map(String::as_str)),
        DaysInput::Text(text) => parse_days([text.as_str()]),
    }
    .map_err(WateringError::InvalidSchedule)?;

    if state.db.get_sensor(body.sensor_id).await?.is_none() {
        return Err(WateringError::SensorNotFound(body.sensor_id));
    }

    let schedule = state.db.insert_schedule(body.sensor_id, &time, &days).await?;
    info!(
        schedule_id = schedule.id,
        sensor_id = schedule.sensor_id,
        time = %schedule.time,
        days = ?schedule.days,
        "schedule created"
    );
    state
        .shared
        .write()
        .await
        .record_scheduler(format!(
            "schedule {} created: sensor {} at {} on {}",
            schedule.id,
            schedule.sensor_id,
            schedule.time,
            schedule.days.join(", ")
        ));
    Ok((StatusCode::CREATED, Json(schedule)))
}

async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> WateringResult<Json<serde_json::Value>> {
    if !state.db.deactivate_schedule(id).await? {
        return Err(WateringError::ScheduleNotFound(id));
    }
    info!(schedule_id = id, "schedule deactivated");
    Ok(Json(json!({ "success": true })))
}

// -- Stats -------------------------------------------------------------------

#[derive(Serialize)]
struct StatsResponse {
    avg_moisture: f64,
    total_sensors: i64,
    today_watering: i64,
}

async fn stats(State(state): State<AppState>) -> WateringResult<Json<StatsResponse>> {
    let s = state.db.stats().await?;
    Ok(Json(StatsResponse {
        avg_moisture: s.avg_moisture.map(round1).unwrap_or(0.0),
        total_sensors: s.total_sensors,
        today_watering: s.today_watering,
    }))
}

fn rfc3339(ts: i64) -> String {
    OffsetDateTime::from_unix_timestamp(ts)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| ts.to_string())
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve<F>(state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("api listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
