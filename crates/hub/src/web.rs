//! HTTP API for the dashboard.
//!
//! Read endpoints degrade: a broken store yields empty, well-formed
//! payloads instead of a 500, so the dashboard keeps rendering. The
//! one exception is the manual backup sync, whose failure the operator
//! explicitly asked to see.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use time::macros::format_description;
use time::Date;
use tokio::net::TcpListener;

use crate::analytics::{self, ReadingStats};
use crate::db::{Db, Reading, Setpoints, SetpointsUpdate, SettingsUpdate};
use crate::remote::{ThingSpeak, HEATER_FIELD, PUMP_FIELD};
use crate::state::{DeviceStateCache, DeviceStatus};
use crate::sync::SyncEngine;

const MAX_HISTORY_RESULTS: i64 = 5000;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub engine: Arc<SyncEngine>,
    pub cache: DeviceStateCache,
    pub remote: ThingSpeak,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/readings/latest", get(latest_readings))
        .route("/api/readings/history", get(readings_history))
        .route("/api/readings/import", post(import_readings))
        .route("/api/device/status", get(device_status))
        .route("/api/control/pump", post(control_pump))
        .route("/api/control/heater", post(control_heater))
        .route("/api/setpoints", get(get_setpoints).post(update_setpoints))
        .route("/api/settings", get(get_settings).post(update_settings))
        .route("/api/backup/sync", post(backup_sync))
        .route("/api/backup/status", get(backup_status))
        .route("/api/backup/stats", get(backup_stats))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct LatestParams {
    limit: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadingsResponse {
    readings: Vec<Reading>,
    count: usize,
    setpoints: Setpoints,
    temperature_stats: ReadingStats,
    level_stats: ReadingStats,
}

impl ReadingsResponse {
    fn build(readings: Vec<Reading>, setpoints: Setpoints) -> Self {
        Self {
            count: readings.len(),
            setpoints,
            temperature_stats: analytics::temperature_stats(&readings),
            level_stats: analytics::level_stats(&readings),
            readings,
        }
    }
}

/// Setpoints shown to the dashboard when the store misbehaves.
fn fallback_setpoints() -> Setpoints {
    Setpoints {
        temp_min: 20.0,
        temp_max: 30.0,
        level_min: 60.0,
        level_max: 90.0,
        updated_at: 0,
    }
}

async fn latest_readings(
    State(state): State<AppState>,
    Query(params): Query<LatestParams>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(20).clamp(1, 100);
    let readings = state.db.latest_readings(limit).await.unwrap_or_else(|err| {
        tracing::warn!(error = %err, "failed to load latest readings");
        Vec::new()
    });
    let setpoints = state
        .db
        .get_setpoints()
        .await
        .unwrap_or_else(|_| fallback_setpoints());
    Json(ReadingsResponse::build(readings, setpoints))
}

#[derive(Deserialize)]
struct HistoryParams {
    start: Option<String>,
    end: Option<String>,
}

fn parse_day(raw: &str) -> Option<Date> {
    Date::parse(raw, format_description!("[year]-[month]-[day]")).ok()
}

async fn readings_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    let (Some(start_raw), Some(end_raw)) = (params.start.as_deref(), params.end.as_deref()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "start and end query parameters are required (YYYY-MM-DD)"})),
        )
            .into_response();
    };

    let (Some(start), Some(end)) = (parse_day(start_raw), parse_day(end_raw)) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "dates must be formatted YYYY-MM-DD"})),
        )
            .into_response();
    };

    let start_ts = start.midnight().assume_utc().unix_timestamp();
    // Inclusive end day.
    let end_ts = end.midnight().assume_utc().unix_timestamp() + 86_400 - 1;

    let readings = state
        .db
        .readings_by_range(start_ts, end_ts, MAX_HISTORY_RESULTS)
        .await
        .unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to load reading history");
            Vec::new()
        });
    let setpoints = state
        .db
        .get_setpoints()
        .await
        .unwrap_or_else(|_| fallback_setpoints());

    Json(ReadingsResponse::build(readings, setpoints)).into_response()
}

#[derive(Deserialize)]
struct ImportParams {
    days: Option<u32>,
}

async fn import_readings(
    State(state): State<AppState>,
    Query(params): Query<ImportParams>,
) -> impl IntoResponse {
    let days = params.days.unwrap_or(7).clamp(1, 30);

    // The import can take a while against a slow channel; run it in
    // the background and acknowledge immediately.
    let db = state.db.clone();
    let remote = state.remote.clone();
    tokio::spawn(async move {
        if let Err(err) = crate::poller::import_from_remote(&db, &remote, days).await {
            tracing::error!(error = %err, "history import failed");
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({"success": true, "days": days})),
    )
}

// ---------------------------------------------------------------------------
// Device status + control
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceStatusResponse {
    #[serde(flatten)]
    status: DeviceStatus,
    latest_reading: Option<Reading>,
    pending_sync: bool,
    pending_backup: i64,
}

async fn device_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.cache.snapshot().await;
    let latest_reading = state.db.latest_reading().await.unwrap_or_default();
    let pending_backup = state.engine.pending_sync().await.unwrap_or(0);

    // A cached toggle counts as pending until a polled reading echoes
    // it back. With no reading at all, any "on" intent is pending.
    let pending_sync = match &latest_reading {
        Some(reading) => {
            reading.pump_status != status.pump_status
                || reading.heater_status != status.heater_status
        }
        None => status.pump_status || status.heater_status,
    };

    Json(DeviceStatusResponse {
        status,
        latest_reading,
        pending_sync,
        pending_backup,
    })
}

#[derive(Deserialize)]
struct ControlRequest {
    status: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ControlResponse {
    success: bool,
    pending: bool,
    status: DeviceStatus,
}

async fn control_pump(
    State(state): State<AppState>,
    Json(request): Json<ControlRequest>,
) -> impl IntoResponse {
    let status = state.cache.set_pump(request.status).await;

    let remote = state.remote.clone();
    tokio::spawn(async move {
        remote
            .write_field(PUMP_FIELD, if request.status { "1" } else { "0" })
            .await;
    });

    Json(ControlResponse {
        success: true,
        pending: true,
        status,
    })
}

async fn control_heater(
    State(state): State<AppState>,
    Json(request): Json<ControlRequest>,
) -> impl IntoResponse {
    let status = state.cache.set_heater(request.status).await;

    let remote = state.remote.clone();
    tokio::spawn(async move {
        remote
            .write_field(HEATER_FIELD, if request.status { "1" } else { "0" })
            .await;
    });

    Json(ControlResponse {
        success: true,
        pending: true,
        status,
    })
}

// ---------------------------------------------------------------------------
// Setpoints + settings
// ---------------------------------------------------------------------------

async fn get_setpoints(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.get_setpoints().await {
        Ok(sp) => Json(sp).into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "failed to load setpoints");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "setpoints unavailable"})),
            )
                .into_response()
        }
    }
}

async fn update_setpoints(
    State(state): State<AppState>,
    Json(update): Json<SetpointsUpdate>,
) -> impl IntoResponse {
    match state.db.update_setpoints(&update).await {
        Ok(sp) => Json(sp).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "failed to update setpoints");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "failed to update setpoints"})),
            )
                .into_response()
        }
    }
}

async fn get_settings(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.get_settings().await {
        Ok(s) => Json(s).into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "failed to load settings");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "settings unavailable"})),
            )
                .into_response()
        }
    }
}

async fn update_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> impl IntoResponse {
    match state.db.update_settings(&update).await {
        Ok(s) => Json(s).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "failed to update settings");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "failed to update settings"})),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Backup
// ---------------------------------------------------------------------------

async fn backup_sync(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.sync().await {
        Ok(count) => Json(json!({"success": true, "recordsSynced": count})).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "manual backup sync failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "error": format!("{err:#}")})),
            )
                .into_response()
        }
    }
}

async fn backup_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.last_backup_info().await)
}

async fn backup_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.backup_stats().await)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState) {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind web port");

    tracing::info!("api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .expect("web server error");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupDb;
    use crate::db::NewReading;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::util::ServiceExt;

    async fn test_state() -> AppState {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let backup = BackupDb::connect("sqlite::memory:").await.unwrap();
        backup.migrate().await.unwrap();

        AppState {
            engine: Arc::new(SyncEngine::new(db.clone(), backup)),
            db,
            cache: DeviceStateCache::new(),
            remote: ThingSpeak::new("http://127.0.0.1:1", "123", "rk", "wk"),
        }
    }

    async fn get_json(state: AppState, uri: &str) -> (StatusCode, Value) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn post_json(state: AppState, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn reading(temperature: f64, level: f64, ts: i64) -> NewReading {
        NewReading {
            temperature,
            level,
            pump_status: false,
            heater_status: false,
            timestamp: ts,
        }
    }

    // 2026-01-01T00:00:00Z
    const DAY_START: i64 = 1_767_225_600;

    #[tokio::test]
    async fn latest_readings_empty_store_is_well_formed() {
        let state = test_state().await;
        let (status, body) = get_json(state, "/api/readings/latest").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["readings"], json!([]));
        assert_eq!(body["count"], 0);
        assert_eq!(body["setpoints"]["tempMin"], 20.0);
        assert_eq!(body["temperatureStats"]["avg"], 0.0);
    }

    #[tokio::test]
    async fn latest_readings_returns_camel_case_rows() {
        let state = test_state().await;
        state
            .db
            .save_reading(&reading(24.5, 71.0, DAY_START))
            .await
            .unwrap();

        let (status, body) = get_json(state, "/api/readings/latest?limit=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["readings"][0]["temperature"], 24.5);
        assert_eq!(body["readings"][0]["pumpStatus"], false);
        assert_eq!(body["readings"][0]["timestamp"], DAY_START);
    }

    #[tokio::test]
    async fn history_requires_date_params() {
        let state = test_state().await;
        let (status, body) = get_json(state.clone(), "/api/readings/history").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("required"));

        let (status, _) =
            get_json(state, "/api/readings/history?start=soon&end=later").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn history_returns_readings_and_stats() {
        let state = test_state().await;
        state
            .db
            .save_reading(&reading(20.0, 60.0, DAY_START))
            .await
            .unwrap();
        state
            .db
            .save_reading(&reading(24.0, 80.0, DAY_START + 3600))
            .await
            .unwrap();
        // Outside the queried range.
        state
            .db
            .save_reading(&reading(30.0, 90.0, DAY_START + 200_000))
            .await
            .unwrap();

        let (status, body) = get_json(
            state,
            "/api/readings/history?start=2026-01-01&end=2026-01-01",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 2);
        assert_eq!(body["temperatureStats"]["avg"], 22.0);
        assert_eq!(body["levelStats"]["max"], 80.0);
        assert_eq!(body["setpoints"]["levelMax"], 90.0);
    }

    #[tokio::test]
    async fn device_status_reflects_cache_and_store() {
        let state = test_state().await;
        state.cache.set_pump(true).await;
        state
            .db
            .save_reading(&reading(24.0, 70.0, DAY_START))
            .await
            .unwrap();

        let (status, body) = get_json(state, "/api/device/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pumpStatus"], true);
        assert_eq!(body["heaterStatus"], false);
        assert_eq!(body["latestReading"]["temperature"], 24.0);
        assert_eq!(body["pendingBackup"], 1);
    }

    #[tokio::test]
    async fn pending_sync_flags_unconfirmed_toggle() {
        let state = test_state().await;
        state
            .db
            .save_reading(&reading(24.0, 70.0, DAY_START))
            .await
            .unwrap();

        // Cache and store agree: nothing pending.
        let (_, body) = get_json(state.clone(), "/api/device/status").await;
        assert_eq!(body["pendingSync"], false);

        // Toggle the pump; no reading confirms it yet.
        let (status, _) =
            post_json(state.clone(), "/api/control/pump", json!({"status": true})).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = get_json(state.clone(), "/api/device/status").await;
        assert_eq!(body["pendingSync"], true);

        // A polled reading echoing the toggle clears the flag.
        let mut confirmed = reading(24.0, 70.0, DAY_START + 300);
        confirmed.pump_status = true;
        state.db.save_reading(&confirmed).await.unwrap();
        let (_, body) = get_json(state, "/api/device/status").await;
        assert_eq!(body["pendingSync"], false);
    }

    #[tokio::test]
    async fn control_pump_updates_cache_immediately() {
        let state = test_state().await;
        let (status, body) =
            post_json(state.clone(), "/api/control/pump", json!({"status": true})).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["pending"], true);
        assert_eq!(body["status"]["pumpStatus"], true);
        assert!(state.cache.snapshot().await.pump_status);
    }

    #[tokio::test]
    async fn control_heater_updates_cache_immediately() {
        let state = test_state().await;
        let (_, body) =
            post_json(state.clone(), "/api/control/heater", json!({"status": true})).await;
        assert_eq!(body["status"]["heaterStatus"], true);
        assert!(state.cache.snapshot().await.heater_status);
    }

    #[tokio::test]
    async fn setpoints_roundtrip() {
        let state = test_state().await;
        let (status, body) = get_json(state.clone(), "/api/setpoints").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tempMin"], 20.0);

        let (status, body) =
            post_json(state, "/api/setpoints", json!({"tempMin": 22.0})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tempMin"], 22.0);
        assert_eq!(body["tempMax"], 30.0);
    }

    #[tokio::test]
    async fn settings_roundtrip() {
        let state = test_state().await;
        let (status, body) = get_json(state.clone(), "/api/settings").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["systemName"], "Aquaponics");

        let (status, body) = post_json(
            state,
            "/api/settings",
            json!({"systemName": "Tank A", "emailAlerts": false}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["systemName"], "Tank A");
        assert_eq!(body["emailAlerts"], false);
    }

    #[tokio::test]
    async fn backup_sync_reports_copied_rows() {
        let state = test_state().await;
        state
            .db
            .save_reading(&reading(24.0, 70.0, DAY_START))
            .await
            .unwrap();

        let (status, body) = post_json(state.clone(), "/api/backup/sync", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["recordsSynced"], 1);

        let (status, body) = get_json(state.clone(), "/api/backup/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["lastId"], 1);
        assert_eq!(body["totalRecords"], 1);
        assert_eq!(body["pendingRecords"], 0);

        let (status, body) = get_json(state, "/api/backup/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalReadings"], 1);
        assert_eq!(body["syncHistory"][0]["success"], true);
    }

    #[tokio::test]
    async fn import_acknowledges_immediately() {
        let state = test_state().await;
        let (status, body) =
            post_json(state, "/api/readings/import?days=3", json!({})).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["success"], true);
        assert_eq!(body["days"], 3);
    }
}
