//! HTTP handlers for the worker's full surface, wired onto [`super::AppState`].

use axum::body::Bytes;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::error::AppResult;
use crate::model::VehicleObservation;
use crate::state_store::StateStore;
use crate::tokens::SecretStore;

use super::AppState;

pub fn router<S, T>() -> Router<AppState<S, T>>
where
    S: StateStore + 'static,
    T: SecretStore + 'static,
{
    Router::new()
        .route("/health", get(health::<S, T>))
        .route("/worker-status", get(worker_status::<S, T>))
        .route("/get-token", get(get_token::<S, T>))
        .route("/run-cycle", post(run_cycle::<S, T>))
        .route("/run-midnight-wake", post(run_midnight_wake::<S, T>))
        .route("/scout-trigger", post(scout_trigger::<S, T>))
        .route("/refresh-tokens", post(refresh_tokens::<S, T>))
        .route("/sync-tokens", post(sync_tokens::<S, T>))
        .route(
            "/daily-special-charging-check",
            post(daily_special_charging_check::<S, T>),
        )
        .route("/send-special-schedule", post(send_special_schedule::<S, T>))
        .route(
            "/send-special-schedule-immediate",
            post(send_special_schedule_immediate::<S, T>),
        )
        .route("/cleanup-single-session", post(cleanup_single_session::<S, T>))
        .route("/reset", get(reset::<S, T>))
        .route("/reset-tesla-schedules", get(reset_tesla_schedules::<S, T>))
        .layer(TraceLayer::new_for_http())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    timestamp: chrono::DateTime<Utc>,
}

async fn health<S: StateStore, T: SecretStore>(
    State(_state): State<AppState<S, T>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "ev-charge-control-worker",
        timestamp: Utc::now(),
    })
}

async fn worker_status<S: StateStore, T: SecretStore>(
    State(state): State<AppState<S, T>>,
) -> Json<super::WorkerStatusReport> {
    Json(state.worker_status().await)
}

async fn get_token<S: StateStore, T: SecretStore>(
    State(state): State<AppState<S, T>>,
) -> AppResult<Json<super::GetTokenReport>> {
    Ok(Json(state.get_token().await?))
}

/// Most of the cycle-triggering endpoints accept an empty body or a small
/// optional JSON object; this parses the latter while tolerating the
/// former instead of relying on axum rejecting a missing body outright.
fn parse_optional_body<D: DeserializeOwned + Default>(bytes: &Bytes) -> D {
    if bytes.is_empty() {
        D::default()
    } else {
        serde_json::from_slice(bytes).unwrap_or_default()
    }
}

#[derive(Deserialize, Default)]
struct RunCycleRequest {
    trigger: Option<String>,
}

async fn run_cycle<S: StateStore, T: SecretStore>(
    State(state): State<AppState<S, T>>,
    bytes: Bytes,
) -> AppResult<Json<super::CycleReport>> {
    let body: RunCycleRequest = parse_optional_body(&bytes);
    Ok(Json(state.run_cycle(body.trigger).await?))
}

async fn run_midnight_wake<S: StateStore, T: SecretStore>(
    State(state): State<AppState<S, T>>,
) -> AppResult<Json<super::CycleReport>> {
    Ok(Json(state.run_midnight_wake().await?))
}

#[derive(Deserialize)]
struct ScoutTriggerRequest {
    reason: String,
    #[serde(flatten)]
    observation: VehicleObservation,
}

async fn scout_trigger<S: StateStore, T: SecretStore>(
    State(state): State<AppState<S, T>>,
    Json(body): Json<ScoutTriggerRequest>,
) -> AppResult<Json<super::CycleReport>> {
    Ok(Json(state.scout_trigger(&body.reason, body.observation).await?))
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct RefreshTokensRequest {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    requested_by: Option<String>,
    #[serde(default)]
    attempt_count: Option<u32>,
}

async fn refresh_tokens<S: StateStore, T: SecretStore>(
    State(state): State<AppState<S, T>>,
    body: Option<Json<RefreshTokensRequest>>,
) -> AppResult<Json<super::RefreshTokensReport>> {
    let _ = body;
    Ok(Json(state.refresh_tokens().await?))
}

#[derive(Deserialize, Default)]
#[allow(dead_code)]
struct SyncTokensRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn sync_tokens<S: StateStore, T: SecretStore>(
    State(state): State<AppState<S, T>>,
    body: Option<Json<SyncTokensRequest>>,
) -> AppResult<Json<super::SyncTokensReport>> {
    let _ = body;
    Ok(Json(state.sync_tokens().await?))
}

async fn daily_special_charging_check<S: StateStore, T: SecretStore>(
    State(state): State<AppState<S, T>>,
) -> AppResult<Json<crate::special::DailyCheckReport>> {
    let token = state.ensure_ready(true).await?;
    Ok(Json(state.special.daily_check(&token, &state.vin).await))
}

#[derive(Deserialize)]
struct SendScheduleRequest {
    session_id: String,
}

#[derive(Serialize)]
struct SendScheduleResponse {
    success: bool,
    session_id: String,
    vin_last4: String,
}

async fn send_special_schedule<S: StateStore, T: SecretStore>(
    State(state): State<AppState<S, T>>,
    Json(body): Json<SendScheduleRequest>,
) -> AppResult<Json<SendScheduleResponse>> {
    let token = state.ensure_ready(true).await?;
    let session = state.special.send_scheduled(&token, &body.session_id).await?;
    let vin_last4 = last4(&session.vin);
    Ok(Json(SendScheduleResponse {
        success: true,
        session_id: session.session_id,
        vin_last4,
    }))
}

#[derive(Deserialize, Default)]
struct SendImmediateRequest {
    #[serde(default)]
    target_percent: Option<u32>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Serialize)]
struct SendImmediateResponse {
    status: &'static str,
    details: crate::model::SpecialChargingSession,
}

async fn send_special_schedule_immediate<S: StateStore, T: SecretStore>(
    State(state): State<AppState<S, T>>,
    body: Option<Json<SendImmediateRequest>>,
) -> AppResult<Json<SendImmediateResponse>> {
    let body = body.map(|b| b.0).unwrap_or_default();
    if let Some(reason) = &body.reason {
        tracing::info!(reason, "immediate special-charging dispatch requested");
    }
    let token = state.ensure_ready(true).await?;
    let target_percent = body.target_percent.unwrap_or(90);
    let session = state
        .special
        .send_immediate(&token, &state.vin, target_percent)
        .await?;
    Ok(Json(SendImmediateResponse {
        status: "sent",
        details: session,
    }))
}

#[derive(Deserialize)]
struct CleanupRequest {
    session_id: String,
}

#[derive(Serialize)]
struct CleanupResponse {
    session_id: String,
    cleaned: bool,
    cleanup_job_deleted: bool,
}

async fn cleanup_single_session<S: StateStore, T: SecretStore>(
    State(state): State<AppState<S, T>>,
    Json(body): Json<CleanupRequest>,
) -> AppResult<Json<CleanupResponse>> {
    let token = state.ensure_ready(true).await?;
    let (outcome, cleanup_job_deleted) = state
        .special
        .cleanup_session(&token, &body.session_id)
        .await?;
    let cleaned = matches!(outcome, crate::special::CleanupOutcome::Cleaned { .. });
    Ok(Json(CleanupResponse {
        session_id: body.session_id,
        cleaned,
        cleanup_job_deleted,
    }))
}

async fn reset<S: StateStore, T: SecretStore>(
    State(state): State<AppState<S, T>>,
) -> Json<super::ResetReport> {
    Json(state.reset().await)
}

async fn reset_tesla_schedules<S: StateStore, T: SecretStore>(
    State(state): State<AppState<S, T>>,
) -> AppResult<Json<super::ResetSchedulesReport>> {
    Ok(Json(state.reset_tesla_schedules().await?))
}

fn last4(vin: &str) -> String {
    if vin.len() <= 4 {
        vin.to_string()
    } else {
        vin[vin.len() - 4..].to_string()
    }
}
