use crate::api::middleware::{ApiKey, DeviceCredentials};
use crate::api::models::vitals::{HistoryParams, HistoryResponse, IngestResponse};
use crate::error::{AppError, AuthError, ValidationErrors};
use crate::vitals::{DeviceStats, Reading, VitalSignsPayload};
use crate::ws::AppState;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

fn check_read_access(state: &AppState, device_id: &str, api_key: &ApiKey) -> Result<(), AppError> {
    if state.sessions.credentials().validate(device_id, &api_key.0) {
        Ok(())
    } else {
        tracing::warn!(device_id = %device_id, "Read access denied");
        Err(AuthError::InvalidCredentials.into())
    }
}

/// Request-style ingestion. Shares validation, storage and fan-out with the
/// WebSocket path; the body must carry its own timestamp.
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    credentials: DeviceCredentials,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<IngestResponse>, AppError> {
    state
        .sessions
        .authorize(&credentials.device_id, &credentials.api_key)?;

    let Json(body) = body.map_err(|rejection| {
        let mut errors = ValidationErrors::default();
        errors.push("body", rejection.body_text());
        AppError::InvalidReading(errors)
    })?;
    let payload = VitalSignsPayload::from_value(body)?;

    let reading = state.store.record(&credentials.device_id, payload, None)?;
    state.dispatcher.publish(&reading);

    Ok(Json(IngestResponse {
        success: true,
        message: "Vital signs received successfully".to_string(),
        timestamp: Utc::now(),
        stats: state.store.stats(&credentials.device_id),
    }))
}

pub async fn get_latest(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    api_key: ApiKey,
) -> Result<Json<Option<Reading>>, AppError> {
    check_read_access(&state, &device_id, &api_key)?;
    Ok(Json(state.store.latest(&device_id)))
}

pub async fn get_history(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    Query(params): Query<HistoryParams>,
    api_key: ApiKey,
) -> Result<Json<HistoryResponse>, AppError> {
    check_read_access(&state, &device_id, &api_key)?;

    Ok(Json(HistoryResponse {
        data: state.store.history(&device_id, params.limit()),
        timestamp: Utc::now(),
    }))
}

pub async fn get_stats(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    api_key: ApiKey,
) -> Result<Json<DeviceStats>, AppError> {
    check_read_access(&state, &device_id, &api_key)?;
    Ok(Json(state.store.stats(&device_id)))
}

pub async fn clear_history(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    api_key: ApiKey,
) -> Result<StatusCode, AppError> {
    check_read_access(&state, &device_id, &api_key)?;
    state.store.clear(&device_id);
    Ok(StatusCode::NO_CONTENT)
}
