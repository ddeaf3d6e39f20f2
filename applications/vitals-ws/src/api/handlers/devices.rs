use crate::api::middleware::DeviceCredentials;
use crate::api::models::devices::{DeviceConfigResponse, DeviceSettings};
use crate::error::AppError;
use crate::ws::AppState;
use axum::{extract::State, response::Json};
use std::sync::Arc;

pub async fn device_config(
    State(state): State<Arc<AppState>>,
    credentials: DeviceCredentials,
) -> Result<Json<DeviceConfigResponse>, AppError> {
    state
        .sessions
        .authorize(&credentials.device_id, &credentials.api_key)?;

    let device_id = credentials.device_id;
    Ok(Json(DeviceConfigResponse {
        config: DeviceSettings::from(&state.device),
        latest_data: state.store.latest(&device_id),
        stats: state.store.stats(&device_id),
        device_id,
    }))
}
