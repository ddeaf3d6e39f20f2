use crate::api::models::devices::StatusResponse;
use crate::ws::AppState;
use axum::{extract::State, response::Json};
use chrono::Utc;
use std::sync::Arc;

pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "online".to_string(),
        message: "Vital signs server is running".to_string(),
        timestamp: Utc::now(),
        authenticated_devices: state.sessions.authenticated_devices().len(),
    })
}
