use crate::api::handlers::{devices, status, vitals};
use crate::ws::{health_check, live_handler, ws_handler, AppState};
use axum::{
    extract::Request,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::Level;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Public routes (no credentials)
    let public_routes = Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/status", get(status::status));

    // Device routes (credentials checked per handler)
    let device_routes = Router::new()
        .route("/api/v1/vital-signs", post(vitals::ingest))
        .route("/api/v1/device", get(devices::device_config))
        .route("/api/v1/devices/{device_id}/latest", get(vitals::get_latest))
        .route(
            "/api/v1/devices/{device_id}/history",
            get(vitals::get_history).delete(vitals::clear_history),
        )
        .route("/api/v1/devices/{device_id}/stats", get(vitals::get_stats));

    // WebSocket routes (device handshake is in-band)
    let ws_routes = Router::new()
        .route("/ws/devices", get(ws_handler))
        .route("/ws/live", get(live_handler));

    Router::new()
        .merge(public_routes)
        .merge(device_routes)
        .merge(ws_routes)
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request| {
                    tracing::span!(
                        Level::INFO,
                        "http_request",
                        method = %request.method(),
                        uri = %request.uri(),
                    )
                })
                .on_request(|_request: &Request, _span: &tracing::Span| {
                    tracing::event!(Level::DEBUG, "received request");
                })
                .on_response(
                    |response: &axum::response::Response,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::event!(
                            Level::INFO,
                            status = %response.status(),
                            latency = ?latency,
                            "request completed"
                        );
                    },
                )
                .on_failure(
                    |_error: tower_http::classify::ServerErrorsFailureClass,
                     _latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::event!(Level::ERROR, "request failed");
                    },
                ),
        )
}
