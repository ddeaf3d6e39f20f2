use crate::auth::{CredentialValidator, SessionRegistry};
use crate::config::{Config, DeviceConfig};
use crate::dispatch::{BroadcastObserver, Dispatcher};
use crate::vitals::{Reading, VitalSignsStore};
use crate::ws::connection::{handle_device_connection, handle_live_connection};
use crate::ws::session::DeviceConnection;
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::Response,
};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

const LIVE_CHANNEL_CAPACITY: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionRegistry>,
    pub store: Arc<VitalSignsStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub live_tx: broadcast::Sender<Reading>,
    pub device: DeviceConfig,
    pub max_connections: usize,
    active_connections: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        store: Arc<VitalSignsStore>,
        dispatcher: Arc<Dispatcher>,
        device: DeviceConfig,
        max_connections: usize,
    ) -> Self {
        let (live_tx, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        dispatcher.subscribe(Arc::new(BroadcastObserver::new(live_tx.clone())));

        Self {
            sessions,
            store,
            dispatcher,
            live_tx,
            device,
            max_connections,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let sessions = Arc::new(SessionRegistry::new(
            CredentialValidator::from_config(&config.auth),
            config.auth.timeout(),
        ));
        let store = Arc::new(VitalSignsStore::new(
            config.storage.history_size,
            config.thresholds,
        ));

        Self::new(
            sessions,
            store,
            Arc::new(Dispatcher::new()),
            config.device.clone(),
            config.server.max_connections,
        )
    }

    /// Reserve a device connection slot, or `None` when the cap is reached.
    pub fn try_acquire_connection(&self) -> Option<ConnectionGuard> {
        let max = self.max_connections;
        self.active_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| ConnectionGuard {
                active: self.active_connections.clone(),
            })
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }
}

/// Holds one device connection slot until dropped.
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handle device WebSocket upgrade request
/// Devices authenticate in-band with an `auth` message after the upgrade.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Result<Response, StatusCode> {
    let guard = match state.try_acquire_connection() {
        Some(guard) => guard,
        None => {
            warn!(
                "Rejecting device connection: {} connections already open",
                state.max_connections
            );
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }
    };

    let connection = DeviceConnection::new(
        uuid::Uuid::new_v4().to_string(),
        state.sessions.clone(),
        state.store.clone(),
        state.dispatcher.clone(),
    );

    Ok(ws.on_upgrade(move |socket: WebSocket| {
        handle_device_connection(socket, connection, guard)
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveParams {
    pub device_id: String,
    pub api_key: String,
}

/// Handle live dashboard upgrade request
/// Expects credentials in query parameters: /ws/live?deviceId=<ID>&apiKey=<KEY>
pub async fn live_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<LiveParams>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, StatusCode> {
    if !state
        .sessions
        .credentials()
        .validate(&params.device_id, &params.api_key)
    {
        warn!(device_id = %params.device_id, "Live stream credentials rejected");
        return Err(StatusCode::UNAUTHORIZED);
    }

    info!("Live stream authorized for device: {}", params.device_id);

    let client_id = format!("{}_{}", params.device_id, uuid::Uuid::new_v4());
    let readings = state.live_tx.subscribe();
    let alerts = state.store.subscribe_alerts();
    let device_id = params.device_id;

    Ok(ws.on_upgrade(move |socket: WebSocket| {
        handle_live_connection(socket, readings, alerts, device_id, client_id)
    }))
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "OK"
}
