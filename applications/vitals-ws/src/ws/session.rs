//! Per-connection device protocol
//!
//! `DeviceConnection` owns the handshake state for one device socket and
//! turns each inbound frame into exactly one reply. It knows nothing about
//! the transport, so the socket task in `connection.rs` only shuttles text.
//!
//! ```text
//! Connecting -> Open -> Authenticating -> Authenticated
//!      \          \            \               \
//!       +----------+------------+---------------+--> Closed
//! ```

use crate::auth::SessionRegistry;
use crate::dispatch::Dispatcher;
use crate::error::AppError;
use crate::vitals::{VitalSignsPayload, VitalSignsStore};
use crate::ws::protocol::{DeviceMessage, ServerMessage};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Authenticating,
    Authenticated,
    Closed,
}

/// Reply to one inbound frame; `close` asks the transport to hang up after sending.
#[derive(Debug, Clone)]
pub struct Reply {
    pub message: ServerMessage,
    pub close: bool,
}

impl Reply {
    fn send(message: ServerMessage) -> Self {
        Self {
            message,
            close: false,
        }
    }

    fn send_and_close(message: ServerMessage) -> Self {
        Self {
            message,
            close: true,
        }
    }
}

pub struct DeviceConnection {
    connection_id: String,
    state: ConnectionState,
    device_id: Option<String>,
    sessions: Arc<SessionRegistry>,
    store: Arc<VitalSignsStore>,
    dispatcher: Arc<Dispatcher>,
}

impl DeviceConnection {
    pub fn new(
        connection_id: impl Into<String>,
        sessions: Arc<SessionRegistry>,
        store: Arc<VitalSignsStore>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            state: ConnectionState::Connecting,
            device_id: None,
            sessions,
            store,
            dispatcher,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Transport is up.
    pub fn open(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Open;
        }
    }

    /// Parse and handle one text frame. Returns `None` once closed.
    pub fn handle_text(&mut self, text: &str) -> Option<Reply> {
        if self.state == ConnectionState::Closed {
            return None;
        }

        match serde_json::from_str::<DeviceMessage>(text) {
            Ok(message) => Some(self.handle_message(message)),
            Err(e) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    "Failed to parse device message: {}",
                    e
                );
                Some(Reply::send(ServerMessage::error("Failed to process message")))
            }
        }
    }

    pub fn handle_message(&mut self, message: DeviceMessage) -> Reply {
        if self.state == ConnectionState::Connecting {
            return Reply::send(ServerMessage::error("Connection not open"));
        }

        match message {
            DeviceMessage::Auth {
                device_id,
                api_key,
                timestamp,
            } => self.handle_auth(device_id, &api_key, &timestamp),
            DeviceMessage::VitalSigns { payload } => self.handle_vital_signs(payload),
            DeviceMessage::Heartbeat { .. } => {
                tracing::debug!(connection_id = %self.connection_id, "Heartbeat received");
                Reply::send(ServerMessage::heartbeat())
            }
        }
    }

    fn handle_auth(&mut self, device_id: String, api_key: &str, timestamp: &str) -> Reply {
        let previous = self.state;
        self.state = ConnectionState::Authenticating;

        let presented = match DateTime::parse_from_rfc3339(timestamp) {
            Ok(ts) => ts.with_timezone(&Utc),
            Err(_) => {
                tracing::warn!(device_id = %device_id, "Unparseable authentication timestamp");
                self.close();
                return Reply::send_and_close(ServerMessage::auth_failed(
                    "Invalid authentication message",
                ));
            }
        };

        match self.sessions.authenticate(&device_id, api_key, presented) {
            Ok(session) => {
                if let Some(old) = self.device_id.take() {
                    if old != session.device_id {
                        self.sessions.remove(&old);
                    }
                }
                tracing::info!(
                    connection_id = %self.connection_id,
                    device_id = %session.device_id,
                    reauth = previous == ConnectionState::Authenticated,
                    "Device connection authenticated"
                );
                self.device_id = Some(session.device_id.clone());
                self.state = ConnectionState::Authenticated;
                Reply::send(ServerMessage::auth_ok(session.device_id))
            }
            Err(e) => {
                self.close();
                Reply::send_and_close(ServerMessage::auth_failed(e.to_string()))
            }
        }
    }

    fn handle_vital_signs(&mut self, payload: Value) -> Reply {
        let device_id = match (&self.state, &self.device_id) {
            (ConnectionState::Authenticated, Some(id)) => id.clone(),
            _ => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    "Vital signs received before authentication"
                );
                let error = AppError::DeviceNotAuthenticated(self.connection_id.clone());
                return Reply::send(ServerMessage::from_error(&error));
            }
        };

        // Sessions can lapse between frames, so liveness is checked every time
        if !self.sessions.is_authenticated(&device_id) {
            tracing::warn!(
                device_id = %device_id,
                timeout_secs = self.sessions.timeout().num_seconds(),
                "Vital signs from expired session"
            );
            return Reply::send(ServerMessage::from_error(
                &AppError::DeviceNotAuthenticated(device_id),
            ));
        }

        let recorded = VitalSignsPayload::from_value(payload)
            .and_then(|payload| self.store.record(&device_id, payload, Some(Utc::now())));

        match recorded {
            Ok(reading) => {
                self.dispatcher.publish(&reading);
                Reply::send(ServerMessage::ack())
            }
            Err(errors) => Reply::send(ServerMessage::invalid_reading(errors.0)),
        }
    }

    /// Move to `Closed` and deregister the device. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(device_id) = self.device_id.take() {
            self.sessions.remove(&device_id);
        }
        self.state = ConnectionState::Closed;
    }
}

impl Drop for DeviceConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CredentialValidator;
    use crate::config::ThresholdConfig;
    use serde_json::{json, Value};
    use std::time::Duration;

    struct Harness {
        sessions: Arc<SessionRegistry>,
        store: Arc<VitalSignsStore>,
        dispatcher: Arc<Dispatcher>,
    }

    impl Harness {
        fn new(timeout: Duration) -> Self {
            Self {
                sessions: Arc::new(SessionRegistry::new(
                    CredentialValidator::shared("secret-key"),
                    timeout,
                )),
                store: Arc::new(VitalSignsStore::new(100, ThresholdConfig::default())),
                dispatcher: Arc::new(Dispatcher::new()),
            }
        }

        fn connection(&self) -> DeviceConnection {
            let mut conn = DeviceConnection::new(
                "conn-1",
                self.sessions.clone(),
                self.store.clone(),
                self.dispatcher.clone(),
            );
            conn.open();
            conn
        }
    }

    fn send(conn: &mut DeviceConnection, message: Value) -> (Value, bool) {
        let reply = conn.handle_text(&message.to_string()).unwrap();
        (serde_json::to_value(&reply.message).unwrap(), reply.close)
    }

    fn auth(device_id: &str, key: &str) -> Value {
        json!({
            "type": "auth",
            "deviceId": device_id,
            "apiKey": key,
            "timestamp": Utc::now().to_rfc3339(),
        })
    }

    fn vitals(hr: f64) -> Value {
        json!({
            "type": "vital_signs",
            "payload": { "heartRate": hr, "temperature": 36.8, "spO2": 98 }
        })
    }

    #[test]
    fn test_starts_connecting_then_open() {
        let h = Harness::new(Duration::from_secs(30));
        let mut conn = DeviceConnection::new(
            "c",
            h.sessions.clone(),
            h.store.clone(),
            h.dispatcher.clone(),
        );
        assert_eq!(conn.state(), ConnectionState::Connecting);
        conn.open();
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[test]
    fn test_successful_auth() {
        let h = Harness::new(Duration::from_secs(30));
        let mut conn = h.connection();

        let (reply, close) = send(&mut conn, auth("bedside-01", "secret-key"));

        assert_eq!(reply["type"], "auth_response");
        assert_eq!(reply["success"], true);
        assert_eq!(reply["deviceId"], "bedside-01");
        assert!(!close);
        assert_eq!(conn.state(), ConnectionState::Authenticated);
        assert!(h.sessions.is_authenticated("bedside-01"));
    }

    #[test]
    fn test_failed_auth_closes() {
        let h = Harness::new(Duration::from_secs(30));
        let mut conn = h.connection();

        let (reply, close) = send(&mut conn, auth("bedside-01", "wrong"));

        assert_eq!(reply["success"], false);
        assert_eq!(reply["error"], "Invalid API key");
        assert!(close);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.handle_text(&vitals(72.0).to_string()).is_none());
    }

    #[test]
    fn test_stale_auth_closes() {
        let h = Harness::new(Duration::from_secs(30));
        let mut conn = h.connection();
        let old = (Utc::now() - chrono::Duration::seconds(60)).to_rfc3339();

        let (reply, close) = send(
            &mut conn,
            json!({"type": "auth", "deviceId": "d", "apiKey": "secret-key", "timestamp": old}),
        );

        assert_eq!(reply["error"], "Stale authentication message");
        assert!(close);
    }

    #[test]
    fn test_vital_signs_before_auth_rejected() {
        let h = Harness::new(Duration::from_secs(30));
        let mut conn = h.connection();

        let (reply, close) = send(&mut conn, vitals(72.0));

        assert_eq!(reply["type"], "error");
        assert_eq!(reply["message"], "Device not authenticated");
        assert!(!close);
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[test]
    fn test_vital_signs_stored_and_acknowledged() {
        let h = Harness::new(Duration::from_secs(30));
        let published = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = published.clone();
        h.dispatcher.subscribe(Arc::new(
            move |_: &crate::vitals::Reading| -> anyhow::Result<()> {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            },
        ));
        let mut conn = h.connection();
        send(&mut conn, auth("bedside-01", "secret-key"));

        let (reply, _) = send(&mut conn, vitals(72.0));

        assert_eq!(reply["type"], "vital_signs_ack");
        assert_eq!(h.store.latest("bedside-01").unwrap().heart_rate(), 72.0);
        assert_eq!(published.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_vital_signs_not_stored() {
        let h = Harness::new(Duration::from_secs(30));
        let mut conn = h.connection();
        send(&mut conn, auth("bedside-01", "secret-key"));

        let (reply, close) = send(&mut conn, vitals(400.0));

        assert_eq!(reply["type"], "error");
        assert_eq!(reply["details"][0]["field"], "heartRate");
        assert!(!close);
        assert!(h.store.latest("bedside-01").is_none());
    }

    #[test]
    fn test_wrongly_typed_field_reported_by_name() {
        let h = Harness::new(Duration::from_secs(30));
        let mut conn = h.connection();
        send(&mut conn, auth("bedside-01", "secret-key"));

        let (reply, close) = send(
            &mut conn,
            json!({
                "type": "vital_signs",
                "payload": { "heartRate": "fast", "temperature": 36.8, "spO2": 98 }
            }),
        );

        assert_eq!(reply["type"], "error");
        assert_eq!(reply["details"][0]["field"], "heartRate");
        assert_eq!(reply["details"][0]["message"], "must be a number");
        assert!(!close);
        assert!(h.store.latest("bedside-01").is_none());
    }

    #[test]
    fn test_missing_payload_reported() {
        let h = Harness::new(Duration::from_secs(30));
        let mut conn = h.connection();
        send(&mut conn, auth("bedside-01", "secret-key"));

        let (reply, _) = send(&mut conn, json!({ "type": "vital_signs" }));

        assert_eq!(reply["details"][0]["field"], "payload");
    }

    #[test]
    fn test_expired_session_rejected_then_recovered() {
        let h = Harness::new(Duration::from_secs(30));
        let mut conn = h.connection();
        send(&mut conn, auth("bedside-01", "secret-key"));

        // Session lapses while the socket stays up
        h.sessions.remove("bedside-01");
        let (reply, close) = send(&mut conn, vitals(72.0));
        assert_eq!(reply["message"], "Device not authenticated");
        assert!(!close);
        assert!(h.store.latest("bedside-01").is_none());

        send(&mut conn, auth("bedside-01", "secret-key"));
        let (reply, _) = send(&mut conn, vitals(72.0));
        assert_eq!(reply["type"], "vital_signs_ack");
    }

    #[test]
    fn test_session_timeout_rechecked_per_message() {
        let h = Harness::new(Duration::from_millis(50));
        let mut conn = h.connection();
        send(&mut conn, auth("bedside-01", "secret-key"));

        std::thread::sleep(Duration::from_millis(120));
        let (reply, _) = send(&mut conn, vitals(72.0));

        assert_eq!(reply["message"], "Device not authenticated");
    }

    #[test]
    fn test_heartbeat_echo_any_open_state() {
        let h = Harness::new(Duration::from_secs(30));
        let mut conn = h.connection();

        let (reply, _) = send(&mut conn, json!({"type": "heartbeat", "timestamp": Utc::now().to_rfc3339()}));
        assert_eq!(reply["type"], "heartbeat");

        send(&mut conn, auth("bedside-01", "secret-key"));
        let (reply, _) = send(&mut conn, json!({"type": "heartbeat"}));
        assert_eq!(reply["type"], "heartbeat");
    }

    #[test]
    fn test_heartbeat_does_not_extend_session() {
        let h = Harness::new(Duration::from_secs(30));
        let mut conn = h.connection();
        send(&mut conn, auth("bedside-01", "secret-key"));
        let before = h.sessions.session("bedside-01").unwrap().last_seen_at;

        std::thread::sleep(Duration::from_millis(5));
        send(&mut conn, json!({"type": "heartbeat"}));

        assert_eq!(h.sessions.session("bedside-01").unwrap().last_seen_at, before);
    }

    #[test]
    fn test_malformed_frame_gets_error_reply() {
        let h = Harness::new(Duration::from_secs(30));
        let mut conn = h.connection();

        let reply = conn.handle_text("{not json").unwrap();

        assert!(!reply.close);
        let value = serde_json::to_value(&reply.message).unwrap();
        assert_eq!(value["message"], "Failed to process message");
    }

    #[test]
    fn test_close_deregisters_device() {
        let h = Harness::new(Duration::from_secs(30));
        let mut conn = h.connection();
        send(&mut conn, auth("bedside-01", "secret-key"));

        conn.close();

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!h.sessions.is_authenticated("bedside-01"));
    }

    #[test]
    fn test_drop_deregisters_device() {
        let h = Harness::new(Duration::from_secs(30));
        {
            let mut conn = h.connection();
            send(&mut conn, auth("bedside-01", "secret-key"));
        }
        assert!(h.sessions.authenticated_devices().is_empty());
    }
}
