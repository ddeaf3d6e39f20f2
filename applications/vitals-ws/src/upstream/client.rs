use crate::config::UpstreamConfig;
use crate::dispatch::Dispatcher;
use crate::error::AppError;
use crate::upstream::policy::{ReconnectDecision, ReconnectPolicy};
use crate::vitals::{VitalSignsPayload, VitalSignsStore};
use crate::ws::DeviceMessage;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

/// Connectivity as seen by observers of the outbound client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum UpstreamStatus {
    Connecting,
    Connected,
    #[serde(rename_all = "camelCase")]
    Reconnecting { attempt: u32, delay_ms: u64 },
    Disconnected,
    Failed { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Connect,
    Disconnect,
}

/// Messages a provider may send. Unknown types are ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ProviderMessage {
    AuthResponse {
        success: bool,
        #[serde(default)]
        error: Option<String>,
    },
    VitalSigns {
        #[serde(default)]
        payload: serde_json::Value,
    },
    Heartbeat {
        #[serde(default)]
        timestamp: Option<String>,
    },
    Error {
        message: String,
    },
    #[serde(other)]
    Other,
}

/// How one connected session ended.
#[derive(Debug, PartialEq)]
enum SessionEnd {
    Dropped,
    Manual,
    Rejected(String),
    Shutdown,
}

/// Control surface for a running outbound client.
pub struct UpstreamHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<UpstreamStatus>,
    task: JoinHandle<()>,
}

impl UpstreamHandle {
    /// Reconnect after a manual disconnect or a terminal failure.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Close the connection and suppress automatic reconnection.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    pub fn status(&self) -> UpstreamStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UpstreamStatus> {
        self.status.clone()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

struct UpstreamClient {
    config: UpstreamConfig,
    store: Arc<VitalSignsStore>,
    dispatcher: Arc<Dispatcher>,
    status: watch::Sender<UpstreamStatus>,
}

/// Start the client task. It connects immediately.
pub fn spawn(
    config: UpstreamConfig,
    store: Arc<VitalSignsStore>,
    dispatcher: Arc<Dispatcher>,
) -> UpstreamHandle {
    let (commands, rx) = mpsc::unbounded_channel();
    let (status_tx, status) = watch::channel(UpstreamStatus::Disconnected);

    let client = UpstreamClient {
        config,
        store,
        dispatcher,
        status: status_tx,
    };
    let task = tokio::spawn(client.run(rx));

    UpstreamHandle {
        commands,
        status,
        task,
    }
}

impl UpstreamClient {
    fn set_status(&self, status: UpstreamStatus) {
        debug!("Upstream status: {:?}", status);
        self.status.send_replace(status);
    }

    async fn run(self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut policy = ReconnectPolicy::from_config(&self.config);

        loop {
            self.set_status(UpstreamStatus::Connecting);
            info!("Connecting to provider: {}", self.config.url);

            let end = tokio::select! {
                result = connect_async(self.config.url.as_str()) => match result {
                    Ok((stream, _)) => {
                        info!("Connected to provider: {}", self.config.url);
                        policy.on_open();
                        self.set_status(UpstreamStatus::Connected);
                        self.drive(stream, &mut commands).await
                    }
                    Err(e) => {
                        warn!("Failed to connect to provider: {}", e);
                        SessionEnd::Dropped
                    }
                },
                cmd = commands.recv() => match cmd {
                    Some(Command::Disconnect) => SessionEnd::Manual,
                    Some(Command::Connect) => continue,
                    None => SessionEnd::Shutdown,
                },
            };

            let resume = match end {
                SessionEnd::Shutdown => return,
                SessionEnd::Manual => {
                    policy.manual_disconnect();
                    self.set_status(UpstreamStatus::Disconnected);
                    false
                }
                SessionEnd::Rejected(message) => {
                    self.set_status(UpstreamStatus::Failed { message });
                    false
                }
                SessionEnd::Dropped => match policy.on_unexpected_close() {
                    ReconnectDecision::Retry { attempt, delay } => {
                        info!(
                            "Reconnecting to provider in {}ms (attempt {}/{})",
                            delay.as_millis(),
                            attempt,
                            self.config.max_reconnect_attempts
                        );
                        self.set_status(UpstreamStatus::Reconnecting {
                            attempt,
                            delay_ms: delay.as_millis() as u64,
                        });

                        tokio::select! {
                            _ = sleep(delay) => true,
                            cmd = commands.recv() => match cmd {
                                Some(Command::Connect) => {
                                    policy.connect();
                                    true
                                }
                                Some(Command::Disconnect) => {
                                    policy.manual_disconnect();
                                    self.set_status(UpstreamStatus::Disconnected);
                                    false
                                }
                                None => return,
                            },
                        }
                    }
                    ReconnectDecision::Exhausted => {
                        error!(
                            "Giving up on provider after {} reconnect attempts",
                            self.config.max_reconnect_attempts
                        );
                        self.set_status(UpstreamStatus::Failed {
                            message: "Max reconnection attempts reached".to_string(),
                        });
                        false
                    }
                    ReconnectDecision::Stopped => {
                        self.set_status(UpstreamStatus::Disconnected);
                        false
                    }
                },
            };

            if !resume {
                // Idle until someone asks to connect again
                loop {
                    match commands.recv().await {
                        Some(Command::Connect) => break,
                        Some(Command::Disconnect) => continue,
                        None => return,
                    }
                }
                policy.connect();
            }
        }
    }

    /// Pump one open connection. The heartbeat timer lives only as long as
    /// this call.
    async fn drive<S>(
        &self,
        stream: S,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> SessionEnd
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin,
    {
        let (mut write, mut read) = stream.split();

        if let Some(api_key) = &self.config.api_key {
            let auth = DeviceMessage::Auth {
                device_id: self.config.device_id.clone(),
                api_key: api_key.clone(),
                timestamp: Utc::now().to_rfc3339(),
            };
            if let Err(e) = send_json(&mut write, &auth).await {
                error!("Failed to send auth message: {}", e);
                return SessionEnd::Dropped;
            }
        }

        let mut heartbeat = interval(Duration::from_secs(self.config.heartbeat_interval_secs));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        heartbeat.tick().await;

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(end) = self.handle_text(text.as_str()) {
                            let _ = write.send(Message::Close(None)).await;
                            return end;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("Provider closed connection: {:?}", frame);
                        return SessionEnd::Dropped;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("Provider WebSocket error: {}", e);
                        return SessionEnd::Dropped;
                    }
                    None => {
                        warn!("Provider stream ended");
                        return SessionEnd::Dropped;
                    }
                },
                _ = heartbeat.tick() => {
                    let beat = DeviceMessage::Heartbeat {
                        timestamp: Some(Utc::now().to_rfc3339()),
                    };
                    if let Err(e) = send_json(&mut write, &beat).await {
                        error!("Failed to send heartbeat: {}", e);
                        return SessionEnd::Dropped;
                    }
                    debug!("Heartbeat sent to provider");
                }
                cmd = commands.recv() => match cmd {
                    Some(Command::Connect) => debug!("Already connected to provider"),
                    Some(Command::Disconnect) => {
                        info!("Disconnecting from provider");
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Manual;
                    }
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Shutdown;
                    }
                },
            }
        }
    }

    /// Returns `Some` when the session must end.
    fn handle_text(&self, text: &str) -> Option<SessionEnd> {
        let message = match serde_json::from_str::<ProviderMessage>(text) {
            Ok(m) => m,
            Err(e) => {
                warn!("Unparseable provider message: {}", e);
                return None;
            }
        };

        match message {
            ProviderMessage::AuthResponse { success: true, .. } => {
                info!("Authenticated with provider as {}", self.config.device_id);
            }
            ProviderMessage::AuthResponse { success: false, error } => {
                let reason = error.unwrap_or_else(|| "Authentication failed".to_string());
                error!("Provider rejected authentication: {}", reason);
                return Some(SessionEnd::Rejected(reason));
            }
            ProviderMessage::VitalSigns { payload } => {
                let recorded = VitalSignsPayload::from_value(payload).and_then(|payload| {
                    self.store
                        .record(&self.config.device_id, payload, Some(Utc::now()))
                });
                match recorded {
                    Ok(reading) => {
                        self.dispatcher.publish(&reading);
                    }
                    Err(errors) => warn!("Dropped invalid provider reading: {}", errors),
                }
            }
            ProviderMessage::Heartbeat { timestamp } => {
                debug!("Heartbeat from provider ({})", timestamp.as_deref().unwrap_or("-"))
            }
            ProviderMessage::Error { message } => warn!("Provider error: {}", message),
            ProviderMessage::Other => debug!("Ignoring provider message: {}", text),
        }
        None
    }
}

async fn send_json<W>(write: &mut W, message: &DeviceMessage) -> crate::Result<()>
where
    W: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(message)?;
    write
        .send(Message::text(json))
        .await
        .map_err(|e| AppError::Transport(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThresholdConfig;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn store() -> Arc<VitalSignsStore> {
        Arc::new(VitalSignsStore::new(10, ThresholdConfig::default()))
    }

    fn config(url: String) -> UpstreamConfig {
        let mut config = UpstreamConfig::new(url, "bedside-01");
        config.max_reconnect_attempts = 2;
        config.reconnect_base_delay_ms = 1;
        config.reconnect_max_delay_ms = 5;
        config
    }

    async fn refused_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{}", addr)
    }

    #[test]
    fn test_status_serialization() {
        let status = UpstreamStatus::Reconnecting {
            attempt: 2,
            delay_ms: 4000,
        };
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            serde_json::json!({ "state": "reconnecting", "attempt": 2, "delayMs": 4000 })
        );
    }

    #[test]
    fn test_provider_message_ignores_unknown_types() {
        let msg: ProviderMessage =
            serde_json::from_str(r#"{"type":"vital_signs_ack","timestamp":"x"}"#).unwrap();
        assert!(matches!(msg, ProviderMessage::Other));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let handle = spawn(config(refused_url().await), store(), Arc::new(Dispatcher::new()));
        let mut status = handle.subscribe();

        let failed = timeout(
            Duration::from_secs(5),
            status.wait_for(|s| matches!(s, UpstreamStatus::Failed { .. })),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();

        assert_eq!(
            failed,
            UpstreamStatus::Failed {
                message: "Max reconnection attempts reached".to_string()
            }
        );
        handle.abort();
    }

    #[tokio::test]
    async fn test_receives_readings_from_provider() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let provider = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

            // Expect the auth handshake first
            let auth = ws.next().await.unwrap().unwrap();
            let auth: serde_json::Value = serde_json::from_str(auth.to_text().unwrap()).unwrap();
            assert_eq!(auth["type"], "auth");
            assert_eq!(auth["deviceId"], "bedside-01");

            ws.send(Message::text(r#"{"type":"auth_response","success":true}"#))
                .await
                .unwrap();
            ws.send(Message::text(
                r#"{"type":"vital_signs","payload":{"heartRate":71,"temperature":36.6,"spO2":97}}"#,
            ))
            .await
            .unwrap();

            // Hold the socket open until the client leaves
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
            }
        });

        let store = store();
        let mut config = config(url);
        config.api_key = Some("secret".to_string());
        let handle = spawn(config, store.clone(), Arc::new(Dispatcher::new()));

        timeout(Duration::from_secs(5), async {
            while store.latest("bedside-01").is_none() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(store.latest("bedside-01").unwrap().heart_rate(), 71.0);
        assert_eq!(handle.status(), UpstreamStatus::Connected);

        handle.disconnect();
        let mut status = handle.subscribe();
        timeout(
            Duration::from_secs(5),
            status.wait_for(|s| *s == UpstreamStatus::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();

        timeout(Duration::from_secs(5), provider).await.unwrap().unwrap();
        handle.abort();
    }

    #[tokio::test]
    async fn test_heartbeats_sent_while_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = config(format!("ws://{}", listener.local_addr().unwrap()));
        config.heartbeat_interval_secs = 1;
        let handle = spawn(config, store(), Arc::new(Dispatcher::new()));

        let (tcp, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

        for _ in 0..2 {
            let frame = timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            let beat: serde_json::Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
            assert_eq!(beat["type"], "heartbeat");
            assert!(beat["timestamp"].is_string());
        }

        // Nothing but the close frame follows a disconnect
        handle.disconnect();
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(frame.is_close());

        handle.abort();
    }

    #[tokio::test]
    async fn test_manual_disconnect_suppresses_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = spawn(
            config(format!("ws://{}", listener.local_addr().unwrap())),
            store(),
            Arc::new(Dispatcher::new()),
        );
        let mut status = handle.subscribe();

        let (tcp, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        timeout(
            Duration::from_secs(5),
            status.wait_for(|s| *s == UpstreamStatus::Connected),
        )
        .await
        .unwrap()
        .unwrap();

        handle.disconnect();
        timeout(
            Duration::from_secs(5),
            status.wait_for(|s| *s == UpstreamStatus::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();
        drop(ws);

        // Backoff is 1ms here, so any automatic retry would land well inside this window
        assert!(timeout(Duration::from_millis(500), listener.accept())
            .await
            .is_err());
        assert_eq!(handle.status(), UpstreamStatus::Disconnected);

        handle.connect();
        let (tcp, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let _ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        timeout(
            Duration::from_secs(5),
            status.wait_for(|s| *s == UpstreamStatus::Connected),
        )
        .await
        .unwrap()
        .unwrap();

        handle.abort();
    }

    #[tokio::test]
    async fn test_rejected_auth_is_terminal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _ = ws.next().await;
            let _ = ws
                .send(Message::text(
                    r#"{"type":"auth_response","success":false,"error":"Invalid API key"}"#,
                ))
                .await;
            while let Some(Ok(_)) = ws.next().await {}
        });

        let mut config = config(url);
        config.api_key = Some("wrong".to_string());
        let handle = spawn(config, store(), Arc::new(Dispatcher::new()));
        let mut status = handle.subscribe();

        let failed = timeout(
            Duration::from_secs(5),
            status.wait_for(|s| matches!(s, UpstreamStatus::Failed { .. })),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();

        assert_eq!(
            failed,
            UpstreamStatus::Failed {
                message: "Invalid API key".to_string()
            }
        );
        handle.abort();
    }
}
