use crate::vitals::{CriticalAlert, Reading};
use crate::ws::handler::ConnectionGuard;
use crate::ws::protocol::ServerMessage;
use crate::ws::session::DeviceConnection;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

const INTERNAL_ERROR_FRAME: &str = r#"{"type":"error","message":"Internal server error"}"#;

fn encode(message: &ServerMessage) -> Utf8Bytes {
    match serde_json::to_string(message) {
        Ok(json) => json.into(),
        Err(e) => {
            error!("Failed to serialize message: {}", e);
            Utf8Bytes::from_static(INTERNAL_ERROR_FRAME)
        }
    }
}

/// Drive one device socket until it closes.
pub async fn handle_device_connection(
    socket: WebSocket,
    mut connection: DeviceConnection,
    _guard: ConnectionGuard,
) {
    let connection_id = connection.connection_id().to_string();
    info!("Device connection opened: {}", connection_id);
    connection.open();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    while let Some(msg_result) = ws_receiver.next().await {
        let msg = match msg_result {
            Ok(m) => m,
            Err(e) => {
                error!("WebSocket error on {}: {}", connection_id, e);
                break;
            }
        };

        let reply = match msg {
            Message::Text(text) => match connection.handle_text(text.as_str()) {
                Some(reply) => reply,
                None => break,
            },
            Message::Close(_) => {
                info!("Device {} closed connection", connection_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // Axum handles ping/pong automatically
                continue;
            }
            Message::Binary(_) => {
                warn!("Received unexpected binary message on {}", connection_id);
                if let Err(e) = ws_sender
                    .send(Message::Text(encode(&ServerMessage::error(
                        "Binary frames are not supported",
                    ))))
                    .await
                {
                    error!("Failed to send message to WebSocket: {}", e);
                    break;
                }
                continue;
            }
        };

        if let Err(e) = ws_sender.send(Message::Text(encode(&reply.message))).await {
            error!("Failed to send message to WebSocket: {}", e);
            break;
        }

        if reply.close {
            let frame = CloseFrame {
                code: close_code::NORMAL,
                reason: Utf8Bytes::from_static("Authentication failed"),
            };
            let _ = ws_sender.send(Message::Close(Some(frame))).await;
            break;
        }
    }

    // Deregisters the device before the task (and its guard) ends
    let device_id = connection.device_id().map(str::to_string);
    connection.close();
    info!(
        "Device connection closed: {} (device: {})",
        connection_id,
        device_id.as_deref().unwrap_or("-")
    );
}

/// Stream readings and alerts for one device to a dashboard client.
pub async fn handle_live_connection(
    socket: WebSocket,
    mut readings: broadcast::Receiver<Reading>,
    mut alerts: broadcast::Receiver<CriticalAlert>,
    device_id: String,
    client_id: String,
) {
    info!("Live client connected: {} (device: {})", client_id, device_id);

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_device_id = device_id.clone();
    let send_client_id = client_id.clone();

    let mut send_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                reading = readings.recv() => match reading {
                    Ok(reading) if reading.device_id() == send_device_id => {
                        ServerMessage::reading(reading)
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Live client {} lagged, skipped {} readings", send_client_id, skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
                alert = alerts.recv() => match alert {
                    Ok(alert) if alert.device_id == send_device_id => ServerMessage::alert(alert),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Live client {} lagged, skipped {} alerts", send_client_id, skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            if let Err(e) = ws_sender.send(Message::Text(encode(&message))).await {
                error!("Failed to send message to WebSocket: {}", e);
                break;
            }
        }
    });

    let recv_client_id = client_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg_result) = ws_receiver.next().await {
            match msg_result {
                Ok(Message::Close(_)) => {
                    info!("Live client {} closed connection", recv_client_id);
                    break;
                }
                Ok(_) => debug!("Ignoring inbound frame from live client {}", recv_client_id),
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
        }
    }

    info!("Live client disconnected: {}", client_id);
}
