use crate::error::{AppError, FieldViolation};
use crate::vitals::{CriticalAlert, Reading};
use serde::{Deserialize, Serialize};

/// Messages sent from a device to the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMessage {
    Auth {
        #[serde(rename = "deviceId")]
        device_id: String,
        #[serde(rename = "apiKey")]
        api_key: String,
        timestamp: String,
    },
    /// The payload is decoded after authentication so that type errors can
    /// be reported per field.
    VitalSigns {
        #[serde(default)]
        payload: serde_json::Value,
    },
    Heartbeat {
        #[serde(default)]
        timestamp: Option<String>,
    },
}

/// Messages sent from the server to a device or live client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthResponse {
        success: bool,
        #[serde(rename = "deviceId", skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    VitalSignsAck {
        timestamp: String,
    },
    Heartbeat {
        timestamp: String,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Vec<FieldViolation>>,
    },
    VitalSigns {
        #[serde(rename = "deviceId")]
        device_id: String,
        payload: Reading,
    },
    CriticalAlert(CriticalAlert),
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl ServerMessage {
    pub fn auth_ok(device_id: impl Into<String>) -> Self {
        ServerMessage::AuthResponse {
            success: true,
            device_id: Some(device_id.into()),
            error: None,
        }
    }

    pub fn auth_failed(error: impl Into<String>) -> Self {
        ServerMessage::AuthResponse {
            success: false,
            device_id: None,
            error: Some(error.into()),
        }
    }

    pub fn ack() -> Self {
        ServerMessage::VitalSignsAck { timestamp: now() }
    }

    pub fn heartbeat() -> Self {
        ServerMessage::Heartbeat { timestamp: now() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            details: None,
        }
    }

    /// Error frame carrying only the client-safe text of `error`.
    pub fn from_error(error: &AppError) -> Self {
        Self::error(error.client_message())
    }

    pub fn invalid_reading(details: Vec<FieldViolation>) -> Self {
        ServerMessage::Error {
            message: "Invalid vital signs data".to_string(),
            details: Some(details),
        }
    }

    pub fn reading(reading: Reading) -> Self {
        ServerMessage::VitalSigns {
            device_id: reading.device_id().to_string(),
            payload: reading,
        }
    }

    pub fn alert(alert: CriticalAlert) -> Self {
        ServerMessage::CriticalAlert(alert)
    }
}
