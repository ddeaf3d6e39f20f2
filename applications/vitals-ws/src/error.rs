use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Reasons a device handshake or header check is refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid API key")]
    InvalidCredentials,

    #[error("Stale authentication message")]
    StaleTimestamp,
}

/// A single field that failed range or shape validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Every violation found in one reading. Never empty when returned as an error.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(pub Vec<FieldViolation>);

impl ValidationErrors {
    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(FieldViolation::new(field, message));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> Vec<&str> {
        self.0.iter().map(|v| v.field.as_str()).collect()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|v| format!("{}: {}", v.field, v.message))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Missing required headers")]
    MissingCredentials,

    #[error("Invalid reading: {0}")]
    InvalidReading(#[from] ValidationErrors),

    #[error("Device not authenticated: {0}")]
    DeviceNotAuthenticated(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl AppError {
    /// Text that may be shown to a client. Internal detail stays in the logs.
    pub fn client_message(&self) -> String {
        match self {
            AppError::Auth(e) => e.to_string(),
            AppError::MissingCredentials => "Missing required headers".to_string(),
            AppError::DeviceNotAuthenticated(_) => "Device not authenticated".to_string(),
            AppError::InvalidReading(_) => "Invalid data format".to_string(),
            _ => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = self.client_message();
        let (status, body) = match self {
            AppError::Auth(_)
            | AppError::MissingCredentials
            | AppError::DeviceNotAuthenticated(_) => {
                (StatusCode::UNAUTHORIZED, json!({ "error": message }))
            }
            AppError::InvalidReading(errors) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": message, "details": errors }),
            ),
            other => {
                tracing::error!("Internal error: {}", other);
                (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": message }))
            }
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
