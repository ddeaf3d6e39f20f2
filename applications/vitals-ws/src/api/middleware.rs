use crate::error::AppError;
use axum::{extract::FromRequestParts, http::request::Parts};

pub const DEVICE_ID_HEADER: &str = "X-Device-Id";
pub const API_KEY_HEADER: &str = "X-Api-Key";

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn api_key(parts: &Parts) -> Option<String> {
    if let Some(key) = header(parts, API_KEY_HEADER) {
        return Some(key.to_string());
    }

    match header(parts, "Authorization") {
        Some(value) if value.starts_with("Bearer ") => {
            let token = value[7..].trim();
            (!token.is_empty()).then(|| token.to_string())
        }
        _ => None,
    }
}

/// API key presented by a read-only client.
///
/// Taken from `X-Api-Key`, falling back to `Authorization: Bearer <key>`.
#[derive(Debug, Clone)]
pub struct ApiKey(pub String);

impl<S> FromRequestParts<S> for ApiKey
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        api_key(parts).map(ApiKey).ok_or(AppError::MissingCredentials)
    }
}

/// Device identity plus key, as sent by devices posting readings.
#[derive(Debug, Clone)]
pub struct DeviceCredentials {
    pub device_id: String,
    pub api_key: String,
}

impl<S> FromRequestParts<S> for DeviceCredentials
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let device_id = header(parts, DEVICE_ID_HEADER).ok_or(AppError::MissingCredentials)?;
        let api_key = api_key(parts).ok_or(AppError::MissingCredentials)?;

        Ok(DeviceCredentials {
            device_id: device_id.to_string(),
            api_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/api/v1/device");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn test_device_credentials_from_headers() {
        let mut parts = parts(&[("X-Device-Id", "bedside-01"), ("X-Api-Key", "secret")]);

        let creds = DeviceCredentials::from_request_parts(&mut parts, &())
            .await
            .unwrap();

        assert_eq!(creds.device_id, "bedside-01");
        assert_eq!(creds.api_key, "secret");
    }

    #[tokio::test]
    async fn test_device_credentials_missing_device_id() {
        let mut parts = parts(&[("X-Api-Key", "secret")]);

        let result = DeviceCredentials::from_request_parts(&mut parts, &()).await;

        assert!(matches!(result, Err(AppError::MissingCredentials)));
    }

    #[tokio::test]
    async fn test_api_key_bearer_fallback() {
        let mut parts = parts(&[("Authorization", "Bearer secret")]);

        let key = ApiKey::from_request_parts(&mut parts, &()).await.unwrap();

        assert_eq!(key.0, "secret");
    }

    #[tokio::test]
    async fn test_api_key_blank_header_rejected() {
        let mut parts = parts(&[("X-Api-Key", "  ")]);

        let result = ApiKey::from_request_parts(&mut parts, &()).await;

        assert!(matches!(result, Err(AppError::MissingCredentials)));
    }
}
