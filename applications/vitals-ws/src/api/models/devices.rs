use crate::config::DeviceConfig;
use crate::vitals::{DeviceStats, Reading};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSettings {
    pub sampling_rate: u64,
    pub max_retries: u32,
    pub timeout: u64,
}

impl From<&DeviceConfig> for DeviceSettings {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            sampling_rate: config.sampling_rate_ms,
            max_retries: config.max_retries,
            timeout: config.request_timeout_ms,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfigResponse {
    pub device_id: String,
    pub config: DeviceSettings,
    pub latest_data: Option<Reading>,
    pub stats: DeviceStats,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub authenticated_devices: usize,
}
