//! In-memory vital signs store
//!
//! Keeps a bounded, most-recent-first history per device. Each device's
//! history is an independent dashmap entry, so writes for different devices
//! never contend on the same lock. Critical readings are announced on a
//! broadcast channel after they are stored.

use crate::config::ThresholdConfig;
use crate::error::ValidationErrors;
use crate::vitals::alerts::{self, CriticalAlert};
use crate::vitals::reading::{Reading, VitalSignsPayload};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::broadcast;

const ALERT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStats {
    pub total_readings: usize,
    pub last_reading_timestamp: Option<DateTime<Utc>>,
    pub average_heart_rate: Option<f64>,
    pub average_temperature: Option<f64>,
    #[serde(rename = "averageSpO2")]
    pub average_spo2: Option<f64>,
}

impl DeviceStats {
    fn empty() -> Self {
        Self {
            total_readings: 0,
            last_reading_timestamp: None,
            average_heart_rate: None,
            average_temperature: None,
            average_spo2: None,
        }
    }
}

pub struct VitalSignsStore {
    histories: DashMap<String, VecDeque<Reading>>,
    max_history_size: usize,
    thresholds: ThresholdConfig,
    alerts: broadcast::Sender<CriticalAlert>,
}

impl VitalSignsStore {
    pub fn new(max_history_size: usize, thresholds: ThresholdConfig) -> Self {
        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            histories: DashMap::new(),
            max_history_size: max_history_size.max(1),
            thresholds,
            alerts,
        }
    }

    pub fn max_history_size(&self) -> usize {
        self.max_history_size
    }

    /// Receive every critical alert raised after this call.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<CriticalAlert> {
        self.alerts.subscribe()
    }

    /// Validate a raw payload and store it. Nothing is written on failure.
    pub fn record(
        &self,
        device_id: &str,
        payload: VitalSignsPayload,
        fallback_timestamp: Option<DateTime<Utc>>,
    ) -> Result<Reading, ValidationErrors> {
        let reading = Reading::new(device_id, payload, fallback_timestamp).map_err(|errors| {
            tracing::warn!(device_id = %device_id, errors = %errors, "Rejected vital signs");
            errors
        })?;
        self.store(reading.clone());
        Ok(reading)
    }

    /// Insert a validated reading at the front of its device history.
    ///
    /// Returns the alert raised for it, if any.
    pub fn store(&self, reading: Reading) -> Option<CriticalAlert> {
        let alert = alerts::evaluate(&reading, &self.thresholds);
        let device_id = reading.device_id().to_string();
        let timestamp = reading.timestamp();

        {
            let mut history = self.histories.entry(device_id.clone()).or_default();
            history.push_front(reading);
            history.truncate(self.max_history_size);
        }

        tracing::info!(
            device_id = %device_id,
            timestamp = %timestamp,
            "Vital signs stored successfully"
        );

        if let Some(alert) = &alert {
            tracing::warn!(
                device_id = %alert.device_id,
                breaches = ?alert.breaches,
                "Critical vital signs detected"
            );
            // No receivers is not an error
            let _ = self.alerts.send(alert.clone());
        }

        alert
    }

    pub fn latest(&self, device_id: &str) -> Option<Reading> {
        self.histories
            .get(device_id)
            .and_then(|history| history.front().cloned())
    }

    /// Most-recent-first, at most `limit` entries.
    pub fn history(&self, device_id: &str, limit: usize) -> Vec<Reading> {
        self.histories
            .get(device_id)
            .map(|history| history.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Averages over the retained history only.
    pub fn stats(&self, device_id: &str) -> DeviceStats {
        let history = match self.histories.get(device_id) {
            Some(history) if !history.is_empty() => history,
            _ => return DeviceStats::empty(),
        };

        let total = history.len();
        let (hr, temp, spo2) = history.iter().fold((0.0, 0.0, 0.0), |acc, r| {
            (
                acc.0 + r.heart_rate(),
                acc.1 + r.temperature(),
                acc.2 + r.spo2(),
            )
        });
        let n = total as f64;

        DeviceStats {
            total_readings: total,
            last_reading_timestamp: history.front().map(|r| r.timestamp()),
            average_heart_rate: Some(hr / n),
            average_temperature: Some(temp / n),
            average_spo2: Some(spo2 / n),
        }
    }

    pub fn clear(&self, device_id: &str) {
        if self.histories.remove(device_id).is_some() {
            tracing::info!(device_id = %device_id, "Device history cleared");
        }
    }
}
