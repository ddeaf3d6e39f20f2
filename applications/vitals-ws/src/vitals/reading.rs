use crate::error::ValidationErrors;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const HEART_RATE_RANGE: (f64, f64) = (0.0, 300.0);
const TEMPERATURE_RANGE: (f64, f64) = (20.0, 50.0);
const SPO2_RANGE: (f64, f64) = (0.0, 100.0);
const PERCENT_RANGE: (f64, f64) = (0.0, 100.0);

/// One validated vital-signs observation.
///
/// Only constructible through [`Reading::new`], so every value held by the
/// store has passed range validation. Fields are read-only.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    device_id: String,
    timestamp: DateTime<Utc>,
    heart_rate: f64,
    temperature: f64,
    #[serde(rename = "spO2")]
    spo2: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    battery_level: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    signal_strength: Option<f64>,
}

/// Wire shape of a reading before validation.
///
/// Numeric fields are optional here so that a missing value is reported as a
/// field violation rather than a parse failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VitalSignsPayload {
    #[serde(default, alias = "heart_rate", alias = "bpm")]
    pub heart_rate: Option<f64>,
    #[serde(default, alias = "temp")]
    pub temperature: Option<f64>,
    #[serde(default, rename = "spO2", alias = "spo2", alias = "oxygen")]
    pub spo2: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<f64>,
}

impl VitalSignsPayload {
    pub fn new(heart_rate: f64, temperature: f64, spo2: f64) -> Self {
        Self {
            heart_rate: Some(heart_rate),
            temperature: Some(temperature),
            spo2: Some(spo2),
            ..Default::default()
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp.to_rfc3339());
        self
    }

    /// Decode a JSON payload, naming each field whose value has the wrong type.
    pub fn from_value(value: Value) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::default();

        let object = match value.as_object() {
            Some(object) => object,
            None => {
                errors.push("payload", "must be an object");
                return Err(errors);
            }
        };

        for (field, keys, expected) in PAYLOAD_FIELDS {
            let wrong_type = keys
                .iter()
                .filter_map(|key| object.get(*key))
                .any(|v| !v.is_null() && !expected.matches(v));
            if wrong_type {
                errors.push(*field, expected.message());
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        serde_json::from_value(value).map_err(|e| {
            errors.push("payload", e.to_string());
            errors
        })
    }
}

impl Reading {
    /// Validate `payload` for `device_id`.
    ///
    /// `fallback_timestamp` is used when the payload carries none; without a
    /// fallback a missing timestamp is a violation. All violations are
    /// collected before returning.
    pub fn new(
        device_id: &str,
        payload: VitalSignsPayload,
        fallback_timestamp: Option<DateTime<Utc>>,
    ) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::default();

        if device_id.trim().is_empty() {
            errors.push("deviceId", "is required");
        }

        let timestamp = match payload.timestamp.as_deref() {
            Some(raw) => match DateTime::parse_from_rfc3339(raw) {
                Ok(ts) => Some(ts.with_timezone(&Utc)),
                Err(_) => {
                    errors.push("timestamp", "must be an ISO-8601 date-time");
                    None
                }
            },
            None => {
                if fallback_timestamp.is_none() {
                    errors.push("timestamp", "is required");
                }
                fallback_timestamp
            }
        };

        let heart_rate = required(&mut errors, "heartRate", payload.heart_rate, HEART_RATE_RANGE);
        let temperature = required(
            &mut errors,
            "temperature",
            payload.temperature,
            TEMPERATURE_RANGE,
        );
        let spo2 = required(&mut errors, "spO2", payload.spo2, SPO2_RANGE);
        optional(&mut errors, "batteryLevel", payload.battery_level, PERCENT_RANGE);
        optional(
            &mut errors,
            "signalStrength",
            payload.signal_strength,
            PERCENT_RANGE,
        );

        match (timestamp, heart_rate, temperature, spo2) {
            (Some(timestamp), Some(heart_rate), Some(temperature), Some(spo2))
                if errors.is_empty() =>
            {
                Ok(Self {
                    device_id: device_id.to_string(),
                    timestamp,
                    heart_rate,
                    temperature,
                    spo2,
                    battery_level: payload.battery_level,
                    signal_strength: payload.signal_strength,
                })
            }
            _ => Err(errors),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn heart_rate(&self) -> f64 {
        self.heart_rate
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn spo2(&self) -> f64 {
        self.spo2
    }

    pub fn battery_level(&self) -> Option<f64> {
        self.battery_level
    }

    pub fn signal_strength(&self) -> Option<f64> {
        self.signal_strength
    }
}

#[derive(Clone, Copy)]
enum FieldKind {
    Number,
    Text,
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldKind::Number => value.is_number(),
            FieldKind::Text => value.is_string(),
        }
    }

    fn message(self) -> &'static str {
        match self {
            FieldKind::Number => "must be a number",
            FieldKind::Text => "must be a string",
        }
    }
}

/// Reported name, accepted keys, expected JSON type.
const PAYLOAD_FIELDS: &[(&str, &[&str], FieldKind)] = &[
    ("heartRate", &["heartRate", "heart_rate", "bpm"], FieldKind::Number),
    ("temperature", &["temperature", "temp"], FieldKind::Number),
    ("spO2", &["spO2", "spo2", "oxygen"], FieldKind::Number),
    ("timestamp", &["timestamp"], FieldKind::Text),
    ("batteryLevel", &["batteryLevel"], FieldKind::Number),
    ("signalStrength", &["signalStrength"], FieldKind::Number),
];

fn in_range(value: f64, (min, max): (f64, f64)) -> bool {
    value.is_finite() && value >= min && value <= max
}

fn required(
    errors: &mut ValidationErrors,
    field: &str,
    value: Option<f64>,
    range: (f64, f64),
) -> Option<f64> {
    match value {
        None => {
            errors.push(field, "is required");
            None
        }
        Some(v) if !in_range(v, range) => {
            errors.push(field, format!("must be between {} and {}", range.0, range.1));
            None
        }
        Some(v) => Some(v),
    }
}

fn optional(errors: &mut ValidationErrors, field: &str, value: Option<f64>, range: (f64, f64)) {
    if let Some(v) = value {
        if !in_range(v, range) {
            errors.push(field, format!("must be between {} and {}", range.0, range.1));
        }
    }
}
