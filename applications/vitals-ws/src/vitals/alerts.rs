use crate::config::ThresholdConfig;
use crate::vitals::reading::Reading;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Metric {
    #[serde(rename = "heartRate")]
    HeartRate,
    #[serde(rename = "temperature")]
    Temperature,
    #[serde(rename = "spO2")]
    SpO2,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Breach {
    pub metric: Metric,
    pub value: f64,
}

/// One alert per reading, listing every metric outside its critical band.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticalAlert {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub breaches: Vec<Breach>,
}

impl CriticalAlert {
    pub fn metrics(&self) -> Vec<Metric> {
        self.breaches.iter().map(|b| b.metric).collect()
    }
}

/// Evaluate `reading` against the critical bands.
pub fn evaluate(reading: &Reading, thresholds: &ThresholdConfig) -> Option<CriticalAlert> {
    let mut breaches = Vec::new();

    if !thresholds.heart_rate.contains(reading.heart_rate()) {
        breaches.push(Breach {
            metric: Metric::HeartRate,
            value: reading.heart_rate(),
        });
    }

    if !thresholds.temperature.contains(reading.temperature()) {
        breaches.push(Breach {
            metric: Metric::Temperature,
            value: reading.temperature(),
        });
    }

    if reading.spo2() < thresholds.spo2_min {
        breaches.push(Breach {
            metric: Metric::SpO2,
            value: reading.spo2(),
        });
    }

    if breaches.is_empty() {
        return None;
    }

    Some(CriticalAlert {
        device_id: reading.device_id().to_string(),
        timestamp: reading.timestamp(),
        breaches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vitals::reading::VitalSignsPayload;

    fn reading(hr: f64, temp: f64, spo2: f64) -> Reading {
        Reading::new(
            "bedside-01",
            VitalSignsPayload::new(hr, temp, spo2),
            Some(Utc::now()),
        )
        .unwrap()
    }

    #[test]
    fn test_normal_reading_raises_nothing() {
        assert!(evaluate(&reading(72.0, 36.8, 98.0), &ThresholdConfig::default()).is_none());
    }

    #[test]
    fn test_band_edges_are_not_critical() {
        let t = ThresholdConfig::default();
        assert!(evaluate(&reading(40.0, 35.0, 90.0), &t).is_none());
        assert!(evaluate(&reading(150.0, 39.0, 90.0), &t).is_none());
    }

    #[test]
    fn test_high_heart_rate_only() {
        let alert = evaluate(&reading(170.0, 36.8, 98.0), &ThresholdConfig::default()).unwrap();
        assert_eq!(alert.metrics(), vec![Metric::HeartRate]);
        assert_eq!(alert.breaches[0].value, 170.0);
    }

    #[test]
    fn test_all_breaches_batched() {
        let alert = evaluate(&reading(30.0, 40.0, 85.0), &ThresholdConfig::default()).unwrap();
        assert_eq!(
            alert.metrics(),
            vec![Metric::HeartRate, Metric::Temperature, Metric::SpO2]
        );
    }

    #[test]
    fn test_thresholds_come_from_config() {
        let mut t = ThresholdConfig::default();
        t.spo2_min = 95.0;
        let alert = evaluate(&reading(72.0, 36.8, 94.0), &t).unwrap();
        assert_eq!(alert.metrics(), vec![Metric::SpO2]);
    }
}
