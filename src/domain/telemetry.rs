//! Telemetry and tariff inputs published by the episode driver.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metric name for junction pressure readings
pub const PRESSURE_KPA: &str = "pressure_kpa";
/// Metric name for pipe flow readings
pub const FLOW_LPS: &str = "flow_lps";
/// Metric name for demand readings
pub const DEMAND_LPS: &str = "demand_lps";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub metric: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// A window of sensor samples for one network entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryWindow {
    /// Node or sensor the samples were collected at
    pub entity_id: String,

    /// Pipe the entity monitors, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipe_id: Option<String>,

    pub samples: Vec<TelemetrySample>,
}

impl TelemetryWindow {
    /// Values of one metric in timestamp order
    pub fn series(&self, metric: &str) -> Vec<f64> {
        let mut points: Vec<&TelemetrySample> =
            self.samples.iter().filter(|s| s.metric == metric).collect();
        points.sort_by_key(|s| s.timestamp);
        points.into_iter().map(|s| s.value).collect()
    }

    /// Most recent value of a metric
    pub fn latest(&self, metric: &str) -> Option<f64> {
        self.samples
            .iter()
            .filter(|s| s.metric == metric)
            .max_by_key(|s| s.timestamp)
            .map(|s| s.value)
    }

    /// Location the window refers to: the pipe when known, else the entity
    pub fn location(&self) -> &str {
        self.pipe_id.as_deref().unwrap_or(&self.entity_id)
    }
}

/// Hourly electricity prices starting at `start`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TariffUpdate {
    pub start: DateTime<Utc>,
    /// Price per kWh for each hour
    pub hourly_prices: Vec<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn sample(metric: &str, value: f64, minute: i64) -> TelemetrySample {
        TelemetrySample {
            metric: metric.to_string(),
            value,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + Duration::minutes(minute),
        }
    }

    #[test]
    fn test_series_is_time_ordered() {
        let window = TelemetryWindow {
            entity_id: "J2".to_string(),
            pipe_id: Some("P_J2_J3".to_string()),
            samples: vec![
                sample(PRESSURE_KPA, 290.0, 5),
                sample(FLOW_LPS, 4.0, 0),
                sample(PRESSURE_KPA, 300.0, 0),
            ],
        };

        assert_eq!(window.series(PRESSURE_KPA), vec![300.0, 290.0]);
        assert_eq!(window.latest(PRESSURE_KPA), Some(290.0));
        assert_eq!(window.latest(DEMAND_LPS), None);
        assert_eq!(window.location(), "P_J2_J3");
    }
}
