use crate::errors::RejectionReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A reading as pushed by an ESP32, before validation.
///
/// Field aliases keep firmware built for the older `/api/updates` backend
/// (`mac_address`, `temperatura`, `humedad`) working unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawReading {
    #[serde(default, alias = "mac_address")]
    pub sensor_id: Option<String>,
    #[serde(default)]
    pub observed_at: Option<RawTimestamp>,
    #[serde(default, alias = "temperatura")]
    pub temperature: Option<f64>,
    #[serde(default, alias = "humedad")]
    pub humidity: Option<f64>,
}

/// Device timestamps arrive either as RFC 3339 text or UNIX seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    UnixSeconds(i64),
    Text(String),
}

/// A validated, normalized telemetry sample. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub sensor_id: String,
    pub observed_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
}

impl Reading {
    pub fn sequence_key(&self) -> SequenceKey {
        SequenceKey {
            sensor_id: self.sensor_id.clone(),
            observed_at: self.observed_at,
        }
    }

    /// True when both readings carry the same measurements.
    pub fn same_measurements(&self, other: &Reading) -> bool {
        self.temperature == other.temperature && self.humidity == other.humidity
    }
}

/// Ordering and dedup key. Unique within the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceKey {
    pub sensor_id: String,
    pub observed_at: DateTime<Utc>,
}

/// Registry entry for a physical device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub sensor_id: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// A sensor together with its newest stored reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorOverview {
    #[serde(flatten)]
    pub sensor: Sensor,
    pub latest: Option<Reading>,
}

/// Result of `Submit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Accepted,
    Duplicate,
    Rejected(RejectionReason),
}

/// Statistics for one measurement type within a window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SeriesStat {
    pub count: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
}

/// One aggregation window. Zero-reading windows have `count == 0` and empty stats.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStat {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub count: u64,
    pub temperature: SeriesStat,
    pub humidity: SeriesStat,
}

/// REST API response wrapper
#[derive(Debug, Serialize)]
pub struct ReadingsResponse {
    pub sensor_id: String,
    pub total: usize,
    pub data: Vec<Reading>,
}

#[derive(Debug, Serialize)]
pub struct SensorsResponse {
    pub total: usize,
    pub sensors: Vec<Sensor>,
}

#[derive(Debug, Serialize)]
pub struct OverviewResponse {
    pub total: usize,
    pub sensors: Vec<SensorOverview>,
}

#[derive(Debug, Serialize)]
pub struct AggregateResponse {
    pub sensor_id: String,
    pub window_secs: i64,
    pub windows: Vec<WindowStat>,
}
