use crate::aggregate;
use crate::db::ReadingStore;
use crate::dedup::{Admission, DedupGate};
use crate::errors::{Error, RejectionReason, Result};
use crate::metrics::{
    INGEST_LATENCY_SECONDS, READINGS_ACCEPTED_TOTAL, READINGS_DUPLICATE_TOTAL,
    READINGS_RECEIVED_TOTAL, READINGS_REJECTED_TOTAL,
};
use crate::model::{RawReading, Reading, Sensor, SensorOverview, SubmitOutcome, WindowStat};
use crate::validate::{truncate_millis, Validator};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Knobs for the service that are not owned by the store.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub retention_horizon: Duration,
    pub max_future_skew: Duration,
    pub max_windows: usize,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            retention_horizon: Duration::days(30),
            max_future_skew: Duration::minutes(5),
            max_windows: 10_000,
        }
    }
}

/// Hands out `received_at` stamps that never go backwards within a process,
/// even when the wall clock does.
#[derive(Debug)]
pub struct ReceiveClock {
    last_ms: AtomicI64,
}

impl ReceiveClock {
    pub fn new() -> Self {
        Self {
            last_ms: AtomicI64::new(i64::MIN),
        }
    }

    pub fn stamp(&self) -> DateTime<Utc> {
        self.stamp_at(Utc::now())
    }

    fn stamp_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let now_ms = truncate_millis(now).timestamp_millis();
        let prev = self.last_ms.fetch_max(now_ms, Ordering::AcqRel);
        let ms = prev.max(now_ms);
        DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(now)
    }
}

impl Default for ReceiveClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub sensors: u64,
    pub readings: u64,
}

/// The core's public surface: `Submit`, `Query`, `Aggregate`, `ListSensors`.
///
/// Holds no mutable state besides the receive clock; all persistence goes
/// through the store.
pub struct TelemetryService<S> {
    store: Arc<S>,
    gate: DedupGate<S>,
    validator: Validator,
    clock: ReceiveClock,
    max_windows: usize,
}

impl<S: ReadingStore> TelemetryService<S> {
    pub fn new(store: Arc<S>, options: ServiceOptions) -> Self {
        Self {
            gate: DedupGate::new(Arc::clone(&store)),
            store,
            validator: Validator::new(options.max_future_skew, options.retention_horizon),
            clock: ReceiveClock::new(),
            max_windows: options.max_windows,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Validates a raw reading and stamps it with `received_at`. Does not
    /// touch storage.
    pub fn prepare(&self, raw: &RawReading) -> std::result::Result<Reading, SubmitOutcome> {
        READINGS_RECEIVED_TOTAL.inc();
        self.validator
            .validate(raw, self.clock.stamp())
            .map_err(|reason| {
                debug!(sensor_id = ?raw.sensor_id, reason = %reason, "Rejected reading");
                record_rejection(reason)
            })
    }

    /// Records a payload the transport could not even decode.
    pub fn reject_undecodable(&self, detail: impl Into<String>) -> SubmitOutcome {
        READINGS_RECEIVED_TOTAL.inc();
        record_rejection(RejectionReason::MalformedPayload(detail.into()))
    }

    /// Validator -> dedup gate -> store. Rejections and duplicates are
    /// outcomes; only storage failures are errors.
    pub async fn submit(&self, raw: &RawReading) -> Result<SubmitOutcome> {
        let reading = match self.prepare(raw) {
            Ok(reading) => reading,
            Err(outcome) => return Ok(outcome),
        };

        let start = Instant::now();
        let admission = self.gate.admit(&reading).await?;
        INGEST_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());

        Ok(record(admission))
    }

    /// Admits already-validated readings in one transaction.
    pub async fn submit_batch(&self, readings: &[Reading]) -> Result<Vec<SubmitOutcome>> {
        let start = Instant::now();
        let admissions = self.gate.admit_batch(readings).await?;
        INGEST_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());

        Ok(admissions.into_iter().map(record).collect())
    }

    pub async fn query(
        &self,
        sensor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>> {
        if from > to {
            return Err(Error::InvalidRange(format!(
                "from {} is after to {}",
                from.to_rfc3339(),
                to.to_rfc3339()
            )));
        }
        self.store.range_query(sensor_id, from, to).await
    }

    pub async fn aggregate(
        &self,
        sensor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        window: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<WindowStat>> {
        // Reject bad shapes before any I/O.
        aggregate::window_count(from, to, window, self.max_windows)?;

        let readings = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            readings = self.store.range_query(sensor_id, from, to) => readings?,
        };

        // Window math runs off the runtime; `cancel` stops it between windows.
        let max_windows = self.max_windows;
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            aggregate::aggregate(&readings, from, to, window, max_windows, &cancel)
        })
        .await?
    }

    pub async fn list_sensors(&self) -> Result<Vec<Sensor>> {
        self.store.list_sensors().await
    }

    pub async fn recent(&self, sensor_id: &str, limit: u32) -> Result<Vec<Reading>> {
        self.store.recent(sensor_id, limit).await
    }

    /// Every registered sensor with its newest reading, if it still has one.
    pub async fn overview(&self) -> Result<Vec<SensorOverview>> {
        let sensors = self.store.list_sensors().await?;
        let mut latest: HashMap<String, Reading> = self
            .store
            .latest_per_sensor()
            .await?
            .into_iter()
            .map(|r| (r.sensor_id.clone(), r))
            .collect();

        Ok(sensors
            .into_iter()
            .map(|sensor| SensorOverview {
                latest: latest.remove(&sensor.sensor_id),
                sensor,
            })
            .collect())
    }

    pub async fn health(&self) -> Result<HealthReport> {
        Ok(HealthReport {
            sensors: self.store.sensor_count().await?,
            readings: self.store.reading_count().await?,
        })
    }
}

fn record_rejection(reason: RejectionReason) -> SubmitOutcome {
    READINGS_REJECTED_TOTAL
        .with_label_values(&[reason.kind()])
        .inc();
    SubmitOutcome::Rejected(reason)
}

fn record(admission: Admission) -> SubmitOutcome {
    match admission {
        Admission::Accepted => {
            READINGS_ACCEPTED_TOTAL.inc();
            SubmitOutcome::Accepted
        }
        Admission::Duplicate => {
            READINGS_DUPLICATE_TOTAL.inc();
            SubmitOutcome::Duplicate
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{SqliteStore, StoreOptions};
    use crate::model::RawTimestamp;
    use chrono::TimeZone;
    use tempfile::TempDir;

    async fn service(dir: &TempDir) -> TelemetryService<SqliteStore> {
        let store = SqliteStore::open(dir.path().join("t.db"), StoreOptions::default())
            .await
            .unwrap();
        TelemetryService::new(Arc::new(store), ServiceOptions::default())
    }

    fn raw(sensor: &str, minutes_ago: i64, temperature: f64) -> RawReading {
        RawReading {
            sensor_id: Some(sensor.to_string()),
            observed_at: Some(RawTimestamp::Text(
                (Utc::now() - Duration::minutes(minutes_ago)).to_rfc3339(),
            )),
            temperature: Some(temperature),
            humidity: None,
        }
    }

    #[tokio::test]
    async fn test_aggregate_stops_when_cancelled() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        service.submit(&raw("esp32-a1", 5, 21.0)).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let now = Utc::now();
        let result = service
            .aggregate(
                "esp32-a1",
                now - Duration::hours(1),
                now,
                Duration::minutes(1),
                &cancel,
            )
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_overview_and_health() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        service.submit(&raw("esp32-a1", 10, 20.0)).await.unwrap();
        service.submit(&raw("esp32-a1", 2, 23.5)).await.unwrap();
        service.submit(&raw("esp32-b2", 4, 19.0)).await.unwrap();

        let overview = service.overview().await.unwrap();
        assert_eq!(overview.len(), 2);
        assert_eq!(overview[0].sensor.sensor_id, "esp32-a1");
        assert_eq!(
            overview[0].latest.as_ref().and_then(|r| r.temperature),
            Some(23.5)
        );
        assert_eq!(
            overview[1].latest.as_ref().and_then(|r| r.temperature),
            Some(19.0)
        );

        let health = service.health().await.unwrap();
        assert_eq!(health.sensors, 2);
        assert_eq!(health.readings, 3);
    }

    #[test]
    fn test_receive_clock_is_monotonic() {
        let clock = ReceiveClock::new();
        let t = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

        assert_eq!(clock.stamp_at(t), t);
        // Wall clock stepped back: stamp holds at the previous value.
        assert_eq!(clock.stamp_at(t - Duration::seconds(5)), t);
        assert_eq!(
            clock.stamp_at(t + Duration::seconds(1)),
            t + Duration::seconds(1)
        );
    }
}
