use crate::errors::{Error, Result};
use crate::metrics::STORAGE_FAILURES_TOTAL;
use crate::model::{Reading, Sensor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, Transaction};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Persistence contract for readings and the sensor registry.
///
/// The store is the only component that mutates shared state. Every method
/// is safe to call concurrently; atomicity of `insert_if_absent` is the
/// store's responsibility, never the caller's.
#[async_trait]
pub trait ReadingStore: Send + Sync + 'static {
    /// Inserts `reading` unless its sequence key already exists. Returns
    /// `true` only when the reading was newly committed, in which case the
    /// sensor's `last_seen` has been advanced in the same transaction.
    async fn insert_if_absent(&self, reading: &Reading) -> Result<bool>;

    /// `insert_if_absent` for many readings in a single transaction. The
    /// result has one entry per input, in order.
    async fn insert_batch(&self, readings: &[Reading]) -> Result<Vec<bool>>;

    /// Readings of `sensor_id` with `from <= observed_at <= to`, ascending.
    async fn range_query(
        &self,
        sensor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>>;

    /// The newest `limit` readings of `sensor_id`, newest first.
    async fn recent(&self, sensor_id: &str, limit: u32) -> Result<Vec<Reading>>;

    /// Fetches the stored reading for a sequence key, if any.
    async fn get(&self, sensor_id: &str, observed_at: DateTime<Utc>) -> Result<Option<Reading>>;

    /// Deletes every reading with `received_at < cutoff`; returns how many.
    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Sets `last_seen = max(last_seen, at)`, registering unknown sensors.
    async fn upsert_sensor_last_seen(&self, sensor_id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn list_sensors(&self) -> Result<Vec<Sensor>>;

    /// The newest reading of every sensor that has one, ordered by sensor id.
    async fn latest_per_sensor(&self) -> Result<Vec<Reading>>;

    async fn sensor_count(&self) -> Result<u64>;

    async fn reading_count(&self) -> Result<u64>;
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub max_connections: u32,
    pub prune_batch_size: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 8,
            prune_batch_size: 5000,
        }
    }
}

/// SQLite-backed store: one file, WAL journal, `synchronous = FULL` so a
/// committed insert survives a crash.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    prune_batch_size: u32,
}

impl SqliteStore {
    pub async fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        info!("Opening database at {}", path.display());
        let connect = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(connect)
            .await?;

        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Migrations completed");

        Ok(Self {
            pool,
            prune_batch_size: options.prune_batch_size.max(1),
        })
    }

    /// Checkpoints the WAL into the main database file and closes the pool.
    pub async fn close(&self) -> Result<()> {
        info!("Flushing database before shutdown");
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        self.pool.close().await;
        Ok(())
    }

    async fn insert_in(tx: &mut Transaction<'_, Sqlite>, reading: &Reading) -> Result<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO readings (sensor_id, observed_at, received_at, temperature, humidity)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (sensor_id, observed_at) DO NOTHING
            "#,
        )
        .bind(&reading.sensor_id)
        .bind(reading.observed_at.timestamp_millis())
        .bind(reading.received_at.timestamp_millis())
        .bind(reading.temperature)
        .bind(reading.humidity)
        .execute(&mut **tx)
        .await
        .map_err(storage_err)?
        .rows_affected()
            == 1;

        if inserted {
            Self::upsert_last_seen_in(tx, &reading.sensor_id, reading.received_at).await?;
        }
        Ok(inserted)
    }

    async fn upsert_last_seen_in(
        tx: &mut Transaction<'_, Sqlite>,
        sensor_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensors (sensor_id, first_seen, last_seen)
            VALUES (?1, ?2, ?2)
            ON CONFLICT (sensor_id) DO UPDATE SET
                last_seen = MAX(last_seen, excluded.last_seen),
                first_seen = MIN(first_seen, excluded.first_seen)
            "#,
        )
        .bind(sensor_id)
        .bind(at.timestamp_millis())
        .execute(&mut **tx)
        .await
        .map_err(storage_err)?;
        Ok(())
    }
}

#[async_trait]
impl ReadingStore for SqliteStore {
    async fn insert_if_absent(&self, reading: &Reading) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let inserted = Self::insert_in(&mut tx, reading).await?;
        tx.commit().await.map_err(storage_err)?;
        Ok(inserted)
    }

    async fn insert_batch(&self, readings: &[Reading]) -> Result<Vec<bool>> {
        if readings.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let mut results = Vec::with_capacity(readings.len());
        for reading in readings {
            results.push(Self::insert_in(&mut tx, reading).await?);
        }
        tx.commit().await.map_err(storage_err)?;

        debug!(
            batch = readings.len(),
            inserted = results.iter().filter(|i| **i).count(),
            "Committed reading batch"
        );
        Ok(results)
    }

    async fn range_query(
        &self,
        sensor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>> {
        let rows = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT sensor_id, observed_at, received_at, temperature, humidity
            FROM readings
            WHERE sensor_id = ?1 AND observed_at >= ?2 AND observed_at <= ?3
            ORDER BY observed_at ASC
            "#,
        )
        .bind(sensor_id)
        .bind(ceil_millis(from))
        .bind(to.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.into_iter().map(Reading::try_from).collect()
    }

    async fn recent(&self, sensor_id: &str, limit: u32) -> Result<Vec<Reading>> {
        let rows = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT sensor_id, observed_at, received_at, temperature, humidity
            FROM readings
            WHERE sensor_id = ?1
            ORDER BY observed_at DESC
            LIMIT ?2
            "#,
        )
        .bind(sensor_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.into_iter().map(Reading::try_from).collect()
    }

    async fn get(&self, sensor_id: &str, observed_at: DateTime<Utc>) -> Result<Option<Reading>> {
        let row = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT sensor_id, observed_at, received_at, temperature, humidity
            FROM readings
            WHERE sensor_id = ?1 AND observed_at = ?2
            "#,
        )
        .bind(sensor_id)
        .bind(observed_at.timestamp_millis())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.map(Reading::try_from).transpose()
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let cutoff_ms = cutoff.timestamp_millis();
        let mut total = 0u64;

        // Each batch is its own short transaction so writers are never
        // stalled for longer than one batch.
        loop {
            let removed = sqlx::query(
                r#"
                DELETE FROM readings
                WHERE (sensor_id, observed_at) IN (
                    SELECT sensor_id, observed_at
                    FROM readings
                    WHERE received_at < ?1
                    LIMIT ?2
                )
                "#,
            )
            .bind(cutoff_ms)
            .bind(i64::from(self.prune_batch_size))
            .execute(&self.pool)
            .await
            .map_err(storage_err)?
            .rows_affected();

            total += removed;
            if removed < u64::from(self.prune_batch_size) {
                break;
            }
            debug!(removed, total, "Pruned batch, continuing");
            tokio::task::yield_now().await;
        }

        Ok(total)
    }

    async fn upsert_sensor_last_seen(&self, sensor_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        Self::upsert_last_seen_in(&mut tx, sensor_id, at).await?;
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    async fn list_sensors(&self) -> Result<Vec<Sensor>> {
        let rows = sqlx::query_as::<_, SensorRow>(
            "SELECT sensor_id, first_seen, last_seen FROM sensors ORDER BY sensor_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.into_iter().map(Sensor::try_from).collect()
    }

    async fn latest_per_sensor(&self) -> Result<Vec<Reading>> {
        let rows = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT r.sensor_id, r.observed_at, r.received_at, r.temperature, r.humidity
            FROM readings r
            JOIN (
                SELECT sensor_id, MAX(observed_at) AS observed_at
                FROM readings
                GROUP BY sensor_id
            ) latest
            ON r.sensor_id = latest.sensor_id AND r.observed_at = latest.observed_at
            ORDER BY r.sensor_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.into_iter().map(Reading::try_from).collect()
    }

    async fn sensor_count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sensors")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(count.max(0) as u64)
    }

    async fn reading_count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM readings")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(count.max(0) as u64)
    }
}

fn storage_err(err: sqlx::Error) -> Error {
    STORAGE_FAILURES_TOTAL.inc();
    if is_transient_error(&err) {
        warn!(error = %err, "Transient storage failure");
    }
    Error::StorageUnavailable(err)
}

/// Whether retrying the same statement later may succeed.
pub fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY, SQLITE_LOCKED and their extended codes
            db_err.code().is_some_and(|code| {
                code == "5" || // SQLITE_BUSY
                code == "6" || // SQLITE_LOCKED
                code == "261" || // SQLITE_BUSY_RECOVERY
                code == "517" || // SQLITE_BUSY_SNAPSHOT
                code == "262" // SQLITE_LOCKED_SHAREDCACHE
            })
        }
        _ => false,
    }
}

#[derive(sqlx::FromRow)]
struct ReadingRow {
    sensor_id: String,
    observed_at: i64,
    received_at: i64,
    temperature: Option<f64>,
    humidity: Option<f64>,
}

impl TryFrom<ReadingRow> for Reading {
    type Error = Error;

    fn try_from(row: ReadingRow) -> Result<Self> {
        Ok(Reading {
            observed_at: from_millis(row.observed_at)?,
            received_at: from_millis(row.received_at)?,
            sensor_id: row.sensor_id,
            temperature: row.temperature,
            humidity: row.humidity,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SensorRow {
    sensor_id: String,
    first_seen: i64,
    last_seen: i64,
}

impl TryFrom<SensorRow> for Sensor {
    type Error = Error;

    fn try_from(row: SensorRow) -> Result<Self> {
        Ok(Sensor {
            first_seen: from_millis(row.first_seen)?,
            last_seen: from_millis(row.last_seen)?,
            sensor_id: row.sensor_id,
        })
    }
}

/// Stored keys are whole milliseconds, so an inclusive lower bound with a
/// sub-millisecond part starts at the next millisecond.
fn ceil_millis(ts: DateTime<Utc>) -> i64 {
    let ms = ts.timestamp_millis();
    if ts.timestamp_subsec_nanos() % 1_000_000 == 0 {
        ms
    } else {
        ms.saturating_add(1)
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| Error::CorruptRecord(format!("timestamp {} out of range", ms)))
}
