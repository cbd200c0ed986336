use crate::errors::{Error, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DAY_SECS: u64 = 24 * 60 * 60;

/// Runtime configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub db_max_connections: u32,
    pub http_addr: String,
    /// Allowed CORS origins; empty allows any origin.
    pub cors_origins: Vec<String>,
    pub mqtt_enabled: bool,
    pub mqtt_broker: String,
    pub mqtt_port: u16,
    pub mqtt_topic: String,
    /// Stable across restarts so the broker session keeps unacknowledged readings.
    pub mqtt_client_id: String,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub channel_capacity: usize,
    pub retention_horizon: Duration,
    pub prune_interval: Duration,
    pub prune_batch_size: u32,
    pub max_future_skew: Duration,
    pub max_windows: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/telemetry.db"),
            db_max_connections: 8,
            http_addr: "0.0.0.0:8080".to_string(),
            cors_origins: Vec::new(),
            mqtt_enabled: true,
            mqtt_broker: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_topic: "sensors/+/readings".to_string(),
            mqtt_client_id: "climate-ingestor".to_string(),
            batch_size: 500,
            batch_timeout_ms: 50,
            channel_capacity: 10_000,
            retention_horizon: Duration::from_secs(30 * DAY_SECS),
            prune_interval: Duration::from_secs(3600),
            prune_batch_size: 5000,
            max_future_skew: Duration::from_secs(300),
            max_windows: 10_000,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup, falling back to defaults
    /// for missing keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Config::default();
        let config = Config {
            database_path: lookup("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.database_path),
            db_max_connections: parse(&lookup, "DB_MAX_CONNECTIONS", d.db_max_connections)?,
            http_addr: lookup("HTTP_ADDR").unwrap_or(d.http_addr),
            cors_origins: lookup("CORS_ORIGINS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|o| !o.is_empty())
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .unwrap_or(d.cors_origins),
            mqtt_enabled: parse(&lookup, "MQTT_ENABLED", d.mqtt_enabled)?,
            mqtt_broker: lookup("MQTT_BROKER").unwrap_or(d.mqtt_broker),
            mqtt_port: parse(&lookup, "MQTT_PORT", d.mqtt_port)?,
            mqtt_topic: lookup("MQTT_TOPIC").unwrap_or(d.mqtt_topic),
            mqtt_client_id: lookup("MQTT_CLIENT_ID").unwrap_or(d.mqtt_client_id),
            batch_size: parse(&lookup, "BATCH_SIZE", d.batch_size)?,
            batch_timeout_ms: parse(&lookup, "BATCH_TIMEOUT_MS", d.batch_timeout_ms)?,
            channel_capacity: parse(&lookup, "CHANNEL_CAPACITY", d.channel_capacity)?,
            retention_horizon: secs(&lookup, "RETENTION_HORIZON_SECS", d.retention_horizon)?,
            prune_interval: secs(&lookup, "PRUNE_INTERVAL_SECS", d.prune_interval)?,
            prune_batch_size: parse(&lookup, "PRUNE_BATCH_SIZE", d.prune_batch_size)?,
            max_future_skew: secs(&lookup, "MAX_FUTURE_SKEW_SECS", d.max_future_skew)?,
            max_windows: parse(&lookup, "MAX_WINDOWS", d.max_windows)?,
        };
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.retention_horizon.is_zero() {
            return Err(Error::Config(
                "RETENTION_HORIZON_SECS must be greater than zero".to_string(),
            ));
        }
        if self.prune_interval.is_zero() {
            return Err(Error::Config(
                "PRUNE_INTERVAL_SECS must be greater than zero".to_string(),
            ));
        }
        if self.batch_size == 0 || self.channel_capacity == 0 {
            return Err(Error::Config(
                "BATCH_SIZE and CHANNEL_CAPACITY must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retention_horizon_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.retention_horizon).unwrap_or(chrono::Duration::MAX)
    }

    pub fn max_future_skew_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.max_future_skew).unwrap_or(chrono::Duration::MAX)
    }
}

fn parse<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{}={:?}: {}", key, raw, e))),
    }
}

fn secs<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parse(lookup, key, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.http_addr, "0.0.0.0:8080");
        assert_eq!(config.retention_horizon, Duration::from_secs(30 * DAY_SECS));
        assert_eq!(config.max_future_skew, Duration::from_secs(300));
        assert!(config.mqtt_enabled);
        assert!(config.cors_origins.is_empty());
        assert_eq!(config.mqtt_client_id, "climate-ingestor");
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("RETENTION_HORIZON_SECS", "86400"),
            ("PRUNE_INTERVAL_SECS", "60"),
            ("MAX_FUTURE_SKEW_SECS", "30"),
            ("MQTT_ENABLED", "false"),
            ("DATABASE_PATH", "/tmp/readings.db"),
            ("CORS_ORIGINS", "http://panel.local, https://ops.example.com,"),
        ]))
        .unwrap();
        assert_eq!(config.retention_horizon, Duration::from_secs(86400));
        assert_eq!(config.prune_interval, Duration::from_secs(60));
        assert_eq!(config.max_future_skew_chrono(), chrono::Duration::seconds(30));
        assert!(!config.mqtt_enabled);
        assert_eq!(config.database_path, PathBuf::from("/tmp/readings.db"));
        assert_eq!(
            config.cors_origins,
            vec!["http://panel.local", "https://ops.example.com"]
        );
    }

    #[test]
    fn test_invalid_values() {
        let err = Config::from_lookup(lookup(&[("MQTT_PORT", "not-a-port")])).unwrap_err();
        assert!(err.to_string().contains("MQTT_PORT"));

        assert!(Config::from_lookup(lookup(&[("PRUNE_INTERVAL_SECS", "0")])).is_err());
    }
}
