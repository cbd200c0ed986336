use crate::errors::RejectionReason;
use crate::model::{RawReading, RawTimestamp, Reading};
use chrono::{DateTime, Duration, DurationRound, Utc};

const TEMP_MIN: f64 = -50.0;
const TEMP_MAX: f64 = 100.0;
const HUMIDITY_MIN: f64 = 0.0;
const HUMIDITY_MAX: f64 = 100.0;
const SENSOR_ID_MAX_LEN: usize = 64;

/// Stateless validator for incoming readings.
#[derive(Debug, Clone)]
pub struct Validator {
    max_future_skew: Duration,
    retention_horizon: Duration,
}

impl Validator {
    pub fn new(max_future_skew: Duration, retention_horizon: Duration) -> Self {
        Self {
            max_future_skew,
            retention_horizon,
        }
    }

    /// Normalizes `raw` into a [`Reading`] stamped with `received_at`, or
    /// explains why it was refused.
    pub fn validate(
        &self,
        raw: &RawReading,
        received_at: DateTime<Utc>,
    ) -> Result<Reading, RejectionReason> {
        let sensor_id = validate_sensor_id(raw.sensor_id.as_deref())?;

        if raw.temperature.is_none() && raw.humidity.is_none() {
            return Err(RejectionReason::MalformedPayload(
                "reading carries neither temperature nor humidity".to_string(),
            ));
        }
        if let Some(t) = raw.temperature {
            check_range("Temperature", t, TEMP_MIN, TEMP_MAX)?;
        }
        if let Some(h) = raw.humidity {
            check_range("Humidity", h, HUMIDITY_MIN, HUMIDITY_MAX)?;
        }

        let received_at = truncate_millis(received_at);
        let observed_at = match &raw.observed_at {
            None => received_at,
            Some(ts) => truncate_millis(parse_timestamp(ts)?),
        };

        let latest = received_at
            .checked_add_signed(self.max_future_skew)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let earliest = received_at
            .checked_sub_signed(self.retention_horizon)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        if observed_at > latest {
            return Err(RejectionReason::OutOfRange(format!(
                "observed_at {} is more than {}s ahead of the server clock",
                observed_at.to_rfc3339(),
                self.max_future_skew.num_seconds()
            )));
        }
        if observed_at < earliest {
            return Err(RejectionReason::OutOfRange(format!(
                "observed_at {} is older than the retention horizon",
                observed_at.to_rfc3339()
            )));
        }

        Ok(Reading {
            sensor_id,
            observed_at,
            received_at,
            temperature: raw.temperature,
            humidity: raw.humidity,
        })
    }
}

fn validate_sensor_id(raw: Option<&str>) -> Result<String, RejectionReason> {
    let id = raw.map(str::trim).unwrap_or_default();
    if id.is_empty() {
        return Err(RejectionReason::MalformedPayload(
            "sensor_id cannot be empty".to_string(),
        ));
    }
    if id.chars().count() > SENSOR_ID_MAX_LEN {
        return Err(RejectionReason::UnknownSensorFormat(format!(
            "sensor_id longer than {} characters",
            SENSOR_ID_MAX_LEN
        )));
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')))
    {
        return Err(RejectionReason::UnknownSensorFormat(format!(
            "sensor_id contains invalid character {:?}",
            c
        )));
    }
    Ok(id.to_string())
}

fn check_range(name: &str, value: f64, min: f64, max: f64) -> Result<(), RejectionReason> {
    if !value.is_finite() || value < min || value > max {
        return Err(RejectionReason::OutOfRange(format!(
            "{} {} out of range [{}, {}]",
            name, value, min, max
        )));
    }
    Ok(())
}

fn parse_timestamp(ts: &RawTimestamp) -> Result<DateTime<Utc>, RejectionReason> {
    match ts {
        RawTimestamp::UnixSeconds(secs) => DateTime::<Utc>::from_timestamp(*secs, 0).ok_or_else(|| {
            RejectionReason::MalformedPayload(format!("observed_at {} is not a valid time", secs))
        }),
        RawTimestamp::Text(text) => DateTime::parse_from_rfc3339(text.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                RejectionReason::MalformedPayload(format!(
                    "observed_at {:?} is not RFC 3339: {}",
                    text, e
                ))
            }),
    }
}

/// Storage keeps millisecond precision; normalize up front so the dedup key
/// matches what is persisted.
pub(crate) fn truncate_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::milliseconds(1)).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn validator() -> Validator {
        Validator::new(Duration::minutes(5), Duration::days(30))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn raw(sensor_id: &str, temperature: Option<f64>, humidity: Option<f64>) -> RawReading {
        RawReading {
            sensor_id: Some(sensor_id.to_string()),
            observed_at: None,
            temperature,
            humidity,
        }
    }

    #[test]
    fn test_valid_reading_defaults_observed_at() {
        let reading = validator()
            .validate(&raw("esp32-a1", Some(21.5), Some(40.0)), now())
            .unwrap();

        assert_eq!(reading.sensor_id, "esp32-a1");
        assert_eq!(reading.observed_at, now());
        assert_eq!(reading.received_at, now());
    }

    #[test]
    fn test_single_measurement_is_enough() {
        assert!(validator()
            .validate(&raw("esp32-a1", None, Some(55.0)), now())
            .is_ok());
        assert!(validator()
            .validate(&raw("esp32-a1", Some(-10.0), None), now())
            .is_ok());
    }

    #[test]
    fn test_no_measurements() {
        let err = validator()
            .validate(&raw("esp32-a1", None, None), now())
            .unwrap_err();
        assert!(matches!(err, RejectionReason::MalformedPayload(_)));
    }

    #[test]
    fn test_invalid_temperature() {
        let err = validator()
            .validate(&raw("esp32-a1", Some(500.0), Some(40.0)), now())
            .unwrap_err();
        assert!(matches!(err, RejectionReason::OutOfRange(_)));

        let err = validator()
            .validate(&raw("esp32-a1", Some(f64::NAN), None), now())
            .unwrap_err();
        assert!(matches!(err, RejectionReason::OutOfRange(_)));
    }

    #[test]
    fn test_invalid_humidity() {
        let err = validator()
            .validate(&raw("esp32-a1", Some(20.0), Some(150.0)), now())
            .unwrap_err();
        assert!(matches!(err, RejectionReason::OutOfRange(_)));
    }

    #[test]
    fn test_range_bounds_are_inclusive() {
        assert!(validator()
            .validate(&raw("esp32-a1", Some(-50.0), Some(0.0)), now())
            .is_ok());
        assert!(validator()
            .validate(&raw("esp32-a1", Some(100.0), Some(100.0)), now())
            .is_ok());
    }

    #[test]
    fn test_empty_sensor_id() {
        let err = validator()
            .validate(&raw("   ", Some(20.0), None), now())
            .unwrap_err();
        assert!(matches!(err, RejectionReason::MalformedPayload(_)));

        let mut missing = raw("x", Some(20.0), None);
        missing.sensor_id = None;
        assert!(matches!(
            validator().validate(&missing, now()),
            Err(RejectionReason::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_sensor_id_shape() {
        let err = validator()
            .validate(&raw("esp32 a1", Some(20.0), None), now())
            .unwrap_err();
        assert!(matches!(err, RejectionReason::UnknownSensorFormat(_)));

        let long = "a".repeat(SENSOR_ID_MAX_LEN + 1);
        let err = validator()
            .validate(&raw(&long, Some(20.0), None), now())
            .unwrap_err();
        assert!(matches!(err, RejectionReason::UnknownSensorFormat(_)));

        assert!(validator()
            .validate(&raw("24:6F:28:AB:CD:EF", Some(20.0), None), now())
            .is_ok());
    }

    #[test]
    fn test_observed_at_parsing() {
        let mut r = raw("esp32-a1", Some(20.0), None);
        r.observed_at = Some(RawTimestamp::Text("2025-06-01T11:55:00Z".to_string()));
        let reading = validator().validate(&r, now()).unwrap();
        assert_eq!(reading.observed_at, now() - Duration::minutes(5));

        r.observed_at = Some(RawTimestamp::UnixSeconds(now().timestamp() - 60));
        let reading = validator().validate(&r, now()).unwrap();
        assert_eq!(reading.observed_at, now() - Duration::minutes(1));

        r.observed_at = Some(RawTimestamp::Text("yesterday".to_string()));
        assert!(matches!(
            validator().validate(&r, now()),
            Err(RejectionReason::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_clock_skew_bounds() {
        let mut r = raw("esp32-a1", Some(20.0), None);

        r.observed_at = Some(RawTimestamp::UnixSeconds(
            (now() + Duration::minutes(10)).timestamp(),
        ));
        assert!(matches!(
            validator().validate(&r, now()),
            Err(RejectionReason::OutOfRange(_))
        ));

        r.observed_at = Some(RawTimestamp::UnixSeconds(
            (now() - Duration::days(31)).timestamp(),
        ));
        assert!(matches!(
            validator().validate(&r, now()),
            Err(RejectionReason::OutOfRange(_))
        ));

        r.observed_at = Some(RawTimestamp::UnixSeconds(
            (now() + Duration::minutes(4)).timestamp(),
        ));
        assert!(validator().validate(&r, now()).is_ok());
    }

    #[test]
    fn test_timestamps_truncated_to_millis() {
        let received = now() + Duration::nanoseconds(1_234_567);
        let reading = validator()
            .validate(&raw("esp32-a1", Some(20.0), None), received)
            .unwrap();
        assert_eq!(reading.received_at, now() + Duration::milliseconds(1));
    }

    #[test]
    fn test_legacy_field_names() {
        let raw: RawReading = serde_json::from_str(
            r#"{"mac_address":"24:6F:28:00:00:01","temperatura":23.4,"humedad":51.0}"#,
        )
        .unwrap();
        let reading = validator().validate(&raw, now()).unwrap();
        assert_eq!(reading.sensor_id, "24:6F:28:00:00:01");
        assert_eq!(reading.temperature, Some(23.4));
        assert_eq!(reading.humidity, Some(51.0));
    }
}
