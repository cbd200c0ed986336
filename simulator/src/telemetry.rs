use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Wire shape published on `sensors/<sensor_id>/readings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingPayload {
    pub sensor_id: String,
    pub observed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
}

/// One simulated ESP32 with slowly drifting climate values.
#[derive(Debug, Clone)]
pub struct Device {
    pub sensor_id: String,
    temperature: f64,
    humidity: f64,
}

impl Device {
    pub fn new(sensor_id: String, rng: &mut impl Rng) -> Self {
        Self {
            sensor_id,
            temperature: rng.gen_range(18.0..26.0),
            humidity: rng.gen_range(35.0..65.0),
        }
    }

    pub fn topic(&self) -> String {
        format!("sensors/{}/readings", self.sensor_id)
    }

    /// Advances the drift and samples a reading. `outlier_ratio` of samples
    /// carry an out-of-range value the ingestor must reject.
    pub fn sample(&mut self, rng: &mut impl Rng, outlier_ratio: f64) -> ReadingPayload {
        self.temperature = (self.temperature + rng.gen_range(-0.2..0.2)).clamp(-10.0, 45.0);
        self.humidity = (self.humidity + rng.gen_range(-0.5..0.5)).clamp(5.0, 95.0);

        let mut temperature = Some((self.temperature * 10.0).round() / 10.0);
        let mut humidity = Some((self.humidity * 10.0).round() / 10.0);

        // DHT-style sensors occasionally fail one channel
        match rng.gen_range(0..50) {
            0 => temperature = None,
            1 => humidity = None,
            _ => {}
        }

        if rng.gen_bool(outlier_ratio) {
            if rng.gen_bool(0.5) {
                temperature = Some(rng.gen_range(101.0..500.0));
            } else {
                humidity = Some(rng.gen_range(100.5..150.0));
            }
        }

        ReadingPayload {
            sensor_id: self.sensor_id.clone(),
            observed_at: Utc::now(),
            temperature,
            humidity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_without_outliers_stays_in_range() {
        let mut rng = rand::thread_rng();
        let mut device = Device::new("esp32-sim-0".to_string(), &mut rng);

        for _ in 0..1000 {
            let reading = device.sample(&mut rng, 0.0);
            if let Some(t) = reading.temperature {
                assert!((-50.0..=100.0).contains(&t));
            }
            if let Some(h) = reading.humidity {
                assert!((0.0..=100.0).contains(&h));
            }
        }
    }

    #[test]
    fn test_outlier_ratio_one_always_out_of_range() {
        let mut rng = rand::thread_rng();
        let mut device = Device::new("esp32-sim-1".to_string(), &mut rng);

        let reading = device.sample(&mut rng, 1.0);
        let temp_bad = reading.temperature.map_or(false, |t| t > 100.0);
        let hum_bad = reading.humidity.map_or(false, |h| h > 100.0);
        assert!(temp_bad || hum_bad);
    }

    #[test]
    fn test_payload_omits_missing_measurement() {
        let payload = ReadingPayload {
            sensor_id: "esp32-a1".to_string(),
            observed_at: Utc::now(),
            temperature: Some(21.0),
            humidity: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("humidity").is_none());
        assert_eq!(json["temperature"], 21.0);
    }
}
