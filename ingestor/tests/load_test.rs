//! Broker-backed load tests. Require a running MQTT broker on localhost:1883
//! and an ingestor subscribed to it; run with `cargo test -- --ignored`.

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::time::sleep;

#[derive(Debug, Clone, Serialize)]
struct DevicePayload {
    sensor_id: String,
    observed_at: String,
    temperature: Option<f64>,
    humidity: Option<f64>,
}

impl DevicePayload {
    fn random(sensor_id: String, seq: i64) -> Self {
        let mut rng = rand::thread_rng();
        // Distinct observed_at per message so every publish is a new reading.
        let observed_at = Utc::now() - ChronoDuration::milliseconds(seq);
        Self {
            sensor_id,
            observed_at: observed_at.to_rfc3339(),
            temperature: Some(rng.gen_range(15.0..35.0)),
            humidity: rng.gen_bool(0.9).then(|| rng.gen_range(30.0..80.0)),
        }
    }
}

struct LoadReport {
    sent: usize,
    errors: usize,
    elapsed: Duration,
}

async fn publish_load(
    client_id: &str,
    devices: usize,
    target_rate: usize,
    duration_secs: usize,
) -> LoadReport {
    let total_messages = duration_secs * target_rate;

    let mut mqtt_options = MqttOptions::new(client_id, "localhost", 1883);
    mqtt_options.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                eprintln!("MQTT error: {}", e);
                break;
            }
        }
    });

    sleep(Duration::from_millis(500)).await;

    let start = Instant::now();
    let mut sent = 0;
    let mut errors = 0;

    let burst_size = 100;
    let delay_per_burst = Duration::from_micros((burst_size * 1_000_000 / target_rate) as u64);

    for batch_start in (0..total_messages).step_by(burst_size) {
        for i in batch_start..std::cmp::min(batch_start + burst_size, total_messages) {
            let sensor_id = format!("load-esp32-{}", i % devices);
            let payload = DevicePayload::random(sensor_id.clone(), i as i64);
            let body = serde_json::to_string(&payload).unwrap();

            match client
                .publish(
                    format!("sensors/{}/readings", sensor_id),
                    QoS::AtLeastOnce,
                    false,
                    body,
                )
                .await
            {
                Ok(_) => sent += 1,
                Err(e) => {
                    errors += 1;
                    if errors < 10 {
                        eprintln!("Send error: {}", e);
                    }
                }
            }
        }

        sleep(delay_per_burst).await;

        if (batch_start + burst_size) % 5000 == 0 {
            let rate = (batch_start + burst_size) as f64 / start.elapsed().as_secs_f64();
            println!("{} msgs ({:.0} msg/s)", batch_start + burst_size, rate);
        }
    }

    LoadReport {
        sent,
        errors,
        elapsed: start.elapsed(),
    }
}

#[tokio::test]
#[ignore]
async fn test_1000_readings_per_second() {
    let report = publish_load("load-test", 10, 1000, 10).await;
    let rate = report.sent as f64 / report.elapsed.as_secs_f64();

    println!(
        "sent={} errors={} duration={:.2}s rate={:.2} msg/s",
        report.sent,
        report.errors,
        report.elapsed.as_secs_f64(),
        rate
    );

    assert!(rate >= 900.0, "Throughput too low: {:.2} msg/s", rate);
    assert_eq!(report.errors, 0);
}

#[tokio::test]
#[ignore]
async fn test_sustained_load_60_seconds() {
    let report = publish_load("load-test-sustained", 50, 1000, 60).await;
    let rate = report.sent as f64 / report.elapsed.as_secs_f64();

    println!(
        "sent={} errors={} rate={:.2} msg/s",
        report.sent, report.errors, rate
    );

    let error_rate = report.errors as f64 / (report.sent + report.errors).max(1) as f64;
    assert!(error_rate < 0.01, "Error rate too high: {:.2}%", error_rate * 100.0);
}
