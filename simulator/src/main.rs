mod telemetry;

use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::Duration;
use telemetry::{Device, ReadingPayload};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Emulates a fleet of ESP32 climate sensors publishing over MQTT.
#[derive(Debug, Parser)]
#[command(name = "simulator", version)]
struct Args {
    /// MQTT broker host
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Number of simulated devices
    #[arg(long, env = "DEVICES", default_value_t = 100)]
    devices: usize,

    /// Total messages per second across all devices
    #[arg(long, env = "RATE", default_value_t = 1000)]
    rate: u64,

    /// Share of messages re-sent verbatim
    #[arg(long, env = "DUPLICATE_RATIO", default_value_t = 0.02)]
    duplicate_ratio: f64,

    /// Share of messages carrying an out-of-range value
    #[arg(long, env = "OUTLIER_RATIO", default_value_t = 0.01)]
    outlier_ratio: f64,
}

const BURST_SIZE: usize = 200;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let rate = args.rate.max(1);
    let devices = args.devices.max(1);
    let duplicate_ratio = args.duplicate_ratio.clamp(0.0, 1.0);
    let outlier_ratio = args.outlier_ratio.clamp(0.0, 1.0);

    info!("Starting ESP32 simulator");
    info!(
        "Broker: {}:{}, Rate: {} msg/s, Devices: {}, Duplicates: {:.1}%, Outliers: {:.1}%",
        args.broker,
        args.port,
        rate,
        devices,
        duplicate_ratio * 100.0,
        outlier_ratio * 100.0
    );

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut rng = rand::thread_rng();
    let mut fleet: Vec<Device> = (0..devices)
        .map(|i| Device::new(format!("esp32-sim-{:04}", i), &mut rng))
        .collect();

    let burst_interval = Duration::from_millis((BURST_SIZE as u64 * 1000) / rate);
    info!(
        "Publishing in bursts of {} messages every {:?}",
        BURST_SIZE, burst_interval
    );

    let mut counter = 0u64;
    let mut duplicates = 0u64;
    let mut last_sent: Option<(String, String)> = None;

    loop {
        let burst_start = std::time::Instant::now();

        for _ in 0..BURST_SIZE {
            // Resend the previous message verbatim, as a device would after a lost ack.
            let (topic, payload) = match &last_sent {
                Some(previous) if rng.gen_bool(duplicate_ratio) => {
                    duplicates += 1;
                    previous.clone()
                }
                _ => {
                    let device = &mut fleet[(counter % devices as u64) as usize];
                    let reading = device.sample(&mut rng, outlier_ratio);
                    match encode(&reading) {
                        Some(payload) => (device.topic(), payload),
                        None => continue,
                    }
                }
            };

            match client
                .publish(&topic, QoS::AtLeastOnce, false, payload.clone())
                .await
            {
                Ok(_) => {
                    counter += 1;
                    last_sent = Some((topic, payload));
                }
                Err(e) => warn!("Failed to publish: {}", e),
            }
        }

        if counter % 10000 < BURST_SIZE as u64 {
            info!("Published {} messages ({} duplicates)", counter, duplicates);
        }

        let elapsed = burst_start.elapsed();
        if elapsed < burst_interval {
            tokio::time::sleep(burst_interval - elapsed).await;
        } else if elapsed > burst_interval * 2 {
            warn!(
                "Burst took {:?}, target was {:?} - broker may be overloaded",
                elapsed, burst_interval
            );
        }
    }
}

fn encode(reading: &ReadingPayload) -> Option<String> {
    match serde_json::to_string(reading) {
        Ok(p) => Some(p),
        Err(e) => {
            error!("Failed to serialize reading: {}", e);
            None
        }
    }
}
