use crate::batching::PendingReading;
use crate::db::ReadingStore;
use crate::errors::{Error, Result};
use crate::metrics::CHANNEL_FULL_TOTAL;
use crate::model::{RawReading, Reading, SubmitOutcome};
use crate::service::TelemetryService;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, Publish, QoS};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct MqttSettings {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub topic: String,
}

/// A broker delivery that stays unacknowledged until its reading is durable.
pub struct Delivery {
    client: AsyncClient,
    publish: Publish,
}

impl Delivery {
    pub fn new(client: AsyncClient, publish: Publish) -> Self {
        Self { client, publish }
    }

    pub async fn ack(&self) -> Result<()> {
        self.client.ack(&self.publish).await.map_err(Error::Mqtt)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("topic", &self.publish.topic)
            .field("pkid", &self.publish.pkid)
            .finish()
    }
}

/// Subscribes to device reading topics and feeds validated readings to the
/// batcher. Returns when `ctx` is cancelled.
///
/// Acks are manual: a valid reading's PUBACK is sent by the batcher after
/// commit, so anything not yet stored is redelivered by the broker when the
/// session resumes.
pub async fn run_mqtt<S: ReadingStore>(
    settings: MqttSettings,
    service: Arc<TelemetryService<S>>,
    tx: mpsc::Sender<PendingReading>,
    ctx: CancellationToken,
) -> Result<()> {
    info!(
        "Connecting to MQTT broker at {}:{} as {}",
        settings.broker, settings.port, settings.client_id
    );

    let mut mqtt_options = MqttOptions::new(settings.client_id, settings.broker, settings.port);
    mqtt_options.set_keep_alive(std::time::Duration::from_secs(30));
    mqtt_options.set_clean_session(false);
    mqtt_options.set_manual_acks(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);

    client
        .subscribe(settings.topic.as_str(), QoS::AtLeastOnce)
        .await
        .map_err(Error::Mqtt)?;

    info!("Subscribed to {} with QoS 1", settings.topic);

    loop {
        let notification = tokio::select! {
            _ = ctx.cancelled() => {
                info!("Received shutdown signal, disconnecting from MQTT broker");
                if let Err(e) = client.disconnect().await {
                    debug!("MQTT disconnect failed: {}", e);
                }
                break;
            }
            notification = eventloop.poll() => notification,
        };

        match notification {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );

                if let Err(e) = handle_publish(&client, publish, &service, &tx).await {
                    error!("Failed to process message: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT error: {}", e);
                // rumqttc reconnects on the next poll
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }

    Ok(())
}

/// Validates one publish. Rejected payloads are acknowledged at once since
/// redelivery cannot make them valid; valid readings go to the batcher
/// carrying their delivery.
async fn handle_publish<S: ReadingStore>(
    client: &AsyncClient,
    publish: Publish,
    service: &TelemetryService<S>,
    tx: &mpsc::Sender<PendingReading>,
) -> Result<()> {
    match decode_message(&publish.topic, &publish.payload, service) {
        Ok(reading) => {
            let delivery = Delivery::new(client.clone(), publish);
            forward(
                PendingReading {
                    reading,
                    delivery: Some(delivery),
                },
                tx,
            )
            .await
        }
        Err(_) => client.ack(&publish).await.map_err(Error::Mqtt),
    }
}

/// Parses and validates one message. Runs exactly once per delivery so the
/// reading keeps a single `received_at`.
fn decode_message<S: ReadingStore>(
    topic: &str,
    payload: &[u8],
    service: &TelemetryService<S>,
) -> std::result::Result<Reading, SubmitOutcome> {
    let mut raw = match serde_json::from_slice::<RawReading>(payload) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(topic, "Dropping unparseable payload: {}", e);
            return Err(service.reject_undecodable(e.to_string()));
        }
    };
    if raw.sensor_id.is_none() {
        raw.sensor_id = sensor_id_from_topic(topic).map(str::to_string);
    }

    service.prepare(&raw).map_err(|outcome| {
        warn!(topic, "Rejected reading: {:?}", outcome);
        outcome
    })
}

/// Hands a validated reading to the batcher, waiting for room when the
/// channel is full. Only a closed channel fails.
async fn forward(pending: PendingReading, tx: &mpsc::Sender<PendingReading>) -> Result<()> {
    match tx.try_send(pending) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(pending)) => {
            CHANNEL_FULL_TOTAL.inc();
            debug!("Channel full, waiting for batcher");
            tx.send(pending).await.map_err(|_| Error::ChannelSend)
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            error!("Channel closed, cannot forward reading");
            Err(Error::ChannelSend)
        }
    }
}

/// `sensors/<sensor_id>/readings` -> `<sensor_id>`
fn sensor_id_from_topic(topic: &str) -> Option<&str> {
    let mut parts = topic.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("sensors"), Some(id), Some("readings"), None) if !id.is_empty() => Some(id),
        _ => None,
    }
}
