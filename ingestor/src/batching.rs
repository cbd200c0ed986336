use crate::db::{is_transient_error, ReadingStore};
use crate::errors::Error;
use crate::metrics::BATCH_SIZE;
use crate::model::{Reading, SubmitOutcome};
use crate::mqtt::Delivery;
use crate::service::TelemetryService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

const MAX_ATTEMPTS: u32 = 4;

/// A validated reading waiting for group commit, plus the broker delivery to
/// acknowledge once it is stored.
#[derive(Debug)]
pub struct PendingReading {
    pub reading: Reading,
    pub delivery: Option<Delivery>,
}

/// Group-commits validated readings arriving from the MQTT subscriber.
///
/// Flushes when `max_batch` readings are buffered or every `max_wait_ms`,
/// whichever comes first. A batch that cannot be stored stays buffered and
/// unacknowledged; after a failure only the timer retries it. Exits after a
/// final flush once the channel closes.
pub async fn run_batcher<S: ReadingStore>(
    mut rx: mpsc::Receiver<PendingReading>,
    service: Arc<TelemetryService<S>>,
    max_batch: usize,
    max_wait_ms: u64,
) {
    info!(
        "Starting batcher with max_batch={}, max_wait_ms={}",
        max_batch, max_wait_ms
    );

    let mut buffer: Vec<PendingReading> = Vec::with_capacity(max_batch);
    let mut ticker = interval(Duration::from_millis(max_wait_ms.max(1)));
    let mut failing = false;

    loop {
        tokio::select! {
            pending = rx.recv() => {
                match pending {
                    Some(p) => {
                        buffer.push(p);

                        if buffer.len() >= max_batch && !failing {
                            failing = flush_batch(&service, &mut buffer).await.is_none();
                        }
                    }
                    None => {
                        info!("Channel closed, flushing remaining batch");
                        if flush_batch(&service, &mut buffer).await.is_none() {
                            error!(
                                unacknowledged = buffer.len(),
                                "Stopping with unstored readings; the broker redelivers them to the next session"
                            );
                        }
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    failing = flush_batch(&service, &mut buffer).await.is_none();
                }
            }
        }
    }

    info!("Batcher stopped");
}

/// Commits `buffer` and acknowledges its deliveries, returning one outcome
/// per reading. On failure the buffer is left untouched and `None` returned.
pub(crate) async fn flush_batch<S: ReadingStore>(
    service: &TelemetryService<S>,
    buffer: &mut Vec<PendingReading>,
) -> Option<Vec<SubmitOutcome>> {
    let batch_len = buffer.len();
    if batch_len == 0 {
        return Some(Vec::new());
    }

    debug!("Flushing batch of {} readings", batch_len);
    BATCH_SIZE.set(batch_len as f64);
    let readings: Vec<Reading> = buffer.iter().map(|p| p.reading.clone()).collect();

    let mut attempt = 0;
    loop {
        attempt += 1;

        match service.submit_batch(&readings).await {
            Ok(outcomes) => {
                if attempt > 1 {
                    info!("Batch committed after {} attempts", attempt);
                }
                let duplicates = outcomes
                    .iter()
                    .filter(|o| **o == SubmitOutcome::Duplicate)
                    .count();
                debug!(
                    accepted = batch_len - duplicates,
                    duplicates, "Batch committed"
                );

                for pending in buffer.drain(..) {
                    if let Some(delivery) = pending.delivery {
                        if let Err(e) = delivery.ack().await {
                            warn!(?delivery, "Failed to acknowledge stored reading: {}", e);
                        }
                    }
                }
                BATCH_SIZE.set(0.0);
                return Some(outcomes);
            }
            Err(e) => {
                let retryable = matches!(&e, Error::StorageUnavailable(db) if is_transient_error(db));
                if attempt >= MAX_ATTEMPTS || !retryable {
                    error!(
                        batch = batch_len,
                        attempts = attempt,
                        error = %e,
                        "Failed to persist reading batch; keeping it unacknowledged for the next flush"
                    );
                    return None;
                }

                // 100ms, 200ms, 400ms
                let backoff_ms = 100 * 2_u64.pow(attempt - 1);
                warn!(
                    "Failed to persist batch (attempt {}/{}): {}. Retrying in {}ms...",
                    attempt, MAX_ATTEMPTS, e, backoff_ms
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
        }
    }
}
