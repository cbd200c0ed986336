use crate::db::ReadingStore;
use crate::errors::Result;
use crate::model::Reading;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of admitting a validated reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Duplicate,
}

/// Admits readings exactly once per sequence key.
///
/// There is no check-then-insert here: the store's conditional insert is the
/// only arbiter, so concurrent identical submissions cannot both persist.
pub struct DedupGate<S> {
    store: Arc<S>,
}

impl<S> Clone for DedupGate<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: ReadingStore> DedupGate<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn admit(&self, reading: &Reading) -> Result<Admission> {
        if self.store.insert_if_absent(reading).await? {
            return Ok(Admission::Accepted);
        }
        self.note_duplicate(reading).await;
        Ok(Admission::Duplicate)
    }

    /// Admits a batch in one store transaction; one outcome per reading.
    pub async fn admit_batch(&self, readings: &[Reading]) -> Result<Vec<Admission>> {
        let inserted = self.store.insert_batch(readings).await?;
        let mut outcomes = Vec::with_capacity(inserted.len());
        for (reading, inserted) in readings.iter().zip(inserted) {
            if inserted {
                outcomes.push(Admission::Accepted);
            } else {
                self.note_duplicate(reading).await;
                outcomes.push(Admission::Duplicate);
            }
        }
        Ok(outcomes)
    }

    /// Same key, different values is still a duplicate (first write wins),
    /// but worth surfacing to operators.
    async fn note_duplicate(&self, reading: &Reading) {
        match self.store.get(&reading.sensor_id, reading.observed_at).await {
            Ok(Some(stored)) if !stored.same_measurements(reading) => {
                warn!(
                    sensor_id = %reading.sensor_id,
                    observed_at = %reading.observed_at.to_rfc3339(),
                    stored_temperature = ?stored.temperature,
                    stored_humidity = ?stored.humidity,
                    submitted_temperature = ?reading.temperature,
                    submitted_humidity = ?reading.humidity,
                    "Conflicting resubmission for existing sequence key, keeping first write"
                );
            }
            Ok(_) => {
                debug!(
                    sensor_id = %reading.sensor_id,
                    observed_at = %reading.observed_at.to_rfc3339(),
                    "Duplicate reading ignored"
                );
            }
            Err(e) => {
                debug!(error = %e, "Could not load stored reading for duplicate check");
            }
        }
    }
}
