use serde::Serialize;
use thiserror::Error;

/// Why the validator refused a raw reading. Rejections never reach storage.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "reason", content = "detail")]
pub enum RejectionReason {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("value out of range: {0}")]
    OutOfRange(String),

    #[error("unknown sensor id format: {0}")]
    UnknownSensorFormat(String),
}

impl RejectionReason {
    pub fn kind(&self) -> &'static str {
        match self {
            RejectionReason::MalformedPayload(_) => "malformed_payload",
            RejectionReason::OutOfRange(_) => "out_of_range",
            RejectionReason::UnknownSensorFormat(_) => "unknown_sensor_format",
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] sqlx::Error),

    #[error("database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("Channel send error")]
    ChannelSend,

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;
