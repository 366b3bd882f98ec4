use crate::{api::ApiError, bus::BusError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("JSON serialization/deserialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("Message bus error: {0}")]
    BusError(#[from] BusError),

    #[error("Server rejected request: {0}")]
    ApiError(#[from] ApiError),

    #[error("Data instance '{label}' is no longer running")]
    Closed { label: String },

    #[error("Invalid message format on {topic}: {reason}")]
    InvalidMessage { topic: String, reason: String },

    #[error("Metrics server error: {0}")]
    MetricsError(String),
}
