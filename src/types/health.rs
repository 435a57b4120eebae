use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why one probe round was unhealthy. Never fatal on its own.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("health != ok: {0}")]
    Body(String),
    #[error("malformed health payload: {0}")]
    Payload(String),
    #[error("no health check has completed")]
    NotChecked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMessage {
    pub is_healthy: bool,
    pub error: Option<HealthError>,
    pub checked_at: DateTime<Utc>,
}

impl HealthMessage {
    pub fn healthy() -> Self {
        Self {
            is_healthy: true,
            error: None,
            checked_at: Utc::now(),
        }
    }

    pub fn unhealthy(error: HealthError) -> Self {
        Self {
            is_healthy: false,
            error: Some(error),
            checked_at: Utc::now(),
        }
    }

    pub fn from_result(result: Result<(), HealthError>) -> Self {
        match result {
            Ok(()) => Self::healthy(),
            Err(e) => Self::unhealthy(e),
        }
    }
}
