//! Error types for EduPulse

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PulseError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// A write or read failed at the storage boundary.
    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PulseError {
    /// Stable machine-readable code, used in WebSocket `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            PulseError::Auth(_) => "forbidden",
            PulseError::Validation(_) => "validation_error",
            PulseError::Persistence(_) => "persistence_failure",
            PulseError::Internal(_) => "internal_error",
        }
    }
}

impl From<sqlx::Error> for PulseError {
    fn from(err: sqlx::Error) -> Self {
        PulseError::Persistence(err.to_string())
    }
}
