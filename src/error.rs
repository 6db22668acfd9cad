//! Error types for the trip engine

use thiserror::Error;

/// Errors surfaced by the public trip API.
///
/// Storage failures keep their `anyhow` context chain. "Already active" and
/// "nothing to end" are not errors, they are reported through return values.
#[derive(Debug, Error)]
pub enum TripError {
    #[error("repository failure: {0:#}")]
    Repository(#[from] anyhow::Error),

    #[error("invalid location: lat={latitude}, lon={longitude}")]
    InvalidLocation { latitude: f64, longitude: f64 },

    #[error("trip not found: {0}")]
    NotFound(String),

    #[error("trip detection is disabled")]
    DetectionDisabled,

    #[error("trip monitor is no longer running")]
    MonitorClosed,
}

pub type TripResult<T> = Result<T, TripError>;
