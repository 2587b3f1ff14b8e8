use thiserror::Error;

use crate::metrika::MetrikaError;
use crate::state_machine::TransitionError;

#[derive(Debug, Error)]
pub enum ScoreError {
    /// Malformed request, rejected before any state mutation.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The record exists but its precondition is unmet (e.g. job not done).
    #[error("{kind} {id} is not finished")]
    NotReady { kind: &'static str, id: String },

    /// Job reports `done` but no result was stored. Internal consistency fault.
    #[error("Result missing for finished task {0}")]
    ResultMissing(String),

    #[error("Metrika API error: {0}")]
    Upstream(#[from] MetrikaError),

    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error("Model unavailable for device class '{device}': {reason}")]
    ModelUnavailable { device: String, reason: String },

    #[error("Config error: {0}")]
    Configuration(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Illegal state transition: {0}")]
    IllegalTransition(#[from] TransitionError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ScoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        ScoreError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn not_ready(kind: &'static str, id: impl Into<String>) -> Self {
        ScoreError::NotReady {
            kind,
            id: id.into(),
        }
    }

    pub fn model_unavailable(device: impl Into<String>, reason: impl Into<String>) -> Self {
        ScoreError::ModelUnavailable {
            device: device.into(),
            reason: reason.into(),
        }
    }

    /// Errors raised by request validation or lookups; these never touch
    /// persisted state and are surfaced to the caller as-is.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ScoreError::Validation(_)
                | ScoreError::NotFound { .. }
                | ScoreError::NotReady { .. }
                | ScoreError::Unauthorized(_)
        )
    }
}

pub type Result<T, E = ScoreError> = std::result::Result<T, E>;
