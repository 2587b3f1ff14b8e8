mod job;
mod upload;

use std::fmt;

use thiserror::Error;

pub use job::{Job, JobStatus, TaskParams};
pub use upload::{
    ConversionUpload, ReconcileState, RetryConfig, UploadReport, UploadState, UploadStatus,
    WebhookBatch, map_provider_status,
};

/// Rejected state machine mutation. The record is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("{kind} cannot move from {from} to {to}")]
    Illegal {
        kind: &'static str,
        from: String,
        to: String,
    },

    #[error("{kind} is already {state}")]
    Terminal { kind: &'static str, state: String },

    #[error("{kind} is {state}, progress can only change while running")]
    Inactive { kind: &'static str, state: String },

    #[error("progress cannot decrease from {from} to {to}")]
    ProgressRegression { from: u8, to: u8 },
}

/// A closed status vocabulary with an explicit transition table.
pub trait Lifecycle: Copy + PartialEq + fmt::Display {
    const KIND: &'static str;

    fn is_terminal(self) -> bool;

    /// Transition table. Not consulted for terminal states.
    fn allows(self, next: Self) -> bool;

    fn check(self, next: Self) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::Terminal {
                kind: Self::KIND,
                state: self.to_string(),
            });
        }
        if !self.allows(next) {
            return Err(TransitionError::Illegal {
                kind: Self::KIND,
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        Ok(())
    }
}
