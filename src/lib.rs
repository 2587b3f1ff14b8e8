//! Daily tier-4+ engagement scoring for Yandex.Metrika counters, with
//! offline-conversion uploads reconciled against the provider.

pub mod app;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod error;
pub mod features;
pub mod formatter;
pub mod metrika;
pub mod orchestrator;
pub mod pipeline;
pub mod reconciler;
pub mod state_machine;
pub mod store;
pub mod ui;
pub mod webhook;

#[cfg(test)]
mod test_support;

pub use error::{Result, ScoreError};
