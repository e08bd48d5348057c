//! Error types for contract violations.
//!
//! Everything else flows through `anyhow::Result`; these are the cases a
//! caller may want to match on.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpineError {
    #[error("Invalid pointer {pointer:?}: {reason}")]
    InvalidPointer { pointer: String, reason: &'static str },

    #[error("Confidence {0} is outside [0, 1]")]
    InvalidConfidence(f64),

    #[error("Graph contract violated for run {run_id}: {detail}")]
    ContractViolation { run_id: String, detail: String },

    #[error("Usage store error: {0}")]
    Persistence(String),
}
