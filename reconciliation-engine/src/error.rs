//! Error taxonomy for the reconciliation engine.

use crate::models::RecordRef;
use service_core::error::AppError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconError {
    /// An invalid tunable. Fatal, surfaced before any work starts.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The oracle could not be reached after all retry attempts.
    #[error("Oracle invocation failed for chunk {chunk_id} after {attempts} attempt(s): {message}")]
    OracleInvocationError {
        chunk_id: usize,
        attempts: u32,
        message: String,
    },

    /// The oracle answered but nothing usable could be parsed from the text.
    #[error("Oracle response for chunk {chunk_id} is unusable: {message}")]
    OracleResponseError { chunk_id: usize, message: String },

    /// Records are missing from the merged report. Indicates a logic defect.
    #[error("Aggregation invariant violated: {} record(s) without a verdict", missing.len())]
    AggregationInvariantError { missing: Vec<RecordRef> },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Failed to load records from {path}: {message}")]
    IngestError { path: String, message: String },

    #[error(transparent)]
    Core(#[from] AppError),
}

impl ReconError {
    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigError(_) => "config",
            Self::OracleInvocationError { .. } => "oracle_invocation",
            Self::OracleResponseError { .. } => "oracle_response",
            Self::AggregationInvariantError { .. } => "aggregation_invariant",
            Self::InvalidInput(_) => "invalid_input",
            Self::IngestError { .. } => "ingest",
            Self::Core(_) => "core",
        }
    }
}
