//! Classification oracle abstractions and implementations.
//!
//! The oracle is an external generative model that judges ambiguous pairs.
//! It is treated as a black box returning free text: everything it says is
//! validated by [`parser`] and the orchestrator before it becomes a verdict.

pub mod mock;
pub mod openai;
pub mod parser;
pub mod prompt;

use async_trait::async_trait;
use service_core::retry::Retryable;
use thiserror::Error;

pub use mock::MockOracle;
pub use openai::{OpenAiConfig, OpenAiOracle};
pub use parser::{parse_oracle_response, OracleEntry, OracleRedEntry, OracleVerdicts};
pub use prompt::{build_prompt, OraclePrompt};

/// Error type for oracle invocations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OracleError {
    #[error("Oracle not configured: {0}")]
    NotConfigured(String),

    #[error("API error ({status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Content filtered")]
    ContentFiltered,

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Empty response")]
    EmptyResponse,
}

impl Retryable for OracleError {
    fn is_retryable(&self) -> bool {
        match self {
            OracleError::RateLimited
            | OracleError::Timeout(_)
            | OracleError::NetworkError(_)
            | OracleError::EmptyResponse => true,
            OracleError::ApiError { status, .. } => *status >= 500 || *status == 408,
            OracleError::NotConfigured(_)
            | OracleError::InvalidRequest(_)
            | OracleError::ContentFiltered => false,
        }
    }
}

/// The external judgment service: prompt in, raw text out.
#[async_trait]
pub trait ClassificationOracle: Send + Sync {
    /// Provider name for logs and metrics.
    fn name(&self) -> &str;

    async fn invoke(&self, prompt: &OraclePrompt) -> Result<String, OracleError>;
}
