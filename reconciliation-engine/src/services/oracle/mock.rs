//! Mock oracle for tests and offline runs.

use super::{ClassificationOracle, OracleError, OraclePrompt};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Handler = dyn Fn(&OraclePrompt, u32) -> Result<String, OracleError> + Send + Sync;

/// Scriptable oracle. The handler receives the prompt and the 1-based call
/// number, so tests can simulate flaky or chunk-specific behavior.
pub struct MockOracle {
    handler: Arc<Handler>,
    calls: AtomicU32,
    delay: Option<Duration>,
}

impl MockOracle {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&OraclePrompt, u32) -> Result<String, OracleError> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            calls: AtomicU32::new(0),
            delay: None,
        }
    }

    /// Always answers with `text`.
    pub fn fixed(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(move |_, _| Ok(text.clone()))
    }

    /// Always fails with `error`.
    pub fn failing(error: OracleError) -> Self {
        Self::new(move |_, _| Err(error.clone()))
    }

    /// Fails with a rate limit for the first `failures` calls, then answers.
    pub fn flaky(failures: u32, text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(move |_, call| {
            if call <= failures {
                Err(OracleError::RateLimited)
            } else {
                Ok(text.clone())
            }
        })
    }

    /// Answers with an empty classification, leaving every record to rules.
    pub fn silent() -> Self {
        Self::fixed(r#"{"green": [], "yellow": [], "red": []}"#)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClassificationOracle for MockOracle {
    fn name(&self) -> &str {
        "mock"
    }

    async fn invoke(&self, prompt: &OraclePrompt) -> Result<String, OracleError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(prompt, call)
    }
}
