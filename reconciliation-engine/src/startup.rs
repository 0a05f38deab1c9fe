//! Application assembly: oracle selection, recorder wiring, file I/O.

use crate::config::{OracleProvider, ReconciliationConfig};
use crate::error::ReconError;
use crate::models::{ReconciliationReport, Side};
use crate::services::oracle::{ClassificationOracle, MockOracle, OpenAiConfig, OpenAiOracle};
use crate::services::recorder::{FileRecorder, ResponseRecorder, TracingRecorder};
use crate::services::{init_metrics, load_records, Reconciler};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Runtime switches that do not belong in the environment config.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Never call the oracle, whatever the provider setting says.
    pub deterministic_only: bool,
    /// Append raw oracle responses to this file as JSON lines.
    pub response_log: Option<PathBuf>,
}

pub struct Application {
    config: ReconciliationConfig,
    reconciler: Reconciler,
    oracle_name: Option<String>,
}

impl Application {
    pub fn build(config: ReconciliationConfig, options: RunOptions) -> Result<Self, ReconError> {
        init_metrics();
        config.validate()?;

        let oracle = if options.deterministic_only {
            None
        } else {
            build_oracle(&config)?
        };
        let oracle_name = oracle.as_ref().map(|o| o.name().to_string());

        let recorder: Arc<dyn ResponseRecorder> = match &options.response_log {
            Some(path) => Arc::new(FileRecorder::create(path).map_err(|e| {
                ReconError::ConfigError(format!(
                    "cannot open response log {}: {}",
                    path.display(),
                    e
                ))
            })?),
            None => Arc::new(TracingRecorder),
        };

        let reconciler = Reconciler::new(&config, oracle, recorder)?;

        tracing::info!(
            service_name = %config.service_name,
            oracle = oracle_name.as_deref().unwrap_or("none"),
            chunk_size = config.chunking.chunk_size,
            date_tolerance_days = config.matching.date_tolerance_days,
            amount_tolerance_pct = %config.matching.amount_tolerance_pct,
            narration_threshold = config.matching.narration_threshold,
            max_concurrent_calls = config.oracle.max_concurrent_calls,
            "Application built"
        );

        Ok(Self {
            config,
            reconciler,
            oracle_name,
        })
    }

    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    pub fn oracle_name(&self) -> Option<&str> {
        self.oracle_name.as_deref()
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Load both files and reconcile them until done or cancelled.
    pub async fn run(
        &self,
        bank_path: &Path,
        book_path: &Path,
        cancel: CancellationToken,
    ) -> Result<ReconciliationReport, ReconError> {
        let bank = load_records(bank_path, Side::Bank)?;
        let book = load_records(book_path, Side::Book)?;
        self.reconciler
            .reconcile_until_cancelled(&bank, &book, cancel)
            .await
    }
}

fn build_oracle(
    config: &ReconciliationConfig,
) -> Result<Option<Arc<dyn ClassificationOracle>>, ReconError> {
    let oracle: Arc<dyn ClassificationOracle> = match config.oracle.provider {
        OracleProvider::Disabled => return Ok(None),
        OracleProvider::Mock => Arc::new(MockOracle::silent()),
        OracleProvider::OpenAi => {
            let api_key = config.oracle.api_key.clone().ok_or_else(|| {
                ReconError::ConfigError("OPENAI_API_KEY is required for the openai oracle".into())
            })?;
            let oracle = OpenAiOracle::new(OpenAiConfig {
                api_key,
                base_url: config.oracle.base_url.clone(),
                model: config.oracle.model.clone(),
                temperature: config.oracle.temperature,
                max_tokens: config.oracle.max_tokens,
                request_timeout: config.oracle.request_timeout,
            })
            .map_err(|e| ReconError::ConfigError(e.to_string()))?;
            Arc::new(oracle)
        }
    };
    Ok(Some(oracle))
}

/// Serialize the report as pretty JSON to `output`, or stdout when `None`.
pub fn write_report(
    report: &ReconciliationReport,
    output: Option<&Path>,
) -> Result<(), ReconError> {
    let json = serde_json::to_string_pretty(report)
        .map_err(|e| ReconError::InvalidInput(format!("report is not serializable: {}", e)))?;

    match output {
        Some(path) => {
            std::fs::write(path, format!("{}\n", json)).map_err(|e| ReconError::IngestError {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            tracing::info!(path = %path.display(), "Report written");
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", json).map_err(|e| ReconError::IngestError {
                path: "<stdout>".to_string(),
                message: e.to_string(),
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_only_ignores_provider() {
        let mut config = ReconciliationConfig::default();
        config.oracle.provider = OracleProvider::Mock;
        let app = Application::build(
            config,
            RunOptions {
                deterministic_only: true,
                response_log: None,
            },
        )
        .unwrap();
        assert_eq!(app.oracle_name(), None);
    }

    #[test]
    fn mock_provider_is_wired() {
        let mut config = ReconciliationConfig::default();
        config.oracle.provider = OracleProvider::Mock;
        let app = Application::build(config, RunOptions::default()).unwrap();
        assert_eq!(app.oracle_name(), Some("mock"));
    }
}
