//! Configuration module for reconciliation-engine.

use crate::error::ReconError;
use rust_decimal::Decimal;
use service_core::config as core_config;
use service_core::retry::RetryConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub matching: MatchingConfig,
    pub chunking: ChunkingConfig,
    pub oracle: OracleConfig,
}

#[derive(Debug, Clone)]
pub struct MatchingConfig {
    /// Maximum |date delta| in days for a candidate pair.
    pub date_tolerance_days: i64,
    /// Maximum amount difference, in percent of the larger amount.
    pub amount_tolerance_pct: Decimal,
    /// Narration similarity needed for a Green verdict.
    pub narration_threshold: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            date_tolerance_days: 5,
            amount_tolerance_pct: Decimal::new(5, 2),
            narration_threshold: 0.70,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    /// Maximum records per side in one chunk.
    pub chunk_size: i64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self { chunk_size: 50 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleProvider {
    OpenAi,
    Mock,
    Disabled,
}

impl FromStr for OracleProvider {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "mock" => Ok(Self::Mock),
            "disabled" | "none" | "off" => Ok(Self::Disabled),
            other => Err(ReconError::ConfigError(format!(
                "ORACLE_PROVIDER must be openai, mock or disabled, got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub provider: OracleProvider,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout: Duration,
    /// Concurrency cap on in-flight oracle calls across all chunks.
    pub max_concurrent_calls: usize,
    pub retry: RetryConfig,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            provider: OracleProvider::Disabled,
            api_key: None,
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            model: "gpt-4o".to_string(),
            temperature: 0.2,
            max_tokens: 4000,
            request_timeout: Duration::from_secs(120),
            max_concurrent_calls: 4,
            retry: RetryConfig {
                max_retries: 3,
                initial_backoff: Duration::from_millis(500),
                max_backoff: Duration::from_secs(10),
                ..Default::default()
            },
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            common: core_config::Config::default(),
            service_name: "reconciliation-engine".to_string(),
            matching: MatchingConfig::default(),
            chunking: ChunkingConfig::default(),
            oracle: OracleConfig::default(),
        }
    }
}

impl ReconciliationConfig {
    pub fn from_env() -> Result<Self, ReconError> {
        let common = core_config::Config::load()?;
        let defaults = Self::default();

        let api_key = env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty());
        let provider = match env::var("ORACLE_PROVIDER") {
            Ok(p) => p.parse()?,
            Err(_) if api_key.is_some() => OracleProvider::OpenAi,
            Err(_) => OracleProvider::Disabled,
        };

        let config = Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "reconciliation-engine".to_string()),
            matching: MatchingConfig {
                date_tolerance_days: parse_env(
                    "RECON_DATE_TOLERANCE_DAYS",
                    defaults.matching.date_tolerance_days,
                )?,
                amount_tolerance_pct: parse_env(
                    "RECON_AMOUNT_TOLERANCE_PCT",
                    defaults.matching.amount_tolerance_pct,
                )?,
                narration_threshold: parse_env(
                    "RECON_NARRATION_THRESHOLD",
                    defaults.matching.narration_threshold,
                )?,
            },
            chunking: ChunkingConfig {
                chunk_size: parse_env("RECON_CHUNK_SIZE", defaults.chunking.chunk_size)?,
            },
            oracle: OracleConfig {
                provider,
                api_key,
                base_url: env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| DEFAULT_OPENAI_BASE_URL.to_string()),
                model: env::var("ORACLE_MODEL").unwrap_or(defaults.oracle.model),
                temperature: parse_env("ORACLE_TEMPERATURE", defaults.oracle.temperature)?,
                max_tokens: parse_env("ORACLE_MAX_TOKENS", defaults.oracle.max_tokens)?,
                request_timeout: Duration::from_secs(parse_env(
                    "ORACLE_REQUEST_TIMEOUT_SECS",
                    defaults.oracle.request_timeout.as_secs(),
                )?),
                max_concurrent_calls: parse_env(
                    "ORACLE_MAX_CONCURRENT_CALLS",
                    defaults.oracle.max_concurrent_calls,
                )?,
                retry: RetryConfig {
                    max_retries: parse_env(
                        "ORACLE_MAX_RETRIES",
                        defaults.oracle.retry.max_retries,
                    )?,
                    initial_backoff: Duration::from_millis(parse_env(
                        "ORACLE_INITIAL_BACKOFF_MS",
                        defaults.oracle.retry.initial_backoff.as_millis() as u64,
                    )?),
                    max_backoff: Duration::from_millis(parse_env(
                        "ORACLE_MAX_BACKOFF_MS",
                        defaults.oracle.retry.max_backoff.as_millis() as u64,
                    )?),
                    ..defaults.oracle.retry
                },
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject tunables that would make the run meaningless.
    pub fn validate(&self) -> Result<(), ReconError> {
        if self.chunking.chunk_size <= 0 {
            return Err(ReconError::ConfigError(format!(
                "chunk size must be positive, got {}",
                self.chunking.chunk_size
            )));
        }
        if self.matching.date_tolerance_days < 0 {
            return Err(ReconError::ConfigError(format!(
                "date tolerance must not be negative, got {}",
                self.matching.date_tolerance_days
            )));
        }
        if self.matching.amount_tolerance_pct.is_sign_negative() {
            return Err(ReconError::ConfigError(format!(
                "amount tolerance must not be negative, got {}",
                self.matching.amount_tolerance_pct
            )));
        }
        let threshold = self.matching.narration_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ReconError::ConfigError(format!(
                "narration threshold must be within [0, 1], got {}",
                threshold
            )));
        }
        if self.oracle.max_concurrent_calls == 0 {
            return Err(ReconError::ConfigError(
                "max concurrent oracle calls must be at least 1".to_string(),
            ));
        }
        if self.oracle.request_timeout.is_zero() {
            return Err(ReconError::ConfigError(
                "oracle request timeout must be positive".to_string(),
            ));
        }
        if self.oracle.provider == OracleProvider::OpenAi && self.oracle.api_key.is_none() {
            return Err(ReconError::ConfigError(
                "OPENAI_API_KEY is required when ORACLE_PROVIDER=openai".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T, ReconError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e| {
            ReconError::ConfigError(format!("{} has invalid value '{}': {}", key, raw, e))
        }),
        Err(_) => Ok(default),
    }
}
