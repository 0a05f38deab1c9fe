use thiserror::Error;

/// Infrastructure errors shared by every crate in the workspace.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_keep_their_message() {
        let err: AppError = config::ConfigError::NotFound("log_level".into()).into();
        assert!(err.to_string().starts_with("Configuration error:"));
        assert!(err.to_string().contains("log_level"));
    }
}
