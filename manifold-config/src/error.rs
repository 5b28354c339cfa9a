//! Configuration error types

use thiserror::Error;

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error reading a configuration file
    #[error("Failed to read config: {0}")]
    FileRead(#[from] std::io::Error),

    /// YAML parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// JSON parsing error
    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing error
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Upstream-specific configuration error
    #[error("Invalid configuration for upstream '{upstream}': {message}")]
    Upstream { upstream: String, message: String },

    /// Validation error not tied to a single upstream
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

impl ConfigError {
    /// Create an upstream-scoped configuration error
    pub fn upstream(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            upstream: name.into(),
            message: message.into(),
        }
    }
}
