//! Configuration error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// Every variant is fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to parse JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported config file extension '{0}', expected .json, .yaml or .yml")]
    UnsupportedFormat(String),

    #[error("unknown auth method '{0}', expected one of: token, approle, kubernetes, implicit")]
    UnknownAuthMethod(String),

    #[error("field `{field}`: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },

    #[error("validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}
