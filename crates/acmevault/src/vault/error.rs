//! Secrets store error types

use thiserror::Error;

use crate::certificate::CertificateError;

/// Errors returned by the secrets store client and trust backend.
///
/// HTTP 404 and 403 are classified into [`VaultError::NotFound`] and
/// [`VaultError::PermissionDenied`]; callers branch on `NotFound` to decide
/// whether something has to be created.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The secret or endpoint does not exist
    #[error("Secret not found at '{path}'")]
    NotFound { path: String },

    /// The session's policy does not grant access
    #[error("Permission denied for '{path}'")]
    PermissionDenied { path: String },

    /// Network level failure after the retry budget was exhausted
    #[error("Request to '{path}' failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    /// Any other non-success status
    #[error("Unexpected status {status} from '{path}': {body}")]
    Status {
        path: String,
        status: u16,
        body: String,
    },

    /// Login response without usable auth data
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Response body could not be decoded
    #[error("Failed to decode response from '{path}': {message}")]
    Decode { path: String, message: String },

    /// A request needing a session was made before login
    #[error("No authenticated session")]
    NotAuthenticated,

    /// Stored secret exists but its content is invalid
    #[error("Invalid secret data at '{path}': {source}")]
    InvalidData {
        path: String,
        #[source]
        source: CertificateError,
    },

    /// HTTP client construction failed
    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

impl VaultError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }

    /// Whether another attempt may succeed
    pub(crate) fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Status { status, .. } => (500..600).contains(status) && *status != 501,
            _ => false,
        }
    }
}
