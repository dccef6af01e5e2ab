//! ACME error types

use std::time::Duration;

use thiserror::Error;

use super::dns::DnsProviderError;
use crate::certificate::CertificateError;
use crate::vault::VaultError;

/// Errors that can occur during ACME operations
#[derive(Debug, Error)]
pub enum AcmeError {
    /// Neither bootstrap nor registration has produced an account yet
    #[error("ACME account not initialized - call bootstrap() first")]
    NoAccount,

    /// Stored account could not be restored
    #[error("Failed to restore ACME account: {0}")]
    Account(String),

    /// The CA refused the registration
    #[error("Failed to register ACME account: {0}")]
    Registration(String),

    /// Creating or polling an order failed
    #[error("Order for '{domain}' failed: {message}")]
    Order { domain: String, message: String },

    /// A DNS-01 challenge could not be completed
    #[error("Challenge validation failed for domain '{domain}': {message}")]
    Challenge { domain: String, message: String },

    /// CSR generation, finalization or download failed
    #[error("Failed to finalize certificate for '{domain}': {message}")]
    Finalization { domain: String, message: String },

    /// The order did not settle in time
    #[error("Timed out after {elapsed:?} waiting for {what}")]
    Timeout { what: String, elapsed: Duration },

    /// DNS provider operation failed
    #[error("DNS provider error: {0}")]
    Dns(#[from] DnsProviderError),

    /// Trust backend operation failed
    #[error("Storage error: {0}")]
    Storage(#[from] VaultError),

    /// Existing certificate cannot be parsed
    #[error("Malformed certificate: {0}")]
    MalformedCertificate(#[from] CertificateError),

    /// ACME protocol error from instant-acme
    #[error("ACME protocol error: {0}")]
    Protocol(String),
}

impl From<instant_acme::Error> for AcmeError {
    fn from(e: instant_acme::Error) -> Self {
        AcmeError::Protocol(e.to_string())
    }
}
