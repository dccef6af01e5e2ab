//! DNS provider interface for DNS-01 challenges

use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;

pub type DnsResult<T> = Result<T, DnsProviderError>;

#[derive(Debug, Error)]
pub enum DnsProviderError {
    /// The provider rejected our credentials
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Zone not found for domain '{domain}'")]
    ZoneNotFound { domain: String },

    #[error("Failed to create TXT record '{record_name}': {message}")]
    RecordCreation { record_name: String, message: String },

    #[error("Failed to delete TXT record '{record_name}': {message}")]
    RecordDeletion { record_name: String, message: String },

    #[error("API request failed: {0}")]
    ApiRequest(String),

    #[error("Timed out after {elapsed_secs}s waiting for '{what}'")]
    Timeout { what: String, elapsed_secs: u64 },

    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

/// A DNS backend that can publish challenge TXT records.
///
/// `domain` is the name being validated (possibly a wildcard). Several
/// values may be published for the same record name at once, e.g. for
/// `example.com` and `*.example.com` in one order.
#[async_trait]
pub trait DnsProvider: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Publish `value` at `_acme-challenge.<domain>`. Returns a handle for cleanup.
    async fn create_txt_record(&self, domain: &str, value: &str) -> DnsResult<String>;

    /// Remove a record created by `create_txt_record`. Idempotent.
    async fn delete_txt_record(&self, domain: &str, record_id: &str) -> DnsResult<()>;
}

/// ACME challenge record name prefix
pub const ACME_CHALLENGE_RECORD: &str = "_acme-challenge";

/// TTL of challenge records in seconds
pub const CHALLENGE_TTL: i64 = 60;

/// Strip a leading wildcard label
pub fn normalize_domain(domain: &str) -> &str {
    domain.strip_prefix("*.").unwrap_or(domain)
}

/// `_acme-challenge.<domain>` without the wildcard label
pub fn challenge_record_fqdn(domain: &str) -> String {
    format!("{}.{}", ACME_CHALLENGE_RECORD, normalize_domain(domain))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain("example.com"), "example.com");
        assert_eq!(normalize_domain("*.example.com"), "example.com");
        assert_eq!(normalize_domain("*.sub.example.com"), "sub.example.com");
    }

    #[test]
    fn test_challenge_record_fqdn() {
        assert_eq!(challenge_record_fqdn("example.com"), "_acme-challenge.example.com");
        assert_eq!(challenge_record_fqdn("*.example.com"), "_acme-challenge.example.com");
        assert_eq!(
            challenge_record_fqdn("sub.example.com"),
            "_acme-challenge.sub.example.com"
        );
    }

    #[test]
    fn test_error_display() {
        let err = DnsProviderError::ZoneNotFound {
            domain: "example.org".to_string(),
        };
        assert!(err.to_string().contains("example.org"));

        let err = DnsProviderError::Timeout {
            what: "change C123".to_string(),
            elapsed_secs: 30,
        };
        assert!(err.to_string().contains("30s"));
    }
}
