//! Certificate server settings: ACME account, domains and renewal policy.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::ConfigError;

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Upper bound for the check interval
pub const MAX_INTERVAL_SECONDS: u64 = 86_400;

/// A primary domain and its subject alternative names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct DomainSpec {
    #[validate(length(min = 1, max = 253))]
    pub domain: String,

    #[serde(default)]
    pub sans: Vec<String>,
}

impl DomainSpec {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            sans: Vec::new(),
        }
    }

    pub fn with_sans<I, S>(mut self, sans: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sans = sans.into_iter().map(Into::into).collect();
        self
    }

    /// Primary domain followed by the SANs, without duplicates
    pub fn names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        std::iter::once(&self.domain)
            .chain(self.sans.iter())
            .map(|name| name.trim().to_ascii_lowercase())
            .filter(|name| !name.is_empty() && seen.insert(name.clone()))
            .collect()
    }
}

/// Server role configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    /// Contact email for the ACME account
    #[validate(email)]
    pub email: String,

    #[serde(default = "default_acme_url")]
    #[validate(url)]
    pub acme_url: String,

    #[serde(default = "default_interval_seconds")]
    #[validate(range(min = 1, max = 86400))]
    pub interval_seconds: u64,

    #[validate(length(min = 1), nested)]
    pub domains: Vec<DomainSpec>,

    #[serde(default = "default_max_workers")]
    #[validate(range(min = 1, max = 64))]
    pub max_workers: usize,

    /// Recursive resolvers used to check challenge propagation, `host:port` or `host`
    #[serde(default)]
    pub dns_nameservers: Vec<String>,

    #[serde(default = "default_aws_region")]
    pub aws_region: String,

    #[serde(default = "default_min_lifetime_days")]
    #[validate(range(min = 1))]
    pub min_lifetime_days: u32,

    #[serde(default = "default_skew_window_days")]
    #[validate(range(min = 1))]
    pub skew_window_days: u32,

    #[serde(default = "default_jitter_probability")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter_probability: f64,
}

fn default_acme_url() -> String {
    LETS_ENCRYPT_PRODUCTION.to_string()
}

fn default_interval_seconds() -> u64 {
    12 * 60 * 60
}

fn default_max_workers() -> usize {
    4
}

fn default_aws_region() -> String {
    "us-east-1".to_string()
}

fn default_min_lifetime_days() -> u32 {
    30
}

fn default_skew_window_days() -> u32 {
    45
}

fn default_jitter_probability() -> f64 {
    0.03
}

impl ServerConfig {
    pub fn new(email: impl Into<String>, domains: Vec<DomainSpec>) -> Self {
        Self {
            email: email.into(),
            acme_url: default_acme_url(),
            interval_seconds: default_interval_seconds(),
            domains,
            max_workers: default_max_workers(),
            dns_nameservers: Vec::new(),
            aws_region: default_aws_region(),
            min_lifetime_days: default_min_lifetime_days(),
            skew_window_days: default_skew_window_days(),
            jitter_probability: default_jitter_probability(),
        }
    }

    /// Whether the configured directory is a staging environment
    pub fn is_staging(&self) -> bool {
        self.acme_url.contains("staging")
    }

    pub fn validate_all(&self) -> Result<(), ConfigError> {
        self.validate()?;

        if self.interval_seconds > MAX_INTERVAL_SECONDS {
            return Err(ConfigError::invalid(
                "interval_seconds",
                format!("must not exceed {}", MAX_INTERVAL_SECONDS),
            ));
        }

        if self.skew_window_days < self.min_lifetime_days {
            return Err(ConfigError::invalid(
                "skew_window_days",
                "must be greater than or equal to `min_lifetime_days`",
            ));
        }

        let mut primaries = HashSet::new();
        for spec in &self.domains {
            let primary = spec.domain.trim().to_ascii_lowercase();
            if !primaries.insert(primary.clone()) {
                return Err(ConfigError::invalid(
                    "domains",
                    format!("domain '{}' is configured more than once", primary),
                ));
            }
            if primary.contains('/') || primary.contains(' ') {
                return Err(ConfigError::invalid(
                    "domains",
                    format!("'{}' is not a valid domain name", primary),
                ));
            }
        }

        Ok(())
    }
}
