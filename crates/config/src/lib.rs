//! Configuration module for acmevault.
//!
//! A single file carries the secrets store connection plus the settings of
//! whichever roles the process runs: the certificate server, the certificate
//! client, or both. Files are JSON or YAML, picked by extension.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub mod client;
pub mod error;
pub mod server;
pub mod vault;

pub use client::ClientConfig;
pub use error::ConfigError;
pub use server::{DomainSpec, ServerConfig, LETS_ENCRYPT_PRODUCTION, LETS_ENCRYPT_STAGING};
pub use vault::{expand_home, AuthMethod, VaultConfig, DEFAULT_K8S_TOKEN_FILE, VAULT_TOKEN_ENV};

/// Default listen address of the metrics endpoint
pub const DEFAULT_METRICS_ADDR: &str = "127.0.0.1:9112";

// ============================================================================
// Top-level configuration
// ============================================================================

/// Complete process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub vault: VaultConfig,

    #[serde(default)]
    pub server: Option<ServerConfig>,

    #[serde(default)]
    pub client: Option<ClientConfig>,

    /// Listen address for `/metrics`, disabled when empty
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: Option<String>,
}

fn default_metrics_addr() -> Option<String> {
    Some(DEFAULT_METRICS_ADDR.to_string())
}

impl Config {
    /// Load configuration from a `.json`, `.yaml` or `.yml` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        debug!(path = %path.display(), format = %extension, "Parsing configuration file");

        match extension.as_str() {
            "json" => Self::from_json(&content),
            "yaml" | "yml" => Self::from_yaml(&content),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Validate every configured section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.vault.validate_all()?;

        if let Some(ref server) = self.server {
            server.validate_all()?;
        }
        if let Some(ref client) = self.client {
            client.validate_all()?;
        }

        if let Some(ref addr) = self.metrics_addr {
            if !addr.is_empty() && addr.parse::<std::net::SocketAddr>().is_err() {
                return Err(ConfigError::invalid(
                    "metrics_addr",
                    format!("'{}' is not a valid socket address", addr),
                ));
            }
        }

        Ok(())
    }

    /// Server section, or an error naming the missing section
    pub fn require_server(&self) -> Result<&ServerConfig, ConfigError> {
        self.server
            .as_ref()
            .ok_or_else(|| ConfigError::invalid("server", "section is required to run the server"))
    }

    /// Client section, or an error naming the missing section
    pub fn require_client(&self) -> Result<&ClientConfig, ConfigError> {
        self.client
            .as_ref()
            .ok_or_else(|| ConfigError::invalid("client", "section is required to run the client"))
    }

    /// Metrics listen address when the endpoint is enabled
    pub fn metrics_addr(&self) -> Option<&str> {
        self.metrics_addr.as_deref().filter(|addr| !addr.is_empty())
    }

    /// Non-fatal observations about the configuration
    pub fn lint(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.is_none() && self.client.is_none() {
            warnings.push("Neither a server nor a client section is configured".to_string());
        }

        if self.vault.auth_method == AuthMethod::Token {
            warnings.push(
                "Auth method 'token' uses a static token that is never re-issued (prefer approle or kubernetes)"
                    .to_string(),
            );
        }

        if !self.vault.addr.starts_with("https://") {
            warnings.push(format!(
                "Vault address '{}' does not use TLS",
                self.vault.addr
            ));
        }

        if let Some(ref server) = self.server {
            if server.is_staging() {
                warnings.push(format!(
                    "ACME directory '{}' is a staging environment, issued certificates are not trusted",
                    server.acme_url
                ));
            }
            if server.max_workers > server.domains.len() {
                debug!(
                    max_workers = server.max_workers,
                    domains = server.domains.len(),
                    "Worker pool is larger than the domain list"
                );
            }
        }

        if let Some(ref client) = self.client {
            if client.hook.is_empty() {
                warnings.push(format!(
                    "Client for '{}' has no hook, consumers must reload certificates themselves",
                    client.domain
                ));
            }
        }

        warnings
    }

    /// Log a redacted summary of the effective configuration
    pub fn log_summary(&self) {
        info!(
            addr = %self.vault.addr,
            auth_method = %self.vault.auth_method,
            path_prefix = %self.vault.path_prefix,
            kv2_mount = %self.vault.kv2_mount,
            "Vault configuration"
        );
        if let Some(ref server) = self.server {
            info!(
                email = %server.email,
                acme_url = %server.acme_url,
                domains = server.domains.len(),
                interval_seconds = server.interval_seconds,
                "Server configuration"
            );
        }
        if let Some(ref client) = self.client {
            info!(
                domain = %client.domain,
                hook = !client.hook.is_empty(),
                "Client configuration"
            );
        }
        for warning in self.lint() {
            warn!("{}", warning);
        }
    }
}
