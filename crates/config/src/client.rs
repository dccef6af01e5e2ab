//! Certificate consumer settings: which domain to fetch and where to put it.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::ConfigError;

/// Client role configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ClientConfig {
    #[validate(length(min = 1, max = 253))]
    pub domain: String,

    #[serde(default)]
    pub cert_file: Option<PathBuf>,

    #[serde(default)]
    pub private_key_file: Option<PathBuf>,

    /// Certificate chain and private key in a single file
    #[serde(default)]
    pub pem_file: Option<PathBuf>,

    /// Command run after any file changed, program followed by arguments
    #[serde(default)]
    pub hook: Vec<String>,

    /// Poll interval; the client runs once and exits when absent
    #[serde(default)]
    #[validate(range(min = 60))]
    pub interval_seconds: Option<u64>,
}

impl ClientConfig {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            cert_file: None,
            private_key_file: None,
            pem_file: None,
            hook: Vec::new(),
            interval_seconds: None,
        }
    }

    pub fn validate_all(&self) -> Result<(), ConfigError> {
        self.validate()?;

        let has_pem = self.pem_file.is_some();
        let has_cert = self.cert_file.is_some();
        let has_key = self.private_key_file.is_some();

        if !has_pem && !has_cert && !has_key {
            return Err(ConfigError::invalid(
                "pem_file",
                "either `pem_file` or `cert_file` and `private_key_file` must be set",
            ));
        }
        if !has_pem && has_cert != has_key {
            return Err(ConfigError::invalid(
                "cert_file",
                "`cert_file` and `private_key_file` must both be set when no `pem_file` is configured",
            ));
        }
        if self.hook.first().is_some_and(|program| program.trim().is_empty()) {
            return Err(ConfigError::invalid("hook", "program must not be empty"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_some_output() {
        let config = ClientConfig::new("example.com");
        assert!(config.validate_all().is_err());

        let mut config = ClientConfig::new("example.com");
        config.pem_file = Some(PathBuf::from("/etc/ssl/example.pem"));
        config.validate_all().unwrap();
    }

    #[test]
    fn test_cert_and_key_go_together() {
        let mut config = ClientConfig::new("example.com");
        config.cert_file = Some(PathBuf::from("/etc/ssl/example.crt"));
        assert!(config.validate_all().is_err());

        config.private_key_file = Some(PathBuf::from("/etc/ssl/example.key"));
        config.validate_all().unwrap();
    }

    #[test]
    fn test_rejects_empty_hook_program() {
        let mut config = ClientConfig::new("example.com");
        config.pem_file = Some(PathBuf::from("/etc/ssl/example.pem"));
        config.hook = vec![" ".to_string()];
        assert!(config.validate_all().is_err());
    }
}
