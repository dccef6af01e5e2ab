//! Secret path scheme.

use acmevault_config::VaultConfig;

/// Builds every secret path used by the trust backend
#[derive(Debug, Clone)]
pub struct VaultPaths {
    kv2_mount: String,
    prefix: String,
    domain_format: Option<String>,
    aws_mount: String,
    aws_role: String,
}

impl VaultPaths {
    pub fn new(config: &VaultConfig) -> Self {
        Self {
            kv2_mount: config.kv2_mount.trim_matches('/').to_string(),
            prefix: config.path_prefix.trim_matches('/').to_string(),
            domain_format: config.domain_path_format.clone(),
            aws_mount: config.aws_mount.trim_matches('/').to_string(),
            aws_role: config.aws_role.clone(),
        }
    }

    fn base(&self) -> String {
        format!("{}/data/{}", self.kv2_mount, self.prefix)
    }

    /// Domain as embedded in paths, after applying the configured format
    pub fn formatted_domain(&self, domain: &str) -> String {
        match self.domain_format {
            Some(ref format) => format.replace("%s", domain),
            None => domain.to_string(),
        }
    }

    /// Public certificate data for a domain
    pub fn certificate(&self, domain: &str) -> String {
        format!(
            "{}/client/{}/certificate",
            self.base(),
            self.formatted_domain(domain)
        )
    }

    /// Private key for a domain
    pub fn private_key(&self, domain: &str) -> String {
        format!(
            "{}/client/{}/privatekey",
            self.base(),
            self.formatted_domain(domain)
        )
    }

    /// ACME account for an email address
    pub fn account(&self, email: &str) -> String {
        format!("{}/server/account/{}", self.base(), email)
    }

    /// Dynamic AWS credentials endpoint
    pub fn aws_credentials(&self) -> String {
        format!("{}/creds/{}", self.aws_mount, self.aws_role)
    }
}
