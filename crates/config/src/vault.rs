//! Secrets store connection and authentication settings.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::ConfigError;

/// Default location of the projected service-account token inside a pod
pub const DEFAULT_K8S_TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Environment variable consulted first by the implicit auth method
pub const VAULT_TOKEN_ENV: &str = "VAULT_TOKEN";

/// How the process authenticates against the secrets store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Static pre-issued token
    Token,
    /// Role-id and secret-id exchange
    AppRole,
    /// Kubernetes service-account token exchange
    Kubernetes,
    /// Token from the environment or a token file
    Implicit,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::AppRole => "approle",
            Self::Kubernetes => "kubernetes",
            Self::Implicit => "implicit",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "token" => Ok(Self::Token),
            "approle" => Ok(Self::AppRole),
            "kubernetes" | "k8s" => Ok(Self::Kubernetes),
            "implicit" => Ok(Self::Implicit),
            _ => Err(ConfigError::UnknownAuthMethod(s.to_string())),
        }
    }
}

impl<'de> Deserialize<'de> for AuthMethod {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Secrets store configuration
#[derive(Clone, Serialize, Deserialize, Validate)]
pub struct VaultConfig {
    /// Base URL of the secrets store, e.g. `https://vault.example.com:8200`
    #[validate(url)]
    pub addr: String,

    pub auth_method: AuthMethod,

    /// Static token for the `token` method
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub role_id: Option<String>,

    #[serde(default)]
    pub secret_id: Option<String>,

    #[serde(default)]
    pub secret_id_file: Option<PathBuf>,

    /// Role name for the `kubernetes` method
    #[serde(default)]
    pub k8s_role: Option<String>,

    #[serde(default = "default_k8s_mount")]
    pub k8s_mount: String,

    #[serde(default = "default_k8s_token_file")]
    pub k8s_token_file: PathBuf,

    /// Candidate token files for the `implicit` method, tried in order
    #[serde(default = "default_implicit_token_files")]
    pub implicit_token_files: Vec<String>,

    #[validate(length(min = 1))]
    pub path_prefix: String,

    /// Optional format applied to the domain before it is embedded in a path.
    /// Every `%s` is replaced by the domain.
    #[serde(default)]
    pub domain_path_format: Option<String>,

    #[serde(default = "default_kv2_mount")]
    #[validate(length(min = 1))]
    pub kv2_mount: String,

    #[serde(default = "default_aws_mount")]
    #[validate(length(min = 1))]
    pub aws_mount: String,

    #[serde(default = "default_aws_role")]
    #[validate(length(min = 1))]
    pub aws_role: String,

    #[serde(default = "default_max_retries")]
    #[validate(range(min = 3, max = 5))]
    pub max_retries: u32,

    #[serde(default = "default_timeout_secs")]
    #[validate(range(min = 1, max = 300))]
    pub timeout_secs: u64,
}

fn default_k8s_mount() -> String {
    "kubernetes".to_string()
}

fn default_k8s_token_file() -> PathBuf {
    PathBuf::from(DEFAULT_K8S_TOKEN_FILE)
}

fn default_implicit_token_files() -> Vec<String> {
    vec!["~/.vault-token".to_string()]
}

fn default_kv2_mount() -> String {
    "secret".to_string()
}

fn default_aws_mount() -> String {
    "aws".to_string()
}

fn default_aws_role() -> String {
    "acmevault".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    10
}

impl VaultConfig {
    /// Minimal configuration for the given address and auth method.
    ///
    /// All optional fields take their defaults.
    pub fn new(addr: impl Into<String>, auth_method: AuthMethod, path_prefix: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            auth_method,
            token: None,
            role_id: None,
            secret_id: None,
            secret_id_file: None,
            k8s_role: None,
            k8s_mount: default_k8s_mount(),
            k8s_token_file: default_k8s_token_file(),
            implicit_token_files: default_implicit_token_files(),
            path_prefix: path_prefix.into(),
            domain_path_format: None,
            kv2_mount: default_kv2_mount(),
            aws_mount: default_aws_mount(),
            aws_role: default_aws_role(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }

    /// Implicit token file candidates with `~` expanded to the home directory
    pub fn expanded_token_files(&self) -> Vec<PathBuf> {
        self.implicit_token_files
            .iter()
            .map(|p| expand_home(p))
            .collect()
    }

    /// Run derive rules and the cross-field checks
    pub fn validate_all(&self) -> Result<(), ConfigError> {
        self.validate()?;

        let prefix = self.path_prefix.as_str();
        if prefix.starts_with('/') {
            return Err(ConfigError::invalid("path_prefix", "must not start with '/'"));
        }
        if prefix.ends_with('/') {
            return Err(ConfigError::invalid("path_prefix", "must not end with '/'"));
        }
        if prefix.starts_with("secret/") {
            return Err(ConfigError::invalid(
                "path_prefix",
                "must not include the KV2 mount, configure `kv2_mount` instead",
            ));
        }

        for (field, mount) in [("kv2_mount", &self.kv2_mount), ("aws_mount", &self.aws_mount)] {
            if mount.starts_with('/') || mount.ends_with('/') {
                return Err(ConfigError::invalid(field, "must not start or end with '/'"));
            }
        }

        if let Some(ref format) = self.domain_path_format {
            if !format.contains("%s") {
                return Err(ConfigError::invalid(
                    "domain_path_format",
                    format!("'{}' does not contain a '%s' placeholder", format),
                ));
            }
        }

        match self.auth_method {
            AuthMethod::Token => {
                if is_blank(&self.token) {
                    return Err(ConfigError::invalid("token", "required for auth method 'token'"));
                }
            }
            AuthMethod::AppRole => {
                if is_blank(&self.role_id) {
                    return Err(ConfigError::invalid(
                        "role_id",
                        "required for auth method 'approle'",
                    ));
                }
                match (is_blank(&self.secret_id), self.secret_id_file.is_none()) {
                    (true, true) => {
                        return Err(ConfigError::invalid(
                            "secret_id",
                            "either `secret_id` or `secret_id_file` is required for auth method 'approle'",
                        ))
                    }
                    (false, false) => {
                        return Err(ConfigError::invalid(
                            "secret_id",
                            "`secret_id` and `secret_id_file` are mutually exclusive",
                        ))
                    }
                    _ => {}
                }
            }
            AuthMethod::Kubernetes => {
                if is_blank(&self.k8s_role) {
                    return Err(ConfigError::invalid(
                        "k8s_role",
                        "required for auth method 'kubernetes'",
                    ));
                }
            }
            AuthMethod::Implicit => {
                if self.implicit_token_files.is_empty() {
                    tracing::debug!("No implicit token files configured, only {} is consulted", VAULT_TOKEN_ENV);
                }
            }
        }

        Ok(())
    }
}

impl fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultConfig")
            .field("addr", &self.addr)
            .field("auth_method", &self.auth_method)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("role_id", &self.role_id)
            .field("secret_id", &self.secret_id.as_ref().map(|_| "[REDACTED]"))
            .field("secret_id_file", &self.secret_id_file)
            .field("k8s_role", &self.k8s_role)
            .field("k8s_mount", &self.k8s_mount)
            .field("k8s_token_file", &self.k8s_token_file)
            .field("implicit_token_files", &self.implicit_token_files)
            .field("path_prefix", &self.path_prefix)
            .field("domain_path_format", &self.domain_path_format)
            .field("kv2_mount", &self.kv2_mount)
            .field("aws_mount", &self.aws_mount)
            .field("aws_role", &self.aws_role)
            .field("max_retries", &self.max_retries)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).map_or(true, str::is_empty)
}

/// Expand a leading `~` to the current user's home directory
pub fn expand_home(path: &str) -> PathBuf {
    let rest = match path.strip_prefix("~/") {
        Some(rest) => rest,
        None if path == "~" => "",
        None => return PathBuf::from(path),
    };

    match directories::BaseDirs::new() {
        Some(dirs) => dirs.home_dir().join(rest),
        None => Path::new(path).to_path_buf(),
    }
}
