//! Authentication strategies for the secrets store.
//!
//! Each strategy turns some locally available credential into a session
//! token. The set is closed: [`AuthStrategy`] is selected once from the
//! configured method name and dispatches to one of
//!
//! - [`TokenAuth`] - a static pre-issued token
//! - [`AppRoleAuth`] - role-id and secret-id exchange
//! - [`KubernetesAuth`] - service-account JWT exchange
//! - [`ImplicitAuth`] - token from the environment or a token file
//!
//! Strategies never install the token themselves; the lifecycle manager does
//! that after a successful login.

mod approle;
mod implicit;
mod kubernetes;
mod token;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use acmevault_config::{AuthMethod, VaultConfig, VAULT_TOKEN_ENV};

use crate::vault::{AuthInfo, TokenLookup, VaultClient, VaultError};

pub use approle::{AppRoleAuth, SecretIdSource};
pub use implicit::ImplicitAuth;
pub use kubernetes::KubernetesAuth;
pub use token::TokenAuth;

/// Errors raised by an authentication strategy
#[derive(Debug, Error)]
pub enum AuthError {
    /// A required setting is absent
    #[error("{0} is not configured")]
    Missing(&'static str),

    /// A credential file could not be read
    #[error("Failed to read {what} from '{path}': {source}")]
    CredentialFile {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A credential file exists but is empty
    #[error("{what} file '{path}' is empty")]
    EmptyCredential { what: &'static str, path: PathBuf },

    /// Implicit auth found no token anywhere
    #[error("No token found in ${env} or any of {candidates:?}")]
    NoImplicitToken {
        env: String,
        candidates: Vec<PathBuf>,
    },

    /// The secrets store rejected the login
    #[error("Login via {method} failed: {source}")]
    Login {
        method: AuthMethod,
        #[source]
        source: VaultError,
    },

    /// Revoking the session failed
    #[error("Logout failed: {0}")]
    Logout(#[source] VaultError),
}

/// A freshly established session
#[derive(Clone)]
pub struct SessionInfo {
    pub token: String,
    /// Lease duration, zero for tokens that never expire
    pub ttl: Duration,
    pub renewable: bool,
}

impl SessionInfo {
    fn from_auth(auth: AuthInfo) -> Self {
        Self {
            token: auth.client_token,
            ttl: Duration::from_secs(auth.lease_duration),
            renewable: auth.renewable,
        }
    }

    fn from_lookup(token: String, lookup: TokenLookup) -> Self {
        Self {
            token,
            ttl: Duration::from_secs(lookup.ttl),
            renewable: lookup.renewable,
        }
    }
}

impl fmt::Debug for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInfo")
            .field("token", &"[REDACTED]")
            .field("ttl", &self.ttl)
            .field("renewable", &self.renewable)
            .finish()
    }
}

/// Login / logout capability
#[async_trait]
pub trait Authenticator: Send + Sync + fmt::Debug {
    /// Configured method
    fn method(&self) -> AuthMethod;

    /// Obtain a session. Does not touch the client's current token.
    async fn login(&self, client: &VaultClient) -> Result<SessionInfo, AuthError>;

    /// Give up the current session
    async fn logout(&self, client: &VaultClient) -> Result<(), AuthError>;
}

/// The configured authentication strategy
#[derive(Debug)]
pub enum AuthStrategy {
    Token(TokenAuth),
    AppRole(AppRoleAuth),
    Kubernetes(KubernetesAuth),
    Implicit(ImplicitAuth),
}

impl AuthStrategy {
    /// Select the strategy for the configured method
    pub fn from_config(config: &VaultConfig) -> Result<Self, AuthError> {
        let strategy = match config.auth_method {
            AuthMethod::Token => {
                let token = config.token.clone().ok_or(AuthError::Missing("token"))?;
                Self::Token(TokenAuth::new(token))
            }
            AuthMethod::AppRole => {
                let role_id = config.role_id.clone().ok_or(AuthError::Missing("role_id"))?;
                let secret = match (&config.secret_id, &config.secret_id_file) {
                    (Some(secret), _) => SecretIdSource::Inline(secret.clone()),
                    (None, Some(file)) => SecretIdSource::File(file.clone()),
                    (None, None) => return Err(AuthError::Missing("secret_id")),
                };
                Self::AppRole(AppRoleAuth::new(role_id, secret))
            }
            AuthMethod::Kubernetes => {
                let role = config.k8s_role.clone().ok_or(AuthError::Missing("k8s_role"))?;
                Self::Kubernetes(KubernetesAuth::new(
                    config.k8s_mount.clone(),
                    role,
                    config.k8s_token_file.clone(),
                ))
            }
            AuthMethod::Implicit => Self::Implicit(ImplicitAuth::new(
                VAULT_TOKEN_ENV,
                config.expanded_token_files(),
            )),
        };

        tracing::debug!(method = %strategy.method(), "Selected auth strategy");
        Ok(strategy)
    }
}

#[async_trait]
impl Authenticator for AuthStrategy {
    fn method(&self) -> AuthMethod {
        match self {
            Self::Token(_) => AuthMethod::Token,
            Self::AppRole(_) => AuthMethod::AppRole,
            Self::Kubernetes(_) => AuthMethod::Kubernetes,
            Self::Implicit(_) => AuthMethod::Implicit,
        }
    }

    async fn login(&self, client: &VaultClient) -> Result<SessionInfo, AuthError> {
        match self {
            Self::Token(auth) => auth.login(client).await,
            Self::AppRole(auth) => auth.login(client).await,
            Self::Kubernetes(auth) => auth.login(client).await,
            Self::Implicit(auth) => auth.login(client).await,
        }
    }

    async fn logout(&self, client: &VaultClient) -> Result<(), AuthError> {
        match self {
            // Externally issued tokens outlive the process
            Self::Token(_) | Self::Implicit(_) => Ok(()),
            Self::AppRole(_) | Self::Kubernetes(_) => {
                client.revoke_self().await.map_err(AuthError::Logout)
            }
        }
    }
}

/// Read a credential file, trimming surrounding whitespace
async fn read_credential(what: &'static str, path: &std::path::Path) -> Result<String, AuthError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| AuthError::CredentialFile {
            what,
            path: path.to_path_buf(),
            source,
        })?;

    let value = raw.trim();
    if value.is_empty() {
        return Err(AuthError::EmptyCredential {
            what,
            path: path.to_path_buf(),
        });
    }
    Ok(value.to_string())
}
