use std::fmt;
use std::path::PathBuf;

use serde_json::json;
use tracing::debug;

use acmevault_config::AuthMethod;

use super::{read_credential, AuthError, SessionInfo};
use crate::vault::VaultClient;

const LOGIN_PATH: &str = "auth/approle/login";

/// Where the secret-id comes from
#[derive(Clone)]
pub enum SecretIdSource {
    Inline(String),
    /// Re-read on every login so rotated secret-ids are picked up
    File(PathBuf),
}

impl fmt::Debug for SecretIdSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline(_) => f.write_str("Inline([REDACTED])"),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

/// Role-id and secret-id exchange
#[derive(Debug)]
pub struct AppRoleAuth {
    role_id: String,
    secret: SecretIdSource,
}

impl AppRoleAuth {
    pub fn new(role_id: impl Into<String>, secret: SecretIdSource) -> Self {
        Self {
            role_id: role_id.into(),
            secret,
        }
    }

    async fn secret_id(&self) -> Result<String, AuthError> {
        match self.secret {
            SecretIdSource::Inline(ref secret) => Ok(secret.clone()),
            SecretIdSource::File(ref path) => read_credential("secret-id", path).await,
        }
    }

    pub async fn login(&self, client: &VaultClient) -> Result<SessionInfo, AuthError> {
        let secret_id = self.secret_id().await?;
        debug!(role_id = %self.role_id, "Logging in via AppRole");

        let auth = client
            .login(
                LOGIN_PATH,
                &json!({ "role_id": self.role_id, "secret_id": secret_id }),
            )
            .await
            .map_err(|source| AuthError::Login {
                method: AuthMethod::AppRole,
                source,
            })?;

        Ok(SessionInfo::from_auth(auth))
    }
}
