use std::path::PathBuf;

use tracing::{debug, trace};

use acmevault_config::AuthMethod;

use super::{read_credential, AuthError, SessionInfo};
use crate::vault::VaultClient;

/// Token taken from the environment or the first readable token file
#[derive(Debug)]
pub struct ImplicitAuth {
    env_var: String,
    candidates: Vec<PathBuf>,
}

impl ImplicitAuth {
    pub fn new(env_var: impl Into<String>, candidates: Vec<PathBuf>) -> Self {
        Self {
            env_var: env_var.into(),
            candidates,
        }
    }

    async fn find_token(&self) -> Result<String, AuthError> {
        if let Ok(token) = std::env::var(&self.env_var) {
            let token = token.trim();
            if !token.is_empty() {
                debug!(env = %self.env_var, "Using token from environment");
                return Ok(token.to_string());
            }
        }

        for candidate in &self.candidates {
            match read_credential("token", candidate).await {
                Ok(token) => {
                    debug!(path = %candidate.display(), "Using token from file");
                    return Ok(token);
                }
                Err(e) => trace!(error = %e, "Skipping token candidate"),
            }
        }

        Err(AuthError::NoImplicitToken {
            env: self.env_var.clone(),
            candidates: self.candidates.clone(),
        })
    }

    pub async fn login(&self, client: &VaultClient) -> Result<SessionInfo, AuthError> {
        let token = self.find_token().await?;
        let lookup = client
            .lookup_token(&token)
            .await
            .map_err(|source| AuthError::Login {
                method: AuthMethod::Implicit,
                source,
            })?;

        Ok(SessionInfo::from_lookup(token, lookup))
    }
}
