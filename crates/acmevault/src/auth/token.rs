use std::fmt;

use acmevault_config::AuthMethod;

use super::{AuthError, SessionInfo};
use crate::vault::VaultClient;

/// Static pre-issued token
pub struct TokenAuth {
    token: String,
}

impl TokenAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Validate the token and read its lease from `lookup-self`
    pub async fn login(&self, client: &VaultClient) -> Result<SessionInfo, AuthError> {
        let lookup = client
            .lookup_token(&self.token)
            .await
            .map_err(|source| AuthError::Login {
                method: AuthMethod::Token,
                source,
            })?;

        Ok(SessionInfo::from_lookup(self.token.clone(), lookup))
    }
}

impl fmt::Debug for TokenAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuth").field("token", &"[REDACTED]").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{header, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_login_uses_lookup_self() {
        let server = MockServer::start().await;
        Mock::given(path("/v1/auth/token/lookup-self"))
            .and(header("X-Vault-Token", "s.static"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "ttl": 1800, "renewable": true }
            })))
            .mount(&server)
            .await;

        let client = VaultClient::with_address(&server.uri(), Duration::from_secs(5), 3).unwrap();
        let session = TokenAuth::new("s.static").login(&client).await.unwrap();

        assert_eq!(session.token, "s.static");
        assert_eq!(session.ttl, Duration::from_secs(1800));
        assert!(session.renewable);
    }

    #[tokio::test]
    async fn test_rejected_token() {
        let server = MockServer::start().await;
        Mock::given(path("/v1/auth/token/lookup-self"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let client = VaultClient::with_address(&server.uri(), Duration::from_secs(5), 3).unwrap();
        let err = TokenAuth::new("s.revoked").login(&client).await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::Login {
                method: AuthMethod::Token,
                source: crate::vault::VaultError::PermissionDenied { .. }
            }
        ));
    }
}
