use std::path::PathBuf;

use serde_json::json;
use tracing::debug;

use acmevault_config::AuthMethod;

use super::{read_credential, AuthError, SessionInfo};
use crate::vault::VaultClient;

/// Kubernetes service-account token exchange
#[derive(Debug)]
pub struct KubernetesAuth {
    mount: String,
    role: String,
    token_file: PathBuf,
}

impl KubernetesAuth {
    pub fn new(mount: impl Into<String>, role: impl Into<String>, token_file: PathBuf) -> Self {
        Self {
            mount: mount.into().trim_matches('/').to_string(),
            role: role.into(),
            token_file,
        }
    }

    pub async fn login(&self, client: &VaultClient) -> Result<SessionInfo, AuthError> {
        // Projected tokens rotate, so the file is read on every login
        let jwt = read_credential("service account token", &self.token_file).await?;
        debug!(mount = %self.mount, role = %self.role, "Logging in via Kubernetes");

        let auth = client
            .login(
                &format!("auth/{}/login", self.mount),
                &json!({ "role": self.role, "jwt": jwt }),
            )
            .await
            .map_err(|source| AuthError::Login {
                method: AuthMethod::Kubernetes,
                source,
            })?;

        Ok(SessionInfo::from_auth(auth))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_login_with_custom_mount() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/k8s-prod/login"))
            .and(body_json(json!({ "role": "acmevault", "jwt": "eyJhbGciOi" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "auth": { "client_token": "s.k8s", "lease_duration": 3600, "renewable": true }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut token_file = tempfile::NamedTempFile::new().unwrap();
        write!(token_file, "eyJhbGciOi\n").unwrap();

        let client = VaultClient::with_address(&server.uri(), Duration::from_secs(5), 3).unwrap();
        let auth = KubernetesAuth::new("/k8s-prod/", "acmevault", token_file.path().to_path_buf());
        let session = auth.login(&client).await.unwrap();

        assert_eq!(session.token, "s.k8s");
        assert_eq!(session.ttl, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_empty_token_file() {
        let token_file = tempfile::NamedTempFile::new().unwrap();
        let client =
            VaultClient::with_address("http://127.0.0.1:1", Duration::from_secs(1), 3).unwrap();
        let auth = KubernetesAuth::new("kubernetes", "acmevault", token_file.path().to_path_buf());

        assert!(matches!(
            auth.login(&client).await,
            Err(AuthError::EmptyCredential { .. })
        ));
    }
}
