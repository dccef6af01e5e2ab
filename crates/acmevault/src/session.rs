//! Authenticated connection to the secrets store, shared by both roles.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use acmevault_common::MetricsCollector;
use acmevault_config::VaultConfig;

use crate::auth::{AuthError, AuthStrategy, Authenticator};
use crate::vault::{
    LifecycleConfig, LifecycleError, TokenLifecycleManager, TrustBackend, VaultBackend,
    VaultClient, VaultError, VaultPaths,
};

/// How long startup waits for the first successful login
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid secrets store client settings: {0}")]
    Client(#[from] VaultError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("No successful login within {0:?}")]
    StartupTimeout(Duration),

    #[error("Token lifecycle stopped before the first login")]
    Aborted,
}

/// A started [`TokenLifecycleManager`] and the backend built on its client
pub struct VaultSession {
    lifecycle: TokenLifecycleManager,
    backend: Arc<VaultBackend>,
}

impl VaultSession {
    /// Log in and wait until the session is usable, failing after `startup_timeout`
    pub async fn establish(
        config: &VaultConfig,
        metrics: Arc<dyn MetricsCollector>,
        startup_timeout: Duration,
    ) -> Result<Self, SessionError> {
        let client = Arc::new(VaultClient::new(config)?);
        let auth: Arc<dyn Authenticator> = Arc::new(AuthStrategy::from_config(config)?);

        let lifecycle = TokenLifecycleManager::new(
            Arc::clone(&auth),
            Arc::clone(&client),
            Arc::clone(&metrics),
            LifecycleConfig::default(),
        );
        let ready = lifecycle.start()?;

        match tokio::time::timeout(startup_timeout, ready).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                lifecycle.shutdown().await;
                return Err(SessionError::Aborted);
            }
            Err(_) => {
                lifecycle.shutdown().await;
                return Err(SessionError::StartupTimeout(startup_timeout));
            }
        }

        info!(addr = %client.address(), method = %auth.method(), "Secrets store session established");

        let backend = Arc::new(VaultBackend::new(
            client,
            VaultPaths::new(config),
            auth,
            metrics,
        ));

        Ok(Self { lifecycle, backend })
    }

    pub fn backend(&self) -> Arc<VaultBackend> {
        Arc::clone(&self.backend)
    }

    /// Stop renewing and end the session
    pub async fn close(self) {
        self.lifecycle.shutdown().await;
        if let Err(e) = self.backend.logout().await {
            warn!(error = %e, "Logout failed");
        }
    }
}

impl std::fmt::Debug for VaultSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultSession")
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acmevault_common::NoopCollector;
    use acmevault_config::AuthMethod;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_establish_with_static_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/auth/token/lookup-self"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"ttl": 0, "renewable": false, "display_name": "token", "policies": ["acmevault"]}
            })))
            .mount(&server)
            .await;

        let mut config = VaultConfig::new(server.uri(), AuthMethod::Token, "acmevault");
        config.token = Some("s.static".to_string());

        let session = VaultSession::establish(&config, Arc::new(NoopCollector), STARTUP_TIMEOUT)
            .await
            .unwrap();
        assert!(session.backend().client().has_token());
        session.close().await;
    }

    #[tokio::test]
    async fn test_missing_token_is_a_configuration_error() {
        let config = VaultConfig::new("http://127.0.0.1:8200", AuthMethod::Token, "acmevault");
        assert!(matches!(
            VaultSession::establish(&config, Arc::new(NoopCollector), STARTUP_TIMEOUT).await,
            Err(SessionError::Auth(AuthError::Missing("token")))
        ));
    }

    #[tokio::test]
    async fn test_startup_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/auth/token/lookup-self"))
            .respond_with(ResponseTemplate::new(403).set_body_string("permission denied"))
            .mount(&server)
            .await;

        let mut config = VaultConfig::new(server.uri(), AuthMethod::Token, "acmevault");
        config.token = Some("s.revoked".to_string());

        let result =
            VaultSession::establish(&config, Arc::new(NoopCollector), Duration::from_millis(500)).await;
        assert!(matches!(result, Err(SessionError::StartupTimeout(_))));
    }
}
