//! Trust backend: certificate, account and cloud credential storage.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use acmevault_common::MetricsCollector;

use super::client::VaultClient;
use super::error::VaultError;
use super::paths::VaultPaths;
use crate::account::{AcmeAccount, CloudCredentials};
use crate::auth::Authenticator;
use crate::certificate::Certificate;

/// Read-only view used by the client role
#[async_trait]
pub trait CertificateSource: Send + Sync {
    /// Public certificate data merged with the private key
    async fn read_full_certificate_data(&self, domain: &str) -> Result<Certificate, VaultError>;
}

/// Storage operations needed by the issuing server
#[async_trait]
pub trait TrustBackend: CertificateSource {
    /// Store the private key if present, then the public view
    async fn write_certificate(&self, certificate: &Certificate) -> Result<(), VaultError>;

    /// Public view only, `private_key` is always `None`
    async fn read_public_certificate_data(&self, domain: &str) -> Result<Certificate, VaultError>;

    async fn write_account(&self, account: &AcmeAccount) -> Result<(), VaultError>;

    async fn read_account(&self, email: &str) -> Result<AcmeAccount, VaultError>;

    /// Fresh short-lived DNS provider credentials
    async fn read_dynamic_cloud_credentials(&self) -> Result<CloudCredentials, VaultError>;

    /// End the session
    async fn logout(&self) -> Result<(), VaultError>;
}

/// [`TrustBackend`] on a KV2 mount
pub struct VaultBackend {
    client: Arc<VaultClient>,
    paths: VaultPaths,
    auth: Arc<dyn Authenticator>,
    metrics: Arc<dyn MetricsCollector>,
}

impl VaultBackend {
    pub fn new(
        client: Arc<VaultClient>,
        paths: VaultPaths,
        auth: Arc<dyn Authenticator>,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Self {
        Self {
            client,
            paths,
            auth,
            metrics,
        }
    }

    pub fn client(&self) -> &Arc<VaultClient> {
        &self.client
    }

    pub fn paths(&self) -> &VaultPaths {
        &self.paths
    }
}

#[async_trait]
impl CertificateSource for VaultBackend {
    async fn read_full_certificate_data(&self, domain: &str) -> Result<Certificate, VaultError> {
        let public = self.read_public_certificate_data(domain).await?;

        let path = self.paths.private_key(domain);
        let data = self.client.read_secret(&path).await?;
        public
            .with_private_data(&data)
            .map_err(|source| VaultError::InvalidData { path, source })
    }
}

#[async_trait]
impl TrustBackend for VaultBackend {
    async fn write_certificate(&self, certificate: &Certificate) -> Result<(), VaultError> {
        let domain = &certificate.domain;

        // Public secret last, it marks the write as complete
        if let Some(private) = certificate.to_private_data() {
            self.client
                .write_secret(&self.paths.private_key(domain), &private)
                .await?;
        }

        self.client
            .write_secret(&self.paths.certificate(domain), &certificate.to_public_data())
            .await?;

        info!(domain = %domain, "Stored certificate");
        Ok(())
    }

    async fn read_public_certificate_data(&self, domain: &str) -> Result<Certificate, VaultError> {
        let path = self.paths.certificate(domain);
        let data = self.client.read_secret(&path).await?;
        Certificate::from_public_data(&data).map_err(|source| VaultError::InvalidData { path, source })
    }

    async fn write_account(&self, account: &AcmeAccount) -> Result<(), VaultError> {
        self.client
            .write_secret(&self.paths.account(&account.email), &account.to_data())
            .await?;
        debug!(email = %account.email, "Stored ACME account");
        Ok(())
    }

    async fn read_account(&self, email: &str) -> Result<AcmeAccount, VaultError> {
        let path = self.paths.account(email);
        let data = self.client.read_secret(&path).await?;
        AcmeAccount::from_data(&data).map_err(|source| VaultError::InvalidData { path, source })
    }

    async fn read_dynamic_cloud_credentials(&self) -> Result<CloudCredentials, VaultError> {
        let path = self.paths.aws_credentials();
        let response = self.client.read(&path).await?;
        self.metrics.cloud_credentials_requested();

        let data = response.data.ok_or_else(|| VaultError::Decode {
            path: path.clone(),
            message: "credentials response has no data".to_string(),
        })?;

        let field = |name: &str| data.get(name).and_then(Value::as_str).map(str::to_string);

        let access_key_id = field("access_key").ok_or_else(|| VaultError::Decode {
            path: path.clone(),
            message: "missing access_key".to_string(),
        })?;
        let secret_access_key = field("secret_key").ok_or_else(|| VaultError::Decode {
            path: path.clone(),
            message: "missing secret_key".to_string(),
        })?;
        let session_token = field("security_token").filter(|t| !t.is_empty());

        let lease = response.lease_duration.unwrap_or(0);
        let expiry = Utc::now() + chrono::Duration::seconds(lease as i64);
        debug!(lease_secs = lease, "Issued dynamic cloud credentials");

        Ok(CloudCredentials {
            access_key_id,
            secret_access_key,
            session_token,
            expiry,
        })
    }

    async fn logout(&self) -> Result<(), VaultError> {
        if let Err(e) = self.auth.logout(&self.client).await {
            warn!(error = %e, "Logout failed");
        }
        self.client.clear_token();
        Ok(())
    }
}
