//! Short-lived cloud credentials minted by the secrets store.
//!
//! Fresh IAM credentials are not usable immediately after they are issued.
//! [`DynamicCredentialsProvider::retrieve`] therefore waits out a fixed
//! propagation delay before handing them out.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::{future, ProvideCredentials};
use aws_credential_types::Credentials;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::info;

use crate::account::CloudCredentials;
use crate::vault::{TrustBackend, VaultError};

/// Delay between minting credentials and using them
pub const CREDENTIALS_PROPAGATION_DELAY: Duration = Duration::from_secs(20);

const PROVIDER_NAME: &str = "acmevault-vault";

#[derive(Clone)]
pub struct DynamicCredentialsProvider {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn TrustBackend>,
    propagation_delay: Duration,
    /// Serialises refreshes so only one is in flight
    refresh: Mutex<()>,
    cached: ArcSwapOption<CloudCredentials>,
}

impl DynamicCredentialsProvider {
    pub fn new(backend: Arc<dyn TrustBackend>, propagation_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                propagation_delay,
                refresh: Mutex::new(()),
                cached: ArcSwapOption::empty(),
            }),
        }
    }

    /// Mint new credentials, record their expiry and wait for them to propagate
    pub async fn retrieve(&self) -> Result<CloudCredentials, VaultError> {
        let _guard = self.inner.refresh.lock().await;
        self.retrieve_locked().await
    }

    async fn retrieve_locked(&self) -> Result<CloudCredentials, VaultError> {
        let credentials = self.inner.backend.read_dynamic_cloud_credentials().await?;
        self.inner.cached.store(Some(Arc::new(credentials.clone())));

        info!(
            access_key_id = %credentials.access_key_id,
            expiry = %credentials.expiry,
            delay_secs = self.inner.propagation_delay.as_secs(),
            "Received cloud credentials, waiting for them to become effective"
        );
        tokio::time::sleep(self.inner.propagation_delay).await;
        Ok(credentials)
    }

    /// Whether the last retrieved credentials are past their expiry
    pub fn is_expired(&self) -> bool {
        match self.inner.cached.load().as_ref() {
            Some(credentials) => credentials.is_expired_at(Utc::now()),
            None => true,
        }
    }

    /// Cached credentials, refreshed when expired
    pub async fn credentials(&self) -> Result<CloudCredentials, VaultError> {
        let _guard = self.inner.refresh.lock().await;
        if let Some(credentials) = self.inner.cached.load_full() {
            if !credentials.is_expired_at(Utc::now()) {
                return Ok(credentials.as_ref().clone());
            }
        }
        self.retrieve_locked().await
    }
}

impl ProvideCredentials for DynamicCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> future::ProvideCredentials<'a>
    where
        Self: 'a,
    {
        future::ProvideCredentials::new(async move {
            let credentials = self
                .credentials()
                .await
                .map_err(CredentialsError::provider_error)?;

            Ok(Credentials::new(
                credentials.access_key_id,
                credentials.secret_access_key,
                credentials.session_token,
                Some(credentials.expiry.into()),
                PROVIDER_NAME,
            ))
        })
    }
}

impl fmt::Debug for DynamicCredentialsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicCredentialsProvider")
            .field("propagation_delay", &self.inner.propagation_delay)
            .field("expired", &self.is_expired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AcmeAccount;
    use crate::certificate::Certificate;
    use crate::vault::CertificateSource;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CredentialsOnly {
        issued: AtomicU32,
        lease: chrono::Duration,
    }

    #[async_trait]
    impl CertificateSource for CredentialsOnly {
        async fn read_full_certificate_data(&self, domain: &str) -> Result<Certificate, VaultError> {
            Err(VaultError::NotFound { path: domain.to_string() })
        }
    }

    #[async_trait]
    impl TrustBackend for CredentialsOnly {
        async fn write_certificate(&self, _certificate: &Certificate) -> Result<(), VaultError> {
            unimplemented!()
        }
        async fn read_public_certificate_data(&self, domain: &str) -> Result<Certificate, VaultError> {
            Err(VaultError::NotFound { path: domain.to_string() })
        }
        async fn write_account(&self, _account: &AcmeAccount) -> Result<(), VaultError> {
            unimplemented!()
        }
        async fn read_account(&self, email: &str) -> Result<AcmeAccount, VaultError> {
            Err(VaultError::NotFound { path: email.to_string() })
        }
        async fn read_dynamic_cloud_credentials(&self) -> Result<CloudCredentials, VaultError> {
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(CloudCredentials {
                access_key_id: format!("AKIA{}", n),
                secret_access_key: "secret".to_string(),
                session_token: None,
                expiry: Utc::now() + self.lease,
            })
        }
        async fn logout(&self) -> Result<(), VaultError> {
            Ok(())
        }
    }

    fn provider(lease: chrono::Duration) -> (Arc<CredentialsOnly>, DynamicCredentialsProvider) {
        let backend = Arc::new(CredentialsOnly {
            issued: AtomicU32::new(0),
            lease,
        });
        let provider = DynamicCredentialsProvider::new(backend.clone(), CREDENTIALS_PROPAGATION_DELAY);
        (backend, provider)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrieve_waits_for_propagation() {
        let (_, provider) = provider(chrono::Duration::hours(1));
        assert!(provider.is_expired());

        let start = tokio::time::Instant::now();
        let creds = provider.retrieve().await.unwrap();

        assert!(start.elapsed() >= CREDENTIALS_PROPAGATION_DELAY);
        assert_eq!(creds.access_key_id, "AKIA1");
        assert!(!provider.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_refresh() {
        let (backend, provider) = provider(chrono::Duration::hours(1));

        let (a, b) = tokio::join!(provider.credentials(), provider.credentials());
        assert_eq!(a.unwrap().access_key_id, b.unwrap().access_key_id);
        assert_eq!(backend.issued.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_credentials_are_replaced() {
        let (backend, provider) = provider(chrono::Duration::seconds(-1));

        provider.credentials().await.unwrap();
        assert!(provider.is_expired());
        provider.credentials().await.unwrap();
        assert_eq!(backend.issued.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sdk_credentials() {
        let (_, provider) = provider(chrono::Duration::hours(1));
        let creds = provider.provide_credentials().await.unwrap();
        assert_eq!(creds.access_key_id(), "AKIA1");
        assert!(creds.expiry().is_some());
    }
}
