//! Certificate consumer role
//!
//! The client only ever reads full certificate data for its own domain and
//! writes it to disk. It has no access to the write side of the backend.

mod hook;
mod writer;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use acmevault_common::MetricsCollector;
use acmevault_config::ClientConfig;

use crate::certificate::CertificateError;
use crate::vault::{CertificateSource, VaultError};

pub use hook::Hook;
pub use writer::{FsCertWriter, CERT_FILE_MODE, PRIVATE_FILE_MODE};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to read certificate: {0}")]
    Vault(#[from] VaultError),

    #[error("Certificate for '{0}' has no private key")]
    MissingPrivateKey(String),

    #[error("Invalid certificate: {0}")]
    Certificate(#[from] CertificateError),

    #[error("Failed to write '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Post-update hook failed: {0}")]
    Hook(String),
}

pub struct CertificateClient {
    domain: String,
    source: Arc<dyn CertificateSource>,
    writer: FsCertWriter,
    hook: Option<Hook>,
    /// Files changed but the hook has not succeeded since
    hook_pending: AtomicBool,
    metrics: Arc<dyn MetricsCollector>,
}

impl CertificateClient {
    pub fn new(
        config: &ClientConfig,
        source: Arc<dyn CertificateSource>,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Self {
        Self {
            domain: config.domain.clone(),
            source,
            writer: FsCertWriter::from_config(config),
            hook: Hook::from_argv(&config.hook),
            hook_pending: AtomicBool::new(false),
            metrics,
        }
    }

    /// Fetch the certificate and update local files.
    ///
    /// Returns whether anything on disk changed. The hook runs after a change
    /// and again on later calls until it has succeeded once.
    pub async fn retrieve_and_save(&self) -> Result<bool, ClientError> {
        let cert = self.source.read_full_certificate_data(&self.domain).await?;
        let expiry = cert.expiry()?;
        self.metrics.certificate_expiry(&self.domain, expiry);

        let changed = self.writer.write(&cert).await?;
        if changed {
            self.metrics.client_certificate_written(&self.domain);
            info!(domain = %self.domain, expiry = %expiry, "Updated certificate files");
            self.hook_pending.store(true, Ordering::SeqCst);
        } else {
            info!(domain = %self.domain, expiry = %expiry, "Certificate files are up to date");
        }

        if !self.hook_pending.load(Ordering::SeqCst) {
            return Ok(changed);
        }

        if let Some(hook) = &self.hook {
            if !changed {
                info!(domain = %self.domain, "Retrying post-update hook");
            }
            if let Err(e) = hook.run().await {
                self.metrics.client_hook_failed();
                return Err(e);
            }
        }
        self.hook_pending.store(false, Ordering::SeqCst);
        Ok(changed)
    }

    /// Run once, or every `interval` until cancelled
    pub async fn run(
        &self,
        interval: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<(), ClientError> {
        let Some(interval) = interval else {
            return self.retrieve_and_save().await.map(|_| ());
        };

        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.retrieve_and_save().await {
                error!(domain = %self.domain, error = %e, "Certificate update failed");
            }
        }
    }
}

impl std::fmt::Debug for CertificateClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateClient")
            .field("domain", &self.domain)
            .field("writer", &self.writer)
            .field("hook", &self.hook)
            .field("hook_pending", &self.hook_pending.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::tests::self_signed;
    use crate::certificate::Certificate;
    use acmevault_common::NoopCollector;
    use async_trait::async_trait;

    struct Fixed(Certificate);

    #[async_trait]
    impl CertificateSource for Fixed {
        async fn read_full_certificate_data(&self, _domain: &str) -> Result<Certificate, VaultError> {
            Ok(self.0.clone())
        }
    }

    fn config(dir: &std::path::Path, hook: &[&str]) -> ClientConfig {
        let mut config = ClientConfig::new("example.com");
        config.pem_file = Some(dir.join("example.pem"));
        config.hook = hook.iter().map(|s| s.to_string()).collect();
        config
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hook_runs_only_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("hook-ran");
        let script = format!("echo x >> {}", marker.display());

        let client = CertificateClient::new(
            &config(dir.path(), &["sh", "-c", &script]),
            Arc::new(Fixed(self_signed(&["example.com"], 60))),
            Arc::new(NoopCollector),
        );

        assert!(client.retrieve_and_save().await.unwrap());
        assert!(!client.retrieve_and_save().await.unwrap());
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "x\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hook_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let client = CertificateClient::new(
            &config(dir.path(), &["false"]),
            Arc::new(Fixed(self_signed(&["example.com"], 60))),
            Arc::new(NoopCollector),
        );

        assert!(matches!(
            client.retrieve_and_save().await,
            Err(ClientError::Hook(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_hook_is_retried_without_changes() {
        let dir = tempfile::tempdir().unwrap();
        let armed = dir.path().join("armed");
        let marker = dir.path().join("hook-ran");
        // Fails on the first run only
        let script = format!(
            "if [ -f {armed} ]; then echo x >> {marker}; else touch {armed}; exit 1; fi",
            armed = armed.display(),
            marker = marker.display()
        );

        let client = CertificateClient::new(
            &config(dir.path(), &["sh", "-c", &script]),
            Arc::new(Fixed(self_signed(&["example.com"], 60))),
            Arc::new(NoopCollector),
        );

        assert!(matches!(
            client.retrieve_and_save().await,
            Err(ClientError::Hook(_))
        ));
        assert!(!client.retrieve_and_save().await.unwrap());
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "x\n");

        assert!(!client.retrieve_and_save().await.unwrap());
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "x\n");
    }

    #[tokio::test]
    async fn test_one_shot_run() {
        let dir = tempfile::tempdir().unwrap();
        let client = CertificateClient::new(
            &config(dir.path(), &[]),
            Arc::new(Fixed(self_signed(&["example.com"], 60))),
            Arc::new(NoopCollector),
        );

        client.run(None, CancellationToken::new()).await.unwrap();
        assert!(dir.path().join("example.pem").exists());
    }
}
