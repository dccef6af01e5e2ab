//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use acmevault::acme::AcmeDealer;
use acmevault::certificate::SecretData;
use acmevault::{
    AcmeAccount, AcmeError, Certificate, CertificateSource, CloudCredentials, TrustBackend,
    VaultError,
};
use acmevault_config::DomainSpec;

/// Self-signed chain for `names` that expires `days` from now
pub fn self_signed(names: &[&str], days: i64) -> Certificate {
    let key = rcgen::KeyPair::generate().unwrap();
    let mut params =
        rcgen::CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
            .unwrap();
    let not_after = Utc::now() + chrono::Duration::days(days);
    params.not_after =
        rcgen::date_time_ymd(not_after.year(), not_after.month() as u8, not_after.day() as u8);
    let cert = params.self_signed(&key).unwrap();

    Certificate {
        domain: names[0].to_string(),
        certificate: cert.pem().into_bytes(),
        private_key: Some(key.serialize_pem().into_bytes()),
        issuer_certificate: Vec::new(),
        csr: Vec::new(),
        cert_url: format!("https://ca.example/cert/{}", names[0]),
        cert_stable_url: format!("https://ca.example/order/{}", names[0]),
    }
}

pub fn domains(names: &[&str]) -> Vec<DomainSpec> {
    names.iter().map(|name| DomainSpec::new(*name)).collect()
}

/// In-memory trust backend storing the same public/private split as the real one
#[derive(Default)]
pub struct MemoryBackend {
    pub public: Mutex<HashMap<String, SecretData>>,
    pub private: Mutex<HashMap<String, SecretData>>,
    pub writes: AtomicUsize,
    /// Domains whose writes fail with permission denied
    pub reject_writes: Mutex<HashSet<String>>,
    /// Domains whose reads fail with permission denied
    pub reject_reads: Mutex<HashSet<String>>,
}

impl MemoryBackend {
    pub fn with_certificate(self, cert: &Certificate) -> Self {
        self.public
            .lock()
            .insert(cert.domain.clone(), cert.to_public_data());
        if let Some(private) = cert.to_private_data() {
            self.private.lock().insert(cert.domain.clone(), private);
        }
        self
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateSource for MemoryBackend {
    async fn read_full_certificate_data(&self, domain: &str) -> Result<Certificate, VaultError> {
        let public = self.read_public_certificate_data(domain).await?;
        let private = self
            .private
            .lock()
            .get(domain)
            .cloned()
            .ok_or_else(|| VaultError::NotFound {
                path: format!("{}/privatekey", domain),
            })?;
        public
            .with_private_data(&private)
            .map_err(|source| VaultError::InvalidData {
                path: format!("{}/privatekey", domain),
                source,
            })
    }
}

#[async_trait]
impl TrustBackend for MemoryBackend {
    async fn write_certificate(&self, certificate: &Certificate) -> Result<(), VaultError> {
        if self.reject_writes.lock().contains(&certificate.domain) {
            return Err(VaultError::PermissionDenied {
                path: certificate.domain.clone(),
            });
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.public
            .lock()
            .insert(certificate.domain.clone(), certificate.to_public_data());
        if let Some(private) = certificate.to_private_data() {
            self.private.lock().insert(certificate.domain.clone(), private);
        }
        Ok(())
    }

    async fn read_public_certificate_data(&self, domain: &str) -> Result<Certificate, VaultError> {
        if self.reject_reads.lock().contains(domain) {
            return Err(VaultError::PermissionDenied {
                path: domain.to_string(),
            });
        }
        let data = self
            .public
            .lock()
            .get(domain)
            .cloned()
            .ok_or_else(|| VaultError::NotFound {
                path: format!("{}/certificate", domain),
            })?;
        Certificate::from_public_data(&data).map_err(|source| VaultError::InvalidData {
            path: format!("{}/certificate", domain),
            source,
        })
    }

    async fn write_account(&self, _account: &AcmeAccount) -> Result<(), VaultError> {
        Ok(())
    }

    async fn read_account(&self, email: &str) -> Result<AcmeAccount, VaultError> {
        Err(VaultError::NotFound {
            path: email.to_string(),
        })
    }

    async fn read_dynamic_cloud_credentials(&self) -> Result<CloudCredentials, VaultError> {
        Err(VaultError::Client("not available in tests".to_string()))
    }

    async fn logout(&self) -> Result<(), VaultError> {
        Ok(())
    }
}

/// Dealer that issues self-signed certificates and records every call
#[derive(Default)]
pub struct RecordingDealer {
    pub obtained: Mutex<Vec<String>>,
    pub renewed: Mutex<Vec<String>>,
    /// Domains whose issuance fails
    pub failing: HashSet<String>,
    /// Simulated CA latency
    pub latency: Option<Duration>,
    /// Cancelled when the first issuance starts
    pub cancel_on_first_call: Option<CancellationToken>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl RecordingDealer {
    pub fn failing(domains: &[&str]) -> Self {
        Self {
            failing: domains.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn obtained(&self) -> Vec<String> {
        self.obtained.lock().clone()
    }

    pub fn renewed(&self) -> Vec<String> {
        self.renewed.lock().clone()
    }

    async fn issue(&self, domain: &str) -> Result<Certificate, AcmeError> {
        if let Some(token) = &self.cancel_on_first_call {
            token.cancel();
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(domain) {
            return Err(AcmeError::Order {
                domain: domain.to_string(),
                message: "rejected by test CA".to_string(),
            });
        }
        Ok(self_signed(&[domain], 90))
    }
}

#[async_trait]
impl AcmeDealer for RecordingDealer {
    async fn bootstrap(&self, email: &str) -> Result<(AcmeAccount, bool), AcmeError> {
        Ok((AcmeAccount::pending(email), true))
    }

    async fn register_account(&self) -> Result<AcmeAccount, AcmeError> {
        Err(AcmeError::Registration("not supported".to_string()))
    }

    async fn obtain_cert(&self, domain: &DomainSpec) -> Result<Certificate, AcmeError> {
        self.obtained.lock().push(domain.domain.clone());
        self.issue(&domain.domain).await
    }

    async fn renew_cert(&self, existing: Certificate) -> Result<Certificate, AcmeError> {
        assert!(existing.private_key.is_none(), "renewal input must not carry a key");
        self.renewed.lock().push(existing.domain.clone());
        self.issue(&existing.domain).await
    }
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
