//! ACME protocol wrapper
//!
//! [`InstantAcmeDealer`] drives `instant-acme` through account bootstrap,
//! registration and DNS-01 orders. Account state is kept in the trust
//! backend so the same registration survives restarts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, KeyPair};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use acmevault_config::{DomainSpec, ServerConfig};

use super::credentials::DynamicCredentialsProvider;
use super::dns::{DnsProvider, PropagationChecker, PropagationConfig, Route53Provider};
use super::error::AcmeError;
use crate::account::AcmeAccount;
use crate::certificate::{split_chain, Certificate};
use crate::vault::TrustBackend;

/// Upper bound for an order to become ready and for the certificate to be issued
const ORDER_TIMEOUT: Duration = Duration::from_secs(300);

const ORDER_POLL_INTERVAL: Duration = Duration::from_secs(2);

const CERTIFICATE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Certificate authority operations used by the scheduler and the server
#[async_trait]
pub trait AcmeDealer: Send + Sync {
    /// Load the account for `email`. The flag is true when it still has to be registered.
    ///
    /// Only a not-found read creates a new account, every other storage error is returned.
    async fn bootstrap(&self, email: &str) -> Result<(AcmeAccount, bool), AcmeError>;

    /// Register the bootstrapped account, agreeing to the terms of service
    async fn register_account(&self) -> Result<AcmeAccount, AcmeError>;

    /// Issue a certificate for the primary domain and all SANs
    async fn obtain_cert(&self, domain: &DomainSpec) -> Result<Certificate, AcmeError>;

    /// Reissue `existing` for the same names with a fresh private key
    async fn renew_cert(&self, existing: Certificate) -> Result<Certificate, AcmeError>;
}

pub struct InstantAcmeDealer {
    backend: Arc<dyn TrustBackend>,
    directory_url: String,
    dns: Arc<dyn DnsProvider>,
    propagation: PropagationChecker,
    record: parking_lot::Mutex<Option<AcmeAccount>>,
    /// Restored lazily, restoring fetches the CA directory
    account: tokio::sync::Mutex<Option<Account>>,
    order_timeout: Duration,
}

impl InstantAcmeDealer {
    pub fn new(
        backend: Arc<dyn TrustBackend>,
        directory_url: impl Into<String>,
        dns: Arc<dyn DnsProvider>,
        propagation: PropagationChecker,
    ) -> Self {
        Self {
            backend,
            directory_url: directory_url.into(),
            dns,
            propagation,
            record: parking_lot::Mutex::new(None),
            account: tokio::sync::Mutex::new(None),
            order_timeout: ORDER_TIMEOUT,
        }
    }

    /// Route53 DNS-01 dealer for a server configuration
    pub async fn from_config(
        config: &ServerConfig,
        backend: Arc<dyn TrustBackend>,
        credentials: DynamicCredentialsProvider,
    ) -> Result<Self, AcmeError> {
        let propagation = PropagationConfig::default().with_nameservers(&config.dns_nameservers)?;
        let dns = Route53Provider::new(&config.aws_region, credentials).await;

        info!(
            directory = %config.acme_url,
            staging = config.is_staging(),
            dns_provider = dns.name(),
            "Configured ACME dealer"
        );

        Ok(Self::new(
            backend,
            config.acme_url.clone(),
            Arc::new(dns),
            PropagationChecker::new(propagation),
        ))
    }

    pub fn with_order_timeout(mut self, timeout: Duration) -> Self {
        self.order_timeout = timeout;
        self
    }

    /// The account currently held, if bootstrapped
    pub fn current_account(&self) -> Option<AcmeAccount> {
        self.record.lock().clone()
    }

    async fn account(&self) -> Result<Account, AcmeError> {
        let mut cached = self.account.lock().await;
        if let Some(account) = cached.as_ref() {
            return Ok(account.clone());
        }

        let record = self.record.lock().clone().ok_or(AcmeError::NoAccount)?;
        if !record.is_registered() {
            return Err(AcmeError::NoAccount);
        }

        let credentials: AccountCredentials = serde_json::from_value(record.account.clone())
            .map_err(|e| AcmeError::Account(format!("stored credentials: {}", e)))?;
        let account = Account::from_credentials(credentials)
            .await
            .map_err(|e| AcmeError::Account(e.to_string()))?;

        debug!(account = %record.uri, "Restored ACME account");
        *cached = Some(account.clone());
        Ok(account)
    }

    async fn issue(&self, primary: &str, names: &[String]) -> Result<Certificate, AcmeError> {
        let account = self.account().await?;

        let identifiers: Vec<Identifier> = names.iter().cloned().map(Identifier::Dns).collect();
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| AcmeError::Order {
                domain: primary.to_string(),
                message: e.to_string(),
            })?;

        debug!(domain = %primary, names = ?names, order = %order.url(), "Created ACME order");

        let mut published = Vec::new();
        let validated = self.validate(&mut order, primary, &mut published).await;

        for (domain, record_id) in &published {
            if let Err(e) = self.dns.delete_txt_record(domain, record_id).await {
                warn!(domain = %domain, error = %e, "Failed to clean up challenge record");
            }
        }
        validated?;

        self.finalize(&mut order, primary, names).await
    }

    /// Publish every DNS-01 challenge and wait until the order is ready
    async fn validate(
        &self,
        order: &mut Order,
        primary: &str,
        published: &mut Vec<(String, String)>,
    ) -> Result<(), AcmeError> {
        let authorizations = order.authorizations().await.map_err(|e| AcmeError::Order {
            domain: primary.to_string(),
            message: format!("failed to fetch authorizations: {}", e),
        })?;

        let mut pending = Vec::new();
        for authz in &authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let domain = match &authz.identifier {
                Identifier::Dns(domain) => domain.clone(),
                #[allow(unreachable_patterns)]
                other => {
                    return Err(AcmeError::Challenge {
                        domain: primary.to_string(),
                        message: format!("unsupported identifier {:?}", other),
                    })
                }
            };

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Dns01)
                .ok_or_else(|| AcmeError::Challenge {
                    domain: domain.clone(),
                    message: "no dns-01 challenge offered".to_string(),
                })?;

            let value = order.key_authorization(challenge).dns_value();
            let record_id = self.dns.create_txt_record(&domain, &value).await?;
            published.push((domain.clone(), record_id));
            pending.push((domain, value, challenge.url.clone()));
        }

        for (domain, value, _) in &pending {
            self.propagation.wait_for_propagation(domain, value).await?;
        }

        for (domain, _, url) in &pending {
            order
                .set_challenge_ready(url)
                .await
                .map_err(|e| AcmeError::Challenge {
                    domain: domain.clone(),
                    message: e.to_string(),
                })?;
        }

        let start = Instant::now();
        loop {
            order.refresh().await?;
            let status = order.state().status;
            debug!(domain = %primary, status = ?status, "Order status");

            match status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    let message = order
                        .state()
                        .error
                        .as_ref()
                        .map(|e| format!("{:?}", e))
                        .unwrap_or_else(|| "order became invalid".to_string());
                    return Err(AcmeError::Challenge {
                        domain: primary.to_string(),
                        message,
                    });
                }
                OrderStatus::Pending | OrderStatus::Processing => {}
            }

            if start.elapsed() >= self.order_timeout {
                return Err(AcmeError::Timeout {
                    what: format!("order for '{}' to become ready", primary),
                    elapsed: start.elapsed(),
                });
            }
            tokio::time::sleep(ORDER_POLL_INTERVAL).await;
        }
    }

    async fn finalize(
        &self,
        order: &mut Order,
        primary: &str,
        names: &[String],
    ) -> Result<Certificate, AcmeError> {
        let finalization = |message: String| AcmeError::Finalization {
            domain: primary.to_string(),
            message,
        };

        let key = KeyPair::generate().map_err(|e| finalization(format!("key generation: {}", e)))?;
        let params = CertificateParams::new(names.to_vec())
            .map_err(|e| finalization(format!("certificate parameters: {}", e)))?;
        let csr = params
            .serialize_request(&key)
            .map_err(|e| finalization(format!("CSR: {}", e)))?;

        if order.state().status != OrderStatus::Valid {
            order
                .finalize(csr.der())
                .await
                .map_err(|e| finalization(e.to_string()))?;
        }

        let start = Instant::now();
        let chain = loop {
            match order.certificate().await {
                Ok(Some(chain)) => break chain,
                Ok(None) => {}
                Err(e) => return Err(finalization(format!("download: {}", e))),
            }

            if start.elapsed() >= self.order_timeout {
                return Err(AcmeError::Timeout {
                    what: format!("certificate for '{}'", primary),
                    elapsed: start.elapsed(),
                });
            }
            tokio::time::sleep(CERTIFICATE_POLL_INTERVAL).await;
        };

        let (_, issuer) = split_chain(&chain);
        let csr_pem = csr.pem().map_err(|e| finalization(format!("CSR: {}", e)))?;

        Ok(Certificate {
            domain: primary.to_string(),
            certificate: chain.into_bytes(),
            private_key: Some(key.serialize_pem().into_bytes()),
            issuer_certificate: issuer.into_bytes(),
            csr: csr_pem.into_bytes(),
            cert_url: order.state().certificate.clone().unwrap_or_default(),
            cert_stable_url: order.url().to_string(),
        })
    }
}

#[async_trait]
impl AcmeDealer for InstantAcmeDealer {
    async fn bootstrap(&self, email: &str) -> Result<(AcmeAccount, bool), AcmeError> {
        let (account, is_new) = match self.backend.read_account(email).await {
            Ok(account) if account.is_registered() => {
                info!(email = %email, account = %account.uri, "Using stored ACME account");
                (account, false)
            }
            Ok(_) => {
                warn!(email = %email, "Stored ACME account is incomplete, registering again");
                (AcmeAccount::pending(email), true)
            }
            Err(e) if e.is_not_found() => {
                info!(email = %email, "No ACME account stored, creating a new one");
                (AcmeAccount::pending(email), true)
            }
            Err(e) => return Err(AcmeError::Storage(e)),
        };

        *self.record.lock() = Some(account.clone());
        *self.account.lock().await = None;
        Ok((account, is_new))
    }

    async fn register_account(&self) -> Result<AcmeAccount, AcmeError> {
        let email = self
            .record
            .lock()
            .as_ref()
            .map(|record| record.email.clone())
            .ok_or(AcmeError::NoAccount)?;

        let contact = format!("mailto:{}", email);
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[contact.as_str()],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await
        .map_err(|e| AcmeError::Registration(e.to_string()))?;

        let credentials = serde_json::to_value(&credentials)
            .map_err(|e| AcmeError::Registration(format!("serializing credentials: {}", e)))?;
        let record = AcmeAccount::from_credentials(email.as_str(), account.id(), credentials)
            .map_err(|e| AcmeError::Registration(e.to_string()))?;

        info!(email = %email, account = %record.uri, "Registered ACME account");

        if let Err(e) = self.backend.write_account(&record).await {
            warn!(email = %email, error = %e, "Failed to store ACME account");
        }

        *self.record.lock() = Some(record.clone());
        *self.account.lock().await = Some(account);
        Ok(record)
    }

    async fn obtain_cert(&self, domain: &DomainSpec) -> Result<Certificate, AcmeError> {
        info!(domain = %domain.domain, sans = ?domain.sans, "Obtaining certificate");
        self.issue(&domain.domain, &domain.names()).await
    }

    async fn renew_cert(&self, existing: Certificate) -> Result<Certificate, AcmeError> {
        let existing = existing.without_private_key();

        let mut names = vec![existing.domain.clone()];
        for name in existing.dns_names()? {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(&name)) {
                names.push(name);
            }
        }

        info!(domain = %existing.domain, names = ?names, "Renewing certificate");
        self.issue(&existing.domain, &names).await
    }
}

impl std::fmt::Debug for InstantAcmeDealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstantAcmeDealer")
            .field("directory_url", &self.directory_url)
            .field("dns", &self.dns)
            .field("account", &self.record.lock())
            .finish()
    }
}
