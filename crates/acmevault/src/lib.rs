//! acmevault Library
//!
//! Automated ACME certificate issuance and renewal with a Vault-compatible
//! secrets store as trust anchor and certificate store.
//!
//! - **Trust backend**: pluggable login strategies, a lease-renewing session
//!   and KV2 storage split into public and private secrets per domain
//! - **ACME**: DNS-01 orders through Route53 with dynamic credentials,
//!   jittered renewal decisions and a bounded worker pool over all domains
//! - **Client**: installs a stored certificate on the local filesystem and
//!   runs a post-update hook
//!
//! # Example
//!
//! ```ignore
//! use acmevault::{AcmeVaultServer, VaultSession, STARTUP_TIMEOUT};
//!
//! let session = VaultSession::establish(&config.vault, metrics.clone(), STARTUP_TIMEOUT).await?;
//! let server = AcmeVaultServer::bootstrap(server_config, session, metrics).await?;
//! server.run(cancel).await;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod account;
pub mod acme;
pub mod auth;
pub mod certificate;
pub mod client;
pub mod http;
pub mod server;
pub mod session;
pub mod vault;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Data model
pub use account::{AcmeAccount, CloudCredentials};
pub use certificate::{Certificate, CertificateError};

// Secrets store
pub use auth::{AuthError, AuthStrategy, Authenticator, SessionInfo};
pub use session::{SessionError, VaultSession, STARTUP_TIMEOUT};
pub use vault::{CertificateSource, TokenLifecycleManager, TrustBackend, VaultBackend, VaultClient, VaultError};

// Certificate management
pub use acme::{
    AcmeDealer, AcmeError, CheckSummary, DomainScheduler, DynamicCredentialsProvider,
    InstantAcmeDealer, RenewalPolicy, SchedulerError,
};

// Roles
pub use client::{CertificateClient, ClientError};
pub use server::{cancel_on_signal, AcmeVaultServer, ServerError};
