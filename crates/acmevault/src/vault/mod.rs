//! Secrets store integration
//!
//! - [`VaultClient`] - HTTP client with retry and an atomically swappable session token
//! - [`VaultBackend`] - certificate, account and cloud credential storage
//! - [`TokenLifecycleManager`] - login, lease renewal and re-login loop
//! - [`VaultPaths`] - KV2 path scheme

mod backend;
mod client;
mod error;
mod lifecycle;
mod paths;

pub use backend::{CertificateSource, TrustBackend, VaultBackend};
pub use client::{ApiResponse, AuthInfo, TokenLookup, VaultClient};
pub use error::VaultError;
pub use lifecycle::{
    LeaseEvent, LeaseWatcher, LifecycleConfig, LifecycleError, TokenLifecycleManager,
    DEFAULT_LOGIN_BACKOFF, DEFAULT_RENEW_FRACTION,
};
pub use paths::VaultPaths;
