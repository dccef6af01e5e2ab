//! ACME certificate issuance and renewal
//!
//! # Architecture
//!
//! - [`AcmeDealer`] - account bootstrap and registration, DNS-01 orders
//!   (implemented by [`InstantAcmeDealer`] on top of `instant-acme`)
//! - [`RenewalPolicy`] - decides whether a stored certificate is due
//! - [`DomainScheduler`] - checks all domains with a bounded worker pool
//! - [`DynamicCredentialsProvider`] - Route53 credentials minted by the
//!   secrets store
//!
//! # Issuance Flow
//!
//! 1. The scheduler reads the public certificate data of a domain
//! 2. Missing or malformed data leads to a new order, otherwise the policy
//!    decides whether to renew
//! 3. The dealer publishes `_acme-challenge` TXT records through the DNS
//!    provider and waits for them to propagate
//! 4. Once the CA has validated every name, a CSR with a fresh key is
//!    submitted and the chain downloaded
//! 5. Challenge records are removed and the certificate is written back to
//!    the trust backend

mod credentials;
mod dealer;
pub mod dns;
mod error;
mod policy;
mod scheduler;

pub use credentials::{DynamicCredentialsProvider, CREDENTIALS_PROPAGATION_DELAY};
pub use dealer::{AcmeDealer, InstantAcmeDealer};
pub use error::AcmeError;
pub use policy::{RenewalPolicy, JITTER_PROBABILITY, MIN_LIFETIME_DAYS, SKEW_WINDOW_DAYS};
pub use scheduler::{CheckSummary, DomainFailure, DomainScheduler, Operation, SchedulerError};
