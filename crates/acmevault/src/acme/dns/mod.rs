//! DNS-01 challenge support
//!
//! - [`DnsProvider`] publishes and removes `_acme-challenge` TXT records
//! - [`Route53Provider`] is the Route53 implementation, authenticated with
//!   credentials minted by the secrets store
//! - [`PropagationChecker`] waits until recursive resolvers see the record

mod propagation;
mod provider;
mod route53;

pub use propagation::{PropagationChecker, PropagationConfig};
pub use provider::{
    challenge_record_fqdn, normalize_domain, DnsProvider, DnsProviderError, DnsResult,
    ACME_CHALLENGE_RECORD, CHALLENGE_TTL,
};
pub use route53::Route53Provider;
