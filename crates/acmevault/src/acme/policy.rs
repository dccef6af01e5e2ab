//! Renewal decision with load-spreading jitter.
//!
//! ```text
//! remaining <= min_lifetime                  renew
//! min_lifetime < remaining <= skew_window    renew with probability `jitter`
//! remaining > skew_window                    keep
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tracing::debug;

use acmevault_common::MetricsCollector;
use acmevault_config::ServerConfig;

use crate::certificate::{Certificate, CertificateError};

/// Remaining lifetime at or below which renewal is certain
pub const MIN_LIFETIME_DAYS: i64 = 30;

/// Remaining lifetime above which renewal never happens
pub const SKEW_WINDOW_DAYS: i64 = 45;

/// Chance of an early renewal inside the skew window
pub const JITTER_PROBABILITY: f64 = 0.03;

pub struct RenewalPolicy {
    min_lifetime: Duration,
    skew_window: Duration,
    jitter: f64,
    rng: Mutex<Box<dyn RngCore + Send>>,
    metrics: Arc<dyn MetricsCollector>,
}

impl RenewalPolicy {
    pub fn new(
        min_lifetime: Duration,
        skew_window: Duration,
        jitter: f64,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Self {
        Self {
            min_lifetime,
            skew_window: skew_window.max(min_lifetime),
            jitter: jitter.clamp(0.0, 1.0),
            rng: Mutex::new(Box::new(StdRng::from_entropy())),
            metrics,
        }
    }

    pub fn from_config(config: &ServerConfig, metrics: Arc<dyn MetricsCollector>) -> Self {
        Self::new(
            Duration::days(config.min_lifetime_days as i64),
            Duration::days(config.skew_window_days as i64),
            config.jitter_probability,
            metrics,
        )
    }

    /// Replace the random source, e.g. with a seeded generator
    pub fn with_rng(self, rng: impl RngCore + Send + 'static) -> Self {
        *self.rng.lock() = Box::new(rng);
        self
    }

    pub fn needs_renewal(&self, cert: &Certificate) -> Result<bool, CertificateError> {
        self.needs_renewal_at(cert, Utc::now())
    }

    /// Decide relative to `now`. Fails when the stored chain does not parse.
    pub fn needs_renewal_at(
        &self,
        cert: &Certificate,
        now: DateTime<Utc>,
    ) -> Result<bool, CertificateError> {
        let expiry = cert.expiry()?;
        self.metrics.certificate_expiry(&cert.domain, expiry);

        let remaining = expiry - now;
        let renew = self.decide(remaining);
        debug!(
            domain = %cert.domain,
            expiry = %expiry,
            remaining_days = remaining.num_days(),
            renew,
            "Evaluated certificate lifetime"
        );
        Ok(renew)
    }

    pub fn decide(&self, remaining: Duration) -> bool {
        if remaining <= self.min_lifetime {
            true
        } else if remaining <= self.skew_window {
            self.rng.lock().gen_bool(self.jitter)
        } else {
            false
        }
    }
}

impl fmt::Debug for RenewalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenewalPolicy")
            .field("min_lifetime_days", &self.min_lifetime.num_days())
            .field("skew_window_days", &self.skew_window.num_days())
            .field("jitter", &self.jitter)
            .finish()
    }
}
