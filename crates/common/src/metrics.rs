//! Metrics collection for certificate and session lifecycle events.
//!
//! The [`MetricsCollector`] trait is the only way components report
//! observability data. Every method has an empty default body so test doubles
//! only override what they assert on.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use prometheus::{Gauge, GaugeVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use thiserror::Error;

const NAMESPACE: &str = "acmevault";

/// Errors raised while building the Prometheus collector
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Metric definition or registration failed
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),
}

/// Sink for the counters and gauges emitted by acmevault components
pub trait MetricsCollector: Send + Sync + fmt::Debug {
    /// A certificate was obtained for a domain that had none
    fn certificate_obtained(&self, _domain: &str) {}

    /// An existing certificate was renewed
    fn certificate_renewed(&self, _domain: &str) {}

    /// Obtaining a fresh certificate failed
    fn certificate_obtain_failed(&self, _domain: &str) {}

    /// Renewing an existing certificate failed
    fn certificate_renewal_failed(&self, _domain: &str) {}

    /// A certificate was persisted to the trust backend
    fn certificate_written(&self, _domain: &str) {}

    /// Persisting a certificate to the trust backend failed
    fn certificate_write_failed(&self, _domain: &str) {}

    /// Expiry of the current certificate for a domain
    fn certificate_expiry(&self, _domain: &str, _expiry: DateTime<Utc>) {}

    /// A full scheduler iteration finished
    fn iteration_completed(&self, _at: DateTime<Utc>) {}

    /// A login against the secrets store succeeded
    fn vault_login(&self) {}

    /// A login against the secrets store failed
    fn vault_login_failed(&self) {}

    /// The session token was renewed and now has the given TTL
    fn vault_token_renewed(&self, _ttl: Duration) {}

    /// Dynamic cloud credentials were requested from the secrets store
    fn cloud_credentials_requested(&self) {}

    /// The client wrote certificate material to disk
    fn client_certificate_written(&self, _domain: &str) {}

    /// The client's post-update hook failed
    fn client_hook_failed(&self) {}
}

/// Collector that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCollector;

impl MetricsCollector for NoopCollector {}

/// Prometheus-backed collector with its own registry
pub struct PrometheusCollector {
    registry: Registry,

    // Server metrics
    certificates_obtained: IntCounter,
    certificates_renewed: IntCounter,
    obtain_errors: IntCounter,
    renewal_errors: IntCounter,
    certificates_written: IntCounter,
    write_errors: IntCounter,
    certificate_expiry: GaugeVec,
    latest_iteration: Gauge,

    // Vault session metrics
    vault_logins: IntCounter,
    vault_login_errors: IntCounter,
    vault_token_renewals: IntCounter,
    vault_token_ttl: Gauge,
    cloud_credentials_requested: IntCounter,

    // Client metrics
    client_writes: IntCounterVec,
    client_hook_errors: IntCounter,
}

impl PrometheusCollector {
    /// Create a collector and register all series on a fresh registry
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let certificates_obtained = counter(
            &registry,
            "server",
            "certificates_obtained_total",
            "Certificates obtained for domains without a stored certificate",
        )?;
        let certificates_renewed = counter(
            &registry,
            "server",
            "certificates_renewals_total",
            "Certificates renewed",
        )?;
        let obtain_errors = counter(
            &registry,
            "server",
            "certificate_obtain_errors_total",
            "Errors while obtaining certificates",
        )?;
        let renewal_errors = counter(
            &registry,
            "server",
            "certificates_renewal_errors_total",
            "Errors while renewing certificates",
        )?;
        let certificates_written = counter(
            &registry,
            "server",
            "certificates_written_total",
            "Certificates written to the secrets store",
        )?;
        let write_errors = counter(
            &registry,
            "server",
            "certificates_write_errors_total",
            "Errors while writing certificates to the secrets store",
        )?;

        let certificate_expiry = GaugeVec::new(
            Opts::new(
                "certificate_expiry_time_seconds",
                "Expiry of the current certificate as unix timestamp",
            )
            .namespace(NAMESPACE),
            &["domain"],
        )?;
        registry.register(Box::new(certificate_expiry.clone()))?;

        let latest_iteration = Gauge::with_opts(
            Opts::new(
                "latest_iteration_time_seconds",
                "Timestamp of the latest completed certificate check",
            )
            .namespace(NAMESPACE)
            .subsystem("server"),
        )?;
        registry.register(Box::new(latest_iteration.clone()))?;

        let vault_logins = counter(&registry, "vault", "logins_total", "Successful logins")?;
        let vault_login_errors = counter(
            &registry,
            "vault",
            "login_errors_total",
            "Failed login attempts",
        )?;
        let vault_token_renewals = counter(
            &registry,
            "vault",
            "token_renewals_total",
            "Successful token renewals",
        )?;
        let vault_token_ttl = Gauge::with_opts(
            Opts::new("token_ttl_seconds", "TTL of the current session token")
                .namespace(NAMESPACE)
                .subsystem("vault"),
        )?;
        registry.register(Box::new(vault_token_ttl.clone()))?;
        let cloud_credentials_requested = counter(
            &registry,
            "vault",
            "aws_credentials_requested_total",
            "Dynamic AWS credentials requested",
        )?;

        let client_writes = IntCounterVec::new(
            Opts::new(
                "certificate_writes_total",
                "Certificate bundles written to disk",
            )
            .namespace(NAMESPACE)
            .subsystem("client"),
            &["domain"],
        )?;
        registry.register(Box::new(client_writes.clone()))?;
        let client_hook_errors = counter(
            &registry,
            "client",
            "hook_errors_total",
            "Failed post-update hook executions",
        )?;

        Ok(Self {
            registry,
            certificates_obtained,
            certificates_renewed,
            obtain_errors,
            renewal_errors,
            certificates_written,
            write_errors,
            certificate_expiry,
            latest_iteration,
            vault_logins,
            vault_login_errors,
            vault_token_renewals,
            vault_token_ttl,
            cloud_credentials_requested,
            client_writes,
            client_hook_errors,
        })
    }

    /// Access the underlying registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode all metrics in Prometheus text format
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_default()
    }
}

fn counter(
    registry: &Registry,
    subsystem: &str,
    name: &str,
    help: &str,
) -> Result<IntCounter, MetricsError> {
    let counter = IntCounter::with_opts(
        Opts::new(name, help)
            .namespace(NAMESPACE)
            .subsystem(subsystem),
    )?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl MetricsCollector for PrometheusCollector {
    fn certificate_obtained(&self, _domain: &str) {
        self.certificates_obtained.inc();
    }

    fn certificate_renewed(&self, _domain: &str) {
        self.certificates_renewed.inc();
    }

    fn certificate_obtain_failed(&self, _domain: &str) {
        self.obtain_errors.inc();
    }

    fn certificate_renewal_failed(&self, _domain: &str) {
        self.renewal_errors.inc();
    }

    fn certificate_written(&self, _domain: &str) {
        self.certificates_written.inc();
    }

    fn certificate_write_failed(&self, _domain: &str) {
        self.write_errors.inc();
    }

    fn certificate_expiry(&self, domain: &str, expiry: DateTime<Utc>) {
        self.certificate_expiry
            .with_label_values(&[domain])
            .set(expiry.timestamp() as f64);
    }

    fn iteration_completed(&self, at: DateTime<Utc>) {
        self.latest_iteration.set(at.timestamp() as f64);
    }

    fn vault_login(&self) {
        self.vault_logins.inc();
    }

    fn vault_login_failed(&self) {
        self.vault_login_errors.inc();
    }

    fn vault_token_renewed(&self, ttl: Duration) {
        self.vault_token_renewals.inc();
        self.vault_token_ttl.set(ttl.as_secs_f64());
    }

    fn cloud_credentials_requested(&self) {
        self.cloud_credentials_requested.inc();
    }

    fn client_certificate_written(&self, domain: &str) {
        self.client_writes.with_label_values(&[domain]).inc();
    }

    fn client_hook_failed(&self) {
        self.client_hook_errors.inc();
    }
}

impl fmt::Debug for PrometheusCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusCollector")
            .field("families", &self.registry.gather().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collectors_are_independent() {
        let a = PrometheusCollector::new().unwrap();
        let b = PrometheusCollector::new().unwrap();

        a.certificate_obtained("example.com");
        a.certificate_obtained("example.org");

        assert_eq!(a.certificates_obtained.get(), 2);
        assert_eq!(b.certificates_obtained.get(), 0);
    }

    #[test]
    fn test_encode_contains_namespaced_series() {
        let collector = PrometheusCollector::new().unwrap();
        collector.certificate_renewed("example.com");
        collector.vault_login_failed();
        collector.certificate_expiry(
            "example.com",
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        );

        let text = collector.encode();
        assert!(text.contains("acmevault_server_certificates_renewals_total 1"));
        assert!(text.contains("acmevault_vault_login_errors_total 1"));
        assert!(text.contains("acmevault_certificate_expiry_time_seconds{domain=\"example.com\"} 1700000000"));
    }

    #[test]
    fn test_token_renewal_sets_ttl_gauge() {
        let collector = PrometheusCollector::new().unwrap();
        collector.vault_token_renewed(Duration::from_secs(3600));

        assert_eq!(collector.vault_token_renewals.get(), 1);
        assert_eq!(collector.vault_token_ttl.get(), 3600.0);
    }

    #[test]
    fn test_noop_collector_accepts_everything() {
        let collector: &dyn MetricsCollector = &NoopCollector;
        collector.certificate_obtained("example.com");
        collector.vault_token_renewed(Duration::from_secs(1));
        collector.client_hook_failed();
    }
}
