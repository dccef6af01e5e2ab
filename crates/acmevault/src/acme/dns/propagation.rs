//! DNS propagation checking for DNS-01 challenges
//!
//! Verifies that TXT records are visible on recursive resolvers before the
//! CA is told to validate.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::provider::{challenge_record_fqdn, DnsProviderError};

#[derive(Debug, Clone)]
pub struct PropagationConfig {
    /// Delay before the first lookup
    pub initial_delay: Duration,
    pub check_interval: Duration,
    pub timeout: Duration,
    /// Resolvers to query, empty for the system defaults
    pub nameservers: Vec<SocketAddr>,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(10),
            check_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(180),
            nameservers: vec![
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53),
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53),
            ],
        }
    }
}

impl PropagationConfig {
    /// Use the given `host` or `host:port` resolvers, keeping the defaults when empty
    pub fn with_nameservers(mut self, nameservers: &[String]) -> Result<Self, DnsProviderError> {
        if nameservers.is_empty() {
            return Ok(self);
        }
        self.nameservers = nameservers
            .iter()
            .map(|ns| parse_nameserver(ns))
            .collect::<Result<_, _>>()?;
        Ok(self)
    }
}

fn parse_nameserver(raw: &str) -> Result<SocketAddr, DnsProviderError> {
    let raw = raw.trim();
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Ok(addr);
    }
    raw.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, 53))
        .map_err(|_| {
            DnsProviderError::Configuration(format!(
                "nameserver '{}' is not an IP address or IP:port",
                raw
            ))
        })
}

/// Polls resolvers until a challenge value is visible
pub struct PropagationChecker {
    config: PropagationConfig,
    resolver: TokioAsyncResolver,
}

impl PropagationChecker {
    pub fn new(config: PropagationConfig) -> Self {
        let resolver_config = if config.nameservers.is_empty() {
            ResolverConfig::default()
        } else {
            let mut resolver_config = ResolverConfig::new();
            for addr in &config.nameservers {
                resolver_config.add_name_server(NameServerConfig::new(*addr, Protocol::Udp));
            }
            resolver_config
        };

        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(5);
        opts.attempts = 2;
        // Every lookup must hit the resolver
        opts.cache_size = 0;

        Self {
            config,
            resolver: TokioAsyncResolver::tokio(resolver_config, opts),
        }
    }

    pub fn config(&self) -> &PropagationConfig {
        &self.config
    }

    /// Wait until `expected_value` is published for `domain`
    pub async fn wait_for_propagation(
        &self,
        domain: &str,
        expected_value: &str,
    ) -> Result<(), DnsProviderError> {
        let record_name = challenge_record_fqdn(domain);
        let start = Instant::now();
        let deadline = start + self.config.timeout;

        debug!(
            record = %record_name,
            timeout_secs = self.config.timeout.as_secs(),
            "Waiting for DNS propagation"
        );

        tokio::time::sleep(self.config.initial_delay).await;

        loop {
            match self.check_record(&record_name, expected_value).await {
                Ok(true) => {
                    debug!(
                        record = %record_name,
                        elapsed_secs = start.elapsed().as_secs(),
                        "DNS propagation confirmed"
                    );
                    return Ok(());
                }
                Ok(false) => trace!(record = %record_name, "Record not yet propagated"),
                Err(e) => warn!(record = %record_name, error = %e, "DNS lookup error"),
            }

            if Instant::now() >= deadline {
                return Err(DnsProviderError::Timeout {
                    what: format!("propagation of {}", record_name),
                    elapsed_secs: start.elapsed().as_secs(),
                });
            }

            tokio::time::sleep(self.config.check_interval).await;
        }
    }

    async fn check_record(
        &self,
        record_name: &str,
        expected_value: &str,
    ) -> Result<bool, DnsProviderError> {
        match self.resolver.txt_lookup(record_name).await {
            Ok(records) => Ok(records.iter().any(|record| {
                let value: String = record
                    .txt_data()
                    .iter()
                    .map(|data| String::from_utf8_lossy(data))
                    .collect();
                value == expected_value
            })),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(false),
                _ => Err(DnsProviderError::ApiRequest(format!(
                    "lookup of '{}' failed: {}",
                    record_name, e
                ))),
            },
        }
    }
}

impl std::fmt::Debug for PropagationChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropagationChecker")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_nameservers() {
        let config = PropagationConfig::default()
            .with_nameservers(&["9.9.9.9".to_string(), "10.0.0.2:5353".to_string()])
            .unwrap();
        assert_eq!(
            config.nameservers,
            vec![
                "9.9.9.9:53".parse::<SocketAddr>().unwrap(),
                "10.0.0.2:5353".parse::<SocketAddr>().unwrap()
            ]
        );
    }

    #[test]
    fn test_empty_nameservers_keep_defaults() {
        let config = PropagationConfig::default().with_nameservers(&[]).unwrap();
        assert_eq!(config.nameservers.len(), 2);
    }

    #[test]
    fn test_hostname_nameserver_rejected() {
        assert!(matches!(
            PropagationConfig::default().with_nameservers(&["dns.example".to_string()]),
            Err(DnsProviderError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_checker_construction() {
        let checker = PropagationChecker::new(PropagationConfig::default());
        assert_eq!(checker.config().timeout, Duration::from_secs(180));
    }
}
