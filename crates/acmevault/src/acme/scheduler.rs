//! Certificate check scheduler
//!
//! Every run walks all configured domains with a bounded worker pool:
//! read the stored public certificate, ask the [`RenewalPolicy`], obtain or
//! renew through the [`AcmeDealer`] and write the result back. A failing
//! domain is recorded and never stops the others.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use acmevault_common::MetricsCollector;
use acmevault_config::DomainSpec;

use super::dealer::AcmeDealer;
use super::policy::RenewalPolicy;
use crate::certificate::Certificate;
use crate::vault::TrustBackend;

/// Step of the per-domain flow that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Obtain,
    Renew,
    Write,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Obtain => "obtain",
            Operation::Renew => "renew",
            Operation::Write => "write",
        })
    }
}

#[derive(Debug, Clone, Error)]
#[error("{domain}: {operation} failed: {message}")]
pub struct DomainFailure {
    pub domain: String,
    pub operation: Operation,
    pub message: String,
}

/// Counts for a single run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckSummary {
    pub obtained: usize,
    pub renewed: usize,
    pub unchanged: usize,
    pub failed: usize,
    /// Domains never picked up because the run was cancelled
    pub skipped: usize,
}

/// Combined error of a run, one entry per failed domain
#[derive(Debug, Error)]
#[error("{} domain(s) failed: {}", .failures.len(), join_failures(.failures))]
pub struct SchedulerError {
    pub failures: Vec<DomainFailure>,
    pub summary: CheckSummary,
}

fn join_failures(failures: &[DomainFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Obtained,
    Renewed,
    Unchanged,
}

#[derive(Default)]
struct Tally {
    summary: CheckSummary,
    failures: Vec<DomainFailure>,
}

#[derive(Clone)]
pub struct DomainScheduler {
    backend: Arc<dyn TrustBackend>,
    dealer: Arc<dyn AcmeDealer>,
    policy: Arc<RenewalPolicy>,
    metrics: Arc<dyn MetricsCollector>,
    max_workers: usize,
}

impl DomainScheduler {
    pub fn new(
        backend: Arc<dyn TrustBackend>,
        dealer: Arc<dyn AcmeDealer>,
        policy: Arc<RenewalPolicy>,
        metrics: Arc<dyn MetricsCollector>,
        max_workers: usize,
    ) -> Self {
        Self {
            backend,
            dealer,
            policy,
            metrics,
            max_workers: max_workers.max(1),
        }
    }

    /// Check once immediately, then every `interval` until cancelled
    pub async fn run(&self, domains: &[DomainSpec], interval: Duration, cancel: CancellationToken) {
        info!(
            domains = domains.len(),
            interval_secs = interval.as_secs(),
            workers = self.max_workers,
            "Starting certificate scheduler"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.check_certs(domains, &cancel).await {
                Ok(summary) => info!(
                    obtained = summary.obtained,
                    renewed = summary.renewed,
                    unchanged = summary.unchanged,
                    "Certificate check completed"
                ),
                Err(e) => error!(
                    failed = e.summary.failed,
                    obtained = e.summary.obtained,
                    renewed = e.summary.renewed,
                    error = %e,
                    "Certificate check completed with errors"
                ),
            }
            self.metrics.iteration_completed(Utc::now());
        }

        info!("Certificate scheduler stopped");
    }

    /// Process every domain once with at most `max_workers` in parallel.
    ///
    /// Cancellation stops workers from picking up further domains, a domain
    /// already in progress is finished.
    pub async fn check_certs(
        &self,
        domains: &[DomainSpec],
        cancel: &CancellationToken,
    ) -> Result<CheckSummary, SchedulerError> {
        let workers = self.max_workers.min(domains.len());
        debug!(domains = domains.len(), workers, "Checking certificates");

        let queue = Arc::new(Mutex::new(domains.iter().cloned().collect::<VecDeque<_>>()));
        let tally = Arc::new(Mutex::new(Tally::default()));

        let mut tasks = JoinSet::new();
        for worker in 0..workers {
            let this = self.clone();
            let queue = Arc::clone(&queue);
            let tally = Arc::clone(&tally);
            let cancel = cancel.clone();

            tasks.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        debug!(worker, "Worker stopping on cancellation");
                        break;
                    }
                    let Some(spec) = queue.lock().pop_front() else {
                        break;
                    };

                    let result = this.handle_domain(&spec).await;

                    let mut counts = tally.lock();
                    match result {
                        Ok(Outcome::Obtained) => counts.summary.obtained += 1,
                        Ok(Outcome::Renewed) => counts.summary.renewed += 1,
                        Ok(Outcome::Unchanged) => counts.summary.unchanged += 1,
                        Err(failure) => {
                            counts.summary.failed += 1;
                            counts.failures.push(failure);
                        }
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Certificate worker terminated abnormally");
            }
        }

        let skipped = queue.lock().len();
        let mut tally = std::mem::take(&mut *tally.lock());
        tally.summary.skipped = skipped;
        if skipped > 0 {
            info!(skipped, "Certificate check cancelled before all domains were processed");
        }

        if tally.failures.is_empty() {
            Ok(tally.summary)
        } else {
            Err(SchedulerError {
                failures: tally.failures,
                summary: tally.summary,
            })
        }
    }

    async fn handle_domain(&self, spec: &DomainSpec) -> Result<Outcome, DomainFailure> {
        let domain = spec.domain.as_str();

        let existing = match self.backend.read_public_certificate_data(domain).await {
            Ok(cert) => Some(cert),
            Err(e) if e.is_not_found() => {
                debug!(domain = %domain, "No stored certificate");
                None
            }
            Err(e) => {
                warn!(domain = %domain, error = %e, "Could not read stored certificate, obtaining a new one");
                None
            }
        };

        let (operation, issued) = match existing {
            None => (Operation::Obtain, self.dealer.obtain_cert(spec).await),
            Some(existing) => match self.policy.needs_renewal(&existing) {
                Ok(false) => {
                    debug!(domain = %domain, "Certificate is current");
                    return Ok(Outcome::Unchanged);
                }
                Ok(true) => (Operation::Renew, self.dealer.renew_cert(existing).await),
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Stored certificate is malformed, obtaining a new one");
                    (Operation::Obtain, self.dealer.obtain_cert(spec).await)
                }
            },
        };

        let cert = match issued {
            Ok(cert) => cert,
            Err(e) => {
                error!(domain = %domain, operation = %operation, error = %e, "Certificate issuance failed");
                match operation {
                    Operation::Renew => self.metrics.certificate_renewal_failed(domain),
                    _ => self.metrics.certificate_obtain_failed(domain),
                }
                return Err(DomainFailure {
                    domain: domain.to_string(),
                    operation,
                    message: e.to_string(),
                });
            }
        };

        let outcome = match operation {
            Operation::Renew => {
                self.metrics.certificate_renewed(domain);
                Outcome::Renewed
            }
            _ => {
                self.metrics.certificate_obtained(domain);
                Outcome::Obtained
            }
        };

        self.store(&cert).await?;
        info!(domain = %domain, operation = %operation, "Certificate stored");
        Ok(outcome)
    }

    async fn store(&self, cert: &Certificate) -> Result<(), DomainFailure> {
        if let Err(e) = self.backend.write_certificate(cert).await {
            error!(domain = %cert.domain, error = %e, "Failed to store certificate");
            self.metrics.certificate_write_failed(&cert.domain);
            return Err(DomainFailure {
                domain: cert.domain.clone(),
                operation: Operation::Write,
                message: e.to_string(),
            });
        }

        self.metrics.certificate_written(&cert.domain);
        if let Ok(expiry) = cert.expiry() {
            self.metrics.certificate_expiry(&cert.domain, expiry);
        }
        Ok(())
    }
}

impl fmt::Debug for DomainScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainScheduler")
            .field("policy", &self.policy)
            .field("max_workers", &self.max_workers)
            .finish()
    }
}
