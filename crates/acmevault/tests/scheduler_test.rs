//! Certificate check runs against an in-memory store and a recording dealer

mod common;

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as Days;
use tokio_util::sync::CancellationToken;

use acmevault::acme::{DomainScheduler, Operation, RenewalPolicy};
use acmevault::CertificateSource;
use acmevault_common::NoopCollector;

use common::{domains, self_signed, shared, MemoryBackend, RecordingDealer};

fn scheduler(backend: Arc<MemoryBackend>, dealer: Arc<RecordingDealer>, workers: usize) -> DomainScheduler {
    let policy = RenewalPolicy::new(Days::days(30), Days::days(45), 0.0, Arc::new(NoopCollector));
    DomainScheduler::new(backend, dealer, Arc::new(policy), Arc::new(NoopCollector), workers)
}

#[tokio::test]
async fn test_missing_certificate_is_obtained_and_stored() {
    let backend = shared(MemoryBackend::default());
    let dealer = shared(RecordingDealer::default());

    let summary = scheduler(backend.clone(), dealer.clone(), 4)
        .check_certs(&domains(&["example.com"]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.obtained, 1);
    assert_eq!(dealer.obtained(), vec!["example.com"]);
    assert!(dealer.renewed().is_empty());
    assert_eq!(backend.writes(), 1);

    assert!(backend.public.lock().contains_key("example.com"));
    assert!(backend.private.lock().contains_key("example.com"));

    let stored = backend.read_full_certificate_data("example.com").await.unwrap();
    assert!(stored.private_key.is_some());
    assert!(stored.expiry().is_ok());
}

#[tokio::test]
async fn test_expiring_certificate_is_renewed() {
    let backend = shared(MemoryBackend::default().with_certificate(&self_signed(&["example.com"], 10)));
    let dealer = shared(RecordingDealer::default());

    let summary = scheduler(backend.clone(), dealer.clone(), 4)
        .check_certs(&domains(&["example.com"]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.renewed, 1);
    assert_eq!(summary.obtained, 0);
    assert_eq!(dealer.renewed(), vec!["example.com"]);
    assert!(dealer.obtained().is_empty());
    assert_eq!(backend.writes(), 1);
}

#[tokio::test]
async fn test_current_certificate_is_left_alone() {
    let backend = shared(MemoryBackend::default().with_certificate(&self_signed(&["example.com"], 90)));
    let dealer = shared(RecordingDealer::default());

    let summary = scheduler(backend.clone(), dealer.clone(), 4)
        .check_certs(&domains(&["example.com"]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.unchanged, 1);
    assert!(dealer.obtained().is_empty());
    assert!(dealer.renewed().is_empty());
    assert_eq!(backend.writes(), 0);
}

#[tokio::test]
async fn test_malformed_certificate_is_replaced() {
    let mut broken = self_signed(&["example.com"], 90);
    broken.certificate = b"not a certificate".to_vec();
    let backend = shared(MemoryBackend::default().with_certificate(&broken));
    let dealer = shared(RecordingDealer::default());

    let summary = scheduler(backend.clone(), dealer.clone(), 1)
        .check_certs(&domains(&["example.com"]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.obtained, 1);
    assert_eq!(dealer.obtained(), vec!["example.com"]);
    assert!(dealer.renewed().is_empty());
}

#[tokio::test]
async fn test_unreadable_certificate_is_obtained() {
    let backend = MemoryBackend::default().with_certificate(&self_signed(&["example.com"], 90));
    backend.reject_reads.lock().insert("example.com".to_string());
    let backend = shared(backend);
    let dealer = shared(RecordingDealer::default());

    let summary = scheduler(backend.clone(), dealer.clone(), 1)
        .check_certs(&domains(&["example.com"]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.obtained, 1);
    assert_eq!(backend.writes(), 1);
}

#[tokio::test]
async fn test_failed_write_is_reported() {
    let backend = MemoryBackend::default();
    backend.reject_writes.lock().insert("b.example.com".to_string());
    let backend = shared(backend);
    let dealer = shared(RecordingDealer::default());

    let err = scheduler(backend.clone(), dealer.clone(), 2)
        .check_certs(&domains(&["a.example.com", "b.example.com"]), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.failures.len(), 1);
    assert_eq!(err.failures[0].domain, "b.example.com");
    assert_eq!(err.failures[0].operation, Operation::Write);
    assert_eq!(err.summary.obtained, 1);
    assert_eq!(backend.writes(), 1);
}

#[tokio::test]
async fn test_every_domain_processed_once_with_bounded_workers() {
    let names: Vec<String> = (0..20).map(|i| format!("host{i}.example.com")).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let failing = ["host3.example.com", "host11.example.com", "host17.example.com"];

    let backend = MemoryBackend::default()
        .with_certificate(&self_signed(&["host0.example.com"], 10))
        .with_certificate(&self_signed(&["host1.example.com"], 90));
    let backend = shared(backend);
    let mut dealer = RecordingDealer::failing(&failing);
    dealer.latency = Some(Duration::from_millis(10));
    let dealer = shared(dealer);

    let err = scheduler(backend.clone(), dealer.clone(), 3)
        .check_certs(&domains(&refs), &CancellationToken::new())
        .await
        .unwrap_err();

    let mut issued = dealer.obtained();
    issued.extend(dealer.renewed());
    assert_eq!(issued.len(), 19);
    let unique: HashSet<_> = issued.iter().collect();
    assert_eq!(unique.len(), 19);
    assert!(!issued.contains(&"host1.example.com".to_string()));

    let failed: HashSet<_> = err.failures.iter().map(|f| f.domain.as_str()).collect();
    assert_eq!(failed, failing.into_iter().collect::<HashSet<_>>());
    assert!(err.failures.iter().all(|f| f.operation == Operation::Obtain));

    assert_eq!(err.summary.renewed, 1);
    assert_eq!(err.summary.unchanged, 1);
    assert_eq!(err.summary.obtained, 15);
    assert_eq!(err.summary.failed, 3);
    assert_eq!(err.summary.skipped, 0);
    assert_eq!(backend.writes(), 16);

    let peak = dealer.max_in_flight.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= 3, "peak concurrency was {peak}");
}

#[tokio::test]
async fn test_all_successful_run_is_ok() {
    let backend = shared(MemoryBackend::default());
    let dealer = shared(RecordingDealer::default());

    let summary = scheduler(backend, dealer, 8)
        .check_certs(&domains(&["a.example.com", "b.example.com", "c.example.com"]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.obtained, 3);
    assert_eq!(summary.failed, 0);
}

#[tokio::test]
async fn test_empty_domain_list() {
    let summary = scheduler(shared(MemoryBackend::default()), shared(RecordingDealer::default()), 4)
        .check_certs(&[], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary, Default::default());
}

#[tokio::test]
async fn test_cancellation_stops_picking_up_domains() {
    let cancel = CancellationToken::new();
    let backend = shared(MemoryBackend::default());
    let dealer = shared(RecordingDealer {
        cancel_on_first_call: Some(cancel.clone()),
        ..Default::default()
    });

    let summary = scheduler(backend.clone(), dealer.clone(), 1)
        .check_certs(
            &domains(&["a.example.com", "b.example.com", "c.example.com", "d.example.com"]),
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(summary.obtained, 1);
    assert_eq!(summary.skipped, 3);
    assert_eq!(dealer.obtained(), vec!["a.example.com"]);
    assert_eq!(backend.writes(), 1);
}

#[tokio::test]
async fn test_run_returns_on_cancellation() {
    let cancel = CancellationToken::new();
    let dealer = shared(RecordingDealer::default());
    let scheduler = scheduler(shared(MemoryBackend::default()), dealer.clone(), 2);

    let stop = cancel.clone();
    let handle = tokio::spawn(async move {
        scheduler
            .run(&domains(&["example.com"]), Duration::from_secs(3600), stop)
            .await;
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(dealer.obtained(), vec!["example.com"]);
}
