//! Session lifecycle: login with retry, then keep the lease alive.
//!
//! ```text
//! LoggingIn --ok--> Watching --(renewal failed | max TTL)--> LoggingIn
//!     |                                                         ^
//!     +--err--> backoff ----------------------------------------+
//! ```
//!
//! Exactly one loop runs per manager. The first successful login fires the
//! ready signal returned by [`TokenLifecycleManager::start`]; later logins
//! never signal again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use acmevault_common::MetricsCollector;

use super::client::VaultClient;
use crate::auth::{Authenticator, SessionInfo};

/// Default wait between failed logins
pub const DEFAULT_LOGIN_BACKOFF: Duration = Duration::from_secs(15);

/// Default share of the lease after which it is renewed
pub const DEFAULT_RENEW_FRACTION: f64 = 0.75;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Token lifecycle loop is already running")]
    AlreadyStarted,
}

/// Timing knobs of the lifecycle loop
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub login_backoff: Duration,
    /// Must be in (0, 1)
    pub renew_fraction: f64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            login_backoff: DEFAULT_LOGIN_BACKOFF,
            renew_fraction: DEFAULT_RENEW_FRACTION,
        }
    }
}

/// Notifications from a [`LeaseWatcher`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseEvent {
    /// Lease extended, `ttl` is the newly granted lifetime
    Renewed { ttl: Duration },
    /// Lease can no longer be extended
    Done { reason: String },
}

/// Keeps one authenticated session alive for the process lifetime
pub struct TokenLifecycleManager {
    auth: Arc<dyn Authenticator>,
    client: Arc<VaultClient>,
    metrics: Arc<dyn MetricsCollector>,
    config: LifecycleConfig,
    started: AtomicBool,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TokenLifecycleManager {
    pub fn new(
        auth: Arc<dyn Authenticator>,
        client: Arc<VaultClient>,
        metrics: Arc<dyn MetricsCollector>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            auth,
            client,
            metrics,
            config,
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Spawn the login/watch loop.
    ///
    /// The receiver resolves after the first successful login. It is dropped
    /// without a value if the loop is shut down before that.
    pub fn start(&self) -> Result<oneshot::Receiver<()>, LifecycleError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(LifecycleError::AlreadyStarted);
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let runner = LifecycleLoop {
            auth: Arc::clone(&self.auth),
            client: Arc::clone(&self.client),
            metrics: Arc::clone(&self.metrics),
            config: self.config.clone(),
            cancel: self.cancel.clone(),
        };

        info!(method = %self.auth.method(), "Starting token lifecycle manager");
        *self.task.lock() = Some(tokio::spawn(runner.run(ready_tx)));
        Ok(ready_rx)
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Stop the loop and wait for it to exit
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Token lifecycle task ended abnormally");
            }
        }
        debug!("Token lifecycle manager stopped");
    }
}

impl std::fmt::Debug for TokenLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenLifecycleManager")
            .field("method", &self.auth.method())
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("config", &self.config)
            .finish()
    }
}

struct LifecycleLoop {
    auth: Arc<dyn Authenticator>,
    client: Arc<VaultClient>,
    metrics: Arc<dyn MetricsCollector>,
    config: LifecycleConfig,
    cancel: CancellationToken,
}

impl LifecycleLoop {
    async fn run(self, ready: oneshot::Sender<()>) {
        let mut ready = Some(ready);
        let mut failures: u64 = 0;

        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = self.auth.login(&self.client) => result,
            };

            let session = match result {
                Ok(session) => session,
                Err(e) => {
                    failures += 1;
                    self.metrics.vault_login_failed();
                    warn!(
                        error = %e,
                        failures,
                        retry_in_secs = self.config.login_backoff.as_secs(),
                        "Login failed"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.config.login_backoff) => continue,
                    }
                }
            };

            failures = 0;
            self.client.set_token(session.token.clone());
            self.metrics.vault_login();
            info!(
                ttl_secs = session.ttl.as_secs(),
                renewable = session.renewable,
                "Logged in"
            );

            if let Some(tx) = ready.take() {
                let _ = tx.send(());
            }

            if !self.watch(&session).await {
                return;
            }
            debug!("Session ended, logging in again");
        }
    }

    /// Wait until the session has to be replaced. `false` when cancelled.
    async fn watch(&self, session: &SessionInfo) -> bool {
        if !session.renewable || session.ttl.is_zero() {
            if session.ttl.is_zero() {
                // Never expires
                self.cancel.cancelled().await;
                return false;
            }

            let wait = session.ttl.mul_f64(self.config.renew_fraction);
            debug!(wait_secs = wait.as_secs(), "Session is not renewable");
            return tokio::select! {
                _ = self.cancel.cancelled() => false,
                _ = tokio::time::sleep(wait) => true,
            };
        }

        let (tx, mut rx) = mpsc::channel(4);
        let watcher = LeaseWatcher::new(
            Arc::clone(&self.client),
            session.ttl,
            self.config.renew_fraction,
        );
        let handle = tokio::spawn(watcher.run(tx));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    handle.abort();
                    return false;
                }
                event = rx.recv() => match event {
                    Some(LeaseEvent::Renewed { ttl }) => {
                        self.metrics.vault_token_renewed(ttl);
                        debug!(ttl_secs = ttl.as_secs(), "Renewed token lease");
                    }
                    Some(LeaseEvent::Done { reason }) => {
                        info!(reason = %reason, "Token lease watcher finished");
                        return true;
                    }
                    None => return true,
                }
            }
        }
    }
}

/// Renews the session lease until it can no longer be extended
pub struct LeaseWatcher {
    client: Arc<VaultClient>,
    increment: Duration,
    fraction: f64,
}

impl LeaseWatcher {
    /// `increment` is the original lease duration, requested on every renewal
    pub fn new(client: Arc<VaultClient>, increment: Duration, fraction: f64) -> Self {
        Self {
            client,
            increment,
            fraction,
        }
    }

    pub async fn run(self, events: mpsc::Sender<LeaseEvent>) {
        let mut ttl = self.increment;

        loop {
            tokio::time::sleep(ttl.mul_f64(self.fraction)).await;

            let granted = match self.client.renew_self(self.increment).await {
                Ok(auth) => Duration::from_secs(auth.lease_duration),
                Err(e) => {
                    let _ = events
                        .send(LeaseEvent::Done {
                            reason: format!("renewal failed: {}", e),
                        })
                        .await;
                    return;
                }
            };

            if events
                .send(LeaseEvent::Renewed { ttl: granted })
                .await
                .is_err()
            {
                return;
            }

            if granted < self.increment {
                // Capped by the max TTL; use up what is left, then re-login
                tokio::time::sleep(granted.mul_f64(self.fraction)).await;
                let _ = events
                    .send(LeaseEvent::Done {
                        reason: "maximum lease TTL reached".to_string(),
                    })
                    .await;
                return;
            }

            ttl = granted;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthError;
    use acmevault_config::AuthMethod;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug)]
    struct FlakyAuth {
        failures_before_success: u32,
        attempts: AtomicU32,
        ttl: Duration,
    }

    #[async_trait]
    impl Authenticator for FlakyAuth {
        fn method(&self) -> AuthMethod {
            AuthMethod::Token
        }

        async fn login(&self, _client: &VaultClient) -> Result<SessionInfo, AuthError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.failures_before_success {
                return Err(AuthError::Missing("token"));
            }
            Ok(SessionInfo {
                token: format!("s.attempt-{}", attempt),
                ttl: self.ttl,
                renewable: false,
            })
        }

        async fn logout(&self, _client: &VaultClient) -> Result<(), AuthError> {
            Ok(())
        }
    }

    fn offline_client() -> Arc<VaultClient> {
        Arc::new(VaultClient::with_address("http://127.0.0.1:1", Duration::from_secs(1), 3).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_fires_after_first_success() {
        let auth = Arc::new(FlakyAuth {
            failures_before_success: 5,
            attempts: AtomicU32::new(0),
            ttl: Duration::ZERO,
        });
        let client = offline_client();
        let manager = TokenLifecycleManager::new(
            auth.clone(),
            client.clone(),
            Arc::new(acmevault_common::NoopCollector),
            LifecycleConfig::default(),
        );

        let mut ready = manager.start().unwrap();
        // Attempts at 0s to 60s have all failed, the sixth is due at 75s
        tokio::time::sleep(Duration::from_secs(4 * 15 + 5)).await;
        assert!(ready.try_recv().is_err());
        assert!(!client.has_token());

        ready.await.unwrap();
        assert_eq!(auth.attempts.load(Ordering::SeqCst), 6);
        assert!(client.has_token());
        assert!(manager.is_running());

        manager.shutdown().await;
        assert!(!manager.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_rejected() {
        let manager = TokenLifecycleManager::new(
            Arc::new(FlakyAuth {
                failures_before_success: 0,
                attempts: AtomicU32::new(0),
                ttl: Duration::ZERO,
            }),
            offline_client(),
            Arc::new(acmevault_common::NoopCollector),
            LifecycleConfig::default(),
        );

        let _ready = manager.start().unwrap();
        assert!(matches!(manager.start(), Err(LifecycleError::AlreadyStarted)));
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_renewable_session_relogs() {
        let auth = Arc::new(FlakyAuth {
            failures_before_success: 0,
            attempts: AtomicU32::new(0),
            ttl: Duration::from_secs(100),
        });
        let manager = TokenLifecycleManager::new(
            auth.clone(),
            offline_client(),
            Arc::new(acmevault_common::NoopCollector),
            LifecycleConfig::default(),
        );

        manager.start().unwrap().await.unwrap();
        // 75s per cycle
        tokio::time::sleep(Duration::from_secs(160)).await;
        assert_eq!(auth.attempts.load(Ordering::SeqCst), 3);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_lease_watcher_stops_at_max_ttl() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/token/renew-self"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "auth": { "client_token": "s.session", "lease_duration": 1, "renewable": true }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = Arc::new(
            VaultClient::with_address(&server.uri(), Duration::from_secs(5), 3).unwrap(),
        );
        client.set_token("s.session");

        let (tx, mut rx) = mpsc::channel(4);
        let watcher = LeaseWatcher::new(client, Duration::from_secs(2), 0.1);
        tokio::spawn(watcher.run(tx));

        assert_eq!(
            rx.recv().await,
            Some(LeaseEvent::Renewed {
                ttl: Duration::from_secs(1)
            })
        );
        assert!(matches!(rx.recv().await, Some(LeaseEvent::Done { .. })));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_lease_watcher_reports_failed_renewal() {
        let server = MockServer::start().await;
        Mock::given(path("/v1/auth/token/renew-self"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let client = Arc::new(
            VaultClient::with_address(&server.uri(), Duration::from_secs(5), 3).unwrap(),
        );
        client.set_token("s.session");

        let (tx, mut rx) = mpsc::channel(4);
        tokio::spawn(LeaseWatcher::new(client, Duration::from_secs(1), 0.1).run(tx));

        match rx.recv().await {
            Some(LeaseEvent::Done { reason }) => assert!(reason.contains("renewal failed")),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
