//! Issuing server: account bootstrap followed by the periodic certificate check.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use acmevault_common::MetricsCollector;
use acmevault_config::ServerConfig;

use crate::acme::{
    AcmeDealer, AcmeError, DomainScheduler, DynamicCredentialsProvider, InstantAcmeDealer,
    RenewalPolicy, CREDENTIALS_PROPAGATION_DELAY,
};
use crate::session::VaultSession;
use crate::vault::TrustBackend;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("ACME account bootstrap failed: {0}")]
    Bootstrap(#[source] AcmeError),

    #[error("ACME account registration failed: {0}")]
    Registration(#[source] AcmeError),

    #[error("Failed to set up the ACME dealer: {0}")]
    Setup(#[source] AcmeError),
}

pub struct AcmeVaultServer {
    config: ServerConfig,
    session: VaultSession,
    scheduler: DomainScheduler,
}

impl AcmeVaultServer {
    /// Build the dealer on the session's backend and make sure a registered
    /// ACME account exists
    pub async fn bootstrap(
        config: ServerConfig,
        session: VaultSession,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Result<Self, ServerError> {
        let backend: Arc<dyn TrustBackend> = session.backend();
        let credentials = DynamicCredentialsProvider::new(
            Arc::clone(&backend),
            CREDENTIALS_PROPAGATION_DELAY,
        );

        let dealer = InstantAcmeDealer::from_config(&config, Arc::clone(&backend), credentials)
            .await
            .map_err(ServerError::Setup)?;

        Self::with_dealer(config, session, Arc::new(dealer), metrics).await
    }

    /// Same as [`bootstrap`](Self::bootstrap) with a caller supplied dealer
    pub async fn with_dealer(
        config: ServerConfig,
        session: VaultSession,
        dealer: Arc<dyn AcmeDealer>,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Result<Self, ServerError> {
        let (account, is_new) = dealer
            .bootstrap(&config.email)
            .await
            .map_err(ServerError::Bootstrap)?;

        let account = if is_new {
            dealer
                .register_account()
                .await
                .map_err(ServerError::Registration)?
        } else {
            account
        };
        info!(email = %account.email, account = %account.uri, "ACME account ready");

        let policy = Arc::new(RenewalPolicy::from_config(&config, Arc::clone(&metrics)));
        let scheduler = DomainScheduler::new(
            session.backend(),
            dealer,
            policy,
            metrics,
            config.max_workers,
        );

        Ok(Self {
            config,
            session,
            scheduler,
        })
    }

    /// Check certificates until `cancel` fires, then end the session
    pub async fn run(self, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.config.interval_seconds);
        self.scheduler
            .run(&self.config.domains, interval, cancel)
            .await;

        info!("Shutting down");
        self.session.close().await;
    }
}

impl std::fmt::Debug for AcmeVaultServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeVaultServer")
            .field("email", &self.config.email)
            .field("domains", &self.config.domains.len())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

/// Cancel `token` on SIGINT or SIGTERM
pub fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for SIGINT");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = terminate => info!("Received SIGTERM"),
        }
        token.cancel();
    });
}
