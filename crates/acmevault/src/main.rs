//! acmevault - main entry point
//!
//! `server` issues and renews certificates, `client` installs one of them on
//! the local machine. Both authenticate against the secrets store first.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use acmevault::http::{serve_http, HttpState};
use acmevault::{
    cancel_on_signal, AcmeVaultServer, CertificateClient, VaultSession, STARTUP_TIMEOUT,
};
use acmevault_common::{init_tracing, LogFormat, MetricsCollector, PrometheusCollector};
use acmevault_config::Config;

/// acmevault - ACME certificates with Vault as trust anchor and store
#[derive(Parser, Debug)]
#[command(name = "acmevault")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path (JSON or YAML)
    #[arg(short = 'c', long = "config", env = "ACMEVAULT_CONFIG", global = true)]
    config: Option<String>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Log output format: text or json
    #[arg(long = "log-format", default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Issue and renew the configured certificates
    Server,
    /// Write a certificate from the secrets store to local files
    Client,
    /// Validate the configuration file and exit
    Test,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let config_path = cli
        .config
        .context("No configuration file given, use --config or ACMEVAULT_CONFIG")?;
    info!(path = %config_path, "Loading configuration");
    let config = Config::from_file(&config_path).context("Failed to load configuration file")?;

    if let Commands::Test = cli.command {
        return test_config(&config_path, &config);
    }
    config.validate().context("Configuration validation failed")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    match cli.command {
        Commands::Server => runtime.block_on(run_server(config)),
        Commands::Client => runtime.block_on(run_client(config)),
        Commands::Test => Ok(()),
    }
}

fn test_config(path: &str, config: &Config) -> Result<()> {
    config.validate().context("Configuration validation failed")?;
    for warning in config.lint() {
        warn!("{}", warning);
    }
    config.log_summary();

    println!("acmevault: configuration file {} test is successful", path);
    Ok(())
}

async fn run_server(config: Config) -> Result<()> {
    let server_config = config
        .require_server()
        .context("Configuration has no server section")?
        .clone();

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());
    let (metrics, http) = start_metrics(&config, &cancel)?;

    let session = VaultSession::establish(&config.vault, Arc::clone(&metrics), STARTUP_TIMEOUT)
        .await
        .context("Failed to log in to the secrets store")?;
    http.set_ready(true);

    let server = AcmeVaultServer::bootstrap(server_config, session, metrics)
        .await
        .context("Failed to start the ACME server")?;

    info!("acmevault server started");
    server.run(cancel.clone()).await;
    cancel.cancel();
    Ok(())
}

async fn run_client(config: Config) -> Result<()> {
    let client_config = config
        .require_client()
        .context("Configuration has no client section")?
        .clone();

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());
    let (metrics, http) = start_metrics(&config, &cancel)?;

    let session = VaultSession::establish(&config.vault, Arc::clone(&metrics), STARTUP_TIMEOUT)
        .await
        .context("Failed to log in to the secrets store")?;
    http.set_ready(true);

    let client = CertificateClient::new(&client_config, session.backend(), metrics);
    let interval = client_config.interval_seconds.map(Duration::from_secs);
    let result = client.run(interval, cancel.clone()).await;

    session.close().await;
    cancel.cancel();

    if let Err(e) = &result {
        error!(domain = %client_config.domain, error = %e, "Certificate update failed");
    }
    result.context("Certificate update failed")
}

/// Build the collector and serve it when a metrics address is configured
fn start_metrics(
    config: &Config,
    cancel: &CancellationToken,
) -> Result<(Arc<dyn MetricsCollector>, HttpState)> {
    let collector = Arc::new(PrometheusCollector::new().context("Failed to register metrics")?);
    let state = HttpState::new(Arc::clone(&collector));

    if let Some(addr) = config.metrics_addr() {
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("Invalid metrics address '{}'", addr))?;
        let state = state.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_http(addr, state, cancel).await {
                error!(addr = %addr, error = %e, "Metrics endpoint failed");
            }
        });
    }

    Ok((collector, state))
}
