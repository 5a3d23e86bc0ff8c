use clap::{Parser, Subcommand};
use qbgate::credential::CredentialStore;
use qbgate::manager::ProxyLifecycleManager;
use qbgate::probe::PgrepProbe;
use qbgate::registry::ProxyRegistry;
use qbgate::scanner::{CredentialScanner, EVENT_QUEUE_DEPTH};
use qbgate::single::{self, SingleProxyConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "qbgate",
    version,
    about = "Credential-injecting reverse proxy for per-user qBittorrent unix sockets"
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true, env = "DEBUG")]
    debug: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Discover per-user backends from the process table and proxy each one (default)
    Run,
    /// Proxy a single backend socket on a TCP port
    Single {
        /// Proxy listening port
        #[arg(short, long, default_value_t = 18080, env = "PORT")]
        port: u16,
        /// Backend unix domain socket path
        #[arg(long, default_value = "/home/admin/qbt.sock", env = "UDS")]
        uds: String,
        /// File the backend secret is read from
        #[arg(long = "pf", default_value = "/home/admin/qb-pwd", env = "PWD_FILE")]
        secret_file: PathBuf,
        /// Gate password; if not set, any password is accepted
        #[arg(long, env = "PASSWORD")]
        password: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let directive = if cli.debug { "qbgate=debug" } else { "qbgate=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().expect("valid log directive")),
        )
        .init();

    // One process-wide shutdown signal: flipped by SIGINT/SIGTERM, observed
    // by the scanner, the lifecycle manager and every endpoint.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_engine(shutdown_rx).await,
        Command::Single {
            port,
            uds,
            secret_file,
            password,
        } => {
            single::run(
                SingleProxyConfig {
                    port,
                    backend_sock: uds,
                    secret_file,
                    gate_password: password,
                },
                shutdown_rx,
            )
            .await
        }
    }
}

async fn run_engine(shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
    info!("Starting multi-tenant proxy engine");

    let store = CredentialStore::new();
    let registry = ProxyRegistry::new();
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

    let scanner = CredentialScanner::new(PgrepProbe, Arc::clone(&store), event_tx);
    let scanner_handle = tokio::spawn(scanner.run(shutdown_rx.clone()));

    let manager = ProxyLifecycleManager::new(Arc::clone(&registry), store);
    let manager_handle = tokio::spawn(manager.run(event_rx, shutdown_rx));

    // The manager sweeps all endpoints on shutdown before its task exits.
    let _ = scanner_handle.await;
    let _ = manager_handle.await;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C)");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C");
    }
}
