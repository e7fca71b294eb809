//! meshtap - traffic recording and interception control plane

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use meshtap::cluster::KubeClusterClient;
use meshtap::config::ControlPlaneConfig;
use meshtap::kube_utils::create_client;
use meshtap::session::{spawn_sweeps, SessionManager};
use meshtap::store::{self, Stores};
use meshtap::telemetry::{init_telemetry, LogFormat, TelemetryConfig};

/// meshtap - record and intercept service traffic through an injected sidecar
#[derive(Parser, Debug)]
#[command(name = "meshtap", version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file; defaults apply when omitted
    #[arg(short = 'c', long = "config", env = "MESHTAP_CONFIG")]
    config: Option<PathBuf>,

    /// Path to a kubeconfig; in-cluster configuration is inferred otherwise
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "json")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control plane (default mode)
    ///
    /// Serves the HTTP API, re-arms auto-stops of persisted sessions and
    /// runs the background harvest.
    Serve(ServeArgs),

    /// Print the effective configuration as YAML and exit
    Config,
}

/// Serve mode arguments
#[derive(Parser, Debug, Default)]
struct ServeArgs {
    /// Listen address, overriding the configuration file
    #[arg(long, env = "MESHTAP_BIND")]
    bind: Option<SocketAddr>,

    /// Enable the orphan reconciliation sweep
    #[arg(long)]
    reconcile_orphans: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        format: cli.log_format,
        ..Default::default()
    })?;

    let config = match &cli.config {
        Some(path) => ControlPlaneConfig::from_file(path)?,
        None => ControlPlaneConfig::default(),
    };

    match cli.command {
        Some(Commands::Config) => {
            let yaml = serde_yaml::to_string(&config)
                .map_err(|e| anyhow::anyhow!("Failed to serialize config: {}", e))?;
            println!("{yaml}");
            Ok(())
        }
        Some(Commands::Serve(args)) => run_serve(config, cli.kubeconfig, args).await,
        None => run_serve(config, cli.kubeconfig, ServeArgs::default()).await,
    }
}

/// Run the control plane until SIGINT/SIGTERM
async fn run_serve(
    mut config: ControlPlaneConfig,
    kubeconfig: Option<PathBuf>,
    args: ServeArgs,
) -> anyhow::Result<()> {
    if args.reconcile_orphans {
        config.session.reconcile_orphans = true;
    }
    let addr: SocketAddr = match args.bind {
        Some(addr) => addr,
        None => config
            .api
            .bind_address
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", config.api.bind_address, e))?,
    };

    let client = create_client(kubeconfig.as_deref()).await?;
    let cluster = Arc::new(KubeClusterClient::new(client));
    let backend = store::connect(&config.store).await?;
    let stores = Stores::new(backend, &config.store);
    let manager = SessionManager::new(cluster, stores, &config)?;

    let recovered = manager.recover().await?;
    info!(
        rearmed = recovered.rearmed,
        stopped = recovered.stopped,
        "Startup recovery complete"
    );

    let shutdown = CancellationToken::new();
    let sweeps = spawn_sweeps(manager.clone(), shutdown.clone());

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    meshtap::api::serve(manager.clone(), addr, shutdown.clone()).await?;

    shutdown.cancel();
    manager.scheduler().cancel_all();
    if let Err(e) = sweeps.await {
        warn!(error = %e, "Sweep task ended abnormally");
    }
    info!("meshtap stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM, waiting for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
