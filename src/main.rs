//! DWC Master Server
//!
//! Runs the registry and the client-facing front-ends, either as separate
//! processes sharing a registry over RPC or all together in one process.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::net::UdpSocket;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dwc_master::{
    network::{ProfileDirectory, StaticProfileDirectory},
    registry::{snapshot, RegistryServer},
    BrowserServer, NatNegServer, QrServer, Registry, RegistryApi, RemoteRegistry, SecretKeyTable,
    ServerConfig, VERSION,
};

/// Matchmaking master server for DWC games
#[derive(Parser)]
#[command(name = "dwc-master", version)]
#[command(about = "Server registry, QR heartbeats, server browser and NAT negotiation")]
struct Cli {
    /// Secret key table (overrides DWC_GSLIST)
    #[arg(long, global = true)]
    gslist: Option<PathBuf>,

    /// Profile platform table (overrides DWC_PROFILES)
    #[arg(long, global = true)]
    profiles: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the shared registry over TCP
    Registry,

    /// QR heartbeat server (UDP)
    Qr,

    /// Server browser (TCP)
    Browser,

    /// NAT negotiation relay (UDP)
    Natneg,

    /// Every service in one process with an in-memory registry
    All,

    /// Print a redacted JSON snapshot of a running registry
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = ServerConfig::from_env().context("Failed to read configuration")?;
    if let Some(path) = cli.gslist {
        config.gslist = path;
    }
    if let Some(path) = cli.profiles {
        config.profiles = Some(path);
    }

    if !matches!(cli.command, Commands::Stats) {
        info!("DWC master server v{}", VERSION);
    }

    match cli.command {
        Commands::Registry => run_registry(&config).await,
        Commands::Qr => run_qr(&config).await,
        Commands::Browser => run_browser(&config).await,
        Commands::Natneg => run_natneg(&config).await,
        Commands::All => run_all(&config).await,
        Commands::Stats => print_stats(&config).await,
    }
}

fn load_keys(config: &ServerConfig) -> Result<Arc<SecretKeyTable>> {
    let keys = SecretKeyTable::load(&config.gslist)
        .with_context(|| format!("Failed to load game keys from {}", config.gslist.display()))?;
    Ok(Arc::new(keys))
}

fn load_profiles(config: &ServerConfig) -> Result<Arc<dyn ProfileDirectory>> {
    match &config.profiles {
        Some(path) => Ok(Arc::new(StaticProfileDirectory::load(path)?)),
        None => Ok(Arc::new(StaticProfileDirectory::new())),
    }
}

fn remote_registry(config: &ServerConfig) -> Arc<dyn RegistryApi> {
    info!("Using registry at {}", config.registry_addr);
    Arc::new(RemoteRegistry::new(config.registry_addr))
}

async fn run_registry(config: &ServerConfig) -> Result<()> {
    let server = RegistryServer::new(config.registry_addr, Arc::new(Registry::new()));
    server.run().await?;
    Ok(())
}

async fn run_qr(config: &ServerConfig) -> Result<()> {
    let qr = Arc::new(QrServer::new(
        config,
        remote_registry(config),
        load_keys(config)?,
        load_profiles(config)?,
    ));
    qr.run().await?;
    Ok(())
}

async fn run_browser(config: &ServerConfig) -> Result<()> {
    // Without the QR socket, forwarded messages leave from an ephemeral port.
    let forward = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
    warn!(
        "Browser running standalone, forwarding messages from {}",
        forward.local_addr()?
    );

    let browser = BrowserServer::new(config, remote_registry(config), load_keys(config)?, forward);
    browser.run().await?;
    Ok(())
}

async fn run_natneg(config: &ServerConfig) -> Result<()> {
    let natneg = Arc::new(NatNegServer::new(config, remote_registry(config)));
    natneg.run().await?;
    Ok(())
}

async fn run_all(config: &ServerConfig) -> Result<()> {
    let store = Arc::new(Registry::new());
    let registry: Arc<dyn RegistryApi> = store.clone();
    let keys = load_keys(config)?;

    let registry_server = RegistryServer::new(config.registry_addr, store);
    let qr = Arc::new(QrServer::new(config, registry.clone(), keys.clone(), load_profiles(config)?));
    let qr_socket = qr.bind().await?;
    let browser = BrowserServer::new(config, registry.clone(), keys, qr_socket.clone());
    let natneg = Arc::new(NatNegServer::new(config, registry));

    tokio::select! {
        result = registry_server.run() => result?,
        result = qr.clone().serve(qr_socket) => result?,
        result = browser.run() => result?,
        result = natneg.clone().run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            registry_server.shutdown();
            qr.shutdown();
            browser.shutdown();
            natneg.shutdown();
        }
    }

    Ok(())
}

async fn print_stats(config: &ServerConfig) -> Result<()> {
    let registry = RemoteRegistry::new(config.registry_addr);
    let all = registry
        .get_all()
        .await
        .with_context(|| format!("Failed to query registry at {}", config.registry_addr))?;

    println!("{}", serde_json::to_string_pretty(&snapshot(&all, Utc::now()))?);
    Ok(())
}
