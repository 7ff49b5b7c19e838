use clap::{Parser, Subcommand};
use packice_core::{
    LeaseStore, LocalPeer, MemoryLeaseStore, Peer, PeerConfig, RedisLeaseStore, Result,
    TieredConfig, TieredPeer,
};
use packice_server::config::{Config, LeaseStoreBackend, TieredSection};
use packice_server::http::run_http_server;
use packice_server::uds::run_uds_server;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "packice")]
#[command(about = "Peer-to-peer object cache node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the peer node
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "packice=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config } => {
            tracing::info!("Starting Packice node with config: {}", config);

            let cfg = match Config::from_file(&config) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!("Failed to load config: {}", e);
                    std::process::exit(1);
                }
            };

            if let Err(e) = run_node(cfg).await {
                tracing::error!("Node error: {}", e);
                std::process::exit(1);
            }
        }
    }
}

async fn run_node(cfg: Config) -> Result<()> {
    let peer = build_peer(&cfg).await?;

    match &cfg.uds_path {
        Some(uds_path) => {
            let uds_path = uds_path.clone();
            tokio::try_join!(
                run_http_server(peer.clone(), &cfg.http_addr),
                run_uds_server(peer.clone(), &uds_path),
            )?;
        }
        None => run_http_server(peer, &cfg.http_addr).await?,
    }
    Ok(())
}

async fn build_peer(cfg: &Config) -> Result<Arc<dyn Peer>> {
    match &cfg.tiered {
        Some(tiered) => build_tiered_peer(cfg, tiered).await,
        None => {
            let lease_store = build_lease_store(cfg, "").await?;
            let peer = LocalPeer::new(cfg.peer_config()?, lease_store)?;
            peer.spawn_sweeper();
            Ok(peer)
        }
    }
}

/// Hot tier in memory, cold tier on disk. The tiers get separate lease
/// stores so a lease id routes to exactly one of them.
async fn build_tiered_peer(cfg: &Config, tiered: &TieredSection) -> Result<Arc<dyn Peer>> {
    let sweep = Duration::from_millis(cfg.peer.sweep_interval_ms);

    let hot = LocalPeer::new(
        PeerConfig::memory()
            .with_max_objects(tiered.hot_max_objects)
            .without_eviction()
            .with_sweep_interval(sweep),
        build_lease_store(cfg, "-hot").await?,
    )?;
    hot.spawn_sweeper();

    let cold = LocalPeer::new(
        PeerConfig::file(&tiered.cold_root).with_sweep_interval(sweep),
        build_lease_store(cfg, "-cold").await?,
    )?;
    cold.spawn_sweeper();

    let peer = TieredPeer::new(hot, cold).with_config(TieredConfig {
        demote_retries: tiered.demote_retries,
        promote_on_read: tiered.promote_on_read,
        promote_max_bytes: tiered.promote_max_bytes,
    });
    Ok(Arc::new(peer))
}

async fn build_lease_store(cfg: &Config, suffix: &str) -> Result<Arc<dyn LeaseStore>> {
    match cfg.lease_store.backend {
        LeaseStoreBackend::Memory => Ok(Arc::new(MemoryLeaseStore::new())),
        LeaseStoreBackend::Redis => {
            let url = cfg.lease_store.url.as_ref().ok_or_else(|| {
                packice_core::PackError::Config(
                    "lease_store.url is required for the redis backend".to_string(),
                )
            })?;
            let namespace = format!("{}{}", cfg.lease_store.namespace, suffix);
            let store = RedisLeaseStore::new(url, &namespace).await?;
            Ok(Arc::new(store))
        }
    }
}
