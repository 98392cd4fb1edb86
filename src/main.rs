use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use kadroute::clock::{Clock, SystemClock};
use kadroute::http::routing_router;
use kadroute::routing::RoutingTable;
use kadroute::store::RecordStore;
use kadroute::tcp::{TcpNetwork, serve};
use kadroute::{DhtConfig, DhtNode, Keypair, PeerId, PeerRecord, ProtocolAdapter};

#[derive(Clone, Debug)]
struct BootstrapPeer {
    addr: SocketAddr,
    id: PeerId,
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr_part, id_part) = s
            .rsplit_once('/')
            .context("bootstrap peer must include its id (format: IP:PORT/PEER_ID)")?;
        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;
        let id: PeerId = id_part.parse().context("invalid peer id")?;
        Ok(BootstrapPeer { addr, id })
    }
}

#[derive(Parser, Debug)]
#[command(name = "kadroute")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// DHT listen address.
    #[arg(short, long, default_value = "0.0.0.0:4001")]
    listen: SocketAddr,

    /// Address advertised to other peers; defaults to the listen address.
    #[arg(long)]
    announce: Option<String>,

    /// Routing HTTP API listen address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    http: SocketAddr,

    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<BootstrapPeer>,

    /// Hex Ed25519 secret key; a fresh identity is generated if absent.
    #[arg(long, value_name = "HEX")]
    secret_key: Option<String>,

    #[arg(long)]
    k: Option<usize>,

    #[arg(long)]
    alpha: Option<usize>,

    #[arg(short, long, default_value = "300")]
    stats_interval: u64,
}

fn load_config(args: &Args) -> Result<DhtConfig> {
    let mut config = match &args.config {
        Some(path) => DhtConfig::from_toml_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => DhtConfig::default(),
    };
    config.apply_env_overrides().context("applying environment overrides")?;
    if let Some(k) = args.k {
        config.k = k;
    }
    if let Some(alpha) = args.alpha {
        config.alpha = alpha;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn load_keypair(secret: Option<&str>) -> Result<Keypair> {
    let Some(secret) = secret else {
        return Ok(Keypair::generate());
    };
    let bytes: [u8; 32] = hex::decode(secret)
        .context("secret key is not hex")?
        .try_into()
        .map_err(|_| anyhow::anyhow!("secret key must be 32 bytes"))?;
    Ok(Keypair::from_secret_key_bytes(&bytes))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&args)?;
    let keypair = load_keypair(args.secret_key.as_deref())?;

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding DHT listener on {}", args.listen))?;
    let bound = listener.local_addr().context("DHT listener address")?;
    let announce = args.announce.clone().unwrap_or_else(|| bound.to_string());
    let local = PeerRecord::new(keypair.peer_id(), vec![announce]);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let store = Arc::new(RecordStore::new(Arc::clone(&clock), config.store_limits()));
    let routing = Arc::new(RoutingTable::new(local.id, config.k, Arc::clone(&clock)));
    let network = Arc::new(TcpNetwork::new(local.clone(), Arc::clone(&store), Arc::clone(&routing)));
    let node = DhtNode::from_parts(local, network, config, clock, Arc::clone(&store), routing);
    info!(peer_id = %node.peer_id(), addr = %bound, "node identity");

    let shutdown = node.shutdown_token().clone();
    let dht_server = tokio::spawn(serve(listener, Arc::new(node.clone()), shutdown.clone()));

    if !args.bootstrap.is_empty() {
        let mut seeds = Vec::with_capacity(args.bootstrap.len());
        for peer in &args.bootstrap {
            let record = PeerRecord::new(peer.id, vec![peer.addr.to_string()]);
            store.put_peer_record(record.clone()).await;
            seeds.push(record);
        }
        match node.bootstrap(seeds).await {
            Ok(peers) => info!(peers, "bootstrap complete"),
            Err(e) => warn!(error = %e, "bootstrap failed"),
        }
    }

    let maintenance = node.spawn_maintenance();

    let http_listener = TcpListener::bind(args.http)
        .await
        .with_context(|| format!("binding HTTP listener on {}", args.http))?;
    info!(addr = %args.http, "routing API listening");
    let app = routing_router(ProtocolAdapter::new(node.clone()).into_shared());
    let http_shutdown = shutdown.clone();
    let http_server = tokio::spawn(async move {
        axum::serve(http_listener, app)
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .await
    });

    let mut interval = time::interval(Duration::from_secs(args.stats_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                info!(
                    routing_peers = node.routing().len().await,
                    provider_keys = node.store().provider_key_count().await,
                    peer_records = node.store().peer_record_count().await,
                    "routing snapshot"
                );
            }
        }
    }

    node.shutdown();
    let _ = maintenance.await;
    dht_server.await.context("DHT listener task")??;
    http_server.await.context("HTTP server task")?.context("HTTP server")?;
    Ok(())
}
