use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use peer_road::RoadConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "peer-road")]
#[command(about = "HTTP polling rendezvous server for peer-data")]
struct Cli {
    /// Address to bind
    #[arg(long, env = "PEER_ROAD_ADDR")]
    addr: Option<SocketAddr>,

    /// Path prefix of the polling endpoints
    #[arg(long, env = "PEER_ROAD_PREFIX")]
    prefix: Option<String>,

    /// Members allowed per room
    #[arg(long, env = "PEER_ROAD_MAX_CLIENTS")]
    max_clients: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = RoadConfig::from_env();
    if let Some(addr) = cli.addr {
        config.addr = addr;
    }
    if let Some(prefix) = cli.prefix {
        config.prefix = prefix;
    }
    if let Some(max_clients) = cli.max_clients.filter(|value| *value > 0) {
        config.max_clients = max_clients;
    }

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("binding {}", config.addr))?;
    tokio::select! {
        served = peer_road::serve(listener, config) => served.context("serving")?,
        _ = tokio::signal::ctrl_c() => tracing::info!(target = "road", "shutting down"),
    }
    Ok(())
}
