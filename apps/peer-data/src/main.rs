use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use peer_data::telemetry::init_tracing;
use peer_data::{ChannelEvent, Payload, PeerEvent, PeerSession, SignalConfig};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "peer-data")]
#[command(about = "Join a room and chat with every peer in it over a data channel")]
struct Cli {
    /// Rendezvous server base URL
    #[arg(long, env = "PEER_DATA_SERVER")]
    server: Option<String>,

    /// Room to join
    #[arg(long, env = "PEER_DATA_ROOM")]
    room: Option<String>,

    /// Path prefix of the polling endpoints
    #[arg(long, env = "PEER_DATA_PREFIX")]
    prefix: Option<String>,

    /// Channel label to send and print
    #[arg(long, default_value = "chat")]
    label: String,

    #[arg(long, env = "PEER_DATA_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    /// Use host candidates and relay-provided TURN only
    #[arg(long)]
    disable_stun: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "peer_data=info")]
    log: String,
}

impl Cli {
    fn config(&self) -> SignalConfig {
        let mut config = SignalConfig::from_env();
        if let Some(server) = &self.server {
            config.server = server.clone();
        }
        if let Some(room) = &self.room {
            config.room = room.clone();
        }
        if let Some(prefix) = &self.prefix {
            config.prefix = prefix.clone();
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poll_interval = Duration::from_millis(ms);
        }
        config.disable_stun |= self.disable_stun;
        config
    }
}

fn render(payload: &Payload) -> String {
    match payload {
        Payload::Text(text) => text.clone(),
        Payload::Structured(value) => value.to_string(),
        Payload::Binary(bytes) => format!("<{} bytes>", bytes.len()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log);

    let config = cli.config();
    let session = PeerSession::connect(&config)
        .await
        .with_context(|| format!("joining room {} at {}", config.room, config.server))?;
    let channel = session
        .channel(&cli.label)
        .await
        .with_context(|| format!("opening channel {}", cli.label))?;
    eprintln!(
        "joined {} as {}",
        config.room,
        session.local_peer().unwrap_or_else(|| "?".into())
    );

    let mut peer_events = session.subscribe();
    tokio::spawn(async move {
        while let Some(event) = peer_events.recv().await {
            match event {
                PeerEvent::Connected(handle) => eprintln!("* {} joined", handle.id),
                PeerEvent::Disconnected(handle) => eprintln!("* {} left", handle.id),
                PeerEvent::Error(err) => eprintln!("! {err}"),
                PeerEvent::Close => break,
                _ => {}
            }
        }
    });

    let mut channel_events = channel.subscribe();
    tokio::spawn(async move {
        while let Some(event) = channel_events.recv().await {
            match event {
                ChannelEvent::Message { from, payload } => println!("[{from}] {}", render(&payload)),
                ChannelEvent::Open => eprintln!("* channel open"),
                ChannelEvent::Close => eprintln!("* channel closed"),
                ChannelEvent::Error(err) => eprintln!("! {err}"),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match channel.send(line).await {
                    Ok(true) => {}
                    Ok(false) => eprintln!("! no peer is connected yet"),
                    Err(err) => eprintln!("! {err}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.close().await.context("closing session")?;
    Ok(())
}
