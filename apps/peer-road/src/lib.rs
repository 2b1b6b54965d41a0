//! Rendezvous server for peer-data clients: hands out peer ids, tracks room presence, and
//! relays queued messages between clients that poll over plain HTTP.

pub mod config;
pub mod error;
pub mod rooms;
pub mod routes;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub use config::{RoadConfig, TurnConfig};
pub use error::RoadError;
pub use rooms::RoomStore;
pub use routes::{router, AppState};

/// Periodically drop clients that stopped polling.
pub fn spawn_reaper(store: Arc<RoomStore>, config: &RoadConfig) -> JoinHandle<()> {
    let ttl = config.client_ttl;
    let mut interval = tokio::time::interval(config.reap_interval());
    tokio::spawn(async move {
        loop {
            interval.tick().await;
            let reaped = store.reap(ttl);
            if !reaped.is_empty() {
                tracing::debug!(target = "road", count = reaped.len(), "reaped idle clients");
            }
        }
    })
}

/// Serve on `listener` until the task is dropped or the listener fails.
pub async fn serve(listener: TcpListener, config: RoadConfig) -> std::io::Result<()> {
    let state = AppState::new(&config);
    let reaper = spawn_reaper(Arc::clone(&state.store), &config);
    let app = router(&config, state);
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(target = "road", %addr, prefix = %config.route_prefix(), "peer-road listening");
    }
    let result = axum::serve(listener, app).await;
    reaper.abort();
    result
}
