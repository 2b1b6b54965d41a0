use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::{RoadConfig, TurnConfig};
use crate::error::{is_valid_segment, RoadError};
use crate::rooms::{BatchEntry, JoinOutcome, PollReply, RoomStore};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RoomStore>,
    pub turn: Option<TurnConfig>,
}

impl AppState {
    pub fn new(config: &RoadConfig) -> Self {
        Self {
            store: Arc::new(RoomStore::new(config.max_clients)),
            turn: config.turn.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct JoinResponse {
    peer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    turn: Option<TurnConfig>,
}

#[derive(Debug, Serialize)]
struct RoomStats {
    num_clients: usize,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    full: bool,
}

pub fn router(config: &RoadConfig, state: AppState) -> Router {
    let prefix = config.route_prefix();
    Router::new()
        .route("/health", get(health))
        .route(&format!("{prefix}/:room"), get(join))
        .route(&format!("{prefix}/:room/:peer"), post(poll))
        .route(&format!("{prefix}/:room/:peer/connected"), post(connected))
        .route(&format!("{prefix}/:room/:peer/disconnected"), post(disconnected))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn check_room(room: &str) -> Result<(), RoadError> {
    if is_valid_segment(room) {
        Ok(())
    } else {
        Err(RoadError::InvalidRoom(room.to_string()))
    }
}

fn check_peer(peer: &str) -> Result<(), RoadError> {
    if is_valid_segment(peer) {
        Ok(())
    } else {
        Err(RoadError::InvalidPeer(peer.to_string()))
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "rooms": state.store.room_count() }))
}

async fn join(
    State(state): State<AppState>,
    Path(room): Path<String>,
) -> Result<Json<JoinResponse>, RoadError> {
    check_room(&room)?;
    let peer = Uuid::new_v4().to_string();
    tracing::debug!(target = "road", room = %room, peer = %peer, "issued peer id");
    Ok(Json(JoinResponse {
        peer,
        turn: state.turn.clone(),
    }))
}

async fn connected(
    State(state): State<AppState>,
    Path((room, peer)): Path<(String, String)>,
) -> Result<Json<RoomStats>, RoadError> {
    check_room(&room)?;
    check_peer(&peer)?;
    let stats = match state.store.connect(&room, &peer) {
        JoinOutcome::Joined { num_clients } => RoomStats {
            num_clients,
            full: false,
        },
        JoinOutcome::Full { num_clients } => RoomStats {
            num_clients,
            full: true,
        },
    };
    Ok(Json(stats))
}

async fn disconnected(
    State(state): State<AppState>,
    Path((room, peer)): Path<(String, String)>,
) -> Result<Json<RoomStats>, RoadError> {
    check_room(&room)?;
    check_peer(&peer)?;
    let num_clients = state.store.disconnect(&room, &peer);
    Ok(Json(RoomStats {
        num_clients,
        full: false,
    }))
}

async fn poll(
    State(state): State<AppState>,
    Path((room, peer)): Path<(String, String)>,
    body: String,
) -> Result<Json<Value>, RoadError> {
    check_room(&room)?;
    check_peer(&peer)?;
    let batch = parse_batch(&body)?;
    let reply = match state.store.poll(&room, &peer, batch) {
        PollReply::Messages(messages) => Value::from(messages),
        PollReply::Disconnected => json!({ "state": "disconnected" }),
    };
    Ok(Json(reply))
}

/// An empty body is a plain poll. A bare `{"type":"reconnect"}` is accepted as a one-entry
/// batch.
fn parse_batch(body: &str) -> Result<Vec<BatchEntry>, RoadError> {
    let body = body.trim();
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let value: Value =
        serde_json::from_str(body).map_err(|err| RoadError::MalformedBatch(err.to_string()))?;
    if value.is_object() {
        return Ok(vec![(None, value.to_string())]);
    }
    serde_json::from_value(value).map_err(|err| RoadError::MalformedBatch(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_forms() {
        assert!(parse_batch("").unwrap().is_empty());
        assert_eq!(
            parse_batch(r#"[[null,"{}"],["b","{\"seq\":1}"]]"#).unwrap(),
            vec![(None, "{}".to_string()), (Some("b".to_string()), r#"{"seq":1}"#.to_string())]
        );
        assert_eq!(
            parse_batch(r#"{"type":"reconnect"}"#).unwrap(),
            vec![(None, r#"{"type":"reconnect"}"#.to_string())]
        );
        assert!(matches!(parse_batch("[[1]]"), Err(RoadError::MalformedBatch(_))));
        assert!(matches!(parse_batch("{"), Err(RoadError::MalformedBatch(_))));
    }
}
