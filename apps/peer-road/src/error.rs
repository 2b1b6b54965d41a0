use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoadError {
    #[error("invalid room name {0:?}")]
    InvalidRoom(String),
    #[error("invalid peer id {0:?}")]
    InvalidPeer(String),
    #[error("malformed message batch: {0}")]
    MalformedBatch(String),
}

impl IntoResponse for RoadError {
    fn into_response(self) -> Response {
        tracing::warn!(target = "road", error = %self, "rejecting request");
        let body = Json(json!({ "error": self.to_string() }));
        (StatusCode::BAD_REQUEST, body).into_response()
    }
}

/// Room names and peer ids are path segments: non-empty ASCII letters, digits, `_` or `-`.
pub fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment.len() <= 128
        && segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}
