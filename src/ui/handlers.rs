//! HTTP API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::catalog::merged_library;
use crate::error::{Error, StreamError, ZoneError};
use crate::node::NodeStatus;
use crate::protocol::{Peer, StreamCommand, Track, ZoneEntry, ZoneId};
use crate::streaming::SessionInfo;
use crate::ui::server::AppState;

/// API response wrapper
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Node status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<NodeStatus>> {
    Json(ApiResponse::ok(state.node.status()))
}

/// Every known peer, local one included
pub async fn get_peers(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<Peer>>> {
    Json(ApiResponse::ok(state.node.registry().all()))
}

/// Merged library of every peer
pub async fn get_library(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<Track>>> {
    Json(ApiResponse::ok(merged_library(&state.node.registry().all())))
}

pub async fn get_sessions(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<SessionInfo>>> {
    Json(ApiResponse::ok(state.node.coordinator().sessions()))
}

pub async fn get_zones(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<ZoneEntry>>> {
    Json(ApiResponse::ok(state.node.zones().snapshot()))
}

pub async fn get_zone(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ZoneId>,
) -> (StatusCode, Json<ApiResponse<ZoneEntry>>) {
    match state.node.zones().properties_of(id) {
        Ok(properties) => (
            StatusCode::OK,
            Json(ApiResponse::ok(ZoneEntry { zone: id, properties })),
        ),
        Err(e) => (StatusCode::NOT_FOUND, Json(ApiResponse::error(e.to_string()))),
    }
}

/// Play, pause, skip or stop a zone
pub async fn zone_action(
    State(state): State<Arc<AppState>>,
    Path((id, action)): Path<(ZoneId, String)>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    let command = match parse_action(&action) {
        Some(command) => command,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error(format!("unknown action '{}'", action))),
            )
        }
    };

    match state.node.request(id, command).await {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::ok(()))),
        Err(e) => (status_for(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

fn parse_action(action: &str) -> Option<StreamCommand> {
    match action.to_ascii_lowercase().as_str() {
        "play" => Some(StreamCommand::Play),
        "pause" | "stop" => Some(StreamCommand::Pause),
        "next" => Some(StreamCommand::Next),
        "teardown" => Some(StreamCommand::Teardown),
        _ => None,
    }
}

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::Zone(ZoneError::UnknownZone(_)) => StatusCode::NOT_FOUND,
        Error::Stream(StreamError::EmptyQueue(_)) => StatusCode::CONFLICT,
        Error::Stream(StreamError::PoolFull(_)) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Registry(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::network::memory::{MemoryHub, MemoryLinks};
    use crate::node::{Node, StreamBackends};
    use crate::codec::ChunkedFileCodec;
    use crate::streaming::MulticastScanner;

    fn state() -> Arc<AppState> {
        let hub = MemoryHub::new();
        let backends = StreamBackends {
            allocator: Arc::new(MulticastScanner::with_check(4, |_| Ok(false))),
            codec: Arc::new(ChunkedFileCodec::new(256, 64, None)),
            links: Arc::new(MemoryLinks::new()),
        };
        let node = Node::new(AppConfig::default(), hub.join("ui"), backends).unwrap();
        Arc::new(AppState { node })
    }

    #[test]
    fn test_parse_action() {
        assert_eq!(parse_action("PLAY"), Some(StreamCommand::Play));
        assert_eq!(parse_action("stop"), Some(StreamCommand::Pause));
        assert_eq!(parse_action("rewind"), None);
    }

    #[tokio::test]
    async fn test_zone_routes() {
        let state = state();
        let zone = state.node.local_zone().unwrap();

        let Json(zones) = get_zones(State(state.clone())).await;
        assert_eq!(zones.data.unwrap().len(), 1);

        let (status, _) = get_zone(State(state.clone()), Path(zone)).await;
        assert_eq!(status, StatusCode::OK);
        let (status, Json(body)) = get_zone(State(state.clone()), Path(ZoneId::new())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(!body.success);
    }

    #[tokio::test]
    async fn test_play_on_empty_zone_conflicts() {
        let state = state();
        let zone = state.node.local_zone().unwrap();

        let (status, Json(body)) = zone_action(State(state.clone()), Path((zone, "play".to_string()))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body.error.is_some());

        let (status, _) = zone_action(State(state), Path((zone, "rewind".to_string()))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
