//! Routes the proxy uses to keep the server directory current.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use super::AppState;
use crate::directory::ServerDirectory;
use crate::models::ServerInfo;

#[derive(Debug, Serialize, Deserialize)]
pub struct PlayerCountUpdate {
    pub player_count: i32,
}

pub fn ingest_router() -> Router<AppState> {
    Router::new().route("/servers", get(list_servers)).route(
        "/servers/:name",
        get(get_server)
            .post(register_server)
            .put(update_player_count)
            .delete(unregister_server),
    )
}

async fn list_servers(State(state): State<AppState>) -> Json<Vec<ServerInfo>> {
    Json(state.directory.snapshot())
}

async fn get_server(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.directory.player_count(&name) {
        Some(player_count) => Json(ServerInfo { name, player_count }).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Server {} not found", name) })),
        )
            .into_response(),
    }
}

async fn register_server(State(state): State<AppState>, Path(name): Path<String>) -> StatusCode {
    if state.directory.register(name.clone()) {
        info!("Registered server {}", name);
        StatusCode::CREATED
    } else {
        StatusCode::OK
    }
}

async fn update_player_count(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(update): Json<PlayerCountUpdate>,
) -> Response {
    if update.player_count < 0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "player_count must not be negative" })),
        )
            .into_response();
    }

    debug!("Player count of {} is now {}", name, update.player_count);
    state.directory.set_player_count(name, update.player_count);
    StatusCode::NO_CONTENT.into_response()
}

async fn unregister_server(State(state): State<AppState>, Path(name): Path<String>) -> StatusCode {
    if state.directory.unregister(&name) {
        info!("Unregistered server {}", name);
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
