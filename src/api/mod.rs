use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::directory::InMemoryDirectory;
use crate::service::PeakService;

pub mod control;
pub mod ingest;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PeakService>,
    pub directory: Arc<InMemoryDirectory>,
}

/// Full HTTP surface: queries and group management plus server ingest.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(control::control_router())
        .merge(ingest::ingest_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
