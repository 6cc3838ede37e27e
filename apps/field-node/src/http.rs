use crate::stats::{NodeStats, StatusSnapshot};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpState {
    pub stats: Arc<NodeStats>,
    pub node_name: String,
    pub version: String,
}

#[derive(Debug, serde::Serialize)]
struct StatusResponse {
    node_name: String,
    version: String,
    #[serde(flatten)]
    stats: StatusSnapshot,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_status(State(state): State<HttpState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        node_name: state.node_name.clone(),
        version: state.version.clone(),
        stats: state.stats.snapshot(),
    })
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .with_state(state)
}
