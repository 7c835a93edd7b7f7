use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

use crate::domain::state::{AgentState, AgentStatus};

/// Shared application state for all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<AgentState>,
}

#[derive(Debug, Serialize)]
pub struct AgentHealth {
    pub status: &'static str,
    pub version: String,
    pub uptime_secs: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/status", get(status))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<AgentHealth> {
    Json(AgentHealth {
        status: "ok",
        version: state.agent.version().to_string(),
        uptime_secs: state.agent.uptime_secs(),
    })
}

async fn status(State(state): State<AppState>) -> Json<AgentStatus> {
    Json(state.agent.status().await)
}
