use axum::{Json, extract::State};
use serde::Serialize;
use std::sync::Arc;

use crate::core::realtime::ConnectionState;
use crate::state::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Current upstream connection state
    pub upstream: ConnectionState,
    /// Connected clients
    pub clients: usize,
}

/// Health check handler
///
/// Reports `ok` while the relay accepts clients. The upstream state is
/// informational since connections are opened on demand.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let status = if state.shutdown.is_cancelled() {
        "shutting_down"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status,
        upstream: *state.upstream_state.borrow(),
        clients: state.gateway.client_count(),
    })
}
