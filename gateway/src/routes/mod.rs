//! Router construction

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

pub mod api;
pub mod realtime;

/// Build the complete application router
pub fn create_router(state: Arc<AppState>) -> Router {
    api::create_api_router()
        .merge(realtime::create_realtime_router())
        .with_state(state)
}
