//! Realtime WebSocket route configuration

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::realtime::realtime_handler;
use crate::state::AppState;
use std::sync::Arc;

/// Create the Realtime WebSocket router
///
/// # Endpoint
///
/// `GET /realtime` - WebSocket upgrade; the connection becomes one relay
/// client
///
/// # Example
///
/// ```json
/// // Server greets the client
/// {"type": "connected", "client_id": "6f1c..."}
///
/// // Client sends audio as binary frames or as JSON
/// {"type": "audio_data", "audio": "UklGRi..."}
///
/// // Server sends synthesized audio as binary frames, then
/// {"type": "turn_done"}
/// ```
pub fn create_realtime_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/realtime", get(realtime_handler))
        .layer(TraceLayer::new_for_http())
}
