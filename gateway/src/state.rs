//! Shared application state for the HTTP layer

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::core::realtime::ConnectionState;
use crate::core::relay::{ClientGateway, RelaySupervisor};

/// State handed to every axum handler
#[derive(Debug, Clone)]
pub struct AppState {
    /// Client entry point into the relay
    pub gateway: ClientGateway,
    /// Process-wide shutdown token
    pub shutdown: CancellationToken,
    /// Latest upstream connection state
    pub upstream_state: watch::Receiver<ConnectionState>,
}

impl AppState {
    pub fn new(supervisor: &RelaySupervisor) -> Arc<Self> {
        Arc::new(Self {
            gateway: supervisor.gateway().clone(),
            shutdown: supervisor.shutdown_token(),
            upstream_state: supervisor.state_watch(),
        })
    }
}
