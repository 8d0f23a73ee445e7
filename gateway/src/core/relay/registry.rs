//! Table of connected client sessions.
//!
//! The gateway inserts and removes entries; the dispatcher only reads
//! outbound senders from it.

use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::messages::ClientRoute;
use crate::core::realtime::ClientId;

/// A connected client transport.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub id: ClientId,
    /// Outbound channel drained by the client's transport task
    pub sender: mpsc::Sender<ClientRoute>,
    /// Cancelled when the client goes away
    pub cancel: CancellationToken,
    pub connected_at: Instant,
}

/// DashMap-backed registry of client sessions.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: DashMap<ClientId, ClientSession>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, replacing any previous entry with the same id.
    pub fn insert(&self, session: ClientSession) {
        if let Some(old) = self.clients.insert(session.id, session) {
            debug!(client_id = %old.id, "Replaced existing client session");
            old.cancel.cancel();
        }
    }

    /// Remove a session and cancel its token.
    pub fn remove(&self, id: &ClientId) -> Option<ClientSession> {
        self.clients.remove(id).map(|(_, session)| {
            session.cancel.cancel();
            session
        })
    }

    pub fn get(&self, id: &ClientId) -> Option<ClientSession> {
        self.clients.get(id).map(|entry| entry.clone())
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.contains_key(id)
    }

    /// Outbound sender for one client.
    pub fn sender(&self, id: &ClientId) -> Option<mpsc::Sender<ClientRoute>> {
        self.clients.get(id).map(|entry| entry.sender.clone())
    }

    /// Snapshot of every client's outbound sender.
    pub fn senders(&self) -> Vec<(ClientId, mpsc::Sender<ClientRoute>)> {
        self.clients
            .iter()
            .map(|entry| (*entry.key(), entry.sender.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Remove every session, cancelling their tokens.
    pub fn drain(&self) -> Vec<ClientSession> {
        let ids: Vec<ClientId> = self.clients.iter().map(|entry| *entry.key()).collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }
}
