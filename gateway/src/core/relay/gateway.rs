//! Client gateway.
//!
//! Entry point for client transports. Registers client sessions and turns
//! audio chunks into commands for the upstream session worker. Nothing here
//! performs network I/O: submissions go through a bounded queue with
//! `try_send`, so a slow upstream never stalls a client handler.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::messages::{ClientRoute, OutgoingMessage};
use super::registry::{ClientRegistry, ClientSession};
use crate::core::realtime::{AudioChunk, ClientId, SessionConfig, UpstreamCommand};

/// Errors reported to client transports.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// The client is not registered
    #[error("Unknown client: {0}")]
    UnknownClient(ClientId),

    /// The upstream command queue is at capacity
    #[error("Upstream command queue is full")]
    QueueFull,

    /// The session worker has stopped
    #[error("Relay is not running")]
    RelayClosed,

    /// Shutdown has been requested
    #[error("Relay is shutting down")]
    ShuttingDown,
}

/// What to do with audio that arrives while no upstream connection is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotConnectedPolicy {
    /// Open a connection with the default session configuration and retry once
    #[default]
    Reopen,
    /// Drop the chunk with a warning. The relay keeps the connection open
    /// itself instead, at startup and after every completed turn.
    Drop,
}

impl FromStr for NotConnectedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "reopen" | "retry" => Ok(Self::Reopen),
            "drop" => Ok(Self::Drop),
            other => Err(format!(
                "unknown not-connected policy '{other}' (expected reopen or drop)"
            )),
        }
    }
}

impl fmt::Display for NotConnectedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reopen => write!(f, "reopen"),
            Self::Drop => write!(f, "drop"),
        }
    }
}

/// Accepts client lifecycle notifications and audio.
#[derive(Debug, Clone)]
pub struct ClientGateway {
    clients: Arc<ClientRegistry>,
    commands: mpsc::Sender<UpstreamCommand>,
    default_config: Arc<SessionConfig>,
    policy: NotConnectedPolicy,
    client_channel_capacity: usize,
    shutdown: CancellationToken,
}

impl ClientGateway {
    pub fn new(
        clients: Arc<ClientRegistry>,
        commands: mpsc::Sender<UpstreamCommand>,
        default_config: Arc<SessionConfig>,
        policy: NotConnectedPolicy,
        client_channel_capacity: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            clients,
            commands,
            default_config,
            policy,
            client_channel_capacity: client_channel_capacity.max(1),
            shutdown,
        }
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    pub fn default_config(&self) -> &Arc<SessionConfig> {
        &self.default_config
    }

    pub fn policy(&self) -> NotConnectedPolicy {
        self.policy
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Register a client and return the receiver its transport must drain.
    ///
    /// The first message on the receiver is always `Connected`.
    pub fn on_client_connect(
        &self,
        id: ClientId,
    ) -> Result<mpsc::Receiver<ClientRoute>, GatewayError> {
        if self.shutdown.is_cancelled() {
            return Err(GatewayError::ShuttingDown);
        }

        let (sender, receiver) = mpsc::channel(self.client_channel_capacity);
        let session = ClientSession {
            id,
            sender: sender.clone(),
            cancel: self.shutdown.child_token(),
            connected_at: Instant::now(),
        };
        self.clients.insert(session);

        // Fresh channel, capacity is at least one
        let _ = sender.try_send(ClientRoute::Outgoing(OutgoingMessage::Connected {
            client_id: id,
        }));

        info!(client_id = %id, clients = self.clients.len(), "Client connected");
        Ok(receiver)
    }

    /// Forget a client. Audio it already queued is skipped by the worker.
    pub fn on_client_disconnect(&self, id: ClientId) {
        match self.clients.remove(&id) {
            Some(session) => info!(
                client_id = %id,
                connected_ms = session.connected_at.elapsed().as_millis() as u64,
                clients = self.clients.len(),
                "Client disconnected"
            ),
            None => debug!(client_id = %id, "Disconnect for unknown client"),
        }
    }

    /// Submit one chunk of client audio without waiting on the upstream.
    pub fn on_audio_chunk(&self, id: ClientId, data: Bytes) -> Result<(), GatewayError> {
        if self.shutdown.is_cancelled() {
            return Err(GatewayError::ShuttingDown);
        }
        let session = self
            .clients
            .get(&id)
            .ok_or(GatewayError::UnknownClient(id))?;

        let chunk = AudioChunk::new(data);
        let bytes = chunk.len();
        let reopen_with = match self.policy {
            NotConnectedPolicy::Reopen => Some(Arc::clone(&self.default_config)),
            NotConnectedPolicy::Drop => None,
        };

        self.submit(UpstreamCommand::Audio {
            client_id: id,
            chunk,
            reopen_with,
            cancel: session.cancel,
        })
        .inspect_err(|e| warn!(client_id = %id, bytes, error = %e, "Dropping audio chunk"))
    }

    fn submit(&self, command: UpstreamCommand) -> Result<(), GatewayError> {
        self.commands.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => GatewayError::QueueFull,
            TrySendError::Closed(_) => GatewayError::RelayClosed,
        })
    }

    /// Send a JSON message to one client. Returns whether it was queued.
    pub fn notify(&self, id: ClientId, message: OutgoingMessage) -> bool {
        match self.clients.sender(&id) {
            Some(sender) => sender.try_send(ClientRoute::Outgoing(message)).is_ok(),
            None => false,
        }
    }

    /// Tell every client the relay is closing and forget them all.
    pub fn close_all(&self, reason: &str) -> usize {
        let sessions = self.clients.drain();
        for session in &sessions {
            let _ = session
                .sender
                .try_send(ClientRoute::Outgoing(OutgoingMessage::Closing {
                    reason: reason.to_string(),
                }));
            let _ = session.sender.try_send(ClientRoute::Close);
        }
        if !sessions.is_empty() {
            info!(clients = sessions.len(), "Closed all client sessions");
        }
        sessions.len()
    }
}
