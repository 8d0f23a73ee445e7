//! Upstream session manager for the OpenAI Realtime API.
//!
//! [`UpstreamSession`] owns the single upstream websocket and its state
//! machine. It runs as one worker task ([`UpstreamSession::run`]) fed by a
//! bounded command queue; client transports never touch the socket.
//!
//! ```text
//! Disconnected -> Connecting -> Open -> Closing -> Disconnected
//!                      \______________________________/
//!                         (handshake failed, no socket)
//! ```
//!
//! A clean end of turn (`response.audio.done`) closes the connection. The
//! worker then either waits for the next audio chunk to ask for a new one,
//! or, with `keep_open`, opens the next connection straight away. Transport
//! failures enter the reconnection policy instead.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::codec;
use super::config::{
    OPENAI_BETA_HEADER, OPENAI_BETA_REALTIME, OPENAI_REALTIME_URL, OpenAIRealtimeModel,
    realtime_endpoint,
};
use super::messages::ClientEvent;
use crate::core::realtime::base::{
    ApiKey, AudioChunk, ClientId, ConnectionState, RealtimeError, RealtimeEvent, RealtimeResult,
    ReconnectionConfig, SessionConfig, UpstreamEvent,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound for the websocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for the close handshake.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Capacity of the state transition broadcast.
const TRANSITION_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// Configuration and Commands
// =============================================================================

/// Connection settings for the upstream service.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// API key sent as a bearer credential
    pub api_key: ApiKey,
    /// Base websocket URL (without the model parameter)
    pub endpoint: String,
    /// Realtime model name
    pub model: String,
    /// Reconnection policy after transport failures
    pub reconnection: ReconnectionConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_key: ApiKey::default(),
            endpoint: OPENAI_REALTIME_URL.to_string(),
            model: OpenAIRealtimeModel::default().as_str().to_string(),
            reconnection: ReconnectionConfig::default(),
        }
    }
}

/// Work submitted to the session worker by the client gateway.
#[derive(Debug)]
pub enum UpstreamCommand {
    /// Forward one chunk of client audio
    Audio {
        client_id: ClientId,
        chunk: AudioChunk,
        /// Configuration to open with when no connection is active.
        /// `None` drops the chunk instead.
        reopen_with: Option<Arc<SessionConfig>>,
        /// Cancelled when the client disconnects
        cancel: CancellationToken,
    },
}

/// Receiving end of the command queue.
///
/// Held behind a mutex so a restarted worker picks up the same queue.
pub type CommandQueue = Arc<Mutex<mpsc::Receiver<UpstreamCommand>>>;

/// Why a receive loop returned.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LoopExit {
    TurnDone,
    TransportFailed(String),
    Cancelled,
    ChannelClosed,
}

// =============================================================================
// State Observation
// =============================================================================

/// Read-only view of the session's connection state.
#[derive(Debug, Clone)]
pub struct StateObserver {
    current: watch::Receiver<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
}

impl StateObserver {
    /// Latest published state.
    pub fn current(&self) -> ConnectionState {
        *self.current.borrow()
    }

    /// Watch receiver for the latest state.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.current.clone()
    }

    /// Every transition published from now on, in order.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }
}

// =============================================================================
// Session Manager
// =============================================================================

/// Owner of the single upstream connection.
pub struct UpstreamSession {
    endpoint: String,
    api_key: ApiKey,
    reconnection: ReconnectionConfig,

    state: ConnectionState,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    transitions: broadcast::Sender<ConnectionState>,

    socket: Option<WsStream>,
    active_config: Option<Arc<SessionConfig>>,
    turn_owner: Option<ClientId>,
    last_error: Option<String>,
}

impl UpstreamSession {
    /// Create a session manager. No connection is made until [`open`](Self::open).
    pub fn new(config: UpstreamConfig) -> RealtimeResult<Self> {
        if config.api_key.is_empty() {
            return Err(RealtimeError::AuthenticationFailed(
                "API key is required".to_string(),
            ));
        }

        let parsed = url::Url::parse(&config.endpoint)
            .map_err(|e| RealtimeError::InvalidConfiguration(format!("invalid endpoint: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(RealtimeError::InvalidConfiguration(format!(
                "endpoint scheme must be ws or wss, got {}",
                parsed.scheme()
            )));
        }

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);

        Ok(Self {
            endpoint: realtime_endpoint(&config.endpoint, &config.model),
            api_key: config.api_key,
            reconnection: config.reconnection,
            state: ConnectionState::Disconnected,
            state_tx: Arc::new(state_tx),
            transitions,
            socket: None,
            active_config: None,
            turn_owner: None,
            last_error: None,
        })
    }

    /// A fresh, disconnected session with the same settings that publishes
    /// to the same observers.
    ///
    /// Used to restart a worker that died while holding a connection.
    pub fn replica(&self) -> Self {
        if *self.state_tx.borrow() != ConnectionState::Disconnected {
            self.state_tx.send_replace(ConnectionState::Disconnected);
            let _ = self.transitions.send(ConnectionState::Disconnected);
        }

        Self {
            endpoint: self.endpoint.clone(),
            api_key: self.api_key.clone(),
            reconnection: self.reconnection.clone(),
            state: ConnectionState::Disconnected,
            state_tx: Arc::clone(&self.state_tx),
            transitions: self.transitions.clone(),
            socket: None,
            active_config: None,
            turn_owner: None,
            last_error: None,
        }
    }

    /// Full endpoint URL including the model parameter.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Client that owns the current turn, if any.
    pub fn turn_owner(&self) -> Option<ClientId> {
        self.turn_owner
    }

    /// Most recent connection or transport error.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn observer(&self) -> StateObserver {
        StateObserver {
            current: self.state_tx.subscribe(),
            transitions: self.transitions.clone(),
        }
    }

    fn transition(&mut self, next: ConnectionState) -> RealtimeResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(RealtimeError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        debug!(from = %self.state, to = %next, "Upstream state transition");
        self.state = next;
        self.state_tx.send_replace(next);
        // No subscribers is fine
        let _ = self.transitions.send(next);
        Ok(())
    }

    async fn handshake(&self) -> RealtimeResult<WsStream> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| RealtimeError::InvalidConfiguration(e.to_string()))?;

        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key.expose()))
            .map_err(|e| RealtimeError::AuthenticationFailed(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(OPENAI_BETA_HEADER, HeaderValue::from_static(OPENAI_BETA_REALTIME));

        let (socket, response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| RealtimeError::ConnectionFailed("handshake timed out".to_string()))?
            .map_err(|e| match e {
                WsError::Http(response)
                    if matches!(
                        response.status(),
                        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
                    ) =>
                {
                    RealtimeError::AuthenticationFailed(format!(
                        "upstream rejected credentials ({})",
                        response.status()
                    ))
                }
                other => RealtimeError::ConnectionFailed(other.to_string()),
            })?;

        debug!(status = %response.status(), "Upstream handshake complete");
        Ok(socket)
    }

    /// Open the upstream connection and configure the session.
    ///
    /// A no-op while a connection is already `Open` or `Connecting`. On
    /// success the session update and a turn-start request are sent before
    /// returning.
    pub async fn open(
        &mut self,
        config: Arc<SessionConfig>,
        owner: Option<ClientId>,
    ) -> RealtimeResult<()> {
        if matches!(
            self.state,
            ConnectionState::Open | ConnectionState::Connecting
        ) {
            debug!(state = %self.state, "Upstream connection already active");
            return Ok(());
        }

        self.transition(ConnectionState::Connecting)?;

        let socket = match self.handshake().await {
            Ok(socket) => socket,
            Err(e) => {
                self.last_error = Some(e.to_string());
                self.transition(ConnectionState::Disconnected)?;
                return Err(e);
            }
        };

        self.socket = Some(socket);
        self.active_config = Some(Arc::clone(&config));
        self.turn_owner = owner;
        self.transition(ConnectionState::Open)?;
        info!(endpoint = %self.endpoint, "Connected to OpenAI Realtime API");

        for event in [
            codec::encode_session_update(&config),
            codec::encode_response_create(&config),
        ] {
            if let Err(e) = self.send_event(&event).await {
                warn!(event = event.event_type(), error = %e, "Failed to configure upstream session");
                self.last_error = Some(e.to_string());
                self.close().await;
                return Err(e);
            }
        }

        Ok(())
    }

    async fn send_event(&mut self, event: &ClientEvent) -> RealtimeResult<()> {
        let json = event.to_json()?;
        let socket = self.socket.as_mut().ok_or(RealtimeError::NotConnected)?;
        socket
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| RealtimeError::WebSocketError(e.to_string()))
    }

    /// Send one audio chunk. Fails with `NotConnected` unless `Open`.
    pub async fn send(&mut self, chunk: &AudioChunk) -> RealtimeResult<()> {
        if self.state != ConnectionState::Open {
            return Err(RealtimeError::NotConnected);
        }
        trace!(bytes = chunk.len(), "Forwarding audio upstream");
        self.send_event(&codec::encode_append(chunk)).await
    }

    /// Release the socket and return to `Disconnected`. Idempotent.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        if self.state == ConnectionState::Open
            && let Err(e) = self.transition(ConnectionState::Closing)
        {
            warn!(error = %e, "Failed to enter closing state");
        }

        if let Some(mut socket) = self.socket.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, socket.close(None)).await {
                Ok(Ok(())) => debug!("Upstream websocket closed"),
                Ok(Err(e)) => debug!(error = %e, "Upstream close handshake failed"),
                Err(_) => debug!("Upstream close handshake timed out"),
            }
        }

        self.active_config = None;
        self.turn_owner = None;
        if let Err(e) = self.transition(ConnectionState::Disconnected) {
            warn!(error = %e, "Failed to enter disconnected state");
        }
    }

    fn mark_closing(&mut self, reason: &str) {
        self.last_error = Some(reason.to_string());
        if let Err(e) = self.transition(ConnectionState::Closing) {
            warn!(error = %e, "Failed to enter closing state");
        }
    }

    /// Read frames while `Open`, forwarding decoded events in receipt order.
    ///
    /// Also drains the command queue so audio keeps flowing upstream while
    /// a turn is streaming back.
    async fn receive_loop(
        &mut self,
        commands: &mut mpsc::Receiver<UpstreamCommand>,
        events: &mpsc::Sender<UpstreamEvent>,
        cancel: &CancellationToken,
    ) -> LoopExit {
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return LoopExit::Cancelled,

                // Client audio first so a long reply can't back up the queue
                command = commands.recv() => match command {
                    None => return LoopExit::ChannelClosed,
                    Some(UpstreamCommand::Audio { client_id, chunk, cancel: client_cancel, .. }) => {
                        if client_cancel.is_cancelled() {
                            debug!(%client_id, "Skipping audio from disconnected client");
                            continue;
                        }
                        if self.turn_owner.is_none() {
                            self.turn_owner = Some(client_id);
                        }
                        if let Err(e) = self.send(&chunk).await {
                            let reason = e.to_string();
                            self.mark_closing(&reason);
                            return LoopExit::TransportFailed(reason);
                        }
                    }
                },

                frame = next_frame(&mut self.socket) => {
                    let event = match frame {
                        Some(Ok(Message::Text(text))) => codec::decode(text.as_bytes()),
                        Some(Ok(Message::Binary(data))) => codec::decode(&data),
                        Some(Ok(Message::Ping(payload))) => {
                            if let Some(socket) = self.socket.as_mut()
                                && let Err(e) = socket.send(Message::Pong(payload)).await
                            {
                                let reason = e.to_string();
                                self.mark_closing(&reason);
                                return LoopExit::TransportFailed(reason);
                            }
                            continue;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = match frame {
                                Some(frame) => format!("closed by server: {} {}", frame.code, frame.reason),
                                None => "closed by server".to_string(),
                            };
                            self.mark_closing(&reason);
                            return LoopExit::TransportFailed(reason);
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            let reason = e.to_string();
                            self.mark_closing(&reason);
                            return LoopExit::TransportFailed(reason);
                        }
                        None => {
                            let reason = "stream ended".to_string();
                            self.mark_closing(&reason);
                            return LoopExit::TransportFailed(reason);
                        }
                    };

                    let turn_done = event == RealtimeEvent::TurnDone;
                    if let RealtimeEvent::Error(message) = &event {
                        warn!(error = %message, "Upstream error event");
                    }

                    let forwarded = UpstreamEvent {
                        turn_owner: self.turn_owner,
                        event,
                    };
                    if events.send(forwarded).await.is_err() {
                        return LoopExit::ChannelClosed;
                    }

                    if turn_done {
                        if let Err(e) = self.transition(ConnectionState::Closing) {
                            warn!(error = %e, "Failed to enter closing state");
                        }
                        return LoopExit::TurnDone;
                    }
                }
            }
        }
    }

    async fn handle_idle_command(&mut self, command: UpstreamCommand) {
        let UpstreamCommand::Audio {
            client_id,
            chunk,
            reopen_with,
            cancel,
        } = command;

        if cancel.is_cancelled() {
            debug!(%client_id, "Skipping audio from disconnected client");
            return;
        }

        match self.send(&chunk).await {
            Err(RealtimeError::NotConnected) => {}
            Ok(()) => return,
            Err(e) => {
                warn!(%client_id, error = %e, "Failed to forward audio chunk");
                return;
            }
        }

        let Some(config) = reopen_with else {
            warn!(%client_id, bytes = chunk.len(), "Upstream not connected, dropping audio chunk");
            return;
        };

        if let Err(e) = self.open(config, Some(client_id)).await {
            warn!(%client_id, bytes = chunk.len(), error = %e, "Upstream connect failed, dropping audio chunk");
            return;
        }

        if let Err(e) = self.send(&chunk).await {
            warn!(%client_id, error = %e, "Failed to forward audio chunk after reconnect");
        }
    }

    /// Open with `config`, entering the reconnection policy on failure.
    async fn open_or_reconnect(&mut self, config: Arc<SessionConfig>, cancel: &CancellationToken) {
        if let Err(e) = self.open(Arc::clone(&config), None).await {
            warn!(error = %e, "Upstream connection failed");
            self.reconnect(config, None, cancel).await;
        }
    }

    /// Re-enter `open` after the backoff delay until it succeeds, attempts
    /// run out or `cancel` fires. Returns whether a connection was opened.
    async fn reconnect(
        &mut self,
        config: Arc<SessionConfig>,
        owner: Option<ClientId>,
        cancel: &CancellationToken,
    ) -> bool {
        let mut attempts: u32 = 0;

        while self.reconnection.should_retry(attempts) {
            attempts += 1;
            let delay = self.reconnection.calculate_delay(attempts);
            info!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to OpenAI Realtime API"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Shutdown requested during reconnection delay");
                    return false;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match self.open(Arc::clone(&config), owner).await {
                Ok(()) => {
                    info!(attempt = attempts, "Reconnected to OpenAI Realtime API");
                    return true;
                }
                Err(e) => warn!(attempt = attempts, error = %e, "Reconnection attempt failed"),
            }
        }

        error!(
            attempts,
            "Reconnection attempts exhausted, waiting for the next client request"
        );
        false
    }

    /// Worker loop. Owns the session until `cancel` fires or the command
    /// queue closes, then closes the connection.
    ///
    /// With `eager` set, a connection is opened before the first command and
    /// a failure there enters the reconnection policy. With `keep_open`, the
    /// connection is opened again right after every completed turn.
    pub async fn run(
        mut self,
        commands: CommandQueue,
        events: mpsc::Sender<UpstreamEvent>,
        cancel: CancellationToken,
        eager: Option<Arc<SessionConfig>>,
        keep_open: bool,
    ) {
        let mut commands = commands.lock().await;
        info!(endpoint = %self.endpoint, keep_open, "Upstream session worker started");

        if let Some(config) = eager
            && !cancel.is_cancelled()
        {
            self.open_or_reconnect(config, &cancel).await;
        }

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if self.state == ConnectionState::Open {
                let exit = self.receive_loop(&mut commands, &events, &cancel).await;
                let config = self.active_config.clone();
                let owner = self.turn_owner;
                self.close().await;

                match exit {
                    LoopExit::TurnDone => {
                        debug!("Turn complete, upstream connection released");
                        if keep_open && let Some(config) = config {
                            self.open_or_reconnect(config, &cancel).await;
                        }
                    }
                    LoopExit::TransportFailed(reason) => {
                        warn!(error = %reason, "Upstream connection lost");
                        let notice = UpstreamEvent {
                            turn_owner: owner,
                            event: RealtimeEvent::Error(format!(
                                "upstream connection lost: {reason}"
                            )),
                        };
                        if events.send(notice).await.is_err() {
                            break;
                        }
                        if let Some(config) = config {
                            self.reconnect(config, owner, &cancel).await;
                        }
                    }
                    LoopExit::Cancelled | LoopExit::ChannelClosed => break,
                }
                continue;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_idle_command(command).await,
                    None => break,
                },
            }
        }

        self.close().await;
        info!("Upstream session worker stopped");
    }
}

/// Next frame from the socket, or pending forever when there is none.
async fn next_frame(socket: &mut Option<WsStream>) -> Option<Result<Message, WsError>> {
    match socket {
        Some(socket) => socket.next().await,
        None => std::future::pending().await,
    }
}
