//! Realtime WebSocket handler
//!
//! Each WebSocket connection becomes one client of the relay. Inbound audio
//! is handed to the [`ClientGateway`](crate::core::relay::ClientGateway);
//! outbound routes are drained from the client's channel by a sender task.

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::{select, time::Duration};
use tracing::{debug, error, info, warn};

use crate::core::realtime::ClientId;
use crate::core::relay::{ClientGateway, ClientRoute, GatewayError, OutgoingMessage};
use crate::state::AppState;

use super::messages::IncomingMessage;

/// Maximum WebSocket frame size (10 MB)
const MAX_WS_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Maximum WebSocket message size (10 MB)
const MAX_WS_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// How often the idle check runs
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Connections without inbound traffic for this long are closed
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Time allowed for queued outbound frames to flush after the client leaves
const SENDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Realtime WebSocket handler
///
/// Upgrades the HTTP connection to a WebSocket and registers it as a relay
/// client.
///
/// # Protocol
///
/// Client -> server:
/// - Binary frames: raw audio chunks (`audio_data`)
/// - `{"type": "audio_data", "audio": "<base64>"}`: the same, as JSON
///
/// Server -> client:
/// - Binary frames: synthesized audio (`audio_response`)
/// - `connected`, `transcript`, `turn_done`, `error` and `closing` JSON
///   messages
pub async fn realtime_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    debug!("Realtime WebSocket connection upgrade requested");

    ws.max_frame_size(MAX_WS_FRAME_SIZE)
        .max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_realtime_socket(socket, state))
}

/// Handle one client connection from upgrade to close
async fn handle_realtime_socket(mut socket: WebSocket, app_state: Arc<AppState>) {
    let client_id = ClientId::new_v4();
    let gateway = app_state.gateway.clone();

    let mut routes = match gateway.on_client_connect(client_id) {
        Ok(routes) => routes,
        Err(e) => {
            warn!(%client_id, error = %e, "Rejecting realtime connection");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();

    // Sender task for outgoing routes
    let mut sender_task = tokio::spawn(async move {
        while let Some(route) = routes.recv().await {
            let should_close = matches!(route, ClientRoute::Close);

            let result = match route {
                ClientRoute::Audio(data) => sender.send(Message::Binary(data)).await,
                ClientRoute::Outgoing(message) => match serde_json::to_string(&message) {
                    Ok(json) => sender.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(%client_id, "Failed to serialize outgoing message: {}", e);
                        continue;
                    }
                },
                ClientRoute::Close => sender.send(Message::Close(None)).await,
            };

            if let Err(e) = result {
                debug!(%client_id, "Failed to send WebSocket message: {}", e);
                break;
            }

            if should_close {
                break;
            }
        }
    });

    let mut last_activity = Instant::now();

    loop {
        select! {
            // Ends on a Close route, e.g. from relay shutdown
            _ = &mut sender_task => {
                debug!(%client_id, "Outbound channel closed");
                break;
            }
            msg_result = receiver.next() => {
                last_activity = Instant::now();

                match msg_result {
                    Some(Ok(msg)) => {
                        if !process_message(msg, client_id, &gateway) {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(%client_id, "Realtime WebSocket error: {}", e);
                        break;
                    }
                    None => {
                        info!(%client_id, "Realtime WebSocket connection closed by client");
                        break;
                    }
                }
            }
            _ = tokio::time::sleep(IDLE_CHECK_INTERVAL) => {
                if last_activity.elapsed() > IDLE_TIMEOUT {
                    warn!(
                        %client_id,
                        idle_secs = last_activity.elapsed().as_secs(),
                        "Closing idle realtime connection"
                    );
                    gateway.notify(
                        client_id,
                        OutgoingMessage::Error {
                            code: Some("idle_timeout".to_string()),
                            message: "Connection closed due to inactivity".to_string(),
                        },
                    );
                    break;
                }
            }
        }
    }

    // Cleanup
    gateway.on_client_disconnect(client_id);

    if !sender_task.is_finished()
        && tokio::time::timeout(SENDER_DRAIN_TIMEOUT, &mut sender_task)
            .await
            .is_err()
    {
        sender_task.abort();
    }

    info!(%client_id, "Realtime WebSocket connection terminated");
}

/// Handle one inbound frame. Returns `false` when the connection should end.
fn process_message(msg: Message, client_id: ClientId, gateway: &ClientGateway) -> bool {
    match msg {
        Message::Binary(data) => submit_audio(data, client_id, gateway),
        Message::Text(text) => {
            let audio = IncomingMessage::parse(text.as_str()).and_then(IncomingMessage::into_audio);
            match audio {
                Ok(data) => submit_audio(data, client_id, gateway),
                Err(e) => {
                    warn!(%client_id, "Rejected client message: {}", e);
                    gateway.notify(
                        client_id,
                        OutgoingMessage::Error {
                            code: Some(e.code().to_string()),
                            message: e.to_string(),
                        },
                    );
                    true
                }
            }
        }
        Message::Ping(_) | Message::Pong(_) => true,
        Message::Close(_) => {
            info!(%client_id, "Realtime WebSocket close received");
            false
        }
    }
}

fn submit_audio(data: Bytes, client_id: ClientId, gateway: &ClientGateway) -> bool {
    if data.is_empty() {
        debug!(%client_id, "Ignoring empty audio frame");
        return true;
    }

    match gateway.on_audio_chunk(client_id, data) {
        Ok(()) => true,
        Err(GatewayError::QueueFull) => {
            gateway.notify(
                client_id,
                OutgoingMessage::Error {
                    code: Some("audio_dropped".to_string()),
                    message: GatewayError::QueueFull.to_string(),
                },
            );
            true
        }
        Err(e) => {
            debug!(%client_id, error = %e, "Relay no longer accepts audio from this client");
            false
        }
    }
}
