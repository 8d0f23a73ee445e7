//! Local mock of the upstream realtime service
//!
//! Accepts WebSocket connections on an ephemeral port, records the handshake
//! and every JSON event the relay sends, and answers through a scripted
//! responder.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

/// What the mock does after receiving an event
#[derive(Debug, Clone)]
pub enum Reply {
    /// Send a text frame
    Text(String),
    /// Send a close frame and end the connection
    Close,
    /// End the connection without a close frame
    Drop,
}

impl Reply {
    pub fn json(value: Value) -> Self {
        Reply::Text(value.to_string())
    }

    /// `response.audio.delta` carrying `base64`
    pub fn delta(base64: &str) -> Self {
        Reply::json(json!({
            "type": "response.audio.delta",
            "response_id": "resp_mock",
            "item_id": "item_mock",
            "output_index": 0,
            "content_index": 0,
            "delta": base64,
        }))
    }

    /// `response.audio.done`
    pub fn done() -> Self {
        Reply::json(json!({"type": "response.audio.done", "response_id": "resp_mock"}))
    }
}

/// Responder: connection index and received event in, replies out
pub type Responder = Arc<dyn Fn(usize, &Value) -> Vec<Reply> + Send + Sync>;

/// Captured handshake request
#[derive(Debug, Clone)]
pub struct Handshake {
    pub uri: String,
    pub authorization: Option<String>,
    pub beta: Option<String>,
}

/// Event received from the relay, tagged with its connection index
#[derive(Debug, Clone)]
pub struct Received {
    pub connection: usize,
    pub event: Value,
}

impl Received {
    pub fn event_type(&self) -> &str {
        self.event["type"].as_str().unwrap_or_default()
    }
}

pub struct MockUpstream {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    handshakes: Arc<Mutex<Vec<Handshake>>>,
    received: mpsc::UnboundedReceiver<Received>,
    handle: JoinHandle<()>,
}

struct Shared {
    responder: Responder,
    reject: Option<StatusCode>,
    connections: Arc<AtomicUsize>,
    handshakes: Arc<Mutex<Vec<Handshake>>>,
    received: mpsc::UnboundedSender<Received>,
}

impl MockUpstream {
    /// Mock that never replies
    pub async fn start() -> Self {
        Self::start_with(|_, _| Vec::new()).await
    }

    /// Mock answering through `responder`
    pub async fn start_with<F>(responder: F) -> Self
    where
        F: Fn(usize, &Value) -> Vec<Reply> + Send + Sync + 'static,
    {
        Self::spawn(Arc::new(responder), None).await
    }

    /// Mock rejecting every handshake with `status`
    pub async fn rejecting(status: StatusCode) -> Self {
        Self::spawn(Arc::new(|_, _| Vec::new()), Some(status)).await
    }

    async fn spawn(responder: Responder, reject: Option<StatusCode>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, received) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicUsize::new(0));
        let handshakes = Arc::new(Mutex::new(Vec::new()));

        let shared = Arc::new(Shared {
            responder,
            reject,
            connections: Arc::clone(&connections),
            handshakes: Arc::clone(&handshakes),
            received: tx,
        });

        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, shared).await {
                        eprintln!("Mock upstream connection error: {}", e);
                    }
                });
            }
        });

        Self {
            addr,
            connections,
            handshakes,
            received,
            handle,
        }
    }

    /// Base endpoint for `UpstreamConfig::endpoint`
    pub fn endpoint(&self) -> String {
        format!("ws://{}/v1/realtime", self.addr)
    }

    /// Completed WebSocket handshakes so far
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn handshakes(&self) -> Vec<Handshake> {
        self.handshakes.lock().unwrap().clone()
    }

    /// Next event received from the relay
    pub async fn next_event(&mut self) -> Received {
        tokio::time::timeout(Duration::from_secs(5), self.received.recv())
            .await
            .expect("timed out waiting for an upstream event")
            .expect("mock upstream stopped")
    }

    /// Skip events until one of type `event_type` arrives
    pub async fn expect_event(&mut self, event_type: &str) -> Received {
        loop {
            let received = self.next_event().await;
            if received.event_type() == event_type {
                return received;
            }
        }
    }

    /// Wait until `count` connections have been accepted
    pub async fn wait_for_connections(&self, count: usize, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while tokio::time::Instant::now() < deadline {
            if self.connection_count() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.connection_count() >= count
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    stream: TcpStream,
    shared: Arc<Shared>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let capture = Arc::clone(&shared);
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        capture.handshakes.lock().unwrap().push(Handshake {
            uri: request.uri().to_string(),
            authorization: header("authorization"),
            beta: header("openai-beta"),
        });

        match capture.reject {
            Some(status) => {
                let mut error = ErrorResponse::new(Some("rejected by mock".to_string()));
                *error.status_mut() = status;
                Err(error)
            }
            None => Ok(response),
        }
    };

    let ws_stream = accept_hdr_async(stream, callback).await?;
    let connection = shared.connections.fetch_add(1, Ordering::SeqCst);
    let (mut write, mut read) = ws_stream.split();

    while let Some(msg) = read.next().await {
        match msg? {
            Message::Text(text) => {
                let event: Value = serde_json::from_str(text.as_str())?;
                let replies = (shared.responder)(connection, &event);
                let _ = shared.received.send(Received { connection, event });

                for reply in replies {
                    match reply {
                        Reply::Text(text) => write.send(Message::Text(text.into())).await?,
                        Reply::Close => {
                            write.send(Message::Close(None)).await?;
                            return Ok(());
                        }
                        Reply::Drop => return Ok(()),
                    }
                }
            }
            Message::Ping(data) => write.send(Message::Pong(data)).await?,
            Message::Close(_) => break,
            _ => {}
        }
    }

    Ok(())
}
