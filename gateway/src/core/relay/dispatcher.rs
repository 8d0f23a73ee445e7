//! Event dispatcher.
//!
//! Drains decoded upstream events in order and turns each one into a
//! client route. Holds no state of its own beyond a shared, read-only view
//! of the client registry.
//!
//! Delivery never waits on a client: a client whose outbound channel is full
//! loses that route, and everyone else is unaffected.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, trace, warn};

use super::messages::{ClientRoute, OutgoingMessage};
use super::registry::ClientRegistry;
use crate::core::realtime::{ClientId, RealtimeEvent, UpstreamEvent};

/// Error code attached to upstream failures forwarded to clients.
pub const UPSTREAM_ERROR_CODE: &str = "upstream_error";

/// Which clients receive upstream events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Only the client that owns the current turn. Events without an owner
    /// go to everyone.
    #[default]
    TurnOwner,
    /// Every connected client
    Broadcast,
}

impl FromStr for RoutingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "turn_owner" | "owner" | "session" => Ok(Self::TurnOwner),
            "broadcast" | "all" => Ok(Self::Broadcast),
            other => Err(format!(
                "unknown routing mode '{other}' (expected turn_owner or broadcast)"
            )),
        }
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TurnOwner => write!(f, "turn_owner"),
            Self::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// Routes upstream events to client outbound channels.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    clients: Arc<ClientRegistry>,
    routing: RoutingMode,
    notify_turn_done: bool,
}

impl EventDispatcher {
    pub fn new(clients: Arc<ClientRegistry>, routing: RoutingMode, notify_turn_done: bool) -> Self {
        Self {
            clients,
            routing,
            notify_turn_done,
        }
    }

    pub fn routing(&self) -> RoutingMode {
        self.routing
    }

    /// Dispatch until the event channel closes.
    pub async fn run(self, mut events: mpsc::Receiver<UpstreamEvent>) {
        info!(routing = %self.routing, "Event dispatcher started");
        while let Some(event) = events.recv().await {
            self.dispatch(event);
        }
        info!("Event dispatcher stopped");
    }

    /// Deliver one event. Returns the number of clients that received it.
    pub fn dispatch(&self, upstream: UpstreamEvent) -> usize {
        let route = match upstream.event {
            RealtimeEvent::Delta(audio) => {
                trace!(bytes = audio.len(), "Dispatching audio delta");
                ClientRoute::Audio(audio)
            }
            RealtimeEvent::TextDelta(text) => {
                ClientRoute::Outgoing(OutgoingMessage::Transcript { text })
            }
            RealtimeEvent::TurnDone => {
                debug!(turn_owner = ?upstream.turn_owner, "Turn done");
                if !self.notify_turn_done {
                    return 0;
                }
                ClientRoute::Outgoing(OutgoingMessage::TurnDone)
            }
            RealtimeEvent::Error(message) => {
                warn!(error = %message, "Upstream reported an error");
                ClientRoute::Outgoing(OutgoingMessage::Error {
                    code: Some(UPSTREAM_ERROR_CODE.to_string()),
                    message,
                })
            }
            RealtimeEvent::Other(raw) => {
                trace!(message = %raw, "Dropping unhandled upstream message");
                return 0;
            }
        };

        let mut delivered = 0;
        for (client_id, sender) in self.targets(upstream.turn_owner) {
            match sender.try_send(route.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(dropped)) => {
                    warn!(%client_id, route = dropped.kind(), "Client channel full, dropping route");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(%client_id, "Client channel closed, skipping");
                }
            }
        }

        if delivered == 0 {
            trace!(turn_owner = ?upstream.turn_owner, "No client received the event");
        }
        delivered
    }

    fn targets(&self, owner: Option<ClientId>) -> Vec<(ClientId, mpsc::Sender<ClientRoute>)> {
        match (self.routing, owner) {
            (RoutingMode::TurnOwner, Some(id)) => self
                .clients
                .sender(&id)
                .map(|sender| vec![(id, sender)])
                .unwrap_or_default(),
            _ => self.clients.senders(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::core::relay::registry::ClientSession;

    fn register(registry: &ClientRegistry) -> (ClientId, mpsc::Receiver<ClientRoute>) {
        register_with_capacity(registry, 16)
    }

    fn register_with_capacity(
        registry: &ClientRegistry,
        capacity: usize,
    ) -> (ClientId, mpsc::Receiver<ClientRoute>) {
        let (tx, rx) = mpsc::channel(capacity);
        let id = ClientId::new_v4();
        registry.insert(ClientSession {
            id,
            sender: tx,
            cancel: CancellationToken::new(),
            connected_at: Instant::now(),
        });
        (id, rx)
    }

    fn event(owner: Option<ClientId>, event: RealtimeEvent) -> UpstreamEvent {
        UpstreamEvent {
            turn_owner: owner,
            event,
        }
    }

    #[test]
    fn test_delta_routed_to_turn_owner() {
        let registry = Arc::new(ClientRegistry::new());
        let (owner, mut owner_rx) = register(&registry);
        let (_other, mut other_rx) = register(&registry);
        let dispatcher = EventDispatcher::new(registry, RoutingMode::TurnOwner, true);

        let delivered = dispatcher
            .dispatch(event(
                Some(owner),
                RealtimeEvent::Delta(Bytes::from_static(b"ABC")),
            ));

        assert_eq!(delivered, 1);
        assert_eq!(
            owner_rx.try_recv().unwrap(),
            ClientRoute::Audio(Bytes::from_static(b"ABC"))
        );
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn test_ownerless_event_broadcast() {
        let registry = Arc::new(ClientRegistry::new());
        let (_a, mut a_rx) = register(&registry);
        let (_b, mut b_rx) = register(&registry);
        let dispatcher = EventDispatcher::new(registry, RoutingMode::TurnOwner, true);

        let delivered = dispatcher
            .dispatch(event(None, RealtimeEvent::TextDelta("hi".to_string())));

        assert_eq!(delivered, 2);
        let expected = ClientRoute::Outgoing(OutgoingMessage::Transcript {
            text: "hi".to_string(),
        });
        assert_eq!(a_rx.try_recv().unwrap(), expected);
        assert_eq!(b_rx.try_recv().unwrap(), expected);
    }

    #[test]
    fn test_broadcast_ignores_owner() {
        let registry = Arc::new(ClientRegistry::new());
        let (owner, _owner_rx) = register(&registry);
        let (_other, mut other_rx) = register(&registry);
        let dispatcher = EventDispatcher::new(registry, RoutingMode::Broadcast, true);

        let delivered = dispatcher
            .dispatch(event(
                Some(owner),
                RealtimeEvent::Delta(Bytes::from_static(b"x")),
            ));

        assert_eq!(delivered, 2);
        assert!(other_rx.try_recv().is_ok());
    }

    #[test]
    fn test_turn_done_notification_optional() {
        let registry = Arc::new(ClientRegistry::new());
        let (owner, mut rx) = register(&registry);

        let silent = EventDispatcher::new(Arc::clone(&registry), RoutingMode::TurnOwner, false);
        assert_eq!(
            silent.dispatch(event(Some(owner), RealtimeEvent::TurnDone)),
            0
        );
        assert!(rx.try_recv().is_err());

        let notifying = EventDispatcher::new(registry, RoutingMode::TurnOwner, true);
        notifying.dispatch(event(Some(owner), RealtimeEvent::TurnDone));
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientRoute::Outgoing(OutgoingMessage::TurnDone)
        );
    }

    #[test]
    fn test_error_forwarded_with_code() {
        let registry = Arc::new(ClientRegistry::new());
        let (owner, mut rx) = register(&registry);
        let dispatcher = EventDispatcher::new(registry, RoutingMode::TurnOwner, true);

        dispatcher
            .dispatch(event(
                Some(owner),
                RealtimeEvent::Error("decode failure".to_string()),
            ));

        assert_eq!(
            rx.try_recv().unwrap(),
            ClientRoute::Outgoing(OutgoingMessage::Error {
                code: Some(UPSTREAM_ERROR_CODE.to_string()),
                message: "decode failure".to_string(),
            })
        );
    }

    #[test]
    fn test_other_events_dropped() {
        let registry = Arc::new(ClientRegistry::new());
        let (_id, mut rx) = register(&registry);
        let dispatcher = EventDispatcher::new(registry, RoutingMode::Broadcast, true);

        let delivered = dispatcher
            .dispatch(event(None, RealtimeEvent::Other("{}".to_string())));

        assert_eq!(delivered, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_departed_owner_receives_nothing() {
        let registry = Arc::new(ClientRegistry::new());
        let (_other, mut other_rx) = register(&registry);
        let dispatcher = EventDispatcher::new(registry, RoutingMode::TurnOwner, true);

        let delivered = dispatcher
            .dispatch(event(
                Some(ClientId::new_v4()),
                RealtimeEvent::Delta(Bytes::from_static(b"x")),
            ));

        assert_eq!(delivered, 0);
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_run_preserves_order() {
        let registry = Arc::new(ClientRegistry::new());
        let (owner, mut rx) = register(&registry);
        let dispatcher = EventDispatcher::new(registry, RoutingMode::TurnOwner, true);

        let (tx, events) = mpsc::channel(8);
        for i in 0..5u8 {
            tx.send(event(Some(owner), RealtimeEvent::Delta(Bytes::from(vec![i]))))
                .await
                .unwrap();
        }
        drop(tx);
        dispatcher.run(events).await;

        for i in 0..5u8 {
            assert_eq!(rx.recv().await.unwrap(), ClientRoute::Audio(Bytes::from(vec![i])));
        }
    }

    #[tokio::test]
    async fn test_full_client_does_not_block_others() {
        let registry = Arc::new(ClientRegistry::new());
        let (_stalled, mut stalled_rx) = register_with_capacity(&registry, 4);
        let (_fast, mut fast_rx) = register_with_capacity(&registry, 64);
        let dispatcher = EventDispatcher::new(registry, RoutingMode::Broadcast, true);

        let (tx, events) = mpsc::channel(64);
        for i in 0..40u8 {
            tx.send(event(None, RealtimeEvent::Delta(Bytes::from(vec![i]))))
                .await
                .unwrap();
        }
        drop(tx);

        tokio::time::timeout(std::time::Duration::from_secs(5), dispatcher.run(events))
            .await
            .expect("dispatcher should not wait on a full client");

        for i in 0..40u8 {
            assert_eq!(fast_rx.try_recv().unwrap(), ClientRoute::Audio(Bytes::from(vec![i])));
        }

        // The stalled client keeps the oldest routes, in order
        for i in 0..4u8 {
            assert_eq!(
                stalled_rx.try_recv().unwrap(),
                ClientRoute::Audio(Bytes::from(vec![i]))
            );
        }
        assert!(stalled_rx.try_recv().is_err());
    }

    #[test]
    fn test_routing_mode_parse() {
        assert_eq!(
            "turn-owner".parse::<RoutingMode>(),
            Ok(RoutingMode::TurnOwner)
        );
        assert_eq!("BROADCAST".parse::<RoutingMode>(), Ok(RoutingMode::Broadcast));
        assert!("nobody".parse::<RoutingMode>().is_err());
    }
}
