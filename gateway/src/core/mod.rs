pub mod realtime;
pub mod relay;

// Re-export commonly used types for convenience
pub use realtime::{
    ApiKey, AudioChunk, ClientId, ConnectionState, RealtimeError, RealtimeEvent, RealtimeResult,
    ReconnectionConfig, SessionConfig, UpstreamEvent,
};

pub use relay::{
    ClientGateway, ClientRoute, EventDispatcher, GatewayError, NotConnectedPolicy, OutgoingMessage,
    RelayConfig, RelaySupervisor, RoutingMode,
};
