//! Client-side half of the relay.
//!
//! - [`ClientGateway`] accepts client connections and audio
//! - [`EventDispatcher`] routes upstream events back to clients
//! - [`RelaySupervisor`] wires both to the upstream session worker and owns
//!   shutdown

mod dispatcher;
mod gateway;
mod messages;
mod registry;
mod supervisor;

pub use dispatcher::{EventDispatcher, RoutingMode, UPSTREAM_ERROR_CODE};
pub use gateway::{ClientGateway, GatewayError, NotConnectedPolicy};
pub use messages::{ClientRoute, OutgoingMessage};
pub use registry::{ClientRegistry, ClientSession};
pub use supervisor::{RelayConfig, RelaySupervisor};
