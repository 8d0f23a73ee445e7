//! Realtime audio WebSocket handlers
//!
//! Every connection on `/realtime` is one relay client.
//!
//! # Protocol
//!
//! ## Client → Server
//!
//! - **Binary frames**: audio chunks (`audio_data`), forwarded upstream as-is
//! - **audio_data**: `{"type": "audio_data", "audio": "<base64>"}`
//!
//! ## Server → Client
//!
//! - **Binary frames**: synthesized audio (`audio_response`)
//! - **connected**: assigned client id
//! - **transcript**: text produced during the turn
//! - **turn_done**: the current turn finished
//! - **error**: recoverable failure
//! - **closing**: the relay is shutting down

mod handler;
pub mod messages;

pub use handler::realtime_handler;
