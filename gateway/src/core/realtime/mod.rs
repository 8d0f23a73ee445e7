//! Realtime upstream session module.
//!
//! Shared vocabulary ([`base`]) and the OpenAI Realtime implementation
//! ([`openai`]): wire types, the protocol translator and the session
//! manager that owns the upstream websocket.
//!
//! # Audio Format
//!
//! PCM 16-bit signed little-endian at 24kHz unless the session is
//! configured otherwise. Audio bytes are relayed untouched.

mod base;
pub mod openai;

pub use base::{
    ApiKey, AudioChunk, ClientId, ConnectionState, DEFAULT_INSTRUCTIONS, Modality, RealtimeError,
    RealtimeEvent, RealtimeResult, ReconnectionConfig, SessionConfig, UpstreamEvent,
};
pub use openai::{
    CommandQueue, StateObserver, UpstreamCommand, UpstreamConfig, UpstreamSession,
};
