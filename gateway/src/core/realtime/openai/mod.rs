//! OpenAI Realtime API module.
//!
//! Protocol translation and the upstream session manager for OpenAI's
//! Realtime API.
//!
//! # Supported Models
//!
//! - `gpt-4o-realtime-preview` - GPT-4o Realtime Preview
//! - `gpt-4o-realtime-preview-2024-10-01` - October 2024 version (default)
//! - `gpt-4o-realtime-preview-2024-12-17` - December 2024 version
//! - `gpt-4o-mini-realtime-preview` - Mini model for lower latency
//!
//! # Supported Voices
//!
//! alloy, ash, ballad, coral, echo, sage, shimmer, verse
//!
//! # Audio Format
//!
//! Input and output audio is PCM 16-bit signed little-endian at 24kHz.
//! G.711 u-law and a-law are also accepted at 8kHz.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use waav_relay::core::realtime::{ApiKey, SessionConfig};
//! use waav_relay::core::realtime::openai::{UpstreamConfig, UpstreamSession};
//!
//! let mut session = UpstreamSession::new(UpstreamConfig {
//!     api_key: ApiKey::new("sk-..."),
//!     ..Default::default()
//! })?;
//!
//! session.open(Arc::new(SessionConfig::default()), None).await?;
//! session.send(&chunk).await?;
//! ```

mod client;
pub mod codec;
mod config;
mod messages;

pub use client::{
    CommandQueue, StateObserver, UpstreamCommand, UpstreamConfig, UpstreamSession,
};
pub use config::{
    OPENAI_BETA_HEADER, OPENAI_BETA_REALTIME, OPENAI_REALTIME_URL,
    OpenAIRealtimeAudioFormat, OpenAIRealtimeModel, OpenAIRealtimeVoice, realtime_endpoint,
};
pub use messages::{ApiError, ClientEvent, MaxTokens, ResponseConfig, ServerEvent, SessionUpdate};
