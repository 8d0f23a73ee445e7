//! Base types shared by the upstream session manager and the relay.
//!
//! This module defines the vocabulary the rest of the relay speaks: the
//! error taxonomy, the upstream connection state machine, reconnection
//! policy, the immutable session configuration, audio chunks and the
//! decoded upstream events.
//!
//! # Audio Format
//!
//! Audio is relayed as opaque bytes. The upstream session is configured for
//! PCM 16-bit signed little-endian at 24kHz by default, but the relay never
//! inspects or transcodes the payload.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Identifier of a connected client transport.
pub type ClientId = Uuid;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during realtime operations.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Connection to the upstream service failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Operation requires an open upstream connection
    #[error("Not connected")]
    NotConnected,

    /// Rejected state machine transition
    #[error("Invalid connection state transition: {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// Result type for realtime operations.
pub type RealtimeResult<T> = Result<T, RealtimeError>;

// =============================================================================
// Credentials
// =============================================================================

/// Upstream API credential.
///
/// The secret is zeroized when dropped and never printed by `Debug`.
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the raw secret for building request headers.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

// =============================================================================
// Configuration Types
// =============================================================================

/// Configuration for automatic reconnection behavior.
///
/// The baseline policy retries forever with a fixed 5 second delay. Setting
/// `backoff_multiplier` above 1.0 turns it into exponential backoff capped at
/// `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectionConfig {
    /// Delay before the first reconnection attempt (milliseconds).
    /// Default: 5000ms
    pub initial_delay_ms: u64,

    /// Maximum number of reconnection attempts before giving up.
    /// Set to 0 for unlimited attempts.
    /// Default: 0
    pub max_attempts: u32,

    /// Multiplier applied to the delay after every failed attempt.
    /// Default: 1.0 (fixed delay)
    pub backoff_multiplier: f32,

    /// Ceiling for the computed delay (milliseconds).
    /// Default: 60000ms
    pub max_delay_ms: u64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 5000,
            max_attempts: 0,
            backoff_multiplier: 1.0,
            max_delay_ms: 60_000,
        }
    }
}

impl ReconnectionConfig {
    /// Calculate the delay for a given attempt number (1-based).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay_ms as f64;
        let multiplier = f64::from(self.backoff_multiplier.max(1.0));

        // base_delay * multiplier^(attempt-1), capped
        let delay = base_delay * multiplier.powi(attempt.saturating_sub(1) as i32);
        let ceiling = self.max_delay_ms.max(self.initial_delay_ms) as f64;

        Duration::from_millis(delay.min(ceiling) as u64)
    }

    /// Check if another attempt is allowed after `attempts_made` failures.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        self.max_attempts == 0 || attempts_made < self.max_attempts
    }
}

/// Output modalities requested from the upstream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    /// Text output
    Text,
    /// Audio output
    Audio,
}

impl Modality {
    /// Convert to the API parameter value.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Audio => "audio",
        }
    }

    /// Parse a single modality name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "text" => Some(Self::Text),
            "audio" => Some(Self::Audio),
            _ => None,
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default system instructions for new sessions.
pub const DEFAULT_INSTRUCTIONS: &str = "You are a helpful personal assistant.";

/// Session configuration sent once per upstream connection.
///
/// A session configuration is immutable once the connection opens; the
/// manager holds it behind an `Arc` and a new connection is required to
/// change it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Voice identifier for synthesized audio
    pub voice: String,

    /// System instructions for the assistant
    pub instructions: String,

    /// Enabled response modalities
    pub modalities: Vec<Modality>,

    /// Sampling temperature
    pub temperature: f32,

    /// Maximum output tokens per response (`None` for unlimited)
    pub max_output_tokens: Option<u32>,

    /// Audio format for both directions (e.g. "pcm16")
    pub audio_format: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            voice: "alloy".to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            modalities: vec![Modality::Text, Modality::Audio],
            temperature: 0.5,
            max_output_tokens: Some(500),
            audio_format: "pcm16".to_string(),
        }
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Connection state of the upstream session.
///
/// Transitions follow `Disconnected -> Connecting -> Open -> Closing ->
/// Disconnected`. The single extra edge `Connecting -> Disconnected` covers a
/// handshake that never produced a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No upstream connection
    #[default]
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Connected and ready
    Open,
    /// Tearing down the connection
    Closing,
}

impl ConnectionState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Open)
                | (Connecting, Disconnected)
                | (Open, Closing)
                | (Closing, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Open => write!(f, "Open"),
            ConnectionState::Closing => write!(f, "Closing"),
        }
    }
}

// =============================================================================
// Audio and Events
// =============================================================================

/// One chunk of client audio.
///
/// Raw bytes on the client side; the translator base64-encodes it for the
/// upstream wire. The payload is never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AudioChunk {
    data: Bytes,
}

impl AudioChunk {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

/// Event decoded from one upstream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeEvent {
    /// Synthesized audio chunk (`response.audio.delta`)
    Delta(Bytes),
    /// Incremental text or transcript
    TextDelta(String),
    /// End of the current turn (`response.audio.done`)
    TurnDone,
    /// Upstream error or local decode failure
    Error(String),
    /// Any other message, kept raw
    Other(String),
}

/// Decoded event tagged with the client that owns the current turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamEvent {
    pub turn_owner: Option<ClientId>,
    pub event: RealtimeEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Open.to_string(), "Open");
        assert_eq!(ConnectionState::Disconnected.to_string(), "Disconnected");
        assert_eq!(ConnectionState::Connecting.to_string(), "Connecting");
        assert_eq!(ConnectionState::Closing.to_string(), "Closing");
    }

    #[test]
    fn test_state_machine_cycle() {
        use ConnectionState::*;
        let cycle = [Disconnected, Connecting, Open, Closing, Disconnected];
        for pair in cycle.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn test_state_machine_rejects_skips() {
        use ConnectionState::*;
        assert!(!Disconnected.can_transition_to(Open));
        assert!(!Disconnected.can_transition_to(Closing));
        assert!(!Connecting.can_transition_to(Closing));
        assert!(!Open.can_transition_to(Disconnected));
        assert!(!Open.can_transition_to(Connecting));
        assert!(!Closing.can_transition_to(Open));
        assert!(!Open.can_transition_to(Open));
    }

    #[test]
    fn test_failed_handshake_edge() {
        assert!(ConnectionState::Connecting.can_transition_to(ConnectionState::Disconnected));
    }

    #[test]
    fn test_error_display() {
        let err = RealtimeError::ConnectionFailed("test".to_string());
        assert!(err.to_string().contains("Connection failed"));

        let err = RealtimeError::NotConnected;
        assert_eq!(err.to_string(), "Not connected");

        let err = RealtimeError::InvalidTransition {
            from: ConnectionState::Open,
            to: ConnectionState::Connecting,
        };
        assert_eq!(
            err.to_string(),
            "Invalid connection state transition: Open -> Connecting"
        );
    }

    #[test]
    fn test_reconnection_config_default() {
        let config = ReconnectionConfig::default();
        assert_eq!(config.initial_delay_ms, 5000);
        assert_eq!(config.max_attempts, 0);
        assert_eq!(config.backoff_multiplier, 1.0);
    }

    #[test]
    fn test_reconnection_fixed_delay() {
        let config = ReconnectionConfig::default();
        assert_eq!(config.calculate_delay(1), Duration::from_secs(5));
        assert_eq!(config.calculate_delay(7), Duration::from_secs(5));
        assert_eq!(config.calculate_delay(1000), Duration::from_secs(5));
    }

    #[test]
    fn test_reconnection_exponential_delay_capped() {
        let config = ReconnectionConfig {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30000,
            ..Default::default()
        };

        assert_eq!(config.calculate_delay(1), Duration::from_millis(1000));
        assert_eq!(config.calculate_delay(2), Duration::from_millis(2000));
        assert_eq!(config.calculate_delay(5), Duration::from_millis(16000));
        assert_eq!(config.calculate_delay(6), Duration::from_millis(30000));
    }

    #[test]
    fn test_reconnection_should_retry() {
        let unlimited = ReconnectionConfig::default();
        assert!(unlimited.should_retry(0));
        assert!(unlimited.should_retry(u32::MAX));

        let bounded = ReconnectionConfig {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(bounded.should_retry(2));
        assert!(!bounded.should_retry(3));
    }

    #[test]
    fn test_default_session_config() {
        let config = SessionConfig::default();
        assert_eq!(config.voice, "alloy");
        assert_eq!(config.modalities, vec![Modality::Text, Modality::Audio]);
        assert_eq!(config.temperature, 0.5);
        assert_eq!(config.max_output_tokens, Some(500));
    }

    #[test]
    fn test_modality_parse() {
        assert_eq!(Modality::parse("Audio"), Some(Modality::Audio));
        assert_eq!(Modality::parse(" text "), Some(Modality::Text));
        assert_eq!(Modality::parse("video"), None);
    }

    #[test]
    fn test_api_key_debug_redacted() {
        let key = ApiKey::new("sk-secret");
        assert_eq!(format!("{:?}", key), "ApiKey(***)");
        assert_eq!(key.expose(), "sk-secret");
        assert!(ApiKey::new("  ").is_empty());
    }

    #[test]
    fn test_audio_chunk_accessors() {
        let chunk = AudioChunk::new(vec![1u8, 2, 3]);
        assert_eq!(chunk.len(), 3);
        assert_eq!(chunk.as_bytes(), &[1, 2, 3]);
        assert!(AudioChunk::default().is_empty());
    }
}
