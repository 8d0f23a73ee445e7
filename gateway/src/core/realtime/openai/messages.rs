//! OpenAI Realtime API WebSocket message types.
//!
//! Only the subset of the protocol the relay speaks is modelled here. All
//! events are JSON objects discriminated by their `type` field.
//!
//! # Protocol Overview
//!
//! Client events (sent to server):
//! - session.update - Configure the session once per connection
//! - input_audio_buffer.append - Append base64 audio to the input buffer
//! - response.create - Start a turn
//!
//! Server events (received from server):
//! - response.audio.delta - Audio data chunk
//! - response.audio.done - Audio generation complete
//! - response.text.delta - Text chunk
//! - response.audio_transcript.delta - Transcript chunk
//! - error - Error occurred
//!
//! Every other server event deserializes to [`ServerEvent::Unknown`].

use serde::{Deserialize, Serialize};

use crate::core::realtime::base::{RealtimeError, RealtimeResult};

// =============================================================================
// Session Configuration
// =============================================================================

/// Wire form of the session configuration carried by `session.update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionUpdate {
    /// Response modalities (text, audio)
    pub modalities: Vec<String>,

    /// System instructions for the assistant
    pub instructions: String,

    /// Voice for audio output
    pub voice: String,

    /// Input audio format
    pub input_audio_format: String,

    /// Output audio format
    pub output_audio_format: String,

    /// Tool definitions. The relay never registers tools.
    #[serde(default)]
    pub tools: Vec<serde_json::Value>,

    /// Temperature for response generation
    pub temperature: f32,

    /// Maximum response output tokens
    pub max_response_output_tokens: MaxTokens,
}

/// Maximum tokens configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaxTokens {
    /// Specific number of tokens
    Number(u32),
    /// Infinite tokens, serialized as `"inf"`
    Infinite(String),
}

impl MaxTokens {
    /// Map an optional limit to the wire value.
    pub fn from_limit(limit: Option<u32>) -> Self {
        match limit {
            Some(n) => Self::Number(n),
            None => Self::Infinite("inf".to_string()),
        }
    }
}

/// Per-turn options carried by `response.create`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseConfig {
    /// Response modalities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,
    /// Instructions for this turn
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

// =============================================================================
// Client Events (sent to server)
// =============================================================================

/// Client events sent to the OpenAI Realtime API.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Update session configuration
    #[serde(rename = "session.update")]
    SessionUpdate {
        /// Session configuration
        session: SessionUpdate,
    },

    /// Append audio to input buffer
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend {
        /// Base64-encoded audio data
        audio: String,
    },

    /// Create a response
    #[serde(rename = "response.create")]
    ResponseCreate {
        /// Response configuration
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<ResponseConfig>,
    },
}

impl ClientEvent {
    /// Wire name of the event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionUpdate { .. } => "session.update",
            Self::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            Self::ResponseCreate { .. } => "response.create",
        }
    }

    /// Serialize to the JSON text sent in a websocket text frame.
    pub fn to_json(&self) -> RealtimeResult<String> {
        serde_json::to_string(self).map_err(|e| RealtimeError::SerializationError(e.to_string()))
    }
}

// =============================================================================
// Server Events (received from server)
// =============================================================================

/// Server events consumed by the relay.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Error event
    #[serde(rename = "error")]
    Error {
        /// Error details
        error: ApiError,
    },

    /// Audio delta (audio data chunk)
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        /// Response ID
        #[serde(default)]
        response_id: Option<String>,
        /// Item ID
        #[serde(default)]
        item_id: Option<String>,
        /// Base64-encoded audio delta
        delta: String,
    },

    /// Audio done
    #[serde(rename = "response.audio.done")]
    AudioDone {
        /// Response ID
        #[serde(default)]
        response_id: Option<String>,
    },

    /// Text delta
    #[serde(rename = "response.text.delta")]
    TextDelta {
        /// Text delta
        delta: String,
    },

    /// Audio transcript delta
    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta {
        /// Transcript delta
        delta: String,
    },

    /// Anything the relay does not interpret
    #[serde(other)]
    Unknown,
}

/// API error information.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ApiError {
    /// Error type
    #[serde(rename = "type", default)]
    pub error_type: String,
    /// Error code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Error message
    #[serde(default)]
    pub message: String,
}
