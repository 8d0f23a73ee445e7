//! Client-facing WebSocket message types
//!
//! Binary frames carry raw audio in both directions. Text frames carry JSON
//! messages; the only inbound kind is `audio_data`, for clients that cannot
//! send binary frames. Outbound JSON messages are
//! [`OutgoingMessage`](crate::core::relay::OutgoingMessage).

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::realtime::openai::codec;

/// Maximum decoded size of one audio message (10 MB)
pub const MAX_AUDIO_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Incoming JSON messages from the client
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum IncomingMessage {
    /// One chunk of client audio, base64 encoded
    #[serde(rename = "audio_data")]
    AudioData {
        /// Base64 (standard alphabet) audio bytes
        audio: String,
    },
}

/// Errors for malformed client messages
#[derive(Debug, Error, PartialEq)]
pub enum IncomingMessageError {
    #[error("Invalid message format: {0}")]
    Parse(String),

    #[error("Audio payload is not valid base64")]
    InvalidAudio,

    #[error("Audio payload too large: {size} bytes (max {max})")]
    AudioTooLarge { size: usize, max: usize },
}

impl IncomingMessageError {
    /// Error code sent back to the client
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse(_) => "parse_error",
            Self::InvalidAudio | Self::AudioTooLarge { .. } => "validation_error",
        }
    }
}

impl IncomingMessage {
    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self, IncomingMessageError> {
        serde_json::from_str(text).map_err(|e| IncomingMessageError::Parse(e.to_string()))
    }

    /// Decode the audio payload of an `audio_data` message.
    pub fn into_audio(self) -> Result<Bytes, IncomingMessageError> {
        match self {
            Self::AudioData { audio } => {
                // base64 expands by 4/3, reject before decoding
                let estimated = audio.len() / 4 * 3;
                if estimated > MAX_AUDIO_MESSAGE_SIZE {
                    return Err(IncomingMessageError::AudioTooLarge {
                        size: estimated,
                        max: MAX_AUDIO_MESSAGE_SIZE,
                    });
                }
                codec::decode_audio(&audio).map_err(|_| IncomingMessageError::InvalidAudio)
            }
        }
    }
}
