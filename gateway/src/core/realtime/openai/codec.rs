//! Translation between relay types and the OpenAI Realtime wire format.
//!
//! Every function here is pure. Encoding builds typed [`ClientEvent`]
//! envelopes; decoding turns one raw upstream frame into a
//! [`RealtimeEvent`] and never fails, so a malformed frame can't break
//! the receive loop.

use base64::prelude::*;
use bytes::Bytes;
use tracing::{debug, trace};

use super::config::{OpenAIRealtimeAudioFormat, OpenAIRealtimeVoice};
use super::messages::{ClientEvent, MaxTokens, ResponseConfig, ServerEvent, SessionUpdate};
use crate::core::realtime::base::{
    AudioChunk, RealtimeError, RealtimeEvent, RealtimeResult, SessionConfig,
};

/// Message used for every frame that cannot be decoded.
pub const DECODE_FAILURE: &str = "decode failure";

// =============================================================================
// Base64 layer
// =============================================================================

/// Base64-encode audio for the upstream wire (standard alphabet, padded).
#[inline]
pub fn encode_audio(data: &[u8]) -> String {
    BASE64_STANDARD.encode(data)
}

/// Decode base64 audio received from upstream.
pub fn decode_audio(encoded: &str) -> RealtimeResult<Bytes> {
    BASE64_STANDARD
        .decode(encoded)
        .map(Bytes::from)
        .map_err(|e| RealtimeError::SerializationError(format!("invalid base64 audio: {e}")))
}

// =============================================================================
// Encoding
// =============================================================================

/// Build the `input_audio_buffer.append` envelope for one chunk.
///
/// Empty chunks are passed through unchanged.
pub fn encode_append(chunk: &AudioChunk) -> ClientEvent {
    ClientEvent::InputAudioBufferAppend {
        audio: encode_audio(chunk.as_bytes()),
    }
}

fn modality_names(cfg: &SessionConfig) -> Vec<String> {
    cfg.modalities.iter().map(|m| m.as_str().to_string()).collect()
}

/// Build the `session.update` envelope sent right after a connection opens.
pub fn encode_session_update(cfg: &SessionConfig) -> ClientEvent {
    // Configuration loading rejects unknown names; anything else set in
    // code falls back to the defaults
    let audio_format: OpenAIRealtimeAudioFormat = cfg.audio_format.parse().unwrap_or_default();
    let voice: OpenAIRealtimeVoice = cfg.voice.parse().unwrap_or_default();

    ClientEvent::SessionUpdate {
        session: SessionUpdate {
            modalities: modality_names(cfg),
            instructions: cfg.instructions.clone(),
            voice: voice.to_string(),
            input_audio_format: audio_format.to_string(),
            output_audio_format: audio_format.to_string(),
            tools: Vec::new(),
            temperature: cfg.temperature,
            max_response_output_tokens: MaxTokens::from_limit(cfg.max_output_tokens),
        },
    }
}

/// Build the `response.create` envelope that starts a turn.
pub fn encode_response_create(cfg: &SessionConfig) -> ClientEvent {
    ClientEvent::ResponseCreate {
        response: Some(ResponseConfig {
            modalities: Some(modality_names(cfg)),
            instructions: Some(cfg.instructions.clone()),
        }),
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode one upstream frame.
///
/// Malformed JSON, invalid UTF-8 and invalid base64 all yield
/// `RealtimeEvent::Error("decode failure")`. Unrecognized message kinds are
/// returned as `RealtimeEvent::Other` with the raw text.
pub fn decode(raw: &[u8]) -> RealtimeEvent {
    let Ok(text) = std::str::from_utf8(raw) else {
        debug!(bytes = raw.len(), "Upstream frame is not valid UTF-8");
        return RealtimeEvent::Error(DECODE_FAILURE.to_string());
    };

    let event: ServerEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(error = %e, "Failed to parse upstream message");
            return RealtimeEvent::Error(DECODE_FAILURE.to_string());
        }
    };

    match event {
        ServerEvent::AudioDelta { delta, .. } => match decode_audio(&delta) {
            Ok(audio) => RealtimeEvent::Delta(audio),
            Err(e) => {
                debug!(error = %e, "Failed to decode audio delta");
                RealtimeEvent::Error(DECODE_FAILURE.to_string())
            }
        },
        ServerEvent::AudioDone { .. } => RealtimeEvent::TurnDone,
        ServerEvent::TextDelta { delta } | ServerEvent::AudioTranscriptDelta { delta } => {
            RealtimeEvent::TextDelta(delta)
        }
        ServerEvent::Error { error } => {
            RealtimeEvent::Error(format!("{}: {}", error.error_type, error.message))
        }
        ServerEvent::Unknown => {
            trace!("Unhandled upstream message");
            RealtimeEvent::Other(text.to_string())
        }
    }
}
