//! Client-facing message types produced by the relay.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::realtime::ClientId;

/// JSON text messages sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingMessage {
    /// Sent once after the client is registered
    Connected {
        /// Identifier assigned to the client
        client_id: ClientId,
    },

    /// Incremental text or transcript for the current turn
    Transcript {
        /// Text delta
        text: String,
    },

    /// The current turn finished
    TurnDone,

    /// Recoverable failure
    Error {
        /// Error code (optional)
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        /// Error message
        message: String,
    },

    /// The relay is shutting down
    Closing {
        /// Reason for closing
        reason: String,
    },
}

/// Route for a single frame on a client's outbound channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRoute {
    /// Binary `audio_response` frame
    Audio(Bytes),
    /// JSON text message
    Outgoing(OutgoingMessage),
    /// Close the client transport
    Close,
}

impl ClientRoute {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Audio(_) => "audio",
            Self::Outgoing(_) => "message",
            Self::Close => "close",
        }
    }
}
