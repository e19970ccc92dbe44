//! WebSocket envelope codec for the tracking protocol.
//!
//! Messages travel as JSON over WebSocket text frames, wrapped in an
//! envelope that names the event. The channel layer routes on the event
//! name; typed payloads are decoded at the edges.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// JSON serialization failed.
    #[error("Failed to serialize message: {0}")]
    SerializeError(#[from] serde_json::Error),

    /// Received binary frame instead of text.
    #[error("Expected text frame, received binary")]
    BinaryFrame,
}

/// A routed event: name plus untyped payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The event name (see [`crate::messages::events`]).
    pub event: String,

    /// The event payload.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    /// Wrap a typed payload under an event name.
    pub fn new<T: Serialize>(event: &str, data: &T) -> Result<Self, CodecError> {
        Ok(Self {
            event: event.to_string(),
            data: serde_json::to_value(data)?,
        })
    }

    /// Decode the payload into a typed message.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        serde_json::from_value(self.data.clone()).map_err(CodecError::from)
    }
}

/// Encode an envelope to a JSON string for transmission.
pub fn encode_envelope(envelope: &Envelope) -> Result<String, CodecError> {
    serde_json::to_string(envelope).map_err(CodecError::from)
}

/// Decode an envelope from a received JSON string.
pub fn decode_envelope(text: &str) -> Result<Envelope, CodecError> {
    serde_json::from_str(text).map_err(CodecError::from)
}
