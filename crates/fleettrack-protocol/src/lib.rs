//! # fleettrack-protocol
//!
//! Realtime tracking protocol message types and codec.
//!
//! This crate defines the event names and JSON payloads exchanged over the
//! WebSocket channel, plus the REST persistence body.

pub mod codec;
pub mod messages;

pub use codec::{decode_envelope, encode_envelope, CodecError, Envelope};
pub use messages::*;
