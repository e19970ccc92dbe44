//! # fleettrack-channel
//!
//! The resilient realtime event channel that carries location and status
//! events between clients and the tracking backend.
//!
//! The channel owns its entire connection lifecycle: authenticated
//! WebSocket handshake, application-level heartbeat, and exponential
//! reconnect backoff, exposed to callers as a single state machine. It is
//! explicitly constructed with injected configuration and held by the
//! composition root; there is no ambient singleton.

pub mod backoff;
pub mod channel;

pub use backoff::BackoffPolicy;
pub use channel::{ChannelConfig, ChannelError, ChannelState, HandlerId, RealtimeChannel};
