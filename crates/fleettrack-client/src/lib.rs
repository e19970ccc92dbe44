//! # fleettrack-client
//!
//! Driver- and observer-side tracking clients.
//!
//! This crate wires the core primitives to the realtime channel:
//! - [`ForegroundTracker`] runs while the app is active: GPS watch,
//!   significance filtering, realtime emission, periodic REST persistence
//! - [`BackgroundSyncAgent`] runs on the OS background schedule:
//!   durable-first queuing with opportunistic short-lived sends
//! - [`SubscriptionTracker`] follows a vehicle's event stream with
//!   staleness awareness
//! - [`GeoSampler`] abstracts the platform location provider
//!
//! Components are constructed explicitly by a composition root with
//! injected configuration; nothing here is a process-wide singleton.

pub mod background;
pub mod config;
pub mod error;
pub mod foreground;
pub mod geo;
pub mod rest;
pub mod storage;
pub mod subscription;

pub use background::BackgroundSyncAgent;
pub use config::TrackerConfig;
pub use error::TrackerError;
pub use foreground::ForegroundTracker;
pub use geo::{AccuracyTier, GeoError, GeoSampler, SimulatedRoute, SimulatedSampler, WatchConfig};
pub use rest::RestClient;
pub use storage::FileKeyValueStore;
pub use subscription::{SubscriptionConfig, SubscriptionState, SubscriptionTracker};
