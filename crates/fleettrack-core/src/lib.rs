//! # fleettrack-core
//!
//! Core vehicle tracking data model and offline-first primitives.
//!
//! This crate provides:
//! - Data model types (LocationSample, LocationEvent, VehicleStatus, etc.)
//! - The significance filter deciding which samples are worth transmitting
//! - The durable, bounded pending queue for not-yet-delivered events
//! - The key-value storage abstraction shared by all durable state
//!
//! This crate is intentionally runtime-agnostic and contains no async code:
//! both the foreground tracker and the OS-scheduled background task build on
//! it without pulling in an executor.

pub mod filter;
pub mod model;
pub mod queue;
pub mod storage;

pub use filter::{haversine_meters, FilterConfig, SignificanceFilter};
pub use model::*;
pub use queue::PendingQueue;
pub use storage::{
    keys, KeyValueStore, KeyValueStoreExt, MemoryKeyValueStore, StorageError, TrackingContext,
};
