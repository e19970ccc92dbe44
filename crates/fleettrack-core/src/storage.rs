//! Durable key-value storage abstraction.
//!
//! Tracking state that must survive process restarts (the pending queue,
//! the background task's context, the last-sent fingerprints) goes through
//! this trait. Implementations differ per platform:
//! - `MemoryKeyValueStore` here, for tests and ephemeral setups
//! - a file-backed store in the client crate for Linux
//!
//! The base trait works on raw JSON strings so it stays object-safe; typed
//! access is layered on top by [`KeyValueStoreExt`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

use crate::model::{LocationSample, VehicleStatus};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Failed to read a value.
    #[error("Failed to read key {key}: {reason}")]
    ReadError { key: String, reason: String },

    /// Failed to write a value.
    #[error("Failed to write key {key}: {reason}")]
    WriteError { key: String, reason: String },

    /// Stored data could not be decoded.
    #[error("Invalid data under key {1}: {0}")]
    InvalidData(#[source] serde_json::Error, String),
}

/// Well-known keys shared by the foreground and background producers.
pub mod keys {
    /// Durable context the background task needs to run on its own.
    pub const CONTEXT: &str = "tracking.context";
    /// Last sample transmitted by the foreground tracker.
    pub const FOREGROUND_LAST_SENT: &str = "tracking.foreground.last_sent";
    /// Last sample transmitted by the background sync agent.
    pub const BACKGROUND_LAST_SENT: &str = "tracking.background.last_sent";
    /// The pending queue of undelivered location events.
    pub const PENDING_EVENTS: &str = "tracking.pending_events";
}

/// Abstract durable key-value storage.
///
/// `save_raw` must be atomic per key: readers see either the previous or the
/// new value, never a torn write. That is what lets the pending queue treat
/// each load-modify-store cycle as a unit.
pub trait KeyValueStore: Send + Sync {
    /// Load the raw JSON string under a key, `None` if absent.
    fn load_raw(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Atomically replace the value under a key.
    fn save_raw(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Delete a key. Deleting an absent key is a no-op.
    fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Check if a key exists.
    fn has_key(&self, key: &str) -> bool;
}

/// Typed convenience layer over [`KeyValueStore`].
pub trait KeyValueStoreExt: KeyValueStore {
    /// Load and decode the value under a key, `None` if absent.
    fn load_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.load_raw(key)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StorageError::InvalidData(e, key.to_string())),
            None => Ok(None),
        }
    }

    /// Encode and store a value under a key.
    fn save_value<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let raw = serde_json::to_string(value).map_err(|e| StorageError::WriteError {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.save_raw(key, &raw)
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}

/// Context the background sync agent loads at the start of each invocation.
///
/// The background task may run in a fresh process lifecycle, so everything
/// it needs is persisted here by the foreground tracker when tracking
/// starts, and removed when tracking stops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingContext {
    pub vehicle_id: String,

    pub auth_token: String,

    pub status: VehicleStatus,
}

impl TrackingContext {
    pub fn new(
        vehicle_id: impl Into<String>,
        auth_token: impl Into<String>,
        status: VehicleStatus,
    ) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            auth_token: auth_token.into(),
            status,
        }
    }
}

/// In-memory key-value store.
///
/// Not durable; used by tests and by setups that accept losing queued
/// events on process exit.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    data: RwLock<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn load_raw(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.data.read().unwrap().get(key).cloned())
    }

    fn save_raw(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.data
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.write().unwrap().remove(key);
        Ok(())
    }

    fn has_key(&self, key: &str) -> bool {
        self.data.read().unwrap().contains_key(key)
    }
}
