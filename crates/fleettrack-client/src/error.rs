//! Tracking client error taxonomy.

use thiserror::Error;

use fleettrack_channel::ChannelError;
use fleettrack_core::StorageError;

use crate::geo::GeoError;

/// Errors surfaced by the tracking clients.
///
/// Permission denial is fatal to a tracking start and surfaced to the user;
/// connectivity problems are transient and handled by queuing; everything
/// crossing the background-task boundary is caught and logged instead.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The platform denied location permission. Not retried.
    #[error("Location permission denied")]
    PermissionDenied,

    /// The platform location provider is unavailable. The caller may retry.
    #[error("Location provider unavailable")]
    ProviderUnavailable,

    /// Realtime channel failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Durable storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// REST persistence backstop failure.
    #[error("REST persistence failed: {0}")]
    Rest(#[from] reqwest::Error),
}

impl From<GeoError> for TrackerError {
    fn from(error: GeoError) -> Self {
        match error {
            GeoError::PermissionDenied => TrackerError::PermissionDenied,
            GeoError::ProviderUnavailable => TrackerError::ProviderUnavailable,
        }
    }
}
