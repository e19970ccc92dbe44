//! Vehicle tracking data model types.
//!
//! These are the units the rest of the system moves around:
//! - Raw GPS fixes as produced by the platform provider
//! - Location events, the unit of transmission and of queuing
//! - Pending queue entries for offline buffering
//!
//! Field names serialize in camelCase to match the wire and storage formats.

use serde::{Deserialize, Serialize};

/// A WGS84 coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// A raw position fix from the platform location provider.
///
/// Samples are immutable: once produced by a watch callback they are either
/// turned into a [`LocationEvent`] or dropped by the significance filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub latitude: f64,

    pub longitude: f64,

    /// Estimated horizontal accuracy radius in meters.
    pub accuracy_meters: f64,

    /// Ground speed in meters per second, if the provider reported one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_mps: Option<f64>,

    /// Heading in degrees clockwise from true north, if reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading_deg: Option<f64>,

    /// When the fix was taken, epoch milliseconds.
    pub sampled_at_epoch_ms: i64,
}

impl LocationSample {
    /// The coordinate pair of this sample.
    pub fn coordinates(&self) -> Coordinates {
        Coordinates {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

/// Reported operational status of a vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleStatus {
    Online,
    Offline,
    OnTrip,
}

impl Default for VehicleStatus {
    fn default() -> Self {
        VehicleStatus::Offline
    }
}

impl std::fmt::Display for VehicleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VehicleStatus::Online => write!(f, "online"),
            VehicleStatus::Offline => write!(f, "offline"),
            VehicleStatus::OnTrip => write!(f, "on_trip"),
        }
    }
}

/// A location sample bound to a vehicle and its status at emission time.
///
/// This is the unit of transmission over the realtime channel and the unit
/// stored in the pending queue while offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationEvent {
    pub vehicle_id: String,

    pub sample: LocationSample,

    pub status: VehicleStatus,

    /// When the event was built, epoch milliseconds.
    pub emitted_at_epoch_ms: i64,
}

impl LocationEvent {
    /// Build an event from an accepted sample and the current status.
    pub fn new(
        vehicle_id: impl Into<String>,
        sample: LocationSample,
        status: VehicleStatus,
        emitted_at_epoch_ms: i64,
    ) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            sample,
            status,
            emitted_at_epoch_ms,
        }
    }
}

/// A queued, not-yet-delivered location event.
///
/// Entries are append-only: they are created on enqueue and removed on a
/// successful drain, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingQueueEntry {
    pub event: LocationEvent,

    /// When the entry was appended, epoch milliseconds.
    pub enqueued_at_epoch_ms: i64,
}
