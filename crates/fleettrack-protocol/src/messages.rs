//! Protocol message types for the realtime tracking channel.
//!
//! Every message travels as a JSON envelope `{"event": <name>, "data":
//! <payload>}` over a WebSocket text frame. This module defines the event
//! names and the typed payloads:
//! - Driver → server: location/status reports and service lifecycle
//! - Observer → server: vehicle subscriptions
//! - Server → client: location/status updates and offline notices
//! - Both ways: application-level ping/pong heartbeat

use serde::{Deserialize, Serialize};

use fleettrack_core::{Coordinates, LocationEvent, VehicleStatus};

/// Wire event names.
pub mod events {
    // Driver → server
    pub const UPDATE_VEHICLE_LOCATION: &str = "updateVehicleLocation";
    pub const UPDATE_VEHICLE_STATUS: &str = "updateVehicleStatus";
    pub const START_VEHICLE_SERVICE: &str = "startVehicleService";
    pub const STOP_VEHICLE_SERVICE: &str = "stopVehicleService";

    // Observer → server
    pub const SUBSCRIBE_TO_VEHICLE: &str = "subscribeToVehicle";
    pub const UNSUBSCRIBE_FROM_VEHICLE: &str = "unsubscribeFromVehicle";

    // Server → client
    pub const LOCATION_UPDATE: &str = "locationUpdate";
    pub const STATUS_UPDATE: &str = "statusUpdate";
    pub const VEHICLE_OFFLINE: &str = "vehicleOffline";

    // Heartbeat
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
}

/// Location report payload for `updateVehicleLocation`.
///
/// The same shape is the body of the REST persistence backstop
/// (`POST /tracking/vehicle/{id}/location`), which makes a reading safe to
/// resend on either path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationReport {
    pub vehicle_id: String,

    pub latitude: f64,

    pub longitude: f64,

    /// Ground speed in meters per second.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,

    /// Heading in degrees clockwise from true north.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,

    pub status: VehicleStatus,

    /// Emission time, epoch milliseconds.
    pub timestamp: i64,
}

impl From<&LocationEvent> for LocationReport {
    fn from(event: &LocationEvent) -> Self {
        Self {
            vehicle_id: event.vehicle_id.clone(),
            latitude: event.sample.latitude,
            longitude: event.sample.longitude,
            speed: event.sample.speed_mps,
            heading: event.sample.heading_deg,
            status: event.status,
            timestamp: event.emitted_at_epoch_ms,
        }
    }
}

/// Status change payload for `updateVehicleStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub vehicle_id: String,
    pub status: VehicleStatus,
}

/// Service lifecycle payload for `startVehicleService`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStart {
    pub vehicle_id: String,
    pub coords: Coordinates,
    pub status: VehicleStatus,
}

/// Service lifecycle payload for `stopVehicleService`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStop {
    pub vehicle_id: String,
}

/// Subscription payload for `subscribeToVehicle` / `unsubscribeFromVehicle`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleSubscription {
    pub vehicle_id: String,
}

/// Inbound payload of `locationUpdate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub vehicle_id: String,

    pub coords: Coordinates,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,

    pub status: VehicleStatus,

    /// Emission time at the reporting client, epoch milliseconds.
    pub emitted_at: i64,
}

/// Inbound payload of `statusUpdate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub vehicle_id: String,
    pub status: VehicleStatus,
    pub emitted_at: i64,
}

/// Inbound payload of `vehicleOffline`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleOffline {
    pub vehicle_id: String,
}

/// Heartbeat payload, both directions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Sender's clock, epoch milliseconds.
    pub timestamp: i64,
}

impl Heartbeat {
    /// A heartbeat stamped with the current wall clock.
    pub fn now() -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}
