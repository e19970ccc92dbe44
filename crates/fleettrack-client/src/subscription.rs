//! Observer-side vehicle subscription.
//!
//! Follows one vehicle's event stream: keeps the last known event, applies
//! last-write-wins ordering on the sender's emission timestamps, and
//! derives staleness from how long ago anything arrived. Connectivity loss
//! is surfaced as plain state; the last known position is retained as the
//! best available estimate.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use fleettrack_channel::{ChannelState, HandlerId, RealtimeChannel};
use fleettrack_core::VehicleStatus;
use fleettrack_protocol::{
    events, LocationUpdate, StatusUpdate, VehicleOffline, VehicleSubscription,
};

use crate::error::TrackerError;

/// Observer configuration.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// No update for this long marks the view stale.
    pub stale_threshold_ms: i64,
    /// How often staleness is recomputed.
    pub poll_interval: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            stale_threshold_ms: 30_000,
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// The observer's view of one vehicle.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionState {
    pub vehicle_id: String,

    /// Last event applied, monotonic in its emission timestamp.
    pub last_event: Option<LocationUpdate>,

    /// When anything last arrived for this vehicle, epoch milliseconds.
    pub last_received_at_epoch_ms: i64,

    /// Derived: true once nothing has arrived within the threshold.
    pub is_stale: bool,

    /// Mirror of the channel state, surfaced as plain state rather than an
    /// error.
    pub connected: bool,
}

impl SubscriptionState {
    fn new(vehicle_id: &str, now_ms: i64, connected: bool) -> Self {
        Self {
            vehicle_id: vehicle_id.to_string(),
            last_event: None,
            last_received_at_epoch_ms: now_ms,
            is_stale: false,
            connected,
        }
    }

    /// Apply an inbound location update. Events older than the stored one
    /// are discarded; returns whether the update was applied.
    fn apply_location(&mut self, update: LocationUpdate, now_ms: i64) -> bool {
        if update.vehicle_id != self.vehicle_id {
            return false;
        }
        if let Some(last) = &self.last_event {
            if update.emitted_at < last.emitted_at {
                debug!(
                    incoming = update.emitted_at,
                    stored = last.emitted_at,
                    "discarding out-of-order location update"
                );
                return false;
            }
        }

        self.last_event = Some(update);
        self.last_received_at_epoch_ms = now_ms;
        self.is_stale = false;
        true
    }

    /// Apply an inbound status update under the same ordering rule. A
    /// status change proves liveness even without a position fix.
    fn apply_status(&mut self, update: StatusUpdate, now_ms: i64) -> bool {
        if update.vehicle_id != self.vehicle_id {
            return false;
        }
        if let Some(last) = &mut self.last_event {
            if update.emitted_at < last.emitted_at {
                return false;
            }
            last.status = update.status;
            last.emitted_at = update.emitted_at;
        }

        self.last_received_at_epoch_ms = now_ms;
        self.is_stale = false;
        true
    }

    /// The server declared the vehicle offline.
    fn apply_offline(&mut self) {
        if let Some(last) = &mut self.last_event {
            last.status = VehicleStatus::Offline;
        }
    }

    fn recompute_staleness(&mut self, now_ms: i64, threshold_ms: i64) {
        self.is_stale = now_ms - self.last_received_at_epoch_ms > threshold_ms;
    }
}

/// Tracks one vehicle's realtime stream on behalf of an observer.
pub struct SubscriptionTracker {
    channel: Arc<RealtimeChannel>,
    config: SubscriptionConfig,
    state: Arc<RwLock<Option<SubscriptionState>>>,
    handler_ids: Mutex<Vec<(&'static str, HandlerId)>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionTracker {
    pub fn new(channel: Arc<RealtimeChannel>, config: SubscriptionConfig) -> Self {
        Self {
            channel,
            config,
            state: Arc::new(RwLock::new(None)),
            handler_ids: Mutex::new(Vec::new()),
            timer: Mutex::new(None),
        }
    }

    /// The current view, `None` while not tracking.
    pub fn snapshot(&self) -> Option<SubscriptionState> {
        self.state.read().unwrap().clone()
    }

    /// Subscribe to a vehicle's stream and start the staleness timer.
    pub fn start_tracking(&self, vehicle_id: &str) -> Result<(), TrackerError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        *self.state.write().unwrap() = Some(SubscriptionState::new(
            vehicle_id,
            now_ms,
            self.channel.is_connected(),
        ));

        // Handlers first, then the subscribe request: no window where an
        // update could arrive unobserved.
        self.register_handlers();

        let request = VehicleSubscription {
            vehicle_id: vehicle_id.to_string(),
        };
        if let Err(error) = self.channel.send(events::SUBSCRIBE_TO_VEHICLE, &request) {
            self.remove_handlers();
            *self.state.write().unwrap() = None;
            return Err(error.into());
        }

        self.spawn_timer(vehicle_id.to_string());
        debug!(vehicle_id, "subscription started");
        Ok(())
    }

    /// Unsubscribe and drop the handlers and timer.
    pub fn stop_tracking(&self) {
        let vehicle_id = {
            let state = self.state.read().unwrap();
            state.as_ref().map(|s| s.vehicle_id.clone())
        };

        if let Some(vehicle_id) = vehicle_id {
            let request = VehicleSubscription { vehicle_id };
            if let Err(error) = self.channel.send(events::UNSUBSCRIBE_FROM_VEHICLE, &request) {
                debug!(%error, "unsubscribe not sent");
            }
        }

        self.remove_handlers();
        if let Some(timer) = self.timer.lock().unwrap().take() {
            timer.abort();
        }
        *self.state.write().unwrap() = None;
    }

    fn register_handlers(&self) {
        let mut ids = self.handler_ids.lock().unwrap();

        let state = self.state.clone();
        ids.push((
            events::LOCATION_UPDATE,
            self.channel.subscribe(events::LOCATION_UPDATE, move |data| {
                match serde_json::from_value::<LocationUpdate>(data) {
                    Ok(update) => {
                        let now_ms = chrono::Utc::now().timestamp_millis();
                        if let Some(state) = state.write().unwrap().as_mut() {
                            state.apply_location(update, now_ms);
                        }
                    }
                    Err(error) => warn!(%error, "malformed location update"),
                }
            }),
        ));

        let state = self.state.clone();
        ids.push((
            events::STATUS_UPDATE,
            self.channel.subscribe(events::STATUS_UPDATE, move |data| {
                match serde_json::from_value::<StatusUpdate>(data) {
                    Ok(update) => {
                        let now_ms = chrono::Utc::now().timestamp_millis();
                        if let Some(state) = state.write().unwrap().as_mut() {
                            state.apply_status(update, now_ms);
                        }
                    }
                    Err(error) => warn!(%error, "malformed status update"),
                }
            }),
        ));

        let state = self.state.clone();
        ids.push((
            events::VEHICLE_OFFLINE,
            self.channel.subscribe(events::VEHICLE_OFFLINE, move |data| {
                match serde_json::from_value::<VehicleOffline>(data) {
                    Ok(notice) => {
                        if let Some(state) = state.write().unwrap().as_mut() {
                            if notice.vehicle_id == state.vehicle_id {
                                state.apply_offline();
                            }
                        }
                    }
                    Err(error) => warn!(%error, "malformed offline notice"),
                }
            }),
        ));
    }

    fn remove_handlers(&self) {
        for (event, id) in self.handler_ids.lock().unwrap().drain(..) {
            self.channel.unsubscribe(event, id);
        }
    }

    fn spawn_timer(&self, vehicle_id: String) {
        let state = self.state.clone();
        let channel = self.channel.clone();
        let mut state_rx = self.channel.watch_state();
        let threshold_ms = self.config.stale_threshold_ms;
        let poll_interval = self.config.poll_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now_ms = chrono::Utc::now().timestamp_millis();
                        if let Some(state) = state.write().unwrap().as_mut() {
                            state.recompute_staleness(now_ms, threshold_ms);
                        }
                    }
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let connected =
                            *state_rx.borrow_and_update() == ChannelState::Connected;
                        if let Some(state) = state.write().unwrap().as_mut() {
                            state.connected = connected;
                        }
                        if connected {
                            // The server forgets subscriptions across
                            // reconnects; renew ours.
                            let request = VehicleSubscription {
                                vehicle_id: vehicle_id.clone(),
                            };
                            let _ = channel.send(events::SUBSCRIBE_TO_VEHICLE, &request);
                        } else {
                            warn!("realtime channel lost; retaining last known position");
                        }
                    }
                }
            }
        });

        if let Some(previous) = self.timer.lock().unwrap().replace(task) {
            previous.abort();
        }
    }
}

impl Drop for SubscriptionTracker {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.lock().unwrap().take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleettrack_core::Coordinates;

    const T0: i64 = 1_700_000_000_000;

    fn update(emitted_at: i64, lat: f64) -> LocationUpdate {
        LocationUpdate {
            vehicle_id: "vehicle-1".to_string(),
            coords: Coordinates {
                latitude: lat,
                longitude: 5.0,
            },
            speed: None,
            heading: None,
            status: VehicleStatus::OnTrip,
            emitted_at,
        }
    }

    #[test]
    fn test_first_update_is_applied() {
        let mut state = SubscriptionState::new("vehicle-1", T0, true);

        assert!(state.apply_location(update(T0 + 100, 52.0), T0 + 150));
        assert_eq!(state.last_event.as_ref().unwrap().coords.latitude, 52.0);
        assert_eq!(state.last_received_at_epoch_ms, T0 + 150);
        assert!(!state.is_stale);
    }

    #[test]
    fn test_out_of_order_update_is_discarded() {
        let mut state = SubscriptionState::new("vehicle-1", T0, true);
        state.apply_location(update(T0 + 200, 52.0), T0 + 200);

        // An event emitted earlier than the stored one must not win.
        assert!(!state.apply_location(update(T0 + 100, 99.0), T0 + 300));
        assert_eq!(state.last_event.as_ref().unwrap().coords.latitude, 52.0);
        assert_eq!(state.last_event.as_ref().unwrap().emitted_at, T0 + 200);
    }

    #[test]
    fn test_equal_timestamp_wins() {
        // Last write wins: an equal timestamp replaces the stored event.
        let mut state = SubscriptionState::new("vehicle-1", T0, true);
        state.apply_location(update(T0 + 100, 52.0), T0 + 100);

        assert!(state.apply_location(update(T0 + 100, 53.0), T0 + 200));
        assert_eq!(state.last_event.as_ref().unwrap().coords.latitude, 53.0);
    }

    #[test]
    fn test_update_for_other_vehicle_is_ignored() {
        let mut state = SubscriptionState::new("vehicle-1", T0, true);
        let mut foreign = update(T0 + 100, 52.0);
        foreign.vehicle_id = "vehicle-2".to_string();

        assert!(!state.apply_location(foreign, T0 + 100));
        assert!(state.last_event.is_none());
    }

    #[test]
    fn test_status_update_applies_and_counts_as_liveness() {
        let mut state = SubscriptionState::new("vehicle-1", T0, true);
        state.apply_location(update(T0 + 100, 52.0), T0 + 100);

        let status = StatusUpdate {
            vehicle_id: "vehicle-1".to_string(),
            status: VehicleStatus::Online,
            emitted_at: T0 + 200,
        };
        assert!(state.apply_status(status, T0 + 250));

        let last = state.last_event.as_ref().unwrap();
        assert_eq!(last.status, VehicleStatus::Online);
        assert_eq!(last.emitted_at, T0 + 200);
        assert_eq!(state.last_received_at_epoch_ms, T0 + 250);
    }

    #[test]
    fn test_stale_status_update_is_discarded() {
        let mut state = SubscriptionState::new("vehicle-1", T0, true);
        state.apply_location(update(T0 + 200, 52.0), T0 + 200);

        let status = StatusUpdate {
            vehicle_id: "vehicle-1".to_string(),
            status: VehicleStatus::Offline,
            emitted_at: T0 + 100,
        };
        assert!(!state.apply_status(status, T0 + 300));
        assert_eq!(
            state.last_event.as_ref().unwrap().status,
            VehicleStatus::OnTrip
        );
    }

    #[test]
    fn test_offline_notice_overrides_status() {
        let mut state = SubscriptionState::new("vehicle-1", T0, true);
        state.apply_location(update(T0 + 100, 52.0), T0 + 100);

        state.apply_offline();
        assert_eq!(
            state.last_event.as_ref().unwrap().status,
            VehicleStatus::Offline
        );
        // Position is retained as the best available estimate.
        assert_eq!(state.last_event.as_ref().unwrap().coords.latitude, 52.0);
    }

    #[test]
    fn test_staleness_boundaries() {
        let mut state = SubscriptionState::new("vehicle-1", T0, true);
        state.last_received_at_epoch_ms = T0;

        // 29 s after the last update: fresh.
        state.recompute_staleness(T0 + 29_000, 30_000);
        assert!(!state.is_stale);

        // 31 s after: stale.
        state.recompute_staleness(T0 + 31_000, 30_000);
        assert!(state.is_stale);
    }

    #[test]
    fn test_fresh_update_clears_staleness() {
        let mut state = SubscriptionState::new("vehicle-1", T0, true);
        state.recompute_staleness(T0 + 60_000, 30_000);
        assert!(state.is_stale);

        state.apply_location(update(T0 + 61_000, 52.0), T0 + 61_000);
        assert!(!state.is_stale);
    }
}
