//! Tracking client configuration.

use std::time::Duration;

use fleettrack_core::FilterConfig;

use crate::geo::WatchConfig;

/// Configuration for a driver-side tracking session.
///
/// Injected by the composition root; every interval and threshold has a
/// production default but is tunable for tests.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// The vehicle this client reports for.
    pub vehicle_id: String,

    /// Significance thresholds for the foreground filter.
    pub filter: FilterConfig,

    /// Platform watch parameters.
    pub watch: WatchConfig,

    /// How often the latest accepted event is persisted over REST.
    pub rest_sync_interval: Duration,

    /// Pending queue capacity.
    pub queue_cap: usize,
}

impl TrackerConfig {
    pub fn new(vehicle_id: impl Into<String>) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            filter: FilterConfig::default(),
            watch: WatchConfig::default(),
            rest_sync_interval: Duration::from_secs(300),
            queue_cap: fleettrack_core::queue::DEFAULT_QUEUE_CAP,
        }
    }
}
