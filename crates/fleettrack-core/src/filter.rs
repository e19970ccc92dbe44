//! Significance filtering for location samples.
//!
//! Transmitting every GPS callback would burn battery and bandwidth for no
//! observable gain, so samples pass through a significance filter first. The
//! filter is pure: all state it needs (the last transmitted sample) is
//! supplied by the caller, which keeps the foreground and background
//! producers on independent memories and makes the rules testable in
//! isolation.

use crate::model::{Coordinates, LocationSample};

/// Mean Earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two coordinates in meters (haversine).
pub fn haversine_meters(a: &Coordinates, b: &Coordinates) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let d_phi = (b.latitude - a.latitude).to_radians();
    let d_lambda = (b.longitude - a.longitude).to_radians();

    let h = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_M * c
}

/// Thresholds governing which samples are significant.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Fixes with a worse (larger) accuracy radius than this are noise.
    pub max_accuracy_m: f64,
    /// Fixes older than this by the time we see them are stale.
    pub max_age_ms: i64,
    /// Movement beyond this distance from the last sent fix is significant.
    pub significant_distance_m: f64,
    /// A speed change beyond this many km/h is significant.
    pub significant_speed_delta_kmh: f64,
    /// Force an update after this long even when stationary (liveness).
    pub heartbeat_interval_ms: i64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_accuracy_m: 50.0,
            max_age_ms: 60_000,
            significant_distance_m: 10.0,
            significant_speed_delta_kmh: 2.0,
            heartbeat_interval_ms: 300_000,
        }
    }
}

/// Decides whether a raw sample warrants transmission.
///
/// Rules are applied in order, short-circuiting:
/// 1. reject noisy fixes (accuracy radius too large)
/// 2. reject stale fixes (sampled too long ago)
/// 3. accept the first-ever sample unconditionally
/// 4. accept significant movement (haversine distance)
/// 5. accept significant speed change
/// 6. accept as heartbeat once the last sent sample is old enough
/// 7. otherwise reject
#[derive(Debug, Clone, Default)]
pub struct SignificanceFilter {
    config: FilterConfig,
}

impl SignificanceFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Whether `sample` should be transmitted given the last sent sample.
    ///
    /// `now_ms` is passed in rather than read from a clock so callers in
    /// different execution contexts (and tests) control time themselves.
    pub fn accept(
        &self,
        sample: &LocationSample,
        last_sent: Option<&LocationSample>,
        now_ms: i64,
    ) -> bool {
        if sample.accuracy_meters > self.config.max_accuracy_m {
            tracing::debug!(
                accuracy = sample.accuracy_meters,
                "rejecting sample: accuracy too low"
            );
            return false;
        }

        let age_ms = now_ms - sample.sampled_at_epoch_ms;
        if age_ms > self.config.max_age_ms {
            tracing::debug!(age_ms, "rejecting sample: fix too old");
            return false;
        }

        let Some(last) = last_sent else {
            // First sample is always sent.
            return true;
        };

        let distance_m = haversine_meters(&last.coordinates(), &sample.coordinates());
        if distance_m > self.config.significant_distance_m {
            return true;
        }

        let speed_delta_kmh =
            (sample.speed_mps.unwrap_or(0.0) - last.speed_mps.unwrap_or(0.0)).abs() * 3.6;
        if speed_delta_kmh > self.config.significant_speed_delta_kmh {
            return true;
        }

        // Liveness: observers must see the vehicle is still alive even when
        // it has not moved.
        if now_ms - last.sampled_at_epoch_ms > self.config.heartbeat_interval_ms {
            return true;
        }

        false
    }
}
