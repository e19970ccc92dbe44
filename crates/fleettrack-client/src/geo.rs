//! Location provider abstraction.
//!
//! [`GeoSampler`] wraps whatever the platform offers for position watching.
//! Each `start_watching` call yields a fresh, infinite stream of samples;
//! `stop` tears the active watch down synchronously. There are no retries
//! at this layer: permission and availability failures are typed and left
//! to the caller.
//!
//! [`SimulatedSampler`] generates a configurable drive path and is what the
//! demo binary and the test suites run against; real platform providers
//! implement the same trait.

use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use fleettrack_core::{Coordinates, LocationSample};

/// Errors from the platform location provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GeoError {
    /// The user or OS denied location permission.
    #[error("Location permission denied")]
    PermissionDenied,

    /// No location provider is available on this device.
    #[error("Location provider unavailable")]
    ProviderUnavailable,
}

/// Requested accuracy tier, mapped to platform-specific constants by
/// implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccuracyTier {
    Low,
    Balanced,
    High,
}

/// Parameters for a position watch.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub accuracy: AccuracyTier,
    /// Minimum time between callbacks.
    pub min_interval: Duration,
    /// Minimum movement between callbacks, meters.
    pub min_distance_m: f64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            accuracy: AccuracyTier::High,
            min_interval: Duration::from_secs(15),
            min_distance_m: 5.0,
        }
    }
}

/// A source of raw position samples.
pub trait GeoSampler: Send + Sync {
    /// Start watching; the receiver yields samples until `stop` is called.
    ///
    /// Starting while a watch is active replaces it with a fresh stream.
    fn start_watching(
        &self,
        config: WatchConfig,
    ) -> Result<mpsc::Receiver<LocationSample>, GeoError>;

    /// Terminate the active watch. Effective immediately; idempotent.
    fn stop(&self);
}

/// Parameters of a simulated drive.
#[derive(Debug, Clone)]
pub struct SimulatedRoute {
    pub start: Coordinates,
    /// Degrees of latitude/longitude added per tick.
    pub step_deg: (f64, f64),
    pub speed_mps: f64,
    pub heading_deg: Option<f64>,
    pub accuracy_m: f64,
    /// Time between samples.
    pub interval: Duration,
}

impl Default for SimulatedRoute {
    fn default() -> Self {
        Self {
            start: Coordinates {
                latitude: 52.0987654,
                longitude: 4.9876545,
            },
            // Roughly 12 m north-east per tick.
            step_deg: (0.0001, 0.0001),
            speed_mps: 8.0,
            heading_deg: Some(45.0),
            accuracy_m: 10.0,
            interval: Duration::from_secs(1),
        }
    }
}

/// Simulated location provider driving a straight-line route.
pub struct SimulatedSampler {
    route: SimulatedRoute,
    permission_granted: bool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedSampler {
    pub fn new(route: SimulatedRoute) -> Self {
        Self {
            route,
            permission_granted: true,
            task: Mutex::new(None),
        }
    }

    /// A sampler that fails permission checks, for exercising denial paths.
    pub fn without_permission(route: SimulatedRoute) -> Self {
        Self {
            permission_granted: false,
            ..Self::new(route)
        }
    }
}

impl GeoSampler for SimulatedSampler {
    fn start_watching(
        &self,
        _config: WatchConfig,
    ) -> Result<mpsc::Receiver<LocationSample>, GeoError> {
        if !self.permission_granted {
            return Err(GeoError::PermissionDenied);
        }

        let (tx, rx) = mpsc::channel(32);
        let route = self.route.clone();

        let handle = tokio::spawn(async move {
            let mut latitude = route.start.latitude;
            let mut longitude = route.start.longitude;
            let mut ticker = tokio::time::interval(route.interval);

            loop {
                ticker.tick().await;

                let sample = LocationSample {
                    latitude,
                    longitude,
                    accuracy_meters: route.accuracy_m,
                    speed_mps: Some(route.speed_mps),
                    heading_deg: route.heading_deg,
                    sampled_at_epoch_ms: chrono::Utc::now().timestamp_millis(),
                };

                latitude += route.step_deg.0;
                longitude += route.step_deg.1;

                if tx.send(sample).await.is_err() {
                    break;
                }
            }
        });

        // A fresh start replaces any active watch.
        if let Some(previous) = self.task.lock().unwrap().replace(handle) {
            previous.abort();
        }

        debug!("simulated watch started");
        Ok(rx)
    }

    fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
            debug!("simulated watch stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn fast_route() -> SimulatedRoute {
        SimulatedRoute {
            interval: Duration::from_millis(10),
            ..SimulatedRoute::default()
        }
    }

    #[tokio::test]
    async fn test_watch_yields_moving_samples() {
        let sampler = SimulatedSampler::new(fast_route());
        let mut rx = sampler.start_watching(WatchConfig::default()).unwrap();

        let first = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert!(second.latitude > first.latitude);
        assert_eq!(first.accuracy_meters, 10.0);
        assert!(first.sampled_at_epoch_ms > 0);
    }

    #[tokio::test]
    async fn test_stop_terminates_stream() {
        let sampler = SimulatedSampler::new(fast_route());
        let mut rx = sampler.start_watching(WatchConfig::default()).unwrap();

        let _ = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        sampler.stop();

        // The producer task is gone, so the stream drains and ends.
        let ended = timeout(Duration::from_secs(1), async {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(ended.is_ok());

        // Stopping again is harmless.
        sampler.stop();
    }

    #[tokio::test]
    async fn test_permission_denied_yields_no_stream() {
        let sampler = SimulatedSampler::without_permission(fast_route());
        let result = sampler.start_watching(WatchConfig::default());
        assert_eq!(result.err(), Some(GeoError::PermissionDenied));
    }

    #[tokio::test]
    async fn test_restart_replaces_stream() {
        let sampler = SimulatedSampler::new(fast_route());
        let mut first_rx = sampler.start_watching(WatchConfig::default()).unwrap();
        let _ = timeout(Duration::from_secs(1), first_rx.recv()).await.unwrap();

        let mut second_rx = sampler.start_watching(WatchConfig::default()).unwrap();

        // The old stream drains and ends, the new one produces.
        let ended = timeout(Duration::from_secs(1), async {
            while first_rx.recv().await.is_some() {}
        })
        .await;
        assert!(ended.is_ok());
        let fresh = timeout(Duration::from_secs(1), second_rx.recv()).await.unwrap();
        assert!(fresh.is_some());
    }
}
