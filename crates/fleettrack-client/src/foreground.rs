//! Foreground tracking orchestration.
//!
//! Runs while the app is in the active lifecycle state: owns the GPS
//! watch, applies the significance filter with its own last-sent memory,
//! emits accepted events over the realtime channel, and keeps a periodic
//! REST backstop going regardless of channel health. When the channel is
//! down, accepted events divert into the durable pending queue and are
//! flushed on reconnect or on app resume.
//!
//! The foreground filter memory is deliberately separate from the
//! background agent's: the two producers run in different execution
//! contexts and share only durable state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fleettrack_channel::{ChannelError, ChannelState, RealtimeChannel};
use fleettrack_core::{
    keys, KeyValueStore, KeyValueStoreExt, LocationEvent, LocationSample, PendingQueue,
    SignificanceFilter, TrackingContext, VehicleStatus,
};
use fleettrack_protocol::{events, LocationReport, ServiceStart, ServiceStop, StatusReport};

use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::geo::GeoSampler;
use crate::rest::RestClient;

/// Driver-side tracker for the foreground lifecycle state.
pub struct ForegroundTracker<G: GeoSampler> {
    config: TrackerConfig,
    sampler: Arc<G>,
    channel: Arc<RealtimeChannel>,
    rest: Option<Arc<RestClient>>,
    store: Arc<dyn KeyValueStore>,
    queue: Arc<PendingQueue>,
    filter: SignificanceFilter,
    status: Arc<RwLock<VehicleStatus>>,
    last_sent: Arc<Mutex<Option<LocationSample>>>,
    latest_event: Arc<Mutex<Option<LocationEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    tracking: AtomicBool,
}

impl<G: GeoSampler> ForegroundTracker<G> {
    pub fn new(
        config: TrackerConfig,
        sampler: Arc<G>,
        channel: Arc<RealtimeChannel>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let queue = Arc::new(PendingQueue::with_capacity(store.clone(), config.queue_cap));
        let filter = SignificanceFilter::new(config.filter.clone());
        Self {
            config,
            sampler,
            channel,
            rest: None,
            store,
            queue,
            filter,
            status: Arc::new(RwLock::new(VehicleStatus::Offline)),
            last_sent: Arc::new(Mutex::new(None)),
            latest_event: Arc::new(Mutex::new(None)),
            tasks: Mutex::new(Vec::new()),
            tracking: AtomicBool::new(false),
        }
    }

    /// Attach the REST persistence backstop.
    pub fn with_rest_client(mut self, rest: Arc<RestClient>) -> Self {
        self.rest = Some(rest);
        self
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> VehicleStatus {
        *self.status.read().unwrap()
    }

    /// Queued-but-unsent event count, for surfacing sync state to the UI.
    pub fn pending_count(&self) -> usize {
        self.queue.len().unwrap_or(0)
    }

    /// Begin a tracking session.
    ///
    /// Requests the position watch (permission denial is fatal and
    /// surfaced, never retried here), persists the context the background
    /// agent will need, connects the channel and starts the processing
    /// tasks. Idempotent while already tracking.
    pub async fn start_tracking(&self, token: &str) -> Result<(), TrackerError> {
        if self.tracking.swap(true, Ordering::SeqCst) {
            debug!("tracking already active");
            return Ok(());
        }

        match self.start_inner(token).await {
            Ok(()) => Ok(()),
            Err(error) => {
                self.sampler.stop();
                self.tracking.store(false, Ordering::SeqCst);
                Err(error)
            }
        }
    }

    async fn start_inner(&self, token: &str) -> Result<(), TrackerError> {
        let watch_rx = self.sampler.start_watching(self.config.watch.clone())?;

        *self.status.write().unwrap() = VehicleStatus::Online;

        // Everything the background agent needs must be durable before it
        // can possibly run.
        let context =
            TrackingContext::new(&self.config.vehicle_id, token, VehicleStatus::Online);
        self.store.save_value(keys::CONTEXT, &context)?;

        // Resume the filter memory from the previous session, if any.
        *self.last_sent.lock().unwrap() = self.store.load_value(keys::FOREGROUND_LAST_SENT)?;

        self.channel.connect(token).await?;

        self.spawn_watch_task(watch_rx);
        self.spawn_rest_task();
        self.spawn_drain_task();

        // Pick up whatever the background agent queued while we were away.
        self.on_app_resume();

        info!(vehicle_id = %self.config.vehicle_id, "tracking started");
        Ok(())
    }

    /// End the tracking session.
    ///
    /// The position watch is removed synchronously; already-dispatched
    /// sends are not awaited, no new ones are issued.
    pub fn stop_tracking(&self) {
        if !self.tracking.swap(false, Ordering::SeqCst) {
            return;
        }

        self.sampler.stop();
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }

        let stop = ServiceStop {
            vehicle_id: self.config.vehicle_id.clone(),
        };
        if let Err(error) = self.channel.send(events::STOP_VEHICLE_SERVICE, &stop) {
            debug!(%error, "service stop not announced");
        }

        *self.last_sent.lock().unwrap() = None;
        *self.latest_event.lock().unwrap() = None;
        *self.status.write().unwrap() = VehicleStatus::Offline;
        let _ = self.store.delete(keys::FOREGROUND_LAST_SENT);
        let _ = self.store.delete(keys::CONTEXT);

        info!(vehicle_id = %self.config.vehicle_id, "tracking stopped");
    }

    /// Change the vehicle status, durably and on the wire.
    pub fn update_status(&self, status: VehicleStatus) -> Result<(), TrackerError> {
        *self.status.write().unwrap() = status;

        // Keep the background agent's view in step.
        if let Some(mut context) = self.store.load_value::<TrackingContext>(keys::CONTEXT)? {
            context.status = status;
            self.store.save_value(keys::CONTEXT, &context)?;
        }

        let report = StatusReport {
            vehicle_id: self.config.vehicle_id.clone(),
            status,
        };
        match self.channel.send(events::UPDATE_VEHICLE_STATUS, &report) {
            Ok(()) => {}
            Err(ChannelError::NotConnected) => {
                warn!("channel down, status update not sent");
            }
            Err(error) => return Err(error.into()),
        }
        Ok(())
    }

    /// Flush the pending queue; called on the background→active transition.
    ///
    /// Entries that fail to send stay queued for the next attempt.
    pub fn on_app_resume(&self) -> usize {
        drain_queue(&self.channel, &self.queue)
    }

    fn spawn_watch_task(&self, mut watch_rx: mpsc::Receiver<LocationSample>) {
        let filter = self.filter.clone();
        let channel = self.channel.clone();
        let queue = self.queue.clone();
        let store = self.store.clone();
        let status = self.status.clone();
        let last_sent = self.last_sent.clone();
        let latest_event = self.latest_event.clone();
        let vehicle_id = self.config.vehicle_id.clone();

        let task = tokio::spawn(async move {
            let mut announced = false;

            while let Some(sample) = watch_rx.recv().await {
                let now_ms = chrono::Utc::now().timestamp_millis();

                let accepted = {
                    let last = last_sent.lock().unwrap();
                    filter.accept(&sample, last.as_ref(), now_ms)
                };
                if !accepted {
                    debug!("sample not significant, skipping");
                    continue;
                }

                let current_status = *status.read().unwrap();

                if !announced {
                    let start = ServiceStart {
                        vehicle_id: vehicle_id.clone(),
                        coords: sample.coordinates(),
                        status: current_status,
                    };
                    if let Err(error) = channel.send(events::START_VEHICLE_SERVICE, &start) {
                        warn!(%error, "could not announce service start");
                    }
                    announced = true;
                }

                let event =
                    LocationEvent::new(vehicle_id.clone(), sample.clone(), current_status, now_ms);

                match channel.send(events::UPDATE_VEHICLE_LOCATION, &LocationReport::from(&event)) {
                    Ok(()) => debug!("location sent over channel"),
                    Err(ChannelError::NotConnected) => match queue.enqueue(event.clone(), now_ms) {
                        Ok(len) => debug!(queued = len, "channel down, event queued"),
                        Err(error) => warn!(%error, "failed to queue event"),
                    },
                    Err(error) => warn!(%error, "location send failed"),
                }

                // The memory advances whether the event went out directly or
                // into the queue: it will reach the server either way, and
                // re-accepting near-identical samples would duplicate it.
                *latest_event.lock().unwrap() = Some(event);
                *last_sent.lock().unwrap() = Some(sample.clone());
                if let Err(error) = store.save_value(keys::FOREGROUND_LAST_SENT, &sample) {
                    warn!(%error, "failed to persist filter fingerprint");
                }
            }

            debug!("location watch ended");
        });

        self.tasks.lock().unwrap().push(task);
    }

    fn spawn_rest_task(&self) {
        let Some(rest) = self.rest.clone() else {
            return;
        };
        let latest_event = self.latest_event.clone();
        let period = self.config.rest_sync_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The immediate first tick would persist before anything was
            // accepted; skip it.
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let event = latest_event.lock().unwrap().clone();
                let Some(event) = event else { continue };

                match rest.persist_location(&LocationReport::from(&event)).await {
                    Ok(()) => debug!("periodic REST persistence complete"),
                    Err(error) => warn!(%error, "periodic REST persistence failed"),
                }
            }
        });

        self.tasks.lock().unwrap().push(task);
    }

    fn spawn_drain_task(&self) {
        let channel = self.channel.clone();
        let queue = self.queue.clone();
        let mut state_rx = self.channel.watch_state();

        let task = tokio::spawn(async move {
            loop {
                if state_rx.changed().await.is_err() {
                    break;
                }
                let connected = *state_rx.borrow_and_update() == ChannelState::Connected;
                if connected {
                    debug!("channel reconnected, draining queue");
                    drain_queue(&channel, &queue);
                }
            }
        });

        self.tasks.lock().unwrap().push(task);
    }
}

/// Flush the queue through the channel in enqueue order; entries that
/// fail to send stay queued.
fn drain_queue(channel: &RealtimeChannel, queue: &PendingQueue) -> usize {
    let result = queue.drain_with(|event| {
        channel
            .send(events::UPDATE_VEHICLE_LOCATION, &LocationReport::from(event))
            .is_ok()
    });
    match result {
        Ok(consumed) => {
            if !consumed.is_empty() {
                info!(count = consumed.len(), "drained pending events");
            }
            consumed.len()
        }
        Err(error) => {
            warn!(%error, "pending queue drain failed");
            0
        }
    }
}

impl<G: GeoSampler> Drop for ForegroundTracker<G> {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}
