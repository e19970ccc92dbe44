//! OS-scheduled background synchronization.
//!
//! The platform invokes this agent on its own schedule, possibly in a
//! process lifecycle where nothing from the foreground session survives in
//! memory. Each invocation therefore loads everything it needs from
//! durable storage, queues accepted events before attempting any network
//! work, and treats the whole network step as opportunistic: if a
//! short-lived connection cannot be established within the OS background
//! budget, the events simply stay queued for a later drain.
//!
//! Nothing propagates across the task boundary. An invocation that fails
//! internally logs and returns; the next invocation is unaffected.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use fleettrack_channel::{ChannelConfig, RealtimeChannel};
use fleettrack_core::{
    keys, FilterConfig, KeyValueStore, KeyValueStoreExt, LocationEvent, LocationSample,
    PendingQueue, SignificanceFilter, TrackingContext,
};
use fleettrack_protocol::{events, LocationReport};

use crate::error::TrackerError;

/// Default bound on the opportunistic connect-and-send window.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Driver-side agent for OS-scheduled background execution.
pub struct BackgroundSyncAgent {
    channel_config: ChannelConfig,
    store: Arc<dyn KeyValueStore>,
    queue: PendingQueue,
    filter: SignificanceFilter,
    send_timeout: Duration,
}

impl BackgroundSyncAgent {
    pub fn new(channel_config: ChannelConfig, store: Arc<dyn KeyValueStore>) -> Self {
        // Short-lived connections must respect the background execution
        // budget: one attempt, bounded by the send timeout.
        let mut channel_config = channel_config;
        channel_config.connect_timeout = DEFAULT_SEND_TIMEOUT;
        channel_config.backoff.max_attempts = 1;

        Self {
            channel_config,
            queue: PendingQueue::new(store.clone()),
            store,
            filter: SignificanceFilter::default(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn with_filter(mut self, config: FilterConfig) -> Self {
        self.filter = SignificanceFilter::new(config);
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self.channel_config.connect_timeout = timeout;
        self
    }

    /// Process one batch of raw samples delivered by the OS.
    ///
    /// Never fails: every internal error is logged and the invocation ends
    /// cleanly so the next scheduled run starts fresh.
    pub async fn run_invocation(&self, samples: &[LocationSample]) {
        if let Err(error) = self.process(samples).await {
            warn!(%error, "background invocation failed");
        }
    }

    async fn process(&self, samples: &[LocationSample]) -> Result<(), TrackerError> {
        let Some(context) = self.store.load_value::<TrackingContext>(keys::CONTEXT)? else {
            debug!("no tracking context stored, nothing to do");
            return Ok(());
        };

        let mut last_sent: Option<LocationSample> =
            self.store.load_value(keys::BACKGROUND_LAST_SENT)?;

        let mut accepted = 0usize;
        for sample in samples {
            let now_ms = chrono::Utc::now().timestamp_millis();
            if !self.filter.accept(sample, last_sent.as_ref(), now_ms) {
                continue;
            }

            let event = LocationEvent::new(
                context.vehicle_id.clone(),
                sample.clone(),
                context.status,
                now_ms,
            );

            // Durability first: the OS may suspend us before a send
            // completes, the queue entry must already exist by then.
            self.queue.enqueue(event, now_ms)?;
            self.store.save_value(keys::BACKGROUND_LAST_SENT, sample)?;
            last_sent = Some(sample.clone());
            accepted += 1;
        }

        debug!(accepted, total = samples.len(), "background samples processed");

        self.opportunistic_flush(&context).await;
        Ok(())
    }

    /// Try a short-lived connection and flush the queue through it.
    async fn opportunistic_flush(&self, context: &TrackingContext) {
        match self.queue.is_empty() {
            Ok(true) => return,
            Ok(false) => {}
            Err(error) => {
                warn!(%error, "could not inspect pending queue");
                return;
            }
        }

        let channel = RealtimeChannel::new(self.channel_config.clone());
        match tokio::time::timeout(self.send_timeout, channel.connect(&context.auth_token)).await {
            Ok(Ok(())) => {
                let drained = self.queue.drain_with(|event| {
                    channel
                        .send(events::UPDATE_VEHICLE_LOCATION, &LocationReport::from(event))
                        .is_ok()
                });
                match drained {
                    Ok(consumed) => info!(sent = consumed.len(), "background flush complete"),
                    Err(error) => warn!(%error, "background flush failed"),
                }

                // Let queued frames reach the wire before tearing down.
                tokio::time::sleep(Duration::from_millis(200)).await;
                channel.disconnect();
            }
            Ok(Err(error)) => {
                debug!(%error, "background connect failed, events stay queued");
            }
            Err(_) => {
                channel.disconnect();
                debug!("background connect timed out, events stay queued");
            }
        }
    }
}
