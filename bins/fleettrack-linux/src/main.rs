use std::sync::Arc;
use std::time::Duration;

use fleettrack_channel::{ChannelConfig, RealtimeChannel};
use fleettrack_client::{
    FileKeyValueStore, ForegroundTracker, RestClient, SimulatedRoute, SimulatedSampler,
    SubscriptionConfig, SubscriptionTracker, TrackerConfig,
};
use fleettrack_core::KeyValueStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,fleettrack_channel=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mode = std::env::var("FLEETTRACK_MODE").unwrap_or_else(|_| "driver".to_string());
    let endpoint = std::env::var("FLEETTRACK_WS")
        .unwrap_or_else(|_| "ws://localhost:3000/tracking/stream".to_string());
    let vehicle_id =
        std::env::var("FLEETTRACK_VEHICLE").unwrap_or_else(|_| "vehicle-demo".to_string());
    let token = std::env::var("FLEETTRACK_TOKEN").unwrap_or_else(|_| "demo-token".to_string());

    tracing::info!("Fleettrack client starting...");
    tracing::info!("   Mode:     {}", mode);
    tracing::info!("   Endpoint: {}", endpoint);
    tracing::info!("   Vehicle:  {}", vehicle_id);

    let channel = Arc::new(RealtimeChannel::new(ChannelConfig::new(endpoint)));

    match mode.as_str() {
        "observer" => run_observer(channel, &vehicle_id, &token).await,
        _ => run_driver(channel, &vehicle_id, &token).await,
    }
}

/// Drive a simulated vehicle and report its position.
async fn run_driver(
    channel: Arc<RealtimeChannel>,
    vehicle_id: &str,
    token: &str,
) -> anyhow::Result<()> {
    let state_dir = std::env::var("FLEETTRACK_STATE_DIR").unwrap_or_else(|_| {
        std::env::temp_dir()
            .join("fleettrack")
            .display()
            .to_string()
    });
    let store: Arc<dyn KeyValueStore> = Arc::new(FileKeyValueStore::new(&state_dir)?);

    // A gentle simulated drive: roughly 12 m per tick, one fix a second.
    let sampler = Arc::new(SimulatedSampler::new(SimulatedRoute {
        interval: Duration::from_secs(1),
        ..SimulatedRoute::default()
    }));

    let mut tracker = ForegroundTracker::new(
        TrackerConfig::new(vehicle_id),
        sampler,
        channel,
        store,
    );

    if let Ok(rest_base) = std::env::var("FLEETTRACK_REST") {
        tracker = tracker.with_rest_client(Arc::new(RestClient::new(rest_base, token)));
    }

    tracker.start_tracking(token).await?;
    tracing::info!("🚍 Driver tracking started (state dir: {})", state_dir);
    tracing::info!("   Stop with Ctrl+C");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl+C, shutting down...");

    tracker.stop_tracking();
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Follow a vehicle's stream and print what arrives.
async fn run_observer(
    channel: Arc<RealtimeChannel>,
    vehicle_id: &str,
    token: &str,
) -> anyhow::Result<()> {
    channel.connect(token).await?;

    let tracker = SubscriptionTracker::new(channel, SubscriptionConfig::default());
    tracker.start_tracking(vehicle_id)?;
    tracing::info!("👀 Observing {} (Ctrl+C to stop)", vehicle_id);

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, shutting down...");
                break;
            }
            _ = ticker.tick() => {
                match tracker.snapshot() {
                    Some(state) => match &state.last_event {
                        Some(event) => tracing::info!(
                            "{} @ ({:.6}, {:.6}) status={} stale={} connected={}",
                            state.vehicle_id,
                            event.coords.latitude,
                            event.coords.longitude,
                            event.status,
                            state.is_stale,
                            state.connected,
                        ),
                        None => tracing::info!("waiting for first update..."),
                    },
                    None => break,
                }
            }
        }
    }

    tracker.stop_tracking();
    tracing::info!("Shutdown complete");
    Ok(())
}
