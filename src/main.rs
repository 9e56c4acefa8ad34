mod config;
mod metrics;
mod net;
mod util;
mod world;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::net::adaptation::AdaptationEvent;
use crate::net::codec::DeltaCodec;
use crate::net::orchestrator::{self, OrchestratorHandle, SyncOrchestrator};
use crate::net::protocol::{ClientMessage, ServerMessage};
use crate::net::registry::Outbound;
use crate::net::wire::Frame;
use crate::world::object::Viewport;
use crate::world::sim::WanderSim;

/// Simulation step, independent of the broadcast pace
const SIM_STEP_MS: u64 = 33;
/// Loopback viewers attached at startup
const OBSERVERS: usize = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging, RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Worldcast Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = ServerConfig::load_or_default();
    if let Err(e) = config.validate() {
        anyhow::bail!("invalid configuration: {}", e);
    }
    info!(
        "Configuration loaded: world {}x{}, max_viewers={}, tick={}ms",
        config.world_width, config.world_height, config.max_viewers, config.tick_interval_ms
    );

    // Initialize metrics
    let metrics = Arc::new(Metrics::new());

    // Start metrics server on port 9090 (configurable via METRICS_PORT)
    #[cfg(feature = "metrics_endpoint")]
    {
        let metrics_port: u16 = std::env::var("METRICS_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(9090);

        let metrics_clone = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
        info!("Metrics endpoint on http://localhost:{}/metrics", metrics_port);
    }

    // Build the pipeline and take the adaptation feed before it starts
    let orch = SyncOrchestrator::new(config.orchestrator(), metrics.clone());
    let events = orch.adaptation_events();
    let event_metrics = metrics.clone();
    tokio::task::spawn_blocking(move || {
        while let Ok(event) = events.recv() {
            match event {
                AdaptationEvent::BundleApplied { bundle, reason, priority, at_ms } => {
                    event_metrics
                        .adaptations_applied_total
                        .fetch_add(1, Ordering::Relaxed);
                    info!(bundle = bundle.name(), ?reason, priority, at_ms, "adaptation applied");
                }
                AdaptationEvent::Recovered { step, at_ms } => {
                    event_metrics
                        .adaptations_reverted_total
                        .fetch_add(1, Ordering::Relaxed);
                    info!(?step, at_ms, "adaptation reverted");
                }
            }
        }
    });

    let handle = orchestrator::start(orch);

    // Attach loopback observers so the pipeline has viewers from the start
    for i in 0..OBSERVERS {
        let observer_handle = handle.clone();
        let (width, height) = (config.world_width, config.world_height);
        tokio::spawn(async move {
            if let Err(e) = run_observer(observer_handle, i, width, height).await {
                warn!(observer = i, error = %e, "observer stopped");
            }
        });
    }

    info!("Server ready");

    // Shutdown signal handler
    let shutdown = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Shutdown signal received");
    };

    // Drive the built-in world until shutdown
    tokio::select! {
        _ = drive_world(handle.clone(), config.clone()) => {}
        _ = shutdown => {
            info!("Shutting down...");
        }
    }

    info!("Server stopped");

    Ok(())
}

/// Step the built-in simulation and feed snapshots to the pipeline
async fn drive_world(handle: OrchestratorHandle, config: ServerConfig) {
    let mut sim = WanderSim::new(
        config.world_width,
        config.world_height,
        config.sim_players,
        config.sim_foods,
    );
    let mut interval = tokio::time::interval(Duration::from_millis(SIM_STEP_MS));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        let snapshot = sim.step(SIM_STEP_MS);
        handle.submit_snapshot(snapshot);
    }
}

/// A viewer on the loopback path: decodes and acknowledges every frame,
/// answers probes, and pans its viewport now and then.
async fn run_observer(
    handle: OrchestratorHandle,
    index: usize,
    world_width: f32,
    world_height: f32,
) -> anyhow::Result<()> {
    let name = format!("observer-{}", index);
    let (id, mut rx) = handle.connect(name.clone()).await?;
    handle.send_message(
        id,
        ClientMessage::Hello {
            viewer_name: name,
            viewport: random_viewport(world_width, world_height),
        },
    );

    let codec = DeltaCodec::default();
    let mut frames = 0u64;
    let mut pan_at = tokio::time::Instant::now() + Duration::from_secs(3);

    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else { break };
                match message {
                    Outbound::Data(bytes) => match codec.decode_frame(&bytes) {
                        Ok(_) => {
                            frames += 1;
                            if let Ok(envelope) = Frame::decode(&bytes) {
                                handle.send_message(id, ClientMessage::FrameAck { tick: envelope.tick });
                            }
                            if frames % 512 == 0 {
                                debug!(observer = index, frames, "frames decoded");
                            }
                        }
                        Err(e) => warn!(observer = index, error = %e, "undecodable frame"),
                    },
                    Outbound::Control(ServerMessage::Ping { nonce, timestamp }) => {
                        handle.send_message(id, ClientMessage::Pong { nonce, timestamp });
                    }
                    Outbound::Control(ServerMessage::Kicked { reason }) => {
                        info!(observer = index, reason = %reason, "kicked");
                        break;
                    }
                    Outbound::Control(_) => {}
                }
            }
            _ = tokio::time::sleep_until(pan_at) => {
                pan_at = tokio::time::Instant::now() + Duration::from_secs(3);
                handle.send_message(
                    id,
                    ClientMessage::ViewportUpdate(random_viewport(world_width, world_height)),
                );
            }
        }
    }

    Ok(())
}

fn random_viewport(world_width: f32, world_height: f32) -> Viewport {
    let mut rng = rand::thread_rng();
    let w = 800.0f32.min(world_width);
    let h = 600.0f32.min(world_height);
    let x = rng.gen_range(0.0..(world_width - w).max(1.0));
    let y = rng.gen_range(0.0..(world_height - h).max(1.0));
    Viewport::new(x, y, w, h, x + w * 0.5, y + h * 0.5)
}
