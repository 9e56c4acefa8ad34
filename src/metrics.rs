//! Prometheus-compatible metrics endpoint
//!
//! Exposes sync pipeline metrics in Prometheus format for Grafana dashboards.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use parking_lot::RwLock;
#[cfg(feature = "metrics_endpoint")]
use std::sync::Arc;
#[cfg(feature = "metrics_endpoint")]
use tokio::io::{AsyncReadExt, AsyncWriteExt};
#[cfg(feature = "metrics_endpoint")]
use tokio::net::TcpListener;
#[cfg(feature = "metrics_endpoint")]
use tracing::{debug, info};

/// Metrics registry for the sync server
#[derive(Debug)]
pub struct Metrics {
    // Viewer counts
    pub viewers_active: AtomicU64,
    pub viewers_connected_total: AtomicU64,
    pub viewers_rejected_total: AtomicU64,
    pub viewers_reaped_total: AtomicU64,
    pub viewers_kicked_total: AtomicU64,

    // World state
    pub objects_tracked: AtomicU64,
    pub world_tick: AtomicU64,
    pub snapshots_ingested_total: AtomicU64,
    pub snapshots_dropped_total: AtomicU64,

    // Frame pipeline
    pub frames_sent_total: AtomicU64,
    pub frames_full_total: AtomicU64,
    pub frames_delta_total: AtomicU64,
    pub frames_fallback_total: AtomicU64,
    pub frames_skipped_rate_limit: AtomicU64,
    pub frames_skipped_cadence: AtomicU64,
    pub frames_skipped_empty: AtomicU64,
    pub encode_failures_total: AtomicU64,
    pub bytes_sent_total: AtomicU64,
    pub messages_received_total: AtomicU64,
    pub messages_rate_limited_total: AtomicU64,

    // Codec ratios (stored as ratio * 1000, e.g. 0.42 = 420)
    pub compression_ratio_x1000: AtomicU64,
    pub delta_ratio_x1000: AtomicU64,

    // Broadcast pass timing (microseconds)
    pub broadcast_time_us: AtomicU64,
    pub broadcast_time_p95_us: AtomicU64,
    pub broadcast_time_p99_us: AtomicU64,
    pub broadcast_time_max_us: AtomicU64,
    pub broadcast_count: AtomicU64,

    // Adaptation state
    pub tick_interval_ms: AtomicU64,
    pub congestion_level: AtomicU64, // 0=none, 1=light, 2=moderate, 3=severe
    pub adaptations_applied_total: AtomicU64,
    pub adaptations_reverted_total: AtomicU64,

    // Link quality histogram (viewer counts per band)
    pub quality_excellent: AtomicU64,
    pub quality_good: AtomicU64,
    pub quality_fair: AtomicU64,
    pub quality_poor: AtomicU64,

    // Server uptime
    start_time: Instant,

    // Rolling broadcast times for percentile calculation (VecDeque for O(1) pop_front)
    broadcast_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            viewers_active: AtomicU64::new(0),
            viewers_connected_total: AtomicU64::new(0),
            viewers_rejected_total: AtomicU64::new(0),
            viewers_reaped_total: AtomicU64::new(0),
            viewers_kicked_total: AtomicU64::new(0),
            objects_tracked: AtomicU64::new(0),
            world_tick: AtomicU64::new(0),
            snapshots_ingested_total: AtomicU64::new(0),
            snapshots_dropped_total: AtomicU64::new(0),
            frames_sent_total: AtomicU64::new(0),
            frames_full_total: AtomicU64::new(0),
            frames_delta_total: AtomicU64::new(0),
            frames_fallback_total: AtomicU64::new(0),
            frames_skipped_rate_limit: AtomicU64::new(0),
            frames_skipped_cadence: AtomicU64::new(0),
            frames_skipped_empty: AtomicU64::new(0),
            encode_failures_total: AtomicU64::new(0),
            bytes_sent_total: AtomicU64::new(0),
            messages_received_total: AtomicU64::new(0),
            messages_rate_limited_total: AtomicU64::new(0),
            compression_ratio_x1000: AtomicU64::new(0),
            delta_ratio_x1000: AtomicU64::new(0),
            broadcast_time_us: AtomicU64::new(0),
            broadcast_time_p95_us: AtomicU64::new(0),
            broadcast_time_p99_us: AtomicU64::new(0),
            broadcast_time_max_us: AtomicU64::new(0),
            broadcast_count: AtomicU64::new(0),
            tick_interval_ms: AtomicU64::new(0),
            congestion_level: AtomicU64::new(0),
            adaptations_applied_total: AtomicU64::new(0),
            adaptations_reverted_total: AtomicU64::new(0),
            quality_excellent: AtomicU64::new(0),
            quality_good: AtomicU64::new(0),
            quality_fair: AtomicU64::new(0),
            quality_poor: AtomicU64::new(0),
            start_time: Instant::now(),
            broadcast_history: RwLock::new(VecDeque::with_capacity(1000)),
        }
    }

    /// Record a broadcast pass duration and update percentiles
    pub fn record_broadcast_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.broadcast_time_us.store(us, Ordering::Relaxed);
        self.broadcast_count.fetch_add(1, Ordering::Relaxed);

        // Update rolling history for percentiles
        let mut history = self.broadcast_history.write();
        history.push_back(us);

        // Keep last 1000 samples - O(1) with VecDeque
        while history.len() > 1000 {
            history.pop_front();
        }

        // Calculate percentiles
        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.broadcast_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.broadcast_time_p99_us.store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.broadcast_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    /// Store both codec ratios scaled by 1000
    pub fn set_codec_ratios(&self, compression_ratio: f32, delta_ratio: f32) {
        self.compression_ratio_x1000.store((compression_ratio * 1000.0) as u64, Ordering::Relaxed);
        self.delta_ratio_x1000.store((delta_ratio * 1000.0) as u64, Ordering::Relaxed);
    }

    /// Replace the link quality histogram with fresh per-band viewer counts
    pub fn set_quality_histogram(&self, excellent: u64, good: u64, fair: u64, poor: u64) {
        self.quality_excellent.store(excellent, Ordering::Relaxed);
        self.quality_good.store(good, Ordering::Relaxed);
        self.quality_fair.store(fair, Ordering::Relaxed);
        self.quality_poor.store(poor, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        // Helper macro for metrics
        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        // Viewer metrics
        metric!("worldcast_viewers_active", "Currently connected viewers", "gauge",
            self.viewers_active.load(Ordering::Relaxed));
        metric!("worldcast_viewers_connected_total", "Total viewer connections accepted", "counter",
            self.viewers_connected_total.load(Ordering::Relaxed));
        metric!("worldcast_viewers_rejected_total", "Total viewer connections rejected", "counter",
            self.viewers_rejected_total.load(Ordering::Relaxed));
        metric!("worldcast_viewers_reaped_total", "Total viewers evicted as stale", "counter",
            self.viewers_reaped_total.load(Ordering::Relaxed));
        metric!("worldcast_viewers_kicked_total", "Viewers dropped for message flooding", "counter",
            self.viewers_kicked_total.load(Ordering::Relaxed));

        // World metrics
        metric!("worldcast_objects_tracked", "Objects in the current snapshot", "gauge",
            self.objects_tracked.load(Ordering::Relaxed));
        metric!("worldcast_world_tick", "Tick of the current snapshot", "gauge",
            self.world_tick.load(Ordering::Relaxed));
        metric!("worldcast_snapshots_ingested_total", "World snapshots ingested", "counter",
            self.snapshots_ingested_total.load(Ordering::Relaxed));
        metric!("worldcast_snapshots_dropped_total", "World snapshots dropped while busy", "counter",
            self.snapshots_dropped_total.load(Ordering::Relaxed));

        // Frame pipeline metrics
        metric!("worldcast_frames_sent_total", "Total frames dispatched", "counter",
            self.frames_sent_total.load(Ordering::Relaxed));
        metric!("worldcast_frames_full_total", "Full frames dispatched", "counter",
            self.frames_full_total.load(Ordering::Relaxed));
        metric!("worldcast_frames_delta_total", "Delta frames dispatched", "counter",
            self.frames_delta_total.load(Ordering::Relaxed));
        metric!("worldcast_frames_fallback_total", "Fallback frames dispatched", "counter",
            self.frames_fallback_total.load(Ordering::Relaxed));
        metric!("worldcast_frames_skipped_rate_limit", "Sends skipped by the rate limiter", "counter",
            self.frames_skipped_rate_limit.load(Ordering::Relaxed));
        metric!("worldcast_frames_skipped_cadence", "Sends skipped as not yet due", "counter",
            self.frames_skipped_cadence.load(Ordering::Relaxed));
        metric!("worldcast_frames_skipped_empty", "Sends skipped with no changes to report", "counter",
            self.frames_skipped_empty.load(Ordering::Relaxed));
        metric!("worldcast_encode_failures_total", "Frame encodes that failed outright", "counter",
            self.encode_failures_total.load(Ordering::Relaxed));
        metric!("worldcast_bytes_sent_total", "Total payload bytes dispatched", "counter",
            self.bytes_sent_total.load(Ordering::Relaxed));
        metric!("worldcast_messages_received_total", "Total client messages handled", "counter",
            self.messages_received_total.load(Ordering::Relaxed));
        metric!("worldcast_messages_rate_limited_total", "Client messages dropped by the rate limiter", "counter",
            self.messages_rate_limited_total.load(Ordering::Relaxed));

        // Codec metrics
        metric!("worldcast_compression_ratio_x1000", "Encoded vs raw size ratio (x1000)", "gauge",
            self.compression_ratio_x1000.load(Ordering::Relaxed));
        metric!("worldcast_delta_ratio_x1000", "Share of frames sent as deltas (x1000)", "gauge",
            self.delta_ratio_x1000.load(Ordering::Relaxed));

        // Broadcast timing metrics
        metric!("worldcast_broadcast_time_microseconds", "Current broadcast pass time", "gauge",
            self.broadcast_time_us.load(Ordering::Relaxed));
        metric!("worldcast_broadcast_time_p95_microseconds", "95th percentile broadcast time", "gauge",
            self.broadcast_time_p95_us.load(Ordering::Relaxed));
        metric!("worldcast_broadcast_time_p99_microseconds", "99th percentile broadcast time", "gauge",
            self.broadcast_time_p99_us.load(Ordering::Relaxed));
        metric!("worldcast_broadcast_time_max_microseconds", "Maximum broadcast pass time", "gauge",
            self.broadcast_time_max_us.load(Ordering::Relaxed));
        metric!("worldcast_broadcast_count", "Total broadcast passes", "counter",
            self.broadcast_count.load(Ordering::Relaxed));

        // Adaptation metrics
        metric!("worldcast_tick_interval_ms", "Effective broadcast interval in milliseconds", "gauge",
            self.tick_interval_ms.load(Ordering::Relaxed));
        metric!("worldcast_congestion_level", "Congestion level (0=none, 3=severe)", "gauge",
            self.congestion_level.load(Ordering::Relaxed));
        metric!("worldcast_adaptations_applied_total", "Adaptation bundles applied", "counter",
            self.adaptations_applied_total.load(Ordering::Relaxed));
        metric!("worldcast_adaptations_reverted_total", "Adaptation bundles reverted", "counter",
            self.adaptations_reverted_total.load(Ordering::Relaxed));

        // Human-readable congestion level as a label
        let level_name = match self.congestion_level.load(Ordering::Relaxed) {
            0 => "none",
            1 => "light",
            2 => "moderate",
            _ => "severe",
        };
        output.push_str(&format!(
            "# HELP worldcast_congestion_state Human-readable congestion state\n# TYPE worldcast_congestion_state gauge\nworldcast_congestion_state{{state=\"{}\"}} 1\n",
            level_name
        ));

        // Link quality histogram
        metric!("worldcast_quality_excellent", "Viewers with excellent link quality", "gauge",
            self.quality_excellent.load(Ordering::Relaxed));
        metric!("worldcast_quality_good", "Viewers with good link quality", "gauge",
            self.quality_good.load(Ordering::Relaxed));
        metric!("worldcast_quality_fair", "Viewers with fair link quality", "gauge",
            self.quality_fair.load(Ordering::Relaxed));
        metric!("worldcast_quality_poor", "Viewers with poor link quality", "gauge",
            self.quality_poor.load(Ordering::Relaxed));

        metric!("worldcast_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics (alternative for direct API access)
    pub fn to_json(&self) -> String {
        format!(r#"{{
  "viewers": {{
    "active": {},
    "connected_total": {},
    "rejected_total": {},
    "reaped_total": {},
    "kicked_total": {}
  }},
  "world": {{
    "objects": {},
    "tick": {},
    "snapshots_ingested": {},
    "snapshots_dropped": {}
  }},
  "frames": {{
    "sent": {},
    "full": {},
    "delta": {},
    "fallback": {},
    "skipped_rate_limit": {},
    "skipped_cadence": {},
    "skipped_empty": {},
    "encode_failures": {},
    "bytes_sent": {}
  }},
  "codec": {{
    "compression_ratio": {},
    "delta_ratio": {}
  }},
  "broadcast": {{
    "time_us": {},
    "time_p95_us": {},
    "time_p99_us": {},
    "time_max_us": {},
    "count": {}
  }},
  "adaptation": {{
    "tick_interval_ms": {},
    "congestion_level": {},
    "congestion_name": "{}",
    "applied": {},
    "reverted": {}
  }},
  "quality": {{
    "excellent": {},
    "good": {},
    "fair": {},
    "poor": {}
  }},
  "uptime_seconds": {}
}}"#,
            self.viewers_active.load(Ordering::Relaxed),
            self.viewers_connected_total.load(Ordering::Relaxed),
            self.viewers_rejected_total.load(Ordering::Relaxed),
            self.viewers_reaped_total.load(Ordering::Relaxed),
            self.viewers_kicked_total.load(Ordering::Relaxed),
            self.objects_tracked.load(Ordering::Relaxed),
            self.world_tick.load(Ordering::Relaxed),
            self.snapshots_ingested_total.load(Ordering::Relaxed),
            self.snapshots_dropped_total.load(Ordering::Relaxed),
            self.frames_sent_total.load(Ordering::Relaxed),
            self.frames_full_total.load(Ordering::Relaxed),
            self.frames_delta_total.load(Ordering::Relaxed),
            self.frames_fallback_total.load(Ordering::Relaxed),
            self.frames_skipped_rate_limit.load(Ordering::Relaxed),
            self.frames_skipped_cadence.load(Ordering::Relaxed),
            self.frames_skipped_empty.load(Ordering::Relaxed),
            self.encode_failures_total.load(Ordering::Relaxed),
            self.bytes_sent_total.load(Ordering::Relaxed),
            self.compression_ratio_x1000.load(Ordering::Relaxed) as f32 / 1000.0,
            self.delta_ratio_x1000.load(Ordering::Relaxed) as f32 / 1000.0,
            self.broadcast_time_us.load(Ordering::Relaxed),
            self.broadcast_time_p95_us.load(Ordering::Relaxed),
            self.broadcast_time_p99_us.load(Ordering::Relaxed),
            self.broadcast_time_max_us.load(Ordering::Relaxed),
            self.broadcast_count.load(Ordering::Relaxed),
            self.tick_interval_ms.load(Ordering::Relaxed),
            self.congestion_level.load(Ordering::Relaxed),
            match self.congestion_level.load(Ordering::Relaxed) {
                0 => "none",
                1 => "light",
                2 => "moderate",
                _ => "severe",
            },
            self.adaptations_applied_total.load(Ordering::Relaxed),
            self.adaptations_reverted_total.load(Ordering::Relaxed),
            self.quality_excellent.load(Ordering::Relaxed),
            self.quality_good.load(Ordering::Relaxed),
            self.quality_fair.load(Ordering::Relaxed),
            self.quality_poor.load(Ordering::Relaxed),
            self.uptime_seconds(),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
#[cfg(feature = "metrics_endpoint")]
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);

                    // Parse the request line
                    let response = if request.starts_with("GET /metrics/json") || request.starts_with("GET /json") {
                        let body = metrics.to_json();
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    } else if request.starts_with("GET /metrics") {
                        let body = metrics.to_prometheus();
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    } else if request.starts_with("GET /health") || request.starts_with("GET /") {
                        let body = "OK";
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    } else {
                        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
                    };

                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}
