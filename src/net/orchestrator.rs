//! Broadcast orchestrator
//!
//! Owns the whole per-tick pipeline: ingest a world snapshot, rebuild the
//! spatial index, then fan out to every connected viewer. The fan-out runs in
//! two phases. A sequential gating pass applies the rate limiter and the
//! per-viewer cadence and resolves each due viewer's effective viewport
//! (prediction-expanded, or the whole world while none is known). The encode
//! pass then runs in parallel across the due viewers: spatial query,
//! relevance filter, delta encode, dispatch. All per-viewer mutation stays
//! inside that viewer's record, so the passes shard cleanly by viewer id.
//!
//! A slower maintenance path reaps stale viewers, kicks message flooders,
//! drives the ping probes, aggregates link conditions into the congestion
//! detector and the adaptation controller, and logs periodic stats. The
//! global pace is recomputed from viewer and object counts every few
//! seconds; the run loop re-reads the effective interval before every sleep,
//! so pace changes take effect on the next tick without restarting anything.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::net::adaptation::{
    AdaptationConfig, AdaptationController, AdaptationEvent, AdaptationInputs, SharedSettings,
    SyncSettings,
};
use crate::net::cadence::{CadenceCalculator, CadenceConfig, ServerLoad, ViewerPriority};
use crate::net::codec::{CodecConfig, CodecTuning, DeltaCodec};
use crate::net::monitor::{
    CongestionConfig, CongestionDetector, LinkQuality, MonitorConfig, NetworkSample,
};
use crate::net::protocol::{ClientMessage, ServerMessage, ViewerId};
use crate::net::rate_limit::RateLimitConfig;
use crate::net::registry::{Outbound, RegistryError, ViewerRegistry};
use crate::net::relevance::{RelevanceConfig, RelevanceScorer, ViewerContext};
use crate::net::wire::FrameKind;
use crate::world::object::{
    ObjectId, PlayerObject, ViewSnapshot, Viewport, WorldObject, WorldSnapshot,
};
use crate::util::vec2::Vec2;
use crate::world::predictor::{MovementPredictor, PredictorConfig};
use crate::world::spatial::{SpatialEntry, SpatialIndex, DEFAULT_CELL_SIZE};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub world_width: f32,
    pub world_height: f32,
    pub max_viewers: usize,
    /// Pace under low load; the 5s recomputation scales it up with pressure
    pub base_tick_interval_ms: u64,
    pub min_tick_interval_ms: u64,
    pub max_tick_interval_ms: u64,
    /// Lookahead for viewport expansion
    pub prediction_horizon_ms: u32,
    /// Delta run length that triggers a rebase while error recovery is on
    pub rebase_after_deltas: u32,
    pub maintenance_interval_ms: u64,
    /// How often the global pace is recomputed
    pub pace_interval_ms: u64,
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
    pub stale_timeout_ms: u64,
    /// RTT samples older than this are left out of the aggregates
    pub metrics_stale_after_ms: u64,
    pub stats_interval_ms: u64,
    pub spatial_cell_size: f32,
    pub relevance: RelevanceConfig,
    pub cadence: CadenceConfig,
    pub codec: CodecConfig,
    pub predictor: PredictorConfig,
    pub monitor: MonitorConfig,
    pub rate_limit: RateLimitConfig,
    pub congestion: CongestionConfig,
    pub adaptation: AdaptationConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            world_width: 4_000.0,
            world_height: 4_000.0,
            max_viewers: 500,
            base_tick_interval_ms: 50,
            min_tick_interval_ms: 33,
            max_tick_interval_ms: 250,
            prediction_horizon_ms: 500,
            rebase_after_deltas: 20,
            maintenance_interval_ms: 1_000,
            pace_interval_ms: 5_000,
            ping_interval_ms: 2_000,
            ping_timeout_ms: 3_000,
            stale_timeout_ms: 30_000,
            metrics_stale_after_ms: 15_000,
            stats_interval_ms: 30_000,
            spatial_cell_size: DEFAULT_CELL_SIZE,
            relevance: RelevanceConfig::default(),
            cadence: CadenceConfig::default(),
            codec: CodecConfig::default(),
            predictor: PredictorConfig::default(),
            monitor: MonitorConfig::default(),
            rate_limit: RateLimitConfig::default(),
            congestion: CongestionConfig::default(),
            adaptation: AdaptationConfig::default(),
        }
    }
}

// ============================================================================
// Stats surface
// ============================================================================

/// Viewer counts per link quality band. Viewers without a sample yet are in
/// no band.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QualityHistogram {
    pub excellent: usize,
    pub good: usize,
    pub fair: usize,
    pub poor: usize,
}

/// Point-in-time pipeline summary
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub compression_ratio: f64,
    pub delta_ratio: f64,
    pub active_viewer_count: usize,
    pub quality_histogram: QualityHistogram,
}

// ============================================================================
// World store
// ============================================================================

/// The current snapshot flattened for per-viewer resolution. Rebuilt whole on
/// every ingest; queries between ingests all see the same tick.
#[derive(Default)]
struct WorldStore {
    ready: bool,
    tick: u64,
    objects: Vec<WorldObject>,
    slots: FxHashMap<ObjectId, usize>,
}

impl WorldStore {
    fn get(&self, id: ObjectId) -> Option<&WorldObject> {
        self.slots.get(&id).map(|&i| &self.objects[i])
    }

    fn player(&self, id: ObjectId) -> Option<&PlayerObject> {
        match self.get(id) {
            Some(WorldObject::Player(p)) => Some(p),
            _ => None,
        }
    }
}

/// Score leaders granted Active priority regardless of their own traffic
const TOP_SCORER_COUNT: usize = 3;

// ============================================================================
// Orchestrator
// ============================================================================

pub struct SyncOrchestrator {
    config: OrchestratorConfig,
    settings: SharedSettings,
    registry: ViewerRegistry,
    index: SpatialIndex,
    predictor: MovementPredictor,
    scorer: RelevanceScorer,
    codec: DeltaCodec,
    cadence: CadenceCalculator,
    congestion: CongestionDetector,
    adaptation: AdaptationController,
    world: WorldStore,
    /// Best-scoring player ids as of the last ingest
    top_scorers: FxHashSet<ObjectId>,
    metrics: Arc<Metrics>,
    last_pace_ms: u64,
    last_maintenance_ms: u64,
    last_ping_ms: u64,
    last_stats_ms: u64,
}

impl SyncOrchestrator {
    pub fn new(config: OrchestratorConfig, metrics: Arc<Metrics>) -> Self {
        let settings: SharedSettings = Arc::new(RwLock::new(SyncSettings::baseline(
            config.base_tick_interval_ms,
            config.min_tick_interval_ms,
            config.max_tick_interval_ms,
        )));
        let registry = ViewerRegistry::new(
            config.max_viewers,
            config.monitor.clone(),
            config.rate_limit.clone(),
        )
        .with_stale_timeout(config.stale_timeout_ms);

        Self {
            index: SpatialIndex::new(config.spatial_cell_size, config.world_width, config.world_height),
            predictor: MovementPredictor::new(config.predictor.clone()),
            scorer: RelevanceScorer::new(config.relevance.clone()),
            codec: DeltaCodec::new(config.codec.clone()),
            cadence: CadenceCalculator::new(config.cadence.clone()),
            congestion: CongestionDetector::new(config.congestion.clone()),
            adaptation: AdaptationController::new(config.adaptation.clone(), settings.clone()),
            registry,
            settings,
            config,
            world: WorldStore::default(),
            top_scorers: FxHashSet::default(),
            metrics,
            last_pace_ms: 0,
            last_maintenance_ms: 0,
            last_ping_ms: 0,
            last_stats_ms: 0,
        }
    }

    /// Shared handle to the live tuning knobs
    pub fn settings(&self) -> SharedSettings {
        self.settings.clone()
    }

    /// Adaptation event feed for an external observer. Take it before
    /// `start`; events go to whoever holds the receiver.
    pub fn adaptation_events(&self) -> Receiver<AdaptationEvent> {
        self.adaptation.event_receiver()
    }

    pub fn viewer_count(&self) -> usize {
        self.registry.len()
    }

    pub fn world_tick(&self) -> u64 {
        self.world.tick
    }

    pub fn stats(&self) -> PipelineStats {
        let codec = self.codec.stats();
        let mut histogram = QualityHistogram::default();
        for (_, record) in self.registry.iter() {
            match record.metrics.quality() {
                Some(LinkQuality::Excellent) => histogram.excellent += 1,
                Some(LinkQuality::Good) => histogram.good += 1,
                Some(LinkQuality::Fair) => histogram.fair += 1,
                Some(LinkQuality::Poor) => histogram.poor += 1,
                None => {}
            }
        }
        PipelineStats {
            compression_ratio: codec.compression_ratio,
            delta_ratio: codec.delta_ratio,
            active_viewer_count: self.registry.len(),
            quality_histogram: histogram,
        }
    }

    // ------------------------------------------------------------------
    // Viewer lifecycle
    // ------------------------------------------------------------------

    /// Admit a viewer. A Welcome goes out on success; a Rejected on refusal,
    /// over the channel the caller supplied.
    pub fn connect(
        &mut self,
        name: String,
        outbound: mpsc::UnboundedSender<Outbound>,
        now_ms: u64,
    ) -> Result<ViewerId, RegistryError> {
        match self.registry.connect(name.clone(), outbound.clone(), now_ms) {
            Ok(id) => {
                let tick_interval_ms = self.settings.read().effective_tick_interval_ms();
                if let Some(record) = self.registry.get_mut(&id) {
                    record.send_control(ServerMessage::Welcome {
                        viewer_id: id,
                        world_width: self.config.world_width,
                        world_height: self.config.world_height,
                        tick_interval_ms,
                    });
                }
                self.metrics.viewers_connected_total.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .viewers_active
                    .store(self.registry.len() as u64, Ordering::Relaxed);
                info!(viewer = %id, name = %name, viewers = self.registry.len(), "viewer connected");
                Ok(id)
            }
            Err(err) => {
                let _ = outbound.send(Outbound::Control(ServerMessage::Rejected {
                    reason: err.to_string(),
                }));
                self.metrics.viewers_rejected_total.fetch_add(1, Ordering::Relaxed);
                warn!(name = %name, error = %err, "viewer refused");
                Err(err)
            }
        }
    }

    pub fn disconnect(&mut self, id: &ViewerId) -> bool {
        match self.registry.disconnect(id) {
            Some(record) => {
                self.cadence.forget(id);
                self.metrics
                    .viewers_active
                    .store(self.registry.len() as u64, Ordering::Relaxed);
                info!(
                    viewer = %id,
                    name = %record.name,
                    frames = record.frames_sent,
                    "viewer disconnected"
                );
                true
            }
            None => false,
        }
    }

    /// Tie a viewer to the world object they control. Scoring then uses the
    /// avatar's position and speed instead of the viewport center, and the
    /// avatar is always included in their frames.
    pub fn bind_avatar(&mut self, id: &ViewerId, object: ObjectId) {
        if let Some(record) = self.registry.get_mut(id) {
            record.avatar = Some(object);
        }
    }

    pub fn set_vip(&mut self, id: &ViewerId, vip: bool) {
        if let Some(record) = self.registry.get_mut(id) {
            record.vip = vip;
        }
    }

    // ------------------------------------------------------------------
    // Inbound messages
    // ------------------------------------------------------------------

    pub fn handle_message(&mut self, viewer: ViewerId, message: ClientMessage, now_ms: u64) {
        self.metrics.messages_received_total.fetch_add(1, Ordering::Relaxed);
        let aggressive = self.settings.read().smoothing_aggressive;
        let cadence_config = self.cadence.config().clone();

        let Some(record) = self.registry.get_mut(&viewer) else {
            debug!(viewer = %viewer, "message for unknown viewer");
            return;
        };
        record.touch(now_ms);

        if !record.message_limiter.try_acquire(now_ms) {
            self.metrics
                .messages_rate_limited_total
                .fetch_add(1, Ordering::Relaxed);
            debug!(viewer = %viewer, "message dropped by rate limit");
            return;
        }

        let mut leave = false;
        match message {
            ClientMessage::Hello { viewer_name, viewport } => {
                record.name = viewer_name;
                record.viewport = Some(viewport);
                record.activity.record_message(now_ms, &cadence_config);
            }
            ClientMessage::ViewportUpdate(viewport) => {
                record.viewport = Some(viewport);
                record.activity.record_viewport_move(now_ms, &cadence_config);
            }
            ClientMessage::Ping { nonce, timestamp } => {
                record.activity.record_message(now_ms, &cadence_config);
                record.send_control(ServerMessage::Pong {
                    nonce,
                    client_timestamp: timestamp,
                    server_timestamp: now_ms,
                });
            }
            ClientMessage::Pong { nonce, .. } => {
                if record.record_pong(nonce, now_ms, aggressive).is_none() {
                    debug!(viewer = %viewer, nonce, "pong for unknown or expired probe");
                }
            }
            ClientMessage::FrameAck { .. } => {
                record.metrics.record_ack();
            }
            ClientMessage::Bye => leave = true,
        }

        if leave {
            self.disconnect(&viewer);
        }
    }

    // ------------------------------------------------------------------
    // Snapshot ingest
    // ------------------------------------------------------------------

    /// Take over a fresh world snapshot: sanitize, feed the predictor,
    /// flatten into the object store, and rebuild the spatial index. The
    /// index is complete before any viewer query runs against this tick.
    pub fn ingest_snapshot(&mut self, mut snapshot: WorldSnapshot, now_ms: u64) {
        let fixed = snapshot.sanitize();
        if fixed > 0 {
            warn!(fixed, tick = snapshot.tick, "sanitized non-finite values in snapshot");
        }

        for player in &snapshot.players {
            self.predictor.record_sample(player.id, player.position, now_ms);
        }

        // Avatar travel and score changes feed the owner's activity window.
        // Compared against the previous snapshot, so this runs before the
        // world store is overwritten.
        if !self.registry.is_empty() {
            let cadence_config = self.cadence.config().clone();
            let incoming: FxHashMap<ObjectId, (Vec2, u32)> = snapshot
                .players
                .iter()
                .map(|p| (p.id, (p.position, p.score)))
                .collect();
            for (_, record) in self.registry.iter_mut() {
                let Some(avatar) = record.avatar else { continue };
                let Some(previous) = self.world.player(avatar) else { continue };
                let Some((position, score)) = incoming.get(&avatar) else {
                    continue;
                };
                record.activity.record_avatar_motion(
                    now_ms,
                    previous.position.distance_to(*position),
                    &cadence_config,
                );
                if *score != previous.score {
                    record.activity.record_score_delta(now_ms, &cadence_config);
                }
            }
        }

        // Score leaders get priority treatment in the gating pass
        self.top_scorers.clear();
        if !snapshot.players.is_empty() {
            let mut ranked: Vec<(u32, ObjectId)> =
                snapshot.players.iter().map(|p| (p.score, p.id)).collect();
            ranked.sort_unstable_by(|a, b| b.cmp(a));
            self.top_scorers
                .extend(ranked.iter().take(TOP_SCORER_COUNT).map(|(_, id)| *id));
        }

        let count = snapshot.object_count();
        self.world.ready = true;
        self.world.tick = snapshot.tick;
        self.world.objects.clear();
        self.world.objects.reserve(count);
        for player in snapshot.players {
            self.world.objects.push(WorldObject::Player(player));
        }
        for food in snapshot.foods {
            self.world.objects.push(WorldObject::Food(food));
        }
        for dead in snapshot.dead_points {
            self.world.objects.push(WorldObject::DeadPoint(dead));
        }

        self.world.slots.clear();
        for (i, object) in self.world.objects.iter().enumerate() {
            self.world.slots.insert(object.id(), i);
        }

        self.index.rebuild(self.world.objects.iter().map(|o| SpatialEntry {
            id: o.id(),
            kind: o.kind(),
            position: o.position(),
            radius: o.radius(),
        }));

        let live: FxHashSet<ObjectId> = self.world.slots.keys().copied().collect();
        self.predictor.prune(&live);

        self.metrics.world_tick.store(self.world.tick, Ordering::Relaxed);
        self.metrics.objects_tracked.store(count as u64, Ordering::Relaxed);
        self.metrics.snapshots_ingested_total.fetch_add(1, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// One scheduler tick: the broadcast fan-out, then whichever of the
    /// slower jobs have come due.
    pub fn run_tick(&mut self, now_ms: u64) {
        self.broadcast(now_ms);

        if now_ms.saturating_sub(self.last_pace_ms) >= self.config.pace_interval_ms {
            self.last_pace_ms = now_ms;
            self.recompute_pace();
        }
        if now_ms.saturating_sub(self.last_maintenance_ms) >= self.config.maintenance_interval_ms {
            self.last_maintenance_ms = now_ms;
            self.maintain(now_ms);
        }
    }

    /// The per-viewer fan-out for one tick.
    pub fn broadcast(&mut self, now_ms: u64) {
        if !self.world.ready || self.registry.is_empty() {
            return;
        }
        let started = Instant::now();

        let settings = self.settings.read().clone();
        let base_interval = settings.effective_tick_interval_ms();
        let load = ServerLoad::classify(
            self.registry.len(),
            self.world.objects.len(),
            self.cadence.config(),
        );
        let whole_world = self.full_world_viewport();

        // Phase one, sequential: rate limit, cadence, viewport resolution.
        // Produces the set of due viewers with their query scopes.
        let mut plans: FxHashMap<ViewerId, Viewport> = FxHashMap::default();
        let mut skipped_rate = 0u64;
        let mut skipped_cadence = 0u64;
        for (id, record) in self.registry.iter_mut() {
            if !record.limiter.try_acquire(now_ms) {
                skipped_rate += 1;
                continue;
            }

            let activity = record.activity.level(now_ms, &self.config.cadence);
            let quality = record.metrics.quality();
            let top_scorer = record
                .avatar
                .is_some_and(|avatar| self.top_scorers.contains(&avatar));
            let priority = ViewerPriority::classify(record.vip, top_scorer, activity);
            let interval = self.cadence.interval_for(
                *id,
                base_interval,
                activity,
                quality,
                load,
                priority,
                now_ms,
            );
            if !CadenceCalculator::should_send(interval, record.last_sent_ms, now_ms) {
                skipped_cadence += 1;
                continue;
            }

            // No viewport yet means the world-spanning view; relevance still
            // trims it from the world center outward
            let viewport = match record.viewport {
                None => whole_world,
                Some(vp) => match record.avatar {
                    // Narrowed scope turns the lookahead margin off
                    Some(avatar) if !settings.scope_narrowed => self.predictor.expanded_viewport(
                        &vp,
                        avatar,
                        self.config.prediction_horizon_ms,
                        now_ms,
                    ),
                    _ => vp,
                },
            };
            plans.insert(*id, viewport);
        }

        // Phase two, parallel: query, score, encode, dispatch. Everything
        // mutated here lives inside the one record each worker holds.
        let world = &self.world;
        let index = &self.index;
        let scorer = &self.scorer;
        let codec = &self.codec;
        let plans = &plans;
        let settings = &settings;
        let narrowed = settings.scope_narrowed;
        let rebase_after = self.config.rebase_after_deltas;
        let sent = AtomicU64::new(0);
        let sent_full = AtomicU64::new(0);
        let sent_delta = AtomicU64::new(0);
        let sent_fallback = AtomicU64::new(0);
        let sent_bytes = AtomicU64::new(0);
        let skipped_empty = AtomicU64::new(0);
        let failures = AtomicU64::new(0);

        self.registry.par_for_each_mut(|record| {
            let Some(viewport) = plans.get(&record.id) else {
                return;
            };

            let mut candidates: Vec<&WorldObject> = Vec::new();
            index.for_each_in_rect(viewport, None, |entry| {
                if let Some(object) = world.get(entry.id) {
                    candidates.push(object);
                }
            });
            if let Some(avatar) = record.avatar {
                if !candidates.iter().any(|o| o.id() == avatar) {
                    if let Some(object) = world.get(avatar) {
                        candidates.push(object);
                    }
                }
            }
            record.activity.set_nearby(candidates.len());

            let context = record
                .avatar
                .and_then(|id| world.player(id))
                .map(ViewerContext::from_player)
                .unwrap_or_else(|| ViewerContext::spectator(viewport.viewer_position()));

            let scored = scorer.filter(candidates, &context, narrowed);
            let mut view = ViewSnapshot {
                tick: world.tick,
                players: Vec::new(),
                foods: Vec::new(),
                dead_points: Vec::new(),
            };
            for (object, _) in &scored {
                match object {
                    WorldObject::Player(p) => view.players.push(p.clone()),
                    WorldObject::Food(f) => view.foods.push(f.clone()),
                    WorldObject::DeadPoint(d) => view.dead_points.push(d.clone()),
                }
            }

            let tuning = CodecTuning {
                reduced_precision: settings.reduced_precision,
                compression: settings.compression_enabled,
                redundancy: settings.redundancy_enabled,
                force_full: settings.error_recovery_enabled
                    && record.sends_since_full >= rebase_after,
            };

            let Some(frame) = codec.encode_for_viewer(&mut record.baseline, &view, now_ms, tuning)
            else {
                skipped_empty.fetch_add(1, Ordering::Relaxed);
                return;
            };
            let kind = frame.kind;
            match frame.encode() {
                Ok(bytes) => {
                    let len = bytes.len() as u64;
                    if record.send_frame(bytes) {
                        record.note_sent(now_ms, kind != FrameKind::Delta);
                        sent.fetch_add(1, Ordering::Relaxed);
                        sent_bytes.fetch_add(len, Ordering::Relaxed);
                        match kind {
                            FrameKind::Full => sent_full.fetch_add(1, Ordering::Relaxed),
                            FrameKind::Delta => sent_delta.fetch_add(1, Ordering::Relaxed),
                            FrameKind::Fallback => sent_fallback.fetch_add(1, Ordering::Relaxed),
                        };
                    }
                }
                Err(err) => {
                    // Oversized envelope: drop the stale baseline so the next
                    // attempt resyncs from a full frame
                    record.baseline = None;
                    failures.fetch_add(1, Ordering::Relaxed);
                    warn!(viewer = %record.id, error = %err, "frame envelope refused, send skipped");
                }
            }
        });

        let m = &self.metrics;
        m.frames_sent_total.fetch_add(sent.load(Ordering::Relaxed), Ordering::Relaxed);
        m.frames_full_total.fetch_add(sent_full.load(Ordering::Relaxed), Ordering::Relaxed);
        m.frames_delta_total.fetch_add(sent_delta.load(Ordering::Relaxed), Ordering::Relaxed);
        m.frames_fallback_total
            .fetch_add(sent_fallback.load(Ordering::Relaxed), Ordering::Relaxed);
        m.bytes_sent_total.fetch_add(sent_bytes.load(Ordering::Relaxed), Ordering::Relaxed);
        m.frames_skipped_rate_limit.fetch_add(skipped_rate, Ordering::Relaxed);
        m.frames_skipped_cadence.fetch_add(skipped_cadence, Ordering::Relaxed);
        m.frames_skipped_empty
            .fetch_add(skipped_empty.load(Ordering::Relaxed), Ordering::Relaxed);
        m.encode_failures_total
            .fetch_add(failures.load(Ordering::Relaxed), Ordering::Relaxed);
        m.record_broadcast_time(started.elapsed());
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Slow-path upkeep: reap, probe, aggregate, adapt, log.
    pub fn maintain(&mut self, now_ms: u64) {
        let reaped = self.registry.sweep_stale(now_ms);
        if !reaped.is_empty() {
            for id in &reaped {
                self.cadence.forget(id);
            }
            self.metrics
                .viewers_reaped_total
                .fetch_add(reaped.len() as u64, Ordering::Relaxed);
            info!(count = reaped.len(), "reaped stale viewers");
        }

        // Viewers that kept flooding past the message budget are told why,
        // then their record goes away
        let abusive: Vec<ViewerId> = self
            .registry
            .iter()
            .filter(|(_, record)| record.message_limiter.is_abusive())
            .map(|(id, _)| *id)
            .collect();
        for id in &abusive {
            if let Some(record) = self.registry.get_mut(id) {
                record.send_control(ServerMessage::Kicked {
                    reason: "message rate limit exceeded".to_string(),
                });
                warn!(
                    viewer = %id,
                    name = %record.name,
                    violations = record.message_limiter.violations(),
                    session_ms = now_ms.saturating_sub(record.connected_at_ms),
                    "viewer kicked for message flooding"
                );
            }
            self.registry.disconnect(id);
            self.cadence.forget(id);
        }
        if !abusive.is_empty() {
            self.metrics
                .viewers_kicked_total
                .fetch_add(abusive.len() as u64, Ordering::Relaxed);
        }

        self.metrics
            .viewers_active
            .store(self.registry.len() as u64, Ordering::Relaxed);

        // Ping upkeep: expire unanswered probes, then send the next round
        let mut expired_total = 0usize;
        let send_pings = now_ms.saturating_sub(self.last_ping_ms) >= self.config.ping_interval_ms;
        if send_pings {
            self.last_ping_ms = now_ms;
        }
        for (_, record) in self.registry.iter_mut() {
            expired_total += record.expire_pings(self.config.ping_timeout_ms, now_ms);
            if send_pings {
                let nonce: u32 = rand::random();
                if record.send_control(ServerMessage::Ping {
                    nonce,
                    timestamp: now_ms,
                }) {
                    record.note_ping(nonce, now_ms);
                }
            }
        }
        if expired_total > 0 {
            debug!(count = expired_total, "ping probes timed out");
        }

        // Aggregate link conditions. Viewers without fresh samples stay out
        // of the latency and jitter means.
        let mut latency_sum = 0.0f32;
        let mut jitter_sum = 0.0f32;
        let mut loss_sum = 0.0f32;
        let mut sampled = 0usize;
        let mut histogram = QualityHistogram::default();
        for (_, record) in self.registry.iter() {
            let fresh = record
                .metrics
                .sample_age_ms(now_ms)
                .is_some_and(|age| age <= self.config.metrics_stale_after_ms);
            if fresh {
                if let Some(rtt) = record.metrics.smoothed_rtt() {
                    latency_sum += rtt;
                    jitter_sum += record.metrics.jitter();
                    sampled += 1;
                }
            }
            loss_sum += record.metrics.loss_rate();
            match record.metrics.quality() {
                Some(LinkQuality::Excellent) => histogram.excellent += 1,
                Some(LinkQuality::Good) => histogram.good += 1,
                Some(LinkQuality::Fair) => histogram.fair += 1,
                Some(LinkQuality::Poor) => histogram.poor += 1,
                None => {}
            }
        }

        let viewer_count = self.registry.len();
        let mean_latency = if sampled > 0 { latency_sum / sampled as f32 } else { 0.0 };
        let mean_jitter = if sampled > 0 { jitter_sum / sampled as f32 } else { 0.0 };
        let mean_loss = if viewer_count > 0 { loss_sum / viewer_count as f32 } else { 0.0 };

        if sampled > 0 {
            self.congestion.record(NetworkSample {
                latency_ms: mean_latency,
                loss_rate: mean_loss,
                jitter_ms: mean_jitter,
            });
        }
        let congestion = self.congestion.detect();
        match &congestion {
            Some(report) => {
                self.metrics
                    .congestion_level
                    .store(report.level.severity() as u64, Ordering::Relaxed);
                debug!(
                    level = ?report.level,
                    signal = ?report.signal,
                    spike = report.spike,
                    recent = report.recent_mean,
                    baseline = report.baseline_mean,
                    "congestion detected"
                );
            }
            None => self.metrics.congestion_level.store(0, Ordering::Relaxed),
        }

        let inputs = AdaptationInputs {
            mean_latency_ms: mean_latency,
            mean_jitter_ms: mean_jitter,
            loss_rate: mean_loss,
            viewer_count,
            congestion: congestion.map(|r| r.level),
        };
        self.adaptation.evaluate(&inputs, now_ms);

        // Mirror the live figures into the metrics endpoint
        let codec = self.codec.stats();
        self.metrics
            .set_codec_ratios(codec.compression_ratio as f32, codec.delta_ratio as f32);
        self.metrics.set_quality_histogram(
            histogram.excellent as u64,
            histogram.good as u64,
            histogram.fair as u64,
            histogram.poor as u64,
        );
        let interval = self.settings.read().effective_tick_interval_ms();
        self.metrics.tick_interval_ms.store(interval, Ordering::Relaxed);

        if now_ms.saturating_sub(self.last_stats_ms) >= self.config.stats_interval_ms {
            self.last_stats_ms = now_ms;
            info!(
                viewers = viewer_count,
                objects = self.world.objects.len(),
                tick = self.world.tick,
                interval_ms = interval,
                compression_ratio = codec.compression_ratio,
                delta_ratio = codec.delta_ratio,
                mean_latency_ms = mean_latency,
                "pipeline stats"
            );
        }
    }

    /// Re-pick the base pace from current pressure. Degradation slowdown sits
    /// on top of this and is owned by the adaptation controller.
    fn recompute_pace(&mut self) {
        let load = ServerLoad::classify(
            self.registry.len(),
            self.world.objects.len(),
            self.cadence.config(),
        );
        let base = self.config.base_tick_interval_ms;
        let target = match load {
            ServerLoad::Low => base,
            ServerLoad::Medium => base * 5 / 4,
            ServerLoad::High => base * 3 / 2,
            ServerLoad::Critical => base * 2,
        };

        let mut settings = self.settings.write();
        if settings.base_tick_interval_ms != target {
            info!(
                from_ms = settings.base_tick_interval_ms,
                to_ms = target,
                load = ?load,
                "base pace adjusted"
            );
            settings.base_tick_interval_ms = target;
        }
    }

    fn full_world_viewport(&self) -> Viewport {
        Viewport::new(
            0.0,
            0.0,
            self.config.world_width,
            self.config.world_height,
            self.config.world_width * 0.5,
            self.config.world_height * 0.5,
        )
    }

    // ------------------------------------------------------------------
    // Control events
    // ------------------------------------------------------------------

    fn handle_control(&mut self, event: ControlEvent, now_ms: u64) {
        match event {
            ControlEvent::Connect { name, outbound, reply } => {
                let _ = reply.send(self.connect(name, outbound, now_ms));
            }
            ControlEvent::Disconnect(id) => {
                self.disconnect(&id);
            }
            ControlEvent::Message(id, message) => self.handle_message(id, message, now_ms),
            ControlEvent::BindAvatar(id, object) => self.bind_avatar(&id, object),
            ControlEvent::SetVip(id, vip) => self.set_vip(&id, vip),
        }
    }
}

// ============================================================================
// Async runner
// ============================================================================

/// Commands into the running orchestrator task
enum ControlEvent {
    Connect {
        name: String,
        outbound: mpsc::UnboundedSender<Outbound>,
        reply: oneshot::Sender<Result<ViewerId, RegistryError>>,
    },
    Disconnect(ViewerId),
    Message(ViewerId, ClientMessage),
    BindAvatar(ViewerId, ObjectId),
    SetVip(ViewerId, bool),
}

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("orchestrator is gone")]
    Closed,
    #[error(transparent)]
    Refused(#[from] RegistryError),
}

/// Cheap, cloneable front for the orchestrator task
#[derive(Clone)]
pub struct OrchestratorHandle {
    control: mpsc::UnboundedSender<ControlEvent>,
    snapshots: mpsc::Sender<WorldSnapshot>,
    metrics: Arc<Metrics>,
}

impl OrchestratorHandle {
    /// Admit a viewer and return their id plus the outbound message stream
    /// their writer task drains.
    pub async fn connect(
        &self,
        name: String,
    ) -> Result<(ViewerId, mpsc::UnboundedReceiver<Outbound>), HandleError> {
        let (outbound, rx) = mpsc::unbounded_channel();
        let (reply, response) = oneshot::channel();
        self.control
            .send(ControlEvent::Connect { name, outbound, reply })
            .map_err(|_| HandleError::Closed)?;
        let id = response.await.map_err(|_| HandleError::Closed)??;
        Ok((id, rx))
    }

    pub fn disconnect(&self, id: ViewerId) {
        let _ = self.control.send(ControlEvent::Disconnect(id));
    }

    pub fn send_message(&self, id: ViewerId, message: ClientMessage) -> bool {
        self.control.send(ControlEvent::Message(id, message)).is_ok()
    }

    pub fn bind_avatar(&self, id: ViewerId, object: ObjectId) {
        let _ = self.control.send(ControlEvent::BindAvatar(id, object));
    }

    pub fn set_vip(&self, id: ViewerId, vip: bool) {
        let _ = self.control.send(ControlEvent::SetVip(id, vip));
    }

    /// Hand the next world snapshot to the pipeline. Returns false when the
    /// ingest queue is full and the snapshot was dropped; the next one
    /// supersedes it anyway.
    pub fn submit_snapshot(&self, snapshot: WorldSnapshot) -> bool {
        match self.snapshots.try_send(snapshot) {
            Ok(()) => true,
            Err(_) => {
                self.metrics.snapshots_dropped_total.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Spawn the orchestrator loop and hand back its control surface.
///
/// The loop re-reads the effective tick interval before every sleep, so pace
/// changes from adaptation or load apply on the very next tick. A tick that
/// overruns is simply late once; the schedule restarts from now rather than
/// bursting to catch up.
pub fn start(mut orchestrator: SyncOrchestrator) -> OrchestratorHandle {
    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, mut snapshot_rx) = mpsc::channel::<WorldSnapshot>(2);
    let metrics = orchestrator.metrics.clone();

    tokio::spawn(async move {
        let epoch = Instant::now();
        let interval = orchestrator.settings.read().effective_tick_interval_ms();
        let mut next_tick = tokio::time::Instant::now() + Duration::from_millis(interval);
        info!(interval_ms = interval, "sync orchestrator started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_tick) => {
                    let now_ms = epoch.elapsed().as_millis() as u64;
                    orchestrator.run_tick(now_ms);
                    let interval = orchestrator.settings.read().effective_tick_interval_ms();
                    next_tick = tokio::time::Instant::now() + Duration::from_millis(interval);
                }
                event = control_rx.recv() => {
                    match event {
                        Some(event) => {
                            let now_ms = epoch.elapsed().as_millis() as u64;
                            orchestrator.handle_control(event, now_ms);
                        }
                        None => break,
                    }
                }
                snapshot = snapshot_rx.recv() => {
                    match snapshot {
                        Some(snapshot) => {
                            let now_ms = epoch.elapsed().as_millis() as u64;
                            orchestrator.ingest_snapshot(snapshot, now_ms);
                        }
                        None => break,
                    }
                }
            }
        }
        info!("sync orchestrator stopped");
    });

    // The ingest queue is intentionally short; a stalled loop sheds
    // snapshots instead of queueing stale worlds
    OrchestratorHandle {
        control: control_tx,
        snapshots: snapshot_tx,
        metrics,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::codec::DecodedFrame;
    use crate::util::vec2::Vec2;
    use crate::world::object::FoodObject;

    fn test_config() -> OrchestratorConfig {
        OrchestratorConfig {
            world_width: 2_000.0,
            world_height: 2_000.0,
            max_viewers: 4,
            ..OrchestratorConfig::default()
        }
    }

    fn orchestrator() -> SyncOrchestrator {
        SyncOrchestrator::new(test_config(), Arc::new(Metrics::new()))
    }

    fn player(id: ObjectId, x: f32, y: f32) -> PlayerObject {
        PlayerObject {
            id,
            position: Vec2::new(x, y),
            velocity: Vec2::ZERO,
            heading: 0.0,
            radius: 12.0,
            color: 0xe6194b,
            body: vec![Vec2::new(x, y)],
            score: 0,
            is_bot: false,
            name: format!("p{}", id),
        }
    }

    fn food(id: ObjectId, x: f32, y: f32) -> FoodObject {
        FoodObject {
            id,
            position: Vec2::new(x, y),
            radius: 3.0,
            color: 0x3cb44b,
        }
    }

    fn world(tick: u64, players: Vec<PlayerObject>, foods: Vec<FoodObject>) -> WorldSnapshot {
        WorldSnapshot {
            tick,
            players,
            foods,
            dead_points: Vec::new(),
        }
    }

    fn connect(
        orch: &mut SyncOrchestrator,
        name: &str,
    ) -> (ViewerId, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = orch.connect(name.to_string(), tx, 1_000).expect("connect");
        (id, rx)
    }

    fn next_data(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<u8> {
        loop {
            match rx.try_recv().expect("expected an outbound message") {
                Outbound::Data(bytes) => return bytes,
                Outbound::Control(_) => continue,
            }
        }
    }

    #[test]
    fn test_connect_sends_welcome() {
        let mut orch = orchestrator();
        let (id, mut rx) = connect(&mut orch, "alice");

        match rx.try_recv().expect("welcome queued") {
            Outbound::Control(ServerMessage::Welcome {
                viewer_id,
                world_width,
                world_height,
                tick_interval_ms,
            }) => {
                assert_eq!(viewer_id, id);
                assert_eq!(world_width, 2_000.0);
                assert_eq!(world_height, 2_000.0);
                assert_eq!(tick_interval_ms, 50);
            }
            other => panic!("expected welcome, got {:?}", other),
        }
        assert_eq!(orch.viewer_count(), 1);
    }

    #[test]
    fn test_capacity_refusal_sends_rejected() {
        let mut orch = orchestrator();
        let mut held = Vec::new();
        for i in 0..4 {
            held.push(connect(&mut orch, &format!("v{}", i)));
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(orch.connect("late".to_string(), tx, 1_000).is_err());
        match rx.try_recv().expect("rejection queued") {
            Outbound::Control(ServerMessage::Rejected { reason }) => {
                assert!(reason.contains("capacity"), "reason: {}", reason);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(orch.viewer_count(), 4);
    }

    #[test]
    fn test_unknown_viewport_serves_scored_world_view() {
        let mut orch = orchestrator();
        let (_id, mut rx) = connect(&mut orch, "alice");

        // A player and one food near the world center, one food in the far
        // corner. The viewport-less view is scored from the center outward.
        orch.ingest_snapshot(
            world(
                1,
                vec![player(1, 1_050.0, 1_000.0)],
                vec![food(10, 1_050.0, 1_000.0), food(11, 1_900.0, 1_900.0)],
            ),
            1_000,
        );
        orch.broadcast(1_100);

        let bytes = next_data(&mut rx);
        match DeltaCodec::default().decode_frame(&bytes).expect("decodable") {
            DecodedFrame::Full(decoded) => {
                assert_eq!(decoded.players.len(), 1);
                assert_eq!(decoded.foods.len(), 1, "only the center food scores in");
                assert_eq!(decoded.foods[0].id, 10);
            }
            other => panic!("expected full frame, got {:?}", other),
        }
    }

    #[test]
    fn test_viewportless_viewer_survives_dense_world() {
        // Default-size world packed with food: the world-spanning view must
        // still trim down to an encodable frame
        let config = OrchestratorConfig {
            max_viewers: 4,
            ..OrchestratorConfig::default()
        };
        let metrics = Arc::new(Metrics::new());
        let mut orch = SyncOrchestrator::new(config, metrics.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        orch.connect("drifter".to_string(), tx, 1_000).expect("connect");

        let foods: Vec<FoodObject> = (0..8_000)
            .map(|i| {
                food(
                    100 + i as ObjectId,
                    (i % 100) as f32 * 40.0,
                    (i / 100) as f32 * 50.0,
                )
            })
            .collect();
        orch.ingest_snapshot(world(1, vec![player(1, 2_000.0, 2_000.0)], foods), 1_000);
        orch.broadcast(1_100);

        let bytes = next_data(&mut rx);
        match DeltaCodec::default().decode_frame(&bytes).expect("decodable") {
            DecodedFrame::Full(decoded) => {
                assert_eq!(decoded.players.len(), 1);
                assert!(!decoded.foods.is_empty(), "center foods are in range");
                assert!(
                    decoded.foods.len() <= 600,
                    "relevance caps the world-spanning view, kept {}",
                    decoded.foods.len()
                );
            }
            other => panic!("expected full frame, got {:?}", other),
        }
        assert_eq!(metrics.encode_failures_total.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.frames_sent_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_viewport_scopes_the_frame() {
        let mut orch = orchestrator();
        let (id, mut rx) = connect(&mut orch, "alice");
        orch.handle_message(
            id,
            ClientMessage::Hello {
                viewer_name: "alice".to_string(),
                viewport: Viewport::new(0.0, 0.0, 400.0, 400.0, 200.0, 200.0),
            },
            1_000,
        );

        orch.ingest_snapshot(
            world(
                1,
                vec![player(1, 250.0, 250.0)],
                vec![food(10, 100.0, 100.0), food(11, 1_500.0, 1_500.0)],
            ),
            1_000,
        );
        orch.broadcast(1_100);

        let bytes = next_data(&mut rx);
        match DeltaCodec::default().decode_frame(&bytes).expect("decodable") {
            DecodedFrame::Full(decoded) => {
                assert_eq!(decoded.players.len(), 1);
                assert_eq!(decoded.foods.len(), 1, "far food is outside the viewport");
                assert_eq!(decoded.foods[0].id, 10);
            }
            other => panic!("expected full frame, got {:?}", other),
        }
    }

    #[test]
    fn test_cadence_spaces_sends_then_delta() {
        let mut orch = orchestrator();
        let (id, mut rx) = connect(&mut orch, "alice");
        orch.handle_message(
            id,
            ClientMessage::Hello {
                viewer_name: "alice".to_string(),
                viewport: Viewport::new(0.0, 0.0, 400.0, 400.0, 200.0, 200.0),
            },
            1_000,
        );

        orch.ingest_snapshot(world(1, vec![player(1, 250.0, 250.0)], vec![]), 1_000);
        orch.broadcast(1_100);
        let first = next_data(&mut rx);
        assert!(matches!(
            DeltaCodec::default().decode_frame(&first),
            Ok(DecodedFrame::Full(_))
        ));

        // Next tick arrives 5ms later; an idle viewer's interval is far
        // longer, so nothing goes out
        orch.ingest_snapshot(world(2, vec![player(1, 255.0, 250.0)], vec![]), 1_105);
        orch.broadcast(1_105);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));

        // Past the cadence interval the moved player ships as a delta
        orch.ingest_snapshot(world(3, vec![player(1, 260.0, 250.0)], vec![]), 1_400);
        orch.broadcast(1_400);
        let second = next_data(&mut rx);
        match DeltaCodec::default().decode_frame(&second).expect("decodable") {
            DecodedFrame::Delta(delta) => {
                assert_eq!(delta.player_updates.len(), 1);
                assert_eq!(delta.player_updates[0].id, 1);
                assert!(
                    delta.player_updates[0].position_delta.is_some()
                        || delta.player_updates[0].position_abs.is_some()
                );
            }
            other => panic!("expected delta frame, got {:?}", other),
        }
    }

    #[test]
    fn test_avatar_motion_raises_activity() {
        let mut orch = orchestrator();
        let (id, _rx) = connect(&mut orch, "driver");
        orch.bind_avatar(&id, 1);

        // The avatar shuttles 110 units per snapshot; twenty measured hops
        // at the default distance weight score past the medium threshold.
        let mut now = 1_000;
        for tick in 0..=20u64 {
            let x = if tick % 2 == 0 { 500.0 } else { 610.0 };
            orch.ingest_snapshot(world(tick, vec![player(1, x, 500.0)], vec![]), now);
            now += 33;
        }

        let config = orch.cadence.config().clone();
        let record = orch.registry.get_mut(&id).expect("record");
        assert_eq!(
            record.activity.level(now, &config),
            crate::net::cadence::ActivityLevel::Medium
        );
    }

    #[test]
    fn test_crowded_surroundings_raise_activity() {
        let mut orch = orchestrator();
        let (id, _rx) = connect(&mut orch, "alice");
        orch.handle_message(
            id,
            ClientMessage::Hello {
                viewer_name: "alice".to_string(),
                viewport: Viewport::new(0.0, 0.0, 400.0, 400.0, 200.0, 200.0),
            },
            1_000,
        );

        // Three hundred foods inside the viewport
        let foods: Vec<FoodObject> = (0..300)
            .map(|i| food(100 + i as ObjectId, (i % 20) as f32 * 20.0, (i / 20) as f32 * 20.0))
            .collect();
        orch.ingest_snapshot(world(1, vec![player(1, 200.0, 200.0)], foods), 1_000);
        orch.broadcast(1_100);

        // One served tick in a dense scene outweighs the lone Hello event
        let config = orch.cadence.config().clone();
        let record = orch.registry.get_mut(&id).expect("record");
        assert_eq!(
            record.activity.level(1_150, &config),
            crate::net::cadence::ActivityLevel::High
        );
    }

    #[test]
    fn test_score_leaders_rank_active() {
        let mut orch = orchestrator();
        let (id, _rx) = connect(&mut orch, "champ");
        orch.bind_avatar(&id, 5);

        let players: Vec<PlayerObject> = (1..=5)
            .map(|i| {
                let mut p = player(i as ObjectId, 100.0 * i as f32, 500.0);
                p.score = i as u32 * 100;
                p
            })
            .collect();
        orch.ingest_snapshot(world(1, players, vec![]), 1_000);

        assert!(orch.top_scorers.contains(&5));
        assert!(orch.top_scorers.contains(&4));
        assert!(orch.top_scorers.contains(&3));
        assert!(!orch.top_scorers.contains(&1), "only the leaders are ranked");

        // The leaderboard presence alone lifts an otherwise idle viewer
        let record = orch.registry.get(&id).expect("record");
        let top = record
            .avatar
            .is_some_and(|avatar| orch.top_scorers.contains(&avatar));
        assert!(top);
        assert_eq!(
            ViewerPriority::classify(record.vip, top, crate::net::cadence::ActivityLevel::Idle),
            ViewerPriority::Active
        );
    }

    #[test]
    fn test_bye_disconnects() {
        let mut orch = orchestrator();
        let (id, _rx) = connect(&mut orch, "alice");
        assert_eq!(orch.viewer_count(), 1);

        orch.handle_message(id, ClientMessage::Bye, 2_000);
        assert_eq!(orch.viewer_count(), 0);
    }

    #[test]
    fn test_message_flood_gets_kicked() {
        let metrics = Arc::new(Metrics::new());
        let mut orch = SyncOrchestrator::new(test_config(), metrics.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = orch.connect("spammer".to_string(), tx, 1_000).expect("connect");

        // Two hundred pings inside one window: 70 pass on budget and burst,
        // the rest count as violations
        let mut now = 1_000;
        for _ in 0..200 {
            orch.handle_message(id, ClientMessage::Ping { nonce: 1, timestamp: now }, now);
            now += 1;
        }
        assert_eq!(orch.viewer_count(), 1, "flooding alone does not drop the record");
        assert!(metrics.messages_rate_limited_total.load(Ordering::Relaxed) > 0);

        orch.maintain(now);
        assert_eq!(orch.viewer_count(), 0);
        assert_eq!(metrics.viewers_kicked_total.load(Ordering::Relaxed), 1);
        assert_eq!(orch.cadence.cached_count(), 0);

        let mut kicked = false;
        while let Ok(outbound) = rx.try_recv() {
            if let Outbound::Control(ServerMessage::Kicked { reason }) = outbound {
                assert!(reason.contains("rate limit"), "reason: {}", reason);
                kicked = true;
            }
        }
        assert!(kicked, "a kicked viewer is told why");
    }

    #[test]
    fn test_frame_ack_clears_loss_streak() {
        let mut orch = orchestrator();
        let (id, _rx) = connect(&mut orch, "alice");

        // Unanswered probes have put the link under a loss cloud
        {
            let record = orch.registry.get_mut(&id).expect("record");
            for _ in 0..4 {
                record.metrics.record_timeout();
            }
            assert!(record.metrics.is_unstable());
        }

        orch.handle_message(id, ClientMessage::FrameAck { tick: 7 }, 2_000);

        let record = orch.registry.get(&id).expect("record");
        assert!(
            !record.metrics.is_unstable(),
            "an acknowledged frame ends the timeout streak"
        );
        assert!(record.metrics.loss_rate() < 1.0);
    }

    #[test]
    fn test_ping_pong_round_trip_feeds_rtt() {
        let mut orch = orchestrator();
        let (id, mut rx) = connect(&mut orch, "alice");

        orch.maintain(5_000);
        let nonce = loop {
            match rx.try_recv().expect("ping queued") {
                Outbound::Control(ServerMessage::Ping { nonce, .. }) => break nonce,
                _ => continue,
            }
        };

        orch.handle_message(id, ClientMessage::Pong { nonce, timestamp: 0 }, 5_040);
        let rtt = orch
            .registry
            .get(&id)
            .and_then(|r| r.metrics.smoothed_rtt());
        assert_eq!(rtt, Some(40.0));
    }

    #[test]
    fn test_client_ping_answered() {
        let mut orch = orchestrator();
        let (id, mut rx) = connect(&mut orch, "alice");
        let _ = rx.try_recv(); // welcome

        orch.handle_message(id, ClientMessage::Ping { nonce: 9, timestamp: 123 }, 2_000);
        match rx.try_recv().expect("pong queued") {
            Outbound::Control(ServerMessage::Pong {
                nonce,
                client_timestamp,
                server_timestamp,
            }) => {
                assert_eq!(nonce, 9);
                assert_eq!(client_timestamp, 123);
                assert_eq!(server_timestamp, 2_000);
            }
            other => panic!("expected pong, got {:?}", other),
        }
    }

    #[test]
    fn test_stale_viewer_reaped_by_maintenance() {
        let mut orch = orchestrator();
        let (_id, _rx) = connect(&mut orch, "ghost");
        assert_eq!(orch.viewer_count(), 1);

        // Idle past the stale timeout
        orch.maintain(40_000);
        assert_eq!(orch.viewer_count(), 0);
        assert_eq!(orch.cadence.cached_count(), 0);
    }

    #[test]
    fn test_pace_scales_with_load() {
        let mut config = test_config();
        config.max_viewers = 8;
        config.cadence.max_viewers = 4;
        let mut orch = SyncOrchestrator::new(config, Arc::new(Metrics::new()));

        let mut held = Vec::new();
        for i in 0..3 {
            held.push(connect(&mut orch, &format!("v{}", i)));
        }

        // 3 of 4 capacity is High load: base 50 becomes 75
        orch.recompute_pace();
        assert_eq!(orch.settings().read().base_tick_interval_ms, 75);

        held.clear();
        for id in orch.registry.ids() {
            orch.disconnect(&id);
        }
        orch.recompute_pace();
        assert_eq!(orch.settings().read().base_tick_interval_ms, 50);
    }

    #[test]
    fn test_reported_latency_drives_adaptation() {
        let mut orch = orchestrator();
        let (id, mut rx) = connect(&mut orch, "laggy");

        // First maintenance sends a probe; conditions are still calm
        orch.maintain(2_000);
        let nonce = loop {
            match rx.try_recv().expect("ping queued") {
                Outbound::Control(ServerMessage::Ping { nonce, .. }) => break nonce,
                _ => continue,
            }
        };
        assert!(!orch.settings().read().compression_enabled);

        // The answer lands 400ms later: severe latency territory
        orch.handle_message(id, ClientMessage::Pong { nonce, timestamp: 0 }, 2_400);
        orch.maintain(9_000);

        let settings = orch.settings();
        let s = settings.read();
        assert!(s.compression_enabled);
        assert!(s.reduced_precision);
        assert!(s.slowdown > 1.0);
    }

    #[test]
    fn test_stats_snapshot_counts_viewers() {
        let mut orch = orchestrator();
        let (id, mut _rx) = connect(&mut orch, "alice");
        orch.handle_message(
            id,
            ClientMessage::Hello {
                viewer_name: "alice".to_string(),
                viewport: Viewport::new(0.0, 0.0, 400.0, 400.0, 200.0, 200.0),
            },
            1_000,
        );
        orch.ingest_snapshot(world(1, vec![player(1, 250.0, 250.0)], vec![]), 1_000);
        orch.broadcast(1_100);

        let stats = orch.stats();
        assert_eq!(stats.active_viewer_count, 1);
        assert!(stats.compression_ratio > 0.0);
        // No RTT samples yet, so the histogram is empty
        assert_eq!(stats.quality_histogram, QualityHistogram::default());
    }

    #[test]
    fn test_broadcast_without_snapshot_is_a_no_op() {
        let mut orch = orchestrator();
        let (_id, mut rx) = connect(&mut orch, "early");
        let _ = rx.try_recv(); // welcome

        orch.broadcast(1_100);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_runner_delivers_frames() {
        let orch = SyncOrchestrator::new(test_config(), Arc::new(Metrics::new()));
        let handle = start(orch);

        let (id, mut rx) = handle.connect("alice".to_string()).await.expect("connect");
        handle.send_message(
            id,
            ClientMessage::Hello {
                viewer_name: "alice".to_string(),
                viewport: Viewport::new(0.0, 0.0, 400.0, 400.0, 200.0, 200.0),
            },
        );
        assert!(handle.submit_snapshot(world(1, vec![player(1, 200.0, 200.0)], vec![])));

        let bytes = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(Outbound::Data(bytes)) => break bytes,
                    Some(Outbound::Control(_)) => continue,
                    None => panic!("orchestrator dropped the stream"),
                }
            }
        })
        .await
        .expect("frame within the deadline");

        match DeltaCodec::default().decode_frame(&bytes).expect("decodable") {
            DecodedFrame::Full(decoded) => assert_eq!(decoded.players.len(), 1),
            other => panic!("expected full frame, got {:?}", other),
        }
    }

    #[test]
    fn test_handle_refuses_past_capacity() {
        tokio_test::block_on(async {
            let orch = SyncOrchestrator::new(test_config(), Arc::new(Metrics::new()));
            let handle = start(orch);

            let mut held = Vec::new();
            for i in 0..4 {
                held.push(
                    handle
                        .connect(format!("v{}", i))
                        .await
                        .expect("capacity not yet reached"),
                );
            }

            let refused = handle.connect("late".to_string()).await;
            assert!(matches!(refused, Err(HandleError::Refused(_))));
        });
    }
}
