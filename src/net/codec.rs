//! Stateful full/delta codec for per-viewer frames
//!
//! First frame to a viewer is always full. After that, deltas carry only the
//! fields that moved past a significance threshold, with food and dead points
//! batched as add/remove lists. The viewer's baseline is overwritten with the
//! latest unquantized snapshot after every send so skipped ticks never
//! accumulate drift. If a serialized delta would not save at least 30% over
//! the full encoding, the full frame wins.
//!
//! Encoding never propagates an error: pathological input degrades to a
//! plain-text JSON frame. Decoding tries strict first, then a permissive pass
//! that keeps whatever prefix parsed, then surfaces a typed error.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::net::wire::{Frame, FrameKind, WireError, WireReader, WireWriter};
use crate::util::vec2::Vec2;
use crate::world::object::{DeadPointObject, FoodObject, ObjectId, PlayerObject, ViewSnapshot};

// ============================================================================
// Tuning
// ============================================================================

/// Fixed-point scale for absolute positions (1/100 unit precision)
const POSITION_SCALE: f32 = 100.0;

/// Fixed-point scale for absolute positions under reduced precision
const POSITION_SCALE_REDUCED: f32 = 10.0;

/// Fixed-point scale for relative delta offsets (0.1 unit precision)
const DELTA_SCALE: f32 = 10.0;

/// Widest offset a compact relative position can express per axis
const MAX_RELATIVE_OFFSET: f32 = i16::MAX as f32 / DELTA_SCALE - 1.0;

/// 16-color palette; raw 0xRRGGBB colors map to the nearest entry
pub const PALETTE: [u32; 16] = [
    0xe6194b, 0x3cb44b, 0xffe119, 0x4363d8, 0xf58231, 0x911eb4, 0x46f0f0, 0xf032e6, 0xbcf60c,
    0xfabebe, 0x008080, 0xe6beff, 0x9a6324, 0xfffac8, 0x800000, 0xaaffc3,
];

/// Change-significance thresholds. A field is only carried in a delta when it
/// moved further than this since the baseline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeltaThresholds {
    /// World units
    pub position: f32,
    /// Radians (~2 degrees)
    pub heading: f32,
    /// World units
    pub radius: f32,
    /// World units of any single body segment
    pub body: f32,
}

impl Default for DeltaThresholds {
    fn default() -> Self {
        Self {
            position: 2.0,
            heading: 2.0_f32.to_radians(),
            radius: 0.5,
            body: 3.0,
        }
    }
}

/// Codec configuration; empirical values, kept tunable
#[derive(Debug, Clone)]
pub struct CodecConfig {
    pub thresholds: DeltaThresholds,
    /// Body points kept per player on the wire
    pub max_body_points: usize,
    /// Delta frames larger than this fraction of the full size lose to full
    pub full_fallback_ratio: f32,
    /// Threshold multiplier while compression mode is active
    pub compression_threshold_factor: f32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            thresholds: DeltaThresholds::default(),
            max_body_points: 32,
            full_fallback_ratio: 0.7,
            compression_threshold_factor: 2.0,
        }
    }
}

/// Per-send flags derived from the adaptation settings
#[derive(Debug, Clone, Copy, Default)]
pub struct CodecTuning {
    /// Coarser absolute quantization (1/10 unit instead of 1/100)
    pub reduced_precision: bool,
    /// Raise significance thresholds and halve the body cap
    pub compression: bool,
    /// Carry position for any movement at all, so lossy links re-converge
    pub redundancy: bool,
    /// Skip the delta attempt entirely (periodic rebase)
    pub force_full: bool,
}

// ============================================================================
// Baseline
// ============================================================================

/// Last state actually sent to one viewer, unquantized.
///
/// Missing baseline is not an error: it just means the next frame is full.
#[derive(Debug, Clone)]
pub struct ViewerBaseline {
    pub snapshot: ViewSnapshot,
}

// ============================================================================
// Errors
// ============================================================================

/// Internal encode failures; callers only ever see the fallback frame
#[derive(Debug, thiserror::Error)]
enum EncodeError {
    #[error("non-finite coordinate in snapshot")]
    NonFinite,
    #[error(transparent)]
    Envelope(#[from] WireError),
}

/// Typed, connection-scoped decode failure
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame envelope: {0}")]
    Envelope(#[from] WireError),
    #[error("frame payload undecodable ({kind} frame, {len} bytes)")]
    Payload { kind: FrameKind, len: usize },
    #[error("fallback payload is not valid JSON: {0}")]
    Fallback(#[from] serde_json::Error),
}

// ============================================================================
// Quantization helpers
// ============================================================================

#[inline]
fn quantize(value: f32, scale: f32) -> i32 {
    (value * scale).round() as i32
}

#[inline]
fn dequantize(value: i32, scale: f32) -> f32 {
    value as f32 / scale
}

/// Map an angle onto one byte of resolution (TAU / 256 per step)
#[inline]
fn angle_to_byte(angle: f32) -> u8 {
    let norm = angle.rem_euclid(std::f32::consts::TAU);
    ((norm / std::f32::consts::TAU * 256.0).round() as u32 % 256) as u8
}

#[inline]
fn byte_to_angle(byte: u8) -> f32 {
    byte as f32 / 256.0 * std::f32::consts::TAU
}

#[inline]
fn radius_to_byte(radius: f32) -> u8 {
    radius.round().clamp(0.0, 255.0) as u8
}

/// Nearest palette index by squared RGB distance
pub fn color_to_palette(color: u32) -> u8 {
    let (r, g, b) = ((color >> 16) & 0xff, (color >> 8) & 0xff, color & 0xff);
    let mut best = 0u8;
    let mut best_dist = u32::MAX;
    for (i, entry) in PALETTE.iter().enumerate() {
        let (er, eg, eb) = ((entry >> 16) & 0xff, (entry >> 8) & 0xff, entry & 0xff);
        let dist = (r.abs_diff(er)).pow(2) + (g.abs_diff(eg)).pow(2) + (b.abs_diff(eb)).pow(2);
        if dist < best_dist {
            best_dist = dist;
            best = i as u8;
        }
    }
    best
}

#[inline]
pub fn palette_color(index: u8) -> u32 {
    PALETTE[index as usize % PALETTE.len()]
}

fn snapshot_is_finite(snapshot: &ViewSnapshot) -> bool {
    snapshot.players.iter().all(|p| {
        p.position.is_finite()
            && p.heading.is_finite()
            && p.radius.is_finite()
            && p.body.iter().all(|b| b.is_finite())
    }) && snapshot.foods.iter().all(|f| f.position.is_finite() && f.radius.is_finite())
        && snapshot
            .dead_points
            .iter()
            .all(|d| d.position.is_finite() && d.radius.is_finite())
}

// ============================================================================
// Decoded representation
// ============================================================================

/// Player as reconstructed by a decoder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedPlayer {
    pub id: ObjectId,
    pub name: String,
    pub position: Vec2,
    pub heading: f32,
    pub radius: f32,
    pub color_index: u8,
    pub score: u32,
    pub is_bot: bool,
    pub body: Vec<Vec2>,
}

/// Food or dead point as reconstructed by a decoder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedStatic {
    pub id: ObjectId,
    pub position: Vec2,
    pub radius: f32,
    pub color_index: u8,
}

/// Complete filtered set from a full frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedWorld {
    pub players: Vec<DecodedPlayer>,
    pub foods: Vec<DecodedStatic>,
    pub dead_points: Vec<DecodedStatic>,
}

/// One player's changed fields within a delta frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerUpdate {
    pub id: ObjectId,
    /// Offset to apply to the last known position (0.1-unit precision)
    pub position_delta: Option<Vec2>,
    /// Absolute replacement when the offset overflows the compact form
    pub position_abs: Option<Vec2>,
    pub heading: Option<f32>,
    pub radius: Option<f32>,
    pub score: Option<u32>,
    pub body: Option<Vec<Vec2>>,
}

/// Changes since the viewer's baseline
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedDelta {
    pub base_tick: u64,
    pub player_updates: Vec<PlayerUpdate>,
    pub new_players: Vec<DecodedPlayer>,
    pub removed_players: Vec<ObjectId>,
    pub added_foods: Vec<DecodedStatic>,
    pub removed_foods: Vec<ObjectId>,
    pub added_dead_points: Vec<DecodedStatic>,
    pub removed_dead_points: Vec<ObjectId>,
}

/// What a decoded frame contains
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    Full(DecodedWorld),
    Delta(DecodedDelta),
    /// Plain-text emergency frame, parsed from JSON
    Fallback(ViewSnapshot),
}

// ============================================================================
// Running statistics
// ============================================================================

/// Codec-level counters, shared across the parallel per-viewer phase
#[derive(Debug, Default)]
pub struct CodecStats {
    pub frames_full: AtomicU64,
    pub frames_delta: AtomicU64,
    pub frames_fallback: AtomicU64,
    pub deltas_skipped_empty: AtomicU64,
    /// What every send would have cost as a full frame
    pub bytes_full_equivalent: AtomicU64,
    /// What was actually produced
    pub bytes_sent: AtomicU64,
    pub encode_degraded: AtomicU64,
    pub decode_retries: AtomicU64,
}

/// Point-in-time copy for logs and the stats endpoint
#[derive(Debug, Clone, Serialize)]
pub struct CodecStatsSnapshot {
    pub frames_full: u64,
    pub frames_delta: u64,
    pub frames_fallback: u64,
    pub deltas_skipped_empty: u64,
    pub bytes_full_equivalent: u64,
    pub bytes_sent: u64,
    pub compression_ratio: f64,
    pub delta_ratio: f64,
}

impl CodecStats {
    pub fn snapshot(&self) -> CodecStatsSnapshot {
        let frames_full = self.frames_full.load(Ordering::Relaxed);
        let frames_delta = self.frames_delta.load(Ordering::Relaxed);
        let before = self.bytes_full_equivalent.load(Ordering::Relaxed);
        let after = self.bytes_sent.load(Ordering::Relaxed);
        CodecStatsSnapshot {
            frames_full,
            frames_delta,
            frames_fallback: self.frames_fallback.load(Ordering::Relaxed),
            deltas_skipped_empty: self.deltas_skipped_empty.load(Ordering::Relaxed),
            bytes_full_equivalent: before,
            bytes_sent: after,
            compression_ratio: if before > 0 {
                after as f64 / before as f64
            } else {
                1.0
            },
            delta_ratio: if frames_full + frames_delta > 0 {
                frames_delta as f64 / (frames_full + frames_delta) as f64
            } else {
                0.0
            },
        }
    }
}

// ============================================================================
// Codec
// ============================================================================

pub struct DeltaCodec {
    config: CodecConfig,
    stats: CodecStats,
}

impl DeltaCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self {
            config,
            stats: CodecStats::default(),
        }
    }

    pub fn stats(&self) -> CodecStatsSnapshot {
        self.stats.snapshot()
    }

    fn effective_thresholds(&self, tuning: CodecTuning) -> DeltaThresholds {
        let mut t = self.config.thresholds;
        if tuning.compression {
            let f = self.config.compression_threshold_factor;
            t.position *= f;
            t.heading *= f;
            t.radius *= f;
            t.body *= f;
        }
        if tuning.redundancy {
            // Any movement at all gets carried, so a viewer that lost a frame
            // converges back onto the true position
            t.position = 0.0;
        }
        t
    }

    fn body_cap(&self, tuning: CodecTuning) -> usize {
        if tuning.compression {
            (self.config.max_body_points / 2).max(1)
        } else {
            self.config.max_body_points
        }
    }

    /// Produce the next frame for one viewer, or None when nothing crossed a
    /// significance threshold (the baseline is left untouched in that case).
    ///
    /// This is the single entry point the orchestrator uses; it owns frame
    /// selection, the baseline overwrite, and the fallback path.
    pub fn encode_for_viewer(
        &self,
        baseline: &mut Option<ViewerBaseline>,
        current: &ViewSnapshot,
        timestamp_ms: u64,
        tuning: CodecTuning,
    ) -> Option<Frame> {
        match self.encode_inner(baseline.as_ref(), current, timestamp_ms, tuning) {
            Ok(Some(frame)) => {
                *baseline = Some(ViewerBaseline {
                    snapshot: current.clone(),
                });
                Some(frame)
            }
            Ok(None) => {
                self.stats.deltas_skipped_empty.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, tick = current.tick, "binary encode failed, using plain-text fallback");
                self.stats.encode_degraded.fetch_add(1, Ordering::Relaxed);
                let frame = self.fallback_frame(current, timestamp_ms);
                *baseline = Some(ViewerBaseline {
                    snapshot: current.clone(),
                });
                Some(frame)
            }
        }
    }

    fn encode_inner(
        &self,
        baseline: Option<&ViewerBaseline>,
        current: &ViewSnapshot,
        timestamp_ms: u64,
        tuning: CodecTuning,
    ) -> Result<Option<Frame>, EncodeError> {
        if !snapshot_is_finite(current) {
            return Err(EncodeError::NonFinite);
        }

        let full_payload = self.encode_full_payload(current, tuning)?;

        let base = match baseline {
            Some(b) if !tuning.force_full => &b.snapshot,
            _ => {
                let frame = Frame {
                    kind: FrameKind::Full,
                    tick: current.tick,
                    timestamp_ms,
                    payload: full_payload,
                };
                let size = frame.encode().map(|b| b.len())?;
                self.stats.frames_full.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_full_equivalent
                    .fetch_add(size as u64, Ordering::Relaxed);
                self.stats.bytes_sent.fetch_add(size as u64, Ordering::Relaxed);
                return Ok(Some(frame));
            }
        };

        let Some(delta_payload) = self.encode_delta_payload(base, current, tuning)? else {
            return Ok(None);
        };

        // Selection rule: a delta that saves less than 30% is not worth the
        // statefulness, send full and rebase
        let use_full = delta_payload.len() as f32
            > full_payload.len() as f32 * self.config.full_fallback_ratio;

        let frame = if use_full {
            Frame {
                kind: FrameKind::Full,
                tick: current.tick,
                timestamp_ms,
                payload: full_payload,
            }
        } else {
            self.stats
                .bytes_full_equivalent
                .fetch_add((full_payload.len() + 21) as u64, Ordering::Relaxed);
            Frame {
                kind: FrameKind::Delta,
                tick: current.tick,
                timestamp_ms,
                payload: delta_payload,
            }
        };

        let size = frame.encode().map(|b| b.len())?;
        match frame.kind {
            FrameKind::Full => {
                self.stats.frames_full.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_full_equivalent
                    .fetch_add(size as u64, Ordering::Relaxed);
            }
            _ => {
                self.stats.frames_delta.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.stats.bytes_sent.fetch_add(size as u64, Ordering::Relaxed);
        Ok(Some(frame))
    }

    /// Plain-text escape hatch: JSON of the sanitized payload, size cap
    /// waived. Never fails.
    fn fallback_frame(&self, current: &ViewSnapshot, timestamp_ms: u64) -> Frame {
        let mut sanitized = current.clone();
        for p in &mut sanitized.players {
            if !p.position.is_finite() {
                p.position = Vec2::ZERO;
            }
            if !p.heading.is_finite() {
                p.heading = 0.0;
            }
            if !p.radius.is_finite() {
                p.radius = 1.0;
            }
            p.body.retain(|b| b.is_finite());
        }
        sanitized.foods.retain(|f| f.position.is_finite());
        sanitized.dead_points.retain(|d| d.position.is_finite());

        let payload = serde_json::to_vec(&sanitized).unwrap_or_else(|_| b"{}".to_vec());
        self.stats.frames_fallback.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_sent
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        Frame {
            kind: FrameKind::Fallback,
            tick: current.tick,
            timestamp_ms,
            payload,
        }
    }

    // ------------------------------------------------------------------
    // Full encoding
    // ------------------------------------------------------------------

    fn position_scale(&self, tuning: CodecTuning) -> f32 {
        if tuning.reduced_precision {
            POSITION_SCALE_REDUCED
        } else {
            POSITION_SCALE
        }
    }

    fn payload_flags(tuning: CodecTuning) -> u8 {
        let mut flags = 0u8;
        if tuning.reduced_precision {
            flags |= 0x01;
        }
        flags
    }

    fn encode_full_payload(
        &self,
        snapshot: &ViewSnapshot,
        tuning: CodecTuning,
    ) -> Result<Vec<u8>, WireError> {
        let scale = self.position_scale(tuning);
        let body_cap = self.body_cap(tuning);
        let mut w = WireWriter::with_capacity(64 + snapshot.object_count() * 24);

        w.write_u8(Self::payload_flags(tuning));

        w.write_list_header(snapshot.players.len())?;
        for player in &snapshot.players {
            write_player_record(&mut w, player, scale, body_cap);
        }
        w.write_list_header(snapshot.foods.len())?;
        for food in &snapshot.foods {
            write_static_record(&mut w, food.id, food.position, food.radius, food.color, scale);
        }
        w.write_list_header(snapshot.dead_points.len())?;
        for dp in &snapshot.dead_points {
            write_static_record(&mut w, dp.id, dp.position, dp.radius, dp.color, scale);
        }
        Ok(w.into_bytes())
    }

    // ------------------------------------------------------------------
    // Delta encoding
    // ------------------------------------------------------------------

    fn encode_delta_payload(
        &self,
        base: &ViewSnapshot,
        current: &ViewSnapshot,
        tuning: CodecTuning,
    ) -> Result<Option<Vec<u8>>, WireError> {
        let thresholds = self.effective_thresholds(tuning);
        let scale = self.position_scale(tuning);
        let body_cap = self.body_cap(tuning);

        let base_players: HashMap<ObjectId, &PlayerObject> =
            base.players.iter().map(|p| (p.id, p)).collect();
        let current_player_ids: HashSet<ObjectId> =
            current.players.iter().map(|p| p.id).collect();

        let mut updates: Vec<(ObjectId, u8, Vec<u8>)> = Vec::new();
        let mut new_players: Vec<&PlayerObject> = Vec::new();

        for player in &current.players {
            match base_players.get(&player.id) {
                Some(base_player) => {
                    if let Some(update) =
                        encode_player_update(base_player, player, &thresholds, scale, body_cap)
                    {
                        updates.push(update);
                    }
                }
                None => new_players.push(player),
            }
        }

        let removed_players: Vec<ObjectId> = base
            .players
            .iter()
            .map(|p| p.id)
            .filter(|id| !current_player_ids.contains(id))
            .collect();

        let (added_foods, removed_foods) =
            diff_statics(base.foods.iter(), current.foods.iter());
        let (added_deads, removed_deads) =
            diff_statics(base.dead_points.iter(), current.dead_points.iter());

        if updates.is_empty()
            && new_players.is_empty()
            && removed_players.is_empty()
            && added_foods.is_empty()
            && removed_foods.is_empty()
            && added_deads.is_empty()
            && removed_deads.is_empty()
        {
            return Ok(None);
        }

        let mut w = WireWriter::with_capacity(64 + updates.len() * 16);
        w.write_u8(Self::payload_flags(tuning));
        w.write_u64(base.tick);

        w.write_list_header(updates.len())?;
        for (id, mask, fields) in &updates {
            w.write_u64(*id);
            w.write_u8(*mask);
            w.write_bytes(fields);
        }

        w.write_list_header(new_players.len())?;
        for player in &new_players {
            write_player_record(&mut w, player, scale, body_cap);
        }

        write_id_list(&mut w, &removed_players)?;

        w.write_list_header(added_foods.len())?;
        for food in &added_foods {
            write_static_record(&mut w, food.id, food.position, food.radius, food.color, scale);
        }
        write_id_list(&mut w, &removed_foods)?;

        w.write_list_header(added_deads.len())?;
        for dp in &added_deads {
            write_static_record(&mut w, dp.id, dp.position, dp.radius, dp.color, scale);
        }
        write_id_list(&mut w, &removed_deads)?;

        Ok(Some(w.into_bytes()))
    }

    // ------------------------------------------------------------------
    // Decoding
    // ------------------------------------------------------------------

    /// Decode a received frame. Strict first; on failure one permissive retry
    /// that salvages the parseable prefix; then a typed error. Never panics,
    /// and a bad frame leaves no state behind.
    pub fn decode_frame(&self, data: &[u8]) -> Result<DecodedFrame, CodecError> {
        let frame = Frame::decode(data)?;
        match frame.kind {
            FrameKind::Full => match decode_full_payload(&frame.payload, true) {
                Some(world) => Ok(DecodedFrame::Full(world)),
                None => {
                    self.stats.decode_retries.fetch_add(1, Ordering::Relaxed);
                    decode_full_payload(&frame.payload, false)
                        .map(DecodedFrame::Full)
                        .ok_or(CodecError::Payload {
                            kind: FrameKind::Full,
                            len: frame.payload.len(),
                        })
                }
            },
            FrameKind::Delta => match decode_delta_payload(&frame.payload, true) {
                Some(delta) => Ok(DecodedFrame::Delta(delta)),
                None => {
                    self.stats.decode_retries.fetch_add(1, Ordering::Relaxed);
                    decode_delta_payload(&frame.payload, false)
                        .map(DecodedFrame::Delta)
                        .ok_or(CodecError::Payload {
                            kind: FrameKind::Delta,
                            len: frame.payload.len(),
                        })
                }
            },
            FrameKind::Fallback => {
                let snapshot: ViewSnapshot = serde_json::from_slice(&frame.payload)?;
                Ok(DecodedFrame::Fallback(snapshot))
            }
        }
    }
}

impl Default for DeltaCodec {
    fn default() -> Self {
        Self::new(CodecConfig::default())
    }
}

// ============================================================================
// Record-level encode helpers
// ============================================================================

const MASK_POS_REL: u8 = 0x01;
const MASK_POS_ABS: u8 = 0x02;
const MASK_HEADING: u8 = 0x04;
const MASK_RADIUS: u8 = 0x08;
const MASK_BODY: u8 = 0x10;
const MASK_SCORE: u8 = 0x20;

fn write_player_record(w: &mut WireWriter, player: &PlayerObject, scale: f32, body_cap: usize) {
    w.write_u64(player.id);
    w.write_str(&player.name);
    w.write_i32(quantize(player.position.x, scale));
    w.write_i32(quantize(player.position.y, scale));
    w.write_u8(angle_to_byte(player.heading));
    w.write_u8(radius_to_byte(player.radius));
    w.write_u8(color_to_palette(player.color));
    w.write_u32(player.score);
    w.write_u8(player.is_bot as u8);
    let count = player.body.len().min(body_cap);
    w.write_u8(count as u8);
    for point in player.body.iter().take(count) {
        w.write_i32(quantize(point.x, scale));
        w.write_i32(quantize(point.y, scale));
    }
}

fn write_static_record(
    w: &mut WireWriter,
    id: ObjectId,
    position: Vec2,
    radius: f32,
    color: u32,
    scale: f32,
) {
    w.write_u64(id);
    w.write_i32(quantize(position.x, scale));
    w.write_i32(quantize(position.y, scale));
    w.write_u8(radius_to_byte(radius));
    w.write_u8(color_to_palette(color));
}

fn write_id_list(w: &mut WireWriter, ids: &[ObjectId]) -> Result<(), WireError> {
    w.write_list_header(ids.len())?;
    for id in ids {
        w.write_u64(*id);
    }
    Ok(())
}

/// Field-level comparison against the baseline. Returns the (id, mask, bytes)
/// triple for changed players, None when nothing crossed a threshold.
fn encode_player_update(
    base: &PlayerObject,
    current: &PlayerObject,
    thresholds: &DeltaThresholds,
    scale: f32,
    body_cap: usize,
) -> Option<(ObjectId, u8, Vec<u8>)> {
    let mut mask = 0u8;
    let mut w = WireWriter::with_capacity(24);

    let moved = current.position.distance_to(base.position);
    if moved > thresholds.position {
        let offset = current.position - base.position;
        if offset.x.abs() < MAX_RELATIVE_OFFSET && offset.y.abs() < MAX_RELATIVE_OFFSET {
            mask |= MASK_POS_REL;
            w.write_i16(quantize(offset.x, DELTA_SCALE) as i16);
            w.write_i16(quantize(offset.y, DELTA_SCALE) as i16);
        } else {
            mask |= MASK_POS_ABS;
            w.write_i32(quantize(current.position.x, scale));
            w.write_i32(quantize(current.position.y, scale));
        }
    }

    let turn = (current.heading - base.heading).rem_euclid(std::f32::consts::TAU);
    let turn = turn.min(std::f32::consts::TAU - turn);
    if turn > thresholds.heading {
        mask |= MASK_HEADING;
        w.write_u8(angle_to_byte(current.heading));
    }

    if (current.radius - base.radius).abs() > thresholds.radius {
        mask |= MASK_RADIUS;
        w.write_u8(radius_to_byte(current.radius));
    }

    if body_changed(&base.body, &current.body, thresholds.body) {
        mask |= MASK_BODY;
        let count = current.body.len().min(body_cap);
        w.write_u8(count as u8);
        for point in current.body.iter().take(count) {
            w.write_i32(quantize(point.x, scale));
            w.write_i32(quantize(point.y, scale));
        }
    }

    if current.score != base.score {
        mask |= MASK_SCORE;
        w.write_u32(current.score);
    }

    if mask == 0 {
        None
    } else {
        Some((current.id, mask, w.into_bytes()))
    }
}

fn body_changed(base: &[Vec2], current: &[Vec2], threshold: f32) -> bool {
    if base.len() != current.len() {
        return true;
    }
    base.iter()
        .zip(current.iter())
        .any(|(a, b)| a.distance_to(*b) > threshold)
}

/// Added records and removed ids between two static-object lists
fn diff_statics<'a, T, I>(base: I, current: I) -> (Vec<&'a T>, Vec<ObjectId>)
where
    T: HasIdAndPlace + 'a,
    I: Iterator<Item = &'a T>,
{
    let base_items: Vec<&T> = base.collect();
    let base_ids: HashSet<ObjectId> = base_items.iter().map(|x| x.object_id()).collect();
    let current_items: Vec<&T> = current.collect();
    let current_ids: HashSet<ObjectId> = current_items.iter().map(|x| x.object_id()).collect();

    let added = current_items
        .into_iter()
        .filter(|x| !base_ids.contains(&x.object_id()))
        .collect();
    let removed = base_ids.difference(&current_ids).copied().collect();
    (added, removed)
}

/// Internal trait so food and dead points share one diff implementation
trait HasIdAndPlace {
    fn object_id(&self) -> ObjectId;
}

impl HasIdAndPlace for FoodObject {
    fn object_id(&self) -> ObjectId {
        self.id
    }
}

impl HasIdAndPlace for DeadPointObject {
    fn object_id(&self) -> ObjectId {
        self.id
    }
}

// ============================================================================
// Record-level decode helpers
// ============================================================================

fn scale_from_flags(flags: u8) -> f32 {
    if flags & 0x01 != 0 {
        POSITION_SCALE_REDUCED
    } else {
        POSITION_SCALE
    }
}

fn read_player_record(r: &mut WireReader, scale: f32) -> Option<DecodedPlayer> {
    let id = r.read_u64()?;
    let name = r.read_str()?;
    let x = r.read_i32()?;
    let y = r.read_i32()?;
    let heading = byte_to_angle(r.read_u8()?);
    let radius = r.read_u8()? as f32;
    let color_index = r.read_u8()?;
    let score = r.read_u32()?;
    let is_bot = r.read_u8()? != 0;
    let body_count = r.read_u8()? as usize;
    let mut body = Vec::with_capacity(body_count);
    for _ in 0..body_count {
        let bx = r.read_i32()?;
        let by = r.read_i32()?;
        body.push(Vec2::new(dequantize(bx, scale), dequantize(by, scale)));
    }
    Some(DecodedPlayer {
        id,
        name,
        position: Vec2::new(dequantize(x, scale), dequantize(y, scale)),
        heading,
        radius,
        color_index,
        score,
        is_bot,
        body,
    })
}

fn read_static_record(r: &mut WireReader, scale: f32) -> Option<DecodedStatic> {
    let id = r.read_u64()?;
    let x = r.read_i32()?;
    let y = r.read_i32()?;
    let radius = r.read_u8()? as f32;
    let color_index = r.read_u8()?;
    Some(DecodedStatic {
        id,
        position: Vec2::new(dequantize(x, scale), dequantize(y, scale)),
        radius,
        color_index,
    })
}

/// Strict mode requires every advertised element to parse; permissive mode
/// keeps whatever prefix parsed, as long as at least the header did.
fn decode_full_payload(payload: &[u8], strict: bool) -> Option<DecodedWorld> {
    let mut r = WireReader::new(payload);
    let flags = r.read_u8()?;
    let scale = scale_from_flags(flags);
    let mut world = DecodedWorld::default();

    let player_count = r.read_list_header()?;
    for _ in 0..player_count {
        match read_player_record(&mut r, scale) {
            Some(p) => world.players.push(p),
            None if strict => return None,
            None => return Some(world),
        }
    }
    let food_count = match r.read_list_header() {
        Some(c) => c,
        None if strict => return None,
        None => return Some(world),
    };
    for _ in 0..food_count {
        match read_static_record(&mut r, scale) {
            Some(f) => world.foods.push(f),
            None if strict => return None,
            None => return Some(world),
        }
    }
    let dead_count = match r.read_list_header() {
        Some(c) => c,
        None if strict => return None,
        None => return Some(world),
    };
    for _ in 0..dead_count {
        match read_static_record(&mut r, scale) {
            Some(d) => world.dead_points.push(d),
            None if strict => return None,
            None => return Some(world),
        }
    }
    if strict && r.has_remaining() {
        return None;
    }
    Some(world)
}

fn read_player_update(r: &mut WireReader, scale: f32) -> Option<PlayerUpdate> {
    let id = r.read_u64()?;
    let mask = r.read_u8()?;
    let mut update = PlayerUpdate {
        id,
        ..Default::default()
    };
    if mask & MASK_POS_REL != 0 {
        let dx = r.read_i16()?;
        let dy = r.read_i16()?;
        update.position_delta = Some(Vec2::new(
            dequantize(dx as i32, DELTA_SCALE),
            dequantize(dy as i32, DELTA_SCALE),
        ));
    }
    if mask & MASK_POS_ABS != 0 {
        let x = r.read_i32()?;
        let y = r.read_i32()?;
        update.position_abs = Some(Vec2::new(dequantize(x, scale), dequantize(y, scale)));
    }
    if mask & MASK_HEADING != 0 {
        update.heading = Some(byte_to_angle(r.read_u8()?));
    }
    if mask & MASK_RADIUS != 0 {
        update.radius = Some(r.read_u8()? as f32);
    }
    if mask & MASK_BODY != 0 {
        let count = r.read_u8()? as usize;
        let mut body = Vec::with_capacity(count);
        for _ in 0..count {
            let x = r.read_i32()?;
            let y = r.read_i32()?;
            body.push(Vec2::new(dequantize(x, scale), dequantize(y, scale)));
        }
        update.body = Some(body);
    }
    if mask & MASK_SCORE != 0 {
        update.score = Some(r.read_u32()?);
    }
    Some(update)
}

fn decode_delta_payload(payload: &[u8], strict: bool) -> Option<DecodedDelta> {
    let mut r = WireReader::new(payload);
    let flags = r.read_u8()?;
    let scale = scale_from_flags(flags);
    let mut delta = DecodedDelta {
        base_tick: r.read_u64()?,
        ..Default::default()
    };

    macro_rules! read_list {
        ($target:expr, $reader:expr) => {{
            let count = match r.read_list_header() {
                Some(c) => c,
                None if strict => return None,
                None => return Some(delta),
            };
            for _ in 0..count {
                match $reader {
                    Some(item) => $target.push(item),
                    None if strict => return None,
                    None => return Some(delta),
                }
            }
        }};
    }

    read_list!(delta.player_updates, read_player_update(&mut r, scale));
    read_list!(delta.new_players, read_player_record(&mut r, scale));
    read_list!(delta.removed_players, r.read_u64());
    read_list!(delta.added_foods, read_static_record(&mut r, scale));
    read_list!(delta.removed_foods, r.read_u64());
    read_list!(delta.added_dead_points, read_static_record(&mut r, scale));
    read_list!(delta.removed_dead_points, r.read_u64());

    if strict && r.has_remaining() {
        return None;
    }
    Some(delta)
}
