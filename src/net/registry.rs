//! Per-viewer state registry
//!
//! One record per connected viewer holds everything the pipeline keeps for
//! them: cached viewport, codec baseline, connection metrics, activity
//! window, rate limiters, and the outbound send handle. Records are created
//! on connect and removed on disconnect or by the stale sweep; nothing
//! per-viewer outlives its record.

use hashbrown::HashMap;
use rayon::prelude::*;
use smallvec::SmallVec;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::net::cadence::ActivityTracker;
use crate::net::codec::ViewerBaseline;
use crate::net::monitor::{ConnectionMetrics, MonitorConfig};
use crate::net::protocol::{ServerMessage, ViewerId};
use crate::net::rate_limit::{RateLimitConfig, RateLimiter};
use crate::world::object::{ObjectId, Viewport};

/// Outstanding ping probes kept per viewer
const MAX_PENDING_PINGS: usize = 8;

/// Default idle time before a viewer is reaped (ms)
pub const DEFAULT_STALE_TIMEOUT_MS: u64 = 30_000;

// ============================================================================
// Outbound messages
// ============================================================================

/// What the pipeline hands to a viewer's writer task
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Control-plane message, serialized by the transport
    Control(ServerMessage),
    /// Pre-encoded world frame bytes
    Data(Vec<u8>),
}

// ============================================================================
// Viewer record
// ============================================================================

/// All per-viewer pipeline state, exclusively owned through the registry
#[derive(Debug)]
pub struct ViewerRecord {
    pub id: ViewerId,
    pub name: String,
    /// Last reported viewport; None until the first update arrives
    pub viewport: Option<Viewport>,
    /// World object this viewer follows, when they control one
    pub avatar: Option<ObjectId>,
    /// Codec reference state; None means the next frame is full
    pub baseline: Option<ViewerBaseline>,
    pub metrics: ConnectionMetrics,
    pub activity: ActivityTracker,
    /// Budget for outbound send attempts
    pub limiter: RateLimiter,
    /// Budget for inbound client messages; persistent offenders get kicked
    pub message_limiter: RateLimiter,
    pub vip: bool,
    pub connected_at_ms: u64,
    pub last_seen_ms: u64,
    pub last_sent_ms: Option<u64>,
    /// Delta frames since the last full, drives periodic rebase under
    /// error recovery
    pub sends_since_full: u32,
    pub frames_sent: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
    channel_closed: bool,
    pending_pings: SmallVec<[(u32, u64); MAX_PENDING_PINGS]>,
}

impl ViewerRecord {
    fn new(
        id: ViewerId,
        name: String,
        outbound: mpsc::UnboundedSender<Outbound>,
        monitor_config: MonitorConfig,
        limit_config: RateLimitConfig,
        now_ms: u64,
    ) -> Self {
        Self {
            id,
            name,
            viewport: None,
            avatar: None,
            baseline: None,
            metrics: ConnectionMetrics::new(monitor_config),
            activity: ActivityTracker::new(),
            limiter: RateLimiter::new(limit_config.clone()),
            message_limiter: RateLimiter::new(limit_config),
            vip: false,
            connected_at_ms: now_ms,
            last_seen_ms: now_ms,
            last_sent_ms: None,
            sends_since_full: 0,
            frames_sent: 0,
            outbound,
            channel_closed: false,
            pending_pings: SmallVec::new(),
        }
    }

    /// Mark inbound activity from this viewer
    pub fn touch(&mut self, now_ms: u64) {
        self.last_seen_ms = now_ms;
    }

    pub fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_seen_ms)
    }

    /// Stale viewers are reaped by the maintenance sweep. A closed outbound
    /// channel is stale immediately: the writer task is gone.
    pub fn is_stale(&self, timeout_ms: u64, now_ms: u64) -> bool {
        self.channel_closed || self.idle_ms(now_ms) > timeout_ms
    }

    pub fn send_control(&mut self, message: ServerMessage) -> bool {
        let ok = self.outbound.send(Outbound::Control(message)).is_ok();
        if !ok {
            self.channel_closed = true;
        }
        ok
    }

    pub fn send_frame(&mut self, bytes: Vec<u8>) -> bool {
        let ok = self.outbound.send(Outbound::Data(bytes)).is_ok();
        if !ok {
            self.channel_closed = true;
        }
        ok
    }

    /// Record a completed send for cadence and rebase tracking
    pub fn note_sent(&mut self, now_ms: u64, full: bool) {
        self.last_sent_ms = Some(now_ms);
        self.frames_sent += 1;
        if full {
            self.sends_since_full = 0;
        } else {
            self.sends_since_full += 1;
        }
    }

    /// Track an outgoing ping probe. The oldest probe is evicted once the
    /// window is saturated.
    pub fn note_ping(&mut self, nonce: u32, now_ms: u64) {
        if self.pending_pings.len() >= MAX_PENDING_PINGS {
            self.pending_pings.remove(0);
        }
        self.pending_pings.push((nonce, now_ms));
    }

    /// Match a pong against its outstanding probe and feed the RTT into the
    /// connection metrics. Returns the measured RTT, or None for an unknown
    /// or already-expired nonce.
    pub fn record_pong(&mut self, nonce: u32, now_ms: u64, aggressive: bool) -> Option<f32> {
        let idx = self.pending_pings.iter().position(|(n, _)| *n == nonce)?;
        let (_, sent_at) = self.pending_pings.remove(idx);
        let rtt_ms = now_ms.saturating_sub(sent_at) as f32;
        self.metrics.record_rtt(rtt_ms, now_ms, aggressive);
        Some(rtt_ms)
    }

    /// Expire unanswered probes, each counting as a timeout
    pub fn expire_pings(&mut self, timeout_ms: u64, now_ms: u64) -> usize {
        let mut expired = 0;
        self.pending_pings.retain(|(_, sent_at)| {
            let keep = now_ms.saturating_sub(*sent_at) < timeout_ms;
            if !keep {
                expired += 1;
            }
            keep
        });
        for _ in 0..expired {
            self.metrics.record_timeout();
        }
        expired
    }

    pub fn pending_ping_count(&self) -> usize {
        self.pending_pings.len()
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("viewer capacity reached ({0})")]
    Full(usize),
}

/// Owner of every viewer record. The orchestrator is the only writer.
pub struct ViewerRegistry {
    viewers: HashMap<ViewerId, ViewerRecord>,
    max_viewers: usize,
    stale_timeout_ms: u64,
    monitor_config: MonitorConfig,
    limit_config: RateLimitConfig,
}

impl ViewerRegistry {
    pub fn new(
        max_viewers: usize,
        monitor_config: MonitorConfig,
        limit_config: RateLimitConfig,
    ) -> Self {
        Self {
            viewers: HashMap::with_capacity(max_viewers.min(1024)),
            max_viewers,
            stale_timeout_ms: DEFAULT_STALE_TIMEOUT_MS,
            monitor_config,
            limit_config,
        }
    }

    pub fn with_stale_timeout(mut self, timeout_ms: u64) -> Self {
        self.stale_timeout_ms = timeout_ms;
        self
    }

    /// Admit a viewer and create their record.
    ///
    /// At capacity the stale sweep runs first; only if that frees nothing is
    /// the connect refused.
    pub fn connect(
        &mut self,
        name: String,
        outbound: mpsc::UnboundedSender<Outbound>,
        now_ms: u64,
    ) -> Result<ViewerId, RegistryError> {
        if self.viewers.len() >= self.max_viewers {
            self.sweep_stale(now_ms);
            if self.viewers.len() >= self.max_viewers {
                return Err(RegistryError::Full(self.max_viewers));
            }
        }

        let id = Uuid::new_v4();
        let record = ViewerRecord::new(
            id,
            name,
            outbound,
            self.monitor_config.clone(),
            self.limit_config.clone(),
            now_ms,
        );
        self.viewers.insert(id, record);
        Ok(id)
    }

    pub fn disconnect(&mut self, id: &ViewerId) -> Option<ViewerRecord> {
        self.viewers.remove(id)
    }

    pub fn get(&self, id: &ViewerId) -> Option<&ViewerRecord> {
        self.viewers.get(id)
    }

    pub fn get_mut(&mut self, id: &ViewerId) -> Option<&mut ViewerRecord> {
        self.viewers.get_mut(id)
    }

    pub fn contains(&self, id: &ViewerId) -> bool {
        self.viewers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.viewers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.viewers.is_empty()
    }

    pub fn ids(&self) -> Vec<ViewerId> {
        self.viewers.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ViewerId, &ViewerRecord)> {
        self.viewers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ViewerId, &mut ViewerRecord)> {
        self.viewers.iter_mut()
    }

    /// Parallel mutable pass over every record; the per-viewer fan-out phase
    /// runs here. Each record is touched by exactly one worker.
    pub fn par_for_each_mut<F>(&mut self, f: F)
    where
        F: Fn(&mut ViewerRecord) + Send + Sync,
    {
        self.viewers.par_values_mut().for_each(f);
    }

    /// Remove every stale record and return the reaped ids so callers can
    /// purge their own per-viewer structures.
    pub fn sweep_stale(&mut self, now_ms: u64) -> Vec<ViewerId> {
        let timeout = self.stale_timeout_ms;
        let reaped: Vec<ViewerId> = self
            .viewers
            .iter()
            .filter(|(_, record)| record.is_stale(timeout, now_ms))
            .map(|(id, _)| *id)
            .collect();
        for id in &reaped {
            self.viewers.remove(id);
        }
        reaped
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(max: usize) -> ViewerRegistry {
        ViewerRegistry::new(max, MonitorConfig::default(), RateLimitConfig::default())
    }

    fn channel() -> (
        mpsc::UnboundedSender<Outbound>,
        mpsc::UnboundedReceiver<Outbound>,
    ) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_connect_and_capacity() {
        let mut reg = registry(2);
        let (tx, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let (tx3, _rx3) = channel();

        let a = reg.connect("alice".into(), tx, 1000).unwrap();
        let b = reg.connect("bob".into(), tx2, 1000).unwrap();
        assert_ne!(a, b);
        assert_eq!(reg.len(), 2);

        let refused = reg.connect("carol".into(), tx3, 1000);
        assert_eq!(refused, Err(RegistryError::Full(2)));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_connect_reclaims_stale_slot() {
        let mut reg = registry(1);
        let (tx, _rx1) = channel();
        let (tx2, _rx2) = channel();

        let old = reg.connect("alice".into(), tx, 0).unwrap();

        // Past the stale timeout, the dead record makes room
        let fresh = reg
            .connect("bob".into(), tx2, DEFAULT_STALE_TIMEOUT_MS + 1000)
            .unwrap();
        assert_eq!(reg.len(), 1);
        assert!(!reg.contains(&old));
        assert!(reg.contains(&fresh));
    }

    #[test]
    fn test_disconnect_removes_record() {
        let mut reg = registry(8);
        let (tx, _rx) = channel();
        let id = reg.connect("alice".into(), tx, 1000).unwrap();

        let removed = reg.disconnect(&id);
        assert!(removed.is_some());
        assert_eq!(removed.map(|r| r.name), Some("alice".to_string()));
        assert!(reg.get(&id).is_none());
        assert!(reg.disconnect(&id).is_none());
    }

    #[test]
    fn test_sweep_spares_touched_viewers() {
        let mut reg = registry(8);
        let (tx, _rx1) = channel();
        let (tx2, _rx2) = channel();

        let active = reg.connect("active".into(), tx, 0).unwrap();
        let idle = reg.connect("idle".into(), tx2, 0).unwrap();

        if let Some(record) = reg.get_mut(&active) {
            record.touch(25_000);
        }

        let reaped = reg.sweep_stale(35_000);
        assert_eq!(reaped, vec![idle]);
        assert!(reg.contains(&active));
        assert!(!reg.contains(&idle));
    }

    #[test]
    fn test_send_paths_and_closed_channel() {
        let mut reg = registry(8);
        let (tx, mut rx) = channel();
        let id = reg.connect("alice".into(), tx, 1000).unwrap();

        let record = reg.get_mut(&id).unwrap();
        assert!(record.send_control(ServerMessage::Kicked {
            reason: "bye".into()
        }));
        assert!(record.send_frame(vec![1, 2, 3]));

        match rx.try_recv().unwrap() {
            Outbound::Control(ServerMessage::Kicked { reason }) => assert_eq!(reason, "bye"),
            other => panic!("expected control message, got {:?}", other),
        }
        match rx.try_recv().unwrap() {
            Outbound::Data(bytes) => assert_eq!(bytes, vec![1, 2, 3]),
            other => panic!("expected data frame, got {:?}", other),
        }

        // Writer task gone: sends fail and the record turns stale at once
        drop(rx);
        assert!(!record.send_frame(vec![4]));
        assert!(record.is_stale(DEFAULT_STALE_TIMEOUT_MS, 1001));

        let reaped = reg.sweep_stale(1001);
        assert_eq!(reaped, vec![id]);
    }

    #[test]
    fn test_ping_roundtrip_feeds_metrics() {
        let mut reg = registry(8);
        let (tx, _rx) = channel();
        let id = reg.connect("alice".into(), tx, 1000).unwrap();
        let record = reg.get_mut(&id).unwrap();

        record.note_ping(7, 1000);
        assert_eq!(record.pending_ping_count(), 1);

        let rtt = record.record_pong(7, 1045, false);
        assert_eq!(rtt, Some(45.0));
        assert_eq!(record.pending_ping_count(), 0);
        assert_eq!(record.metrics.smoothed_rtt(), Some(45.0));

        // Unknown nonce is ignored
        assert_eq!(record.record_pong(99, 1050, false), None);
    }

    #[test]
    fn test_ping_expiry_counts_timeouts() {
        let mut reg = registry(8);
        let (tx, _rx) = channel();
        let id = reg.connect("alice".into(), tx, 0).unwrap();
        let record = reg.get_mut(&id).unwrap();

        record.note_ping(1, 0);
        record.note_ping(2, 10);
        record.note_ping(3, 20);

        let expired = record.expire_pings(2000, 5000);
        assert_eq!(expired, 3);
        assert_eq!(record.pending_ping_count(), 0);
        // Three consecutive losses mark the connection unstable
        assert!(record.metrics.is_unstable());
        assert!(record.metrics.loss_rate() > 0.99);
    }

    #[test]
    fn test_pending_ping_window_is_bounded() {
        let mut reg = registry(8);
        let (tx, _rx) = channel();
        let id = reg.connect("alice".into(), tx, 0).unwrap();
        let record = reg.get_mut(&id).unwrap();

        for nonce in 0..10u32 {
            record.note_ping(nonce, nonce as u64 * 10);
        }
        assert_eq!(record.pending_ping_count(), MAX_PENDING_PINGS);

        // Oldest probes were evicted, newest still answerable
        assert_eq!(record.record_pong(0, 200, false), None);
        assert_eq!(record.record_pong(1, 200, false), None);
        assert!(record.record_pong(9, 200, false).is_some());
    }

    #[test]
    fn test_note_sent_tracks_rebase_distance() {
        let mut reg = registry(8);
        let (tx, _rx) = channel();
        let id = reg.connect("alice".into(), tx, 0).unwrap();
        let record = reg.get_mut(&id).unwrap();

        record.note_sent(100, true);
        assert_eq!(record.sends_since_full, 0);
        assert_eq!(record.last_sent_ms, Some(100));

        record.note_sent(150, false);
        record.note_sent(200, false);
        record.note_sent(250, false);
        assert_eq!(record.sends_since_full, 3);
        assert_eq!(record.frames_sent, 4);

        record.note_sent(300, true);
        assert_eq!(record.sends_since_full, 0);
    }

    #[test]
    fn test_parallel_pass_reaches_every_record() {
        let mut reg = registry(8);
        let mut rxs = Vec::new();
        for i in 0..4 {
            let (tx, rx) = channel();
            reg.connect(format!("viewer{}", i), tx, 0).unwrap();
            rxs.push(rx);
        }

        reg.par_for_each_mut(|record| {
            record.vip = true;
        });
        assert!(reg.iter().all(|(_, r)| r.vip));
    }
}
