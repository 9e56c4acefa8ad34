//! Per-viewer send cadence
//!
//! Every viewer gets an individual send interval: the global base pace scaled
//! by four multipliers (activity, link quality, server load, priority) and
//! clamped to a sane band. The result is cached per viewer per wall-clock
//! second so the multiplier math runs at most once a second per viewer.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::net::monitor::LinkQuality;
use crate::net::protocol::ViewerId;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceConfig {
    /// Fastest allowed per-viewer interval (ms)
    pub min_interval_ms: u64,
    /// Slowest allowed per-viewer interval (ms)
    pub max_interval_ms: u64,
    /// Rolling window for activity scoring (ms)
    pub activity_window_ms: u64,
    /// Activity score ceiling
    pub activity_cap: f32,
    /// Score contribution of one viewport move
    pub viewport_move_weight: f32,
    /// Score contribution of one control message
    pub message_weight: f32,
    /// Score per world unit of avatar travel
    pub motion_distance_weight: f32,
    /// Score contribution of one avatar score change
    pub score_delta_weight: f32,
    /// Score per candidate object in the viewer's surroundings
    pub proximity_weight: f32,
    /// Activity band edges (score)
    pub idle_below: f32,
    pub low_below: f32,
    pub medium_below: f32,
    pub high_below: f32,
    /// Capacity used for the load estimate
    pub max_viewers: usize,
    pub max_objects: usize,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 33,
            max_interval_ms: 1_000,
            activity_window_ms: 60_000,
            activity_cap: 100.0,
            viewport_move_weight: 2.0,
            message_weight: 1.0,
            motion_distance_weight: 0.01,
            score_delta_weight: 3.0,
            proximity_weight: 0.25,
            idle_below: 5.0,
            low_below: 20.0,
            medium_below: 50.0,
            high_below: 80.0,
            max_viewers: 500,
            max_objects: 10_000,
        }
    }
}

// ============================================================================
// Classification enums
// ============================================================================

/// How busy a viewer has been recently
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ActivityLevel {
    Idle,
    Low,
    Medium,
    High,
    Critical,
}

impl ActivityLevel {
    fn from_score(score: f32, config: &CadenceConfig) -> Self {
        if score < config.idle_below {
            ActivityLevel::Idle
        } else if score < config.low_below {
            ActivityLevel::Low
        } else if score < config.medium_below {
            ActivityLevel::Medium
        } else if score < config.high_below {
            ActivityLevel::High
        } else {
            ActivityLevel::Critical
        }
    }

    /// Interval multiplier; busy viewers get tighter cadence
    pub fn interval_multiplier(&self) -> f32 {
        match self {
            ActivityLevel::Idle => 2.5,
            ActivityLevel::Low => 1.5,
            ActivityLevel::Medium => 1.0,
            ActivityLevel::High => 0.75,
            ActivityLevel::Critical => 0.5,
        }
    }

    pub fn is_engaged(&self) -> bool {
        matches!(self, ActivityLevel::High | ActivityLevel::Critical)
    }
}

/// Interval multiplier from link quality; unknown links count as clean
pub fn quality_multiplier(quality: Option<LinkQuality>) -> f32 {
    match quality {
        Some(LinkQuality::Excellent) | None => 1.0,
        Some(LinkQuality::Good) => 1.0,
        Some(LinkQuality::Fair) => 1.3,
        Some(LinkQuality::Poor) => 1.8,
    }
}

/// Aggregate server pressure from population counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServerLoad {
    Low,
    Medium,
    High,
    Critical,
}

impl ServerLoad {
    pub fn classify(viewer_count: usize, object_count: usize, config: &CadenceConfig) -> Self {
        let viewer_util = viewer_count as f32 / config.max_viewers.max(1) as f32;
        let object_util = object_count as f32 / config.max_objects.max(1) as f32;
        let utilization = viewer_util.max(object_util);

        if utilization < 0.5 {
            ServerLoad::Low
        } else if utilization < 0.75 {
            ServerLoad::Medium
        } else if utilization < 0.9 {
            ServerLoad::High
        } else {
            ServerLoad::Critical
        }
    }

    pub fn interval_multiplier(&self) -> f32 {
        match self {
            ServerLoad::Low => 1.0,
            ServerLoad::Medium => 1.15,
            ServerLoad::High => 1.5,
            ServerLoad::Critical => 2.0,
        }
    }

    pub fn is_elevated(&self) -> bool {
        matches!(self, ServerLoad::High | ServerLoad::Critical)
    }
}

/// Scheduling class of one viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewerPriority {
    Vip,
    Active,
    Normal,
    Background,
}

impl ViewerPriority {
    /// VIP beats everything; score leaders and engaged viewers rank Active
    pub fn classify(vip: bool, top_scorer: bool, activity: ActivityLevel) -> Self {
        if vip {
            ViewerPriority::Vip
        } else if top_scorer || activity.is_engaged() {
            ViewerPriority::Active
        } else if activity == ActivityLevel::Idle {
            ViewerPriority::Background
        } else {
            ViewerPriority::Normal
        }
    }

    pub fn interval_multiplier(&self) -> f32 {
        match self {
            ViewerPriority::Vip => 0.75,
            ViewerPriority::Active => 1.0,
            ViewerPriority::Normal => 1.1,
            ViewerPriority::Background => 2.0,
        }
    }
}

// ============================================================================
// Activity tracking
// ============================================================================

/// Rolling window of weighted viewer events, plus a standing crowding term
/// from the viewer's last spatial query
#[derive(Debug, Clone, Default)]
pub struct ActivityTracker {
    events: VecDeque<(u64, f32)>,
    nearby: usize,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest candidate count around the viewer, replaced on every served
    /// tick rather than accumulated
    pub fn set_nearby(&mut self, count: usize) {
        self.nearby = count;
    }

    pub fn record_viewport_move(&mut self, now_ms: u64, config: &CadenceConfig) {
        self.record(now_ms, config.viewport_move_weight);
    }

    pub fn record_message(&mut self, now_ms: u64, config: &CadenceConfig) {
        self.record(now_ms, config.message_weight);
    }

    /// Avatar travel scaled by distance; a parked avatar contributes nothing
    pub fn record_avatar_motion(&mut self, now_ms: u64, distance: f32, config: &CadenceConfig) {
        let weight = distance * config.motion_distance_weight;
        if weight > 0.0 {
            self.record(now_ms, weight);
        }
    }

    pub fn record_score_delta(&mut self, now_ms: u64, config: &CadenceConfig) {
        self.record(now_ms, config.score_delta_weight);
    }

    fn record(&mut self, now_ms: u64, weight: f32) {
        self.events.push_back((now_ms, weight));
    }

    /// Weighted event sum inside the window plus the crowding term, capped
    pub fn score(&mut self, now_ms: u64, config: &CadenceConfig) -> f32 {
        let cutoff = now_ms.saturating_sub(config.activity_window_ms);
        while matches!(self.events.front(), Some((at, _)) if *at < cutoff) {
            self.events.pop_front();
        }
        let sum: f32 = self.events.iter().map(|(_, w)| w).sum();
        let crowding = self.nearby as f32 * config.proximity_weight;
        (sum + crowding).min(config.activity_cap)
    }

    pub fn level(&mut self, now_ms: u64, config: &CadenceConfig) -> ActivityLevel {
        ActivityLevel::from_score(self.score(now_ms, config), config)
    }
}

// ============================================================================
// Cadence calculation
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct CachedInterval {
    second: u64,
    interval_ms: u64,
}

/// Computes and caches per-viewer send intervals
pub struct CadenceCalculator {
    config: CadenceConfig,
    cache: FxHashMap<ViewerId, CachedInterval>,
}

impl CadenceCalculator {
    pub fn new(config: CadenceConfig) -> Self {
        Self {
            config,
            cache: FxHashMap::default(),
        }
    }

    pub fn config(&self) -> &CadenceConfig {
        &self.config
    }

    /// Send interval for one viewer. Cached per wall-clock second; the cache
    /// entry is recomputed as soon as the second rolls over.
    pub fn interval_for(
        &mut self,
        viewer: ViewerId,
        base_interval_ms: u64,
        activity: ActivityLevel,
        quality: Option<LinkQuality>,
        load: ServerLoad,
        priority: ViewerPriority,
        now_ms: u64,
    ) -> u64 {
        let second = now_ms / 1_000;
        if let Some(cached) = self.cache.get(&viewer) {
            if cached.second == second {
                return cached.interval_ms;
            }
        }

        let multiplier = activity.interval_multiplier()
            * quality_multiplier(quality)
            * load.interval_multiplier()
            * priority.interval_multiplier();
        let interval = (base_interval_ms as f32 * multiplier) as u64;
        let interval = interval.clamp(self.config.min_interval_ms, self.config.max_interval_ms);

        self.cache.insert(
            viewer,
            CachedInterval {
                second,
                interval_ms: interval,
            },
        );
        interval
    }

    /// Whether enough time has passed since the last send. A viewer that has
    /// never been sent to is always due.
    pub fn should_send(interval_ms: u64, last_sent_ms: Option<u64>, now_ms: u64) -> bool {
        match last_sent_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= interval_ms,
        }
    }

    pub fn forget(&mut self, viewer: &ViewerId) {
        self.cache.remove(viewer);
    }

    /// Drop cache entries for viewers that are gone
    pub fn retain_viewers<F: Fn(&ViewerId) -> bool>(&mut self, keep: F) {
        self.cache.retain(|id, _| keep(id));
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }
}

impl Default for CadenceCalculator {
    fn default() -> Self {
        Self::new(CadenceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_activity_levels_from_score() {
        let config = CadenceConfig::default();
        let mut tracker = ActivityTracker::new();
        assert_eq!(tracker.level(1_000, &config), ActivityLevel::Idle);

        // Ten viewport moves score 20: medium band starts there
        for i in 0..10 {
            tracker.record_viewport_move(1_000 + i, &config);
        }
        assert_eq!(tracker.score(2_000, &config), 20.0);
        assert_eq!(tracker.level(2_000, &config), ActivityLevel::Medium);

        for i in 0..40 {
            tracker.record_viewport_move(2_000 + i, &config);
        }
        assert_eq!(tracker.level(3_000, &config), ActivityLevel::Critical);
    }

    #[test]
    fn test_avatar_motion_scales_with_distance() {
        let config = CadenceConfig::default();
        let mut tracker = ActivityTracker::new();

        // 100 units of travel per step over 30 steps scores 30: medium band
        for i in 0..30u64 {
            tracker.record_avatar_motion(1_000 + i * 33, 100.0, &config);
        }
        assert_eq!(tracker.score(2_000, &config), 30.0);
        assert_eq!(tracker.level(2_000, &config), ActivityLevel::Medium);

        // A score change counts more than raw travel
        tracker.record_score_delta(2_000, &config);
        assert_eq!(tracker.score(2_000, &config), 33.0);

        // Zero travel adds nothing
        tracker.record_avatar_motion(2_000, 0.0, &config);
        assert_eq!(tracker.score(2_000, &config), 33.0);
    }

    #[test]
    fn test_activity_score_capped() {
        let config = CadenceConfig::default();
        let mut tracker = ActivityTracker::new();
        for i in 0..500 {
            tracker.record_viewport_move(1_000 + i, &config);
        }
        assert_eq!(tracker.score(2_000, &config), config.activity_cap);
    }

    #[test]
    fn test_crowding_raises_activity() {
        let config = CadenceConfig::default();
        let mut tracker = ActivityTracker::new();
        assert_eq!(tracker.level(1_000, &config), ActivityLevel::Idle);

        // 200 candidates in view score 50: the high band starts there
        tracker.set_nearby(200);
        assert_eq!(tracker.score(1_000, &config), 50.0);
        assert_eq!(tracker.level(1_000, &config), ActivityLevel::High);

        // The crowd thins out and the score follows immediately
        tracker.set_nearby(8);
        assert_eq!(tracker.score(1_000, &config), 2.0);
        assert_eq!(tracker.level(1_000, &config), ActivityLevel::Idle);
    }

    #[test]
    fn test_crowding_adds_to_events_and_caps() {
        let config = CadenceConfig::default();
        let mut tracker = ActivityTracker::new();
        for i in 0..10 {
            tracker.record_viewport_move(1_000 + i, &config);
        }
        tracker.set_nearby(40);
        // 20 from the moves plus 10 crowding
        assert_eq!(tracker.score(2_000, &config), 30.0);

        tracker.set_nearby(10_000);
        assert_eq!(tracker.score(2_000, &config), config.activity_cap);
    }

    #[test]
    fn test_activity_window_expires() {
        let config = CadenceConfig::default();
        let mut tracker = ActivityTracker::new();
        for i in 0..10 {
            tracker.record_viewport_move(1_000 + i, &config);
        }
        assert!(tracker.score(5_000, &config) > 0.0);
        // Past the 60s window everything ages out
        assert_eq!(tracker.score(70_000, &config), 0.0);
        assert_eq!(tracker.level(70_000, &config), ActivityLevel::Idle);
    }

    #[test]
    fn test_server_load_classification() {
        let config = CadenceConfig::default();
        assert_eq!(ServerLoad::classify(10, 100, &config), ServerLoad::Low);
        assert_eq!(ServerLoad::classify(300, 100, &config), ServerLoad::Medium);
        assert_eq!(ServerLoad::classify(400, 100, &config), ServerLoad::High);
        assert_eq!(ServerLoad::classify(480, 100, &config), ServerLoad::Critical);
        // Object pressure alone can raise the grade
        assert_eq!(ServerLoad::classify(10, 9_500, &config), ServerLoad::Critical);
        assert!(ServerLoad::Critical.is_elevated());
        assert!(!ServerLoad::Low.is_elevated());
    }

    #[test]
    fn test_priority_classification() {
        assert_eq!(
            ViewerPriority::classify(true, false, ActivityLevel::Idle),
            ViewerPriority::Vip
        );
        assert_eq!(
            ViewerPriority::classify(false, false, ActivityLevel::Critical),
            ViewerPriority::Active
        );
        assert_eq!(
            ViewerPriority::classify(false, false, ActivityLevel::Medium),
            ViewerPriority::Normal
        );
        assert_eq!(
            ViewerPriority::classify(false, false, ActivityLevel::Idle),
            ViewerPriority::Background
        );
    }

    #[test]
    fn test_score_leader_ranks_active() {
        // Leading the board lifts even an idle viewer out of Background
        assert_eq!(
            ViewerPriority::classify(false, true, ActivityLevel::Idle),
            ViewerPriority::Active
        );
        assert_eq!(
            ViewerPriority::classify(false, true, ActivityLevel::Medium),
            ViewerPriority::Active
        );
        // VIP still outranks a leader
        assert_eq!(
            ViewerPriority::classify(true, true, ActivityLevel::Idle),
            ViewerPriority::Vip
        );
    }

    #[test]
    fn test_interval_combines_multipliers() {
        let mut calc = CadenceCalculator::default();
        let viewer = Uuid::new_v4();

        // Medium activity, good link, low load, normal priority:
        // 50 * 1.0 * 1.0 * 1.0 * 1.1 = 55
        let interval = calc.interval_for(
            viewer,
            50,
            ActivityLevel::Medium,
            Some(LinkQuality::Good),
            ServerLoad::Low,
            ViewerPriority::Normal,
            1_000,
        );
        assert_eq!(interval, 55);
    }

    #[test]
    fn test_interval_clamped() {
        let mut calc = CadenceCalculator::default();

        // Critical activity + VIP on a clean link pushes under the floor:
        // 50 * 0.5 * 0.75 = 18.75 -> clamped to 33
        let fast = calc.interval_for(
            Uuid::new_v4(),
            50,
            ActivityLevel::Critical,
            Some(LinkQuality::Excellent),
            ServerLoad::Low,
            ViewerPriority::Vip,
            1_000,
        );
        assert_eq!(fast, 33);

        // Idle background viewer on a poor link under critical load:
        // 200 * 2.5 * 1.8 * 2.0 * 2.0 = 3600 -> clamped to 1000
        let slow = calc.interval_for(
            Uuid::new_v4(),
            200,
            ActivityLevel::Idle,
            Some(LinkQuality::Poor),
            ServerLoad::Critical,
            ViewerPriority::Background,
            1_000,
        );
        assert_eq!(slow, 1_000);
    }

    #[test]
    fn test_interval_cached_within_second() {
        let mut calc = CadenceCalculator::default();
        let viewer = Uuid::new_v4();

        let first = calc.interval_for(
            viewer,
            50,
            ActivityLevel::Medium,
            None,
            ServerLoad::Low,
            ViewerPriority::Normal,
            1_000,
        );
        // Same second, different conditions: the cached value wins
        let cached = calc.interval_for(
            viewer,
            50,
            ActivityLevel::Idle,
            Some(LinkQuality::Poor),
            ServerLoad::Critical,
            ViewerPriority::Background,
            1_500,
        );
        assert_eq!(first, cached);

        // Next second recomputes
        let fresh = calc.interval_for(
            viewer,
            50,
            ActivityLevel::Idle,
            Some(LinkQuality::Poor),
            ServerLoad::Critical,
            ViewerPriority::Background,
            2_000,
        );
        assert!(fresh > first);
    }

    #[test]
    fn test_cache_is_per_viewer() {
        let mut calc = CadenceCalculator::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        calc.interval_for(a, 50, ActivityLevel::Medium, None, ServerLoad::Low, ViewerPriority::Normal, 1_000);
        let b_interval = calc.interval_for(
            b,
            50,
            ActivityLevel::Idle,
            None,
            ServerLoad::Low,
            ViewerPriority::Background,
            1_000,
        );
        // 50 * 2.5 * 2.0 = 250, not the 55 cached for viewer a
        assert_eq!(b_interval, 250);
        assert_eq!(calc.cached_count(), 2);

        calc.forget(&a);
        assert_eq!(calc.cached_count(), 1);
    }

    #[test]
    fn test_should_send() {
        assert!(CadenceCalculator::should_send(50, None, 1_000));
        assert!(!CadenceCalculator::should_send(50, Some(980), 1_000));
        assert!(CadenceCalculator::should_send(50, Some(950), 1_000));
        // Exactly on the boundary counts as due
        assert!(CadenceCalculator::should_send(50, Some(950), 1_000));
        assert!(!CadenceCalculator::should_send(50, Some(960), 1_009));
    }

    #[test]
    fn test_retain_viewers() {
        let mut calc = CadenceCalculator::default();
        let keep = Uuid::new_v4();
        let drop = Uuid::new_v4();
        for v in [keep, drop] {
            calc.interval_for(v, 50, ActivityLevel::Medium, None, ServerLoad::Low, ViewerPriority::Normal, 1_000);
        }
        calc.retain_viewers(|id| *id == keep);
        assert_eq!(calc.cached_count(), 1);
    }
}
