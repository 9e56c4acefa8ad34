//! Relevance scoring for per-viewer object selection
//!
//! Every candidate a spatial query returns gets a score in [0,1] built from
//! five weighted sub-scores:
//! - proximity tier (closer objects matter more, in coarse bands)
//! - size ratio against the viewer's own radius
//! - relative speed (fast-changing geometry needs frequent updates)
//! - near-field interaction bonus (things close enough to touch soon)
//! - per-kind importance (player > bot > food > dead point)
//!
//! Objects below their kind's cutoff are dropped; survivors are capped to the
//! highest-scoring N when a per-viewer cap is configured. Weights are
//! runtime-tunable so the fidelity/bandwidth tradeoff can shift without a
//! restart.

use smallvec::SmallVec;
use thiserror::Error;

use crate::util::vec2::Vec2;
use crate::world::object::{ObjectId, ObjectKind, PlayerObject, WorldObject};

// ============================================================================
// Sub-score Constants
// ============================================================================

/// Proximity bands: (distance limit, score). Checked in order.
const DISTANCE_TIERS: [(f32, f32); 4] = [
    (100.0, 1.0),
    (200.0, 0.8),
    (400.0, 0.5),
    (800.0, 0.2),
];

/// Proximity score beyond the last band
const DISTANCE_FLOOR_SCORE: f32 = 0.05;

/// Size ratio at which the size sub-score saturates at 1.0
const SIZE_RATIO_CAP: f32 = 2.0;

/// Relative speed (units/s) at which the movement sub-score saturates
const MAX_RELATIVE_SPEED: f32 = 300.0;

/// Base reach of the interaction bonus (world units)
const INTERACTION_BASE_RANGE: f32 = 100.0;

/// Combined radii contribute to interaction reach at this factor
const INTERACTION_RADII_FACTOR: f32 = 2.0;

/// Per-kind importance weights
const KIND_SCORE_PLAYER: f32 = 1.0;
const KIND_SCORE_BOT: f32 = 0.8;
const KIND_SCORE_FOOD: f32 = 0.4;
const KIND_SCORE_DEAD_POINT: f32 = 0.2;

/// Viewer radius assumed for spectators with no avatar
const DEFAULT_VIEWER_RADIUS: f32 = 12.0;

/// Score bands for the per-object cadence suggestion: (min score, Hz)
const CADENCE_BANDS: [(f32, u32); 4] = [(0.8, 20), (0.6, 10), (0.4, 5), (0.2, 2)];

/// Cadence suggestion below the last band
const CADENCE_FLOOR_HZ: u32 = 1;

// ============================================================================
// Sub-score Functions
// ============================================================================

/// Tiered proximity score.
///
/// Band limits are inclusive: exactly 100 units still scores 1.0.
#[inline]
fn distance_score(distance: f32) -> f32 {
    for (limit, score) in DISTANCE_TIERS {
        if distance <= limit {
            return score;
        }
    }
    DISTANCE_FLOOR_SCORE
}

/// Object size relative to the viewer, saturating at `SIZE_RATIO_CAP`
#[inline]
fn size_score(object_radius: f32, viewer_radius: f32) -> f32 {
    let viewer_radius = if viewer_radius > f32::EPSILON {
        viewer_radius
    } else {
        DEFAULT_VIEWER_RADIUS
    };
    (object_radius / viewer_radius / SIZE_RATIO_CAP).clamp(0.0, 1.0)
}

/// Speed difference between object and viewer, saturating at
/// `MAX_RELATIVE_SPEED`
#[inline]
fn movement_score(object_speed: f32, viewer_speed: f32) -> f32 {
    ((object_speed - viewer_speed).abs() / MAX_RELATIVE_SPEED).clamp(0.0, 1.0)
}

/// Linear falloff inside the interaction reach, zero beyond it.
///
/// Reach grows with the combined radii so large bodies interact from
/// farther away.
#[inline]
fn interaction_score(distance: f32, object_radius: f32, viewer_radius: f32) -> f32 {
    let range = INTERACTION_BASE_RANGE + (object_radius + viewer_radius) * INTERACTION_RADII_FACTOR;
    (1.0 - distance / range).clamp(0.0, 1.0)
}

/// Static importance by object kind, with bots below human players
#[inline]
fn kind_score(object: &WorldObject) -> f32 {
    match object {
        WorldObject::Player(p) => {
            if p.is_bot {
                KIND_SCORE_BOT
            } else {
                KIND_SCORE_PLAYER
            }
        }
        WorldObject::Food(_) => KIND_SCORE_FOOD,
        WorldObject::DeadPoint(_) => KIND_SCORE_DEAD_POINT,
    }
}

/// Map a relevance score to a per-object update-rate suggestion in Hz
pub fn suggested_rate_hz(score: f32) -> u32 {
    for (band, hz) in CADENCE_BANDS {
        if score >= band {
            return hz;
        }
    }
    CADENCE_FLOOR_HZ
}

// ============================================================================
// Weights and Cutoffs
// ============================================================================

/// Relative weight of each sub-score. Must sum to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub distance: f32,
    pub size: f32,
    pub movement: f32,
    pub interaction: f32,
    pub kind: f32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            distance: 0.4,
            size: 0.2,
            movement: 0.2,
            interaction: 0.1,
            kind: 0.1,
        }
    }
}

/// Sum tolerance when validating weights
const WEIGHT_SUM_EPSILON: f32 = 1e-3;

#[derive(Debug, Error, PartialEq)]
pub enum InvalidWeights {
    #[error("weight components must be non-negative")]
    Negative,
    #[error("weights must sum to 1.0, got {0:.3}")]
    BadSum(f32),
}

impl ScoreWeights {
    pub fn sum(&self) -> f32 {
        self.distance + self.size + self.movement + self.interaction + self.kind
    }

    pub fn validate(&self) -> Result<(), InvalidWeights> {
        let components = [
            self.distance,
            self.size,
            self.movement,
            self.interaction,
            self.kind,
        ];
        if components.iter().any(|w| *w < 0.0 || !w.is_finite()) {
            return Err(InvalidWeights::Negative);
        }
        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_EPSILON {
            return Err(InvalidWeights::BadSum(sum));
        }
        Ok(())
    }
}

/// Minimum score an object needs to stay in a viewer's filtered set,
/// by kind. Bots share the player cutoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KindCutoffs {
    pub player: f32,
    pub food: f32,
    pub dead_point: f32,
}

impl Default for KindCutoffs {
    fn default() -> Self {
        Self {
            player: 0.1,
            food: 0.15,
            dead_point: 0.12,
        }
    }
}

impl KindCutoffs {
    pub fn for_kind(&self, kind: ObjectKind) -> f32 {
        match kind {
            ObjectKind::Player => self.player,
            ObjectKind::Food => self.food,
            ObjectKind::DeadPoint => self.dead_point,
        }
    }
}

// ============================================================================
// Viewer Context
// ============================================================================

/// What the scorer knows about the viewer being served
#[derive(Debug, Clone, Copy)]
pub struct ViewerContext {
    pub position: Vec2,
    pub radius: f32,
    pub speed: f32,
    /// The viewer's own avatar, if any. Always included by `filter`,
    /// exempt from cutoff and cap.
    pub self_id: Option<ObjectId>,
}

impl ViewerContext {
    pub fn from_player(player: &PlayerObject) -> Self {
        Self {
            position: player.position,
            radius: player.radius,
            speed: player.speed(),
            self_id: Some(player.id),
        }
    }

    /// A viewer with no avatar in the world
    pub fn spectator(position: Vec2) -> Self {
        Self {
            position,
            radius: DEFAULT_VIEWER_RADIUS,
            speed: 0.0,
            self_id: None,
        }
    }
}

// ============================================================================
// Scorer
// ============================================================================

#[derive(Debug, Clone)]
pub struct RelevanceConfig {
    pub weights: ScoreWeights,
    pub cutoffs: KindCutoffs,
    /// Added to every cutoff while broadcast scope is narrowed
    pub narrow_boost: f32,
    /// Per-viewer cap; the highest-scored objects survive
    pub max_objects: Option<usize>,
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            cutoffs: KindCutoffs::default(),
            narrow_boost: 0.1,
            max_objects: Some(600),
        }
    }
}

/// Pure scoring and filtering; holds no per-viewer state
pub struct RelevanceScorer {
    config: RelevanceConfig,
}

impl RelevanceScorer {
    pub fn new(config: RelevanceConfig) -> Self {
        Self { config }
    }

    pub fn weights(&self) -> ScoreWeights {
        self.config.weights
    }

    /// Replace the weights at runtime. Invalid weights are rejected and the
    /// current set stays in effect.
    pub fn set_weights(&mut self, weights: ScoreWeights) -> Result<(), InvalidWeights> {
        weights.validate()?;
        self.config.weights = weights;
        Ok(())
    }

    pub fn set_cutoffs(&mut self, cutoffs: KindCutoffs) {
        self.config.cutoffs = cutoffs;
    }

    /// Cutoff for a kind, raised by `narrow_boost` while scope is narrowed
    pub fn min_score(&self, kind: ObjectKind, narrowed: bool) -> f32 {
        let base = self.config.cutoffs.for_kind(kind);
        if narrowed {
            base + self.config.narrow_boost
        } else {
            base
        }
    }

    /// Weighted sum of the five sub-scores, in [0,1]
    pub fn score(&self, object: &WorldObject, viewer: &ViewerContext) -> f32 {
        let distance = object.position().distance_to(viewer.position);
        let radius = object.radius();
        let w = &self.config.weights;

        let score = w.distance * distance_score(distance)
            + w.size * size_score(radius, viewer.radius)
            + w.movement * movement_score(object.velocity().length(), viewer.speed)
            + w.interaction * interaction_score(distance, radius, viewer.radius)
            + w.kind * kind_score(object);
        score.clamp(0.0, 1.0)
    }

    /// Score candidates, drop those below their kind's cutoff, and cap the
    /// survivors to the configured maximum, highest scores first.
    ///
    /// The viewer's own avatar bypasses both cutoff and cap, but must be
    /// among the candidates; the caller injects it when the spatial query
    /// missed it.
    pub fn filter<'a, I>(
        &self,
        candidates: I,
        viewer: &ViewerContext,
        narrowed: bool,
    ) -> Vec<(&'a WorldObject, f32)>
    where
        I: IntoIterator<Item = &'a WorldObject>,
    {
        let mut own: Option<(&'a WorldObject, f32)> = None;
        let mut scored: Vec<(&'a WorldObject, f32)> = Vec::new();

        for object in candidates {
            let score = self.score(object, viewer);
            if viewer.self_id == Some(object.id()) {
                own = Some((object, score));
                continue;
            }
            if score >= self.min_score(object.kind(), narrowed) {
                scored.push((object, score));
            }
        }

        scored.sort_unstable_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        if let Some(cap) = self.config.max_objects {
            let cap = if own.is_some() {
                cap.saturating_sub(1)
            } else {
                cap
            };
            scored.truncate(cap);
        }

        if let Some(own) = own {
            let at = scored.partition_point(|(_, s)| *s > own.1);
            scored.insert(at, own);
        }
        scored
    }

    /// Update-rate suggestions for a batch of already-scored objects
    pub fn suggest_rates(&self, scored: &[(&WorldObject, f32)]) -> SmallVec<[(ObjectId, u32); 32]> {
        scored
            .iter()
            .map(|(object, score)| (object.id(), suggested_rate_hz(*score)))
            .collect()
    }
}

impl Default for RelevanceScorer {
    fn default() -> Self {
        Self::new(RelevanceConfig::default())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::object::{DeadPointObject, FoodObject};

    fn player(id: ObjectId, x: f32, y: f32) -> WorldObject {
        WorldObject::Player(PlayerObject {
            id,
            position: Vec2::new(x, y),
            velocity: Vec2::ZERO,
            heading: 0.0,
            radius: 12.0,
            color: 0xff8800,
            body: vec![],
            score: 0,
            is_bot: false,
            name: format!("p{}", id),
        })
    }

    fn moving_player(id: ObjectId, x: f32, y: f32, vx: f32) -> WorldObject {
        match player(id, x, y) {
            WorldObject::Player(mut p) => {
                p.velocity = Vec2::new(vx, 0.0);
                WorldObject::Player(p)
            }
            _ => unreachable!(),
        }
    }

    fn bot(id: ObjectId, x: f32, y: f32) -> WorldObject {
        match player(id, x, y) {
            WorldObject::Player(mut p) => {
                p.is_bot = true;
                WorldObject::Player(p)
            }
            _ => unreachable!(),
        }
    }

    fn sized_player(id: ObjectId, x: f32, y: f32, radius: f32) -> WorldObject {
        match player(id, x, y) {
            WorldObject::Player(mut p) => {
                p.radius = radius;
                WorldObject::Player(p)
            }
            _ => unreachable!(),
        }
    }

    fn food(id: ObjectId, x: f32, y: f32) -> WorldObject {
        WorldObject::Food(FoodObject {
            id,
            position: Vec2::new(x, y),
            radius: 3.0,
            color: 0x00ff00,
        })
    }

    fn dead_point(id: ObjectId, x: f32, y: f32) -> WorldObject {
        WorldObject::DeadPoint(DeadPointObject {
            id,
            position: Vec2::new(x, y),
            radius: 3.0,
            color: 0x999999,
        })
    }

    fn viewer_at_origin() -> ViewerContext {
        ViewerContext {
            position: Vec2::ZERO,
            radius: 12.0,
            speed: 0.0,
            self_id: None,
        }
    }

    fn single_weight(which: &str) -> ScoreWeights {
        let mut w = ScoreWeights {
            distance: 0.0,
            size: 0.0,
            movement: 0.0,
            interaction: 0.0,
            kind: 0.0,
        };
        match which {
            "distance" => w.distance = 1.0,
            "size" => w.size = 1.0,
            "movement" => w.movement = 1.0,
            "interaction" => w.interaction = 1.0,
            "kind" => w.kind = 1.0,
            _ => panic!("unknown weight"),
        }
        w
    }

    #[test]
    fn test_distance_tiers_inclusive_boundaries() {
        assert_eq!(distance_score(0.0), 1.0);
        assert_eq!(distance_score(100.0), 1.0);
        assert_eq!(distance_score(100.1), 0.8);
        assert_eq!(distance_score(200.0), 0.8);
        assert_eq!(distance_score(399.9), 0.5);
        assert_eq!(distance_score(400.1), 0.2);
        assert_eq!(distance_score(800.0), 0.2);
        assert_eq!(distance_score(801.0), 0.05);
        assert_eq!(distance_score(10_000.0), 0.05);
    }

    #[test]
    fn test_default_weights_are_valid() {
        assert!(ScoreWeights::default().validate().is_ok());
        assert!((ScoreWeights::default().sum() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let mut scorer = RelevanceScorer::default();

        let over = ScoreWeights {
            distance: 0.5,
            ..ScoreWeights::default()
        };
        match scorer.set_weights(over) {
            Err(InvalidWeights::BadSum(sum)) => assert!((sum - 1.1).abs() < 1e-3),
            other => panic!("expected BadSum, got {:?}", other),
        }

        let negative = ScoreWeights {
            distance: -0.1,
            size: 0.3,
            movement: 0.3,
            interaction: 0.3,
            kind: 0.2,
        };
        assert_eq!(scorer.set_weights(negative), Err(InvalidWeights::Negative));

        // Rejected updates leave the current weights in effect
        assert_eq!(scorer.weights(), ScoreWeights::default());
    }

    #[test]
    fn test_weights_are_runtime_tunable() {
        let mut scorer = RelevanceScorer::default();
        let viewer = viewer_at_origin();
        let snack = food(1, 50.0, 0.0);

        let before = scorer.score(&snack, &viewer);
        scorer.set_weights(single_weight("distance")).unwrap();
        let after = scorer.score(&snack, &viewer);

        assert!((after - 1.0).abs() < 1e-6, "distance-only score: {}", after);
        assert!(before < after);
    }

    #[test]
    fn test_score_stays_in_unit_interval() {
        let scorer = RelevanceScorer::default();
        let viewer = viewer_at_origin();

        let mut giant = match sized_player(1, 10.0, 0.0, 500.0) {
            WorldObject::Player(p) => p,
            _ => unreachable!(),
        };
        giant.velocity = Vec2::new(5000.0, 0.0);
        let giant = WorldObject::Player(giant);

        for object in [&giant, &food(2, 9000.0, 9000.0), &dead_point(3, 0.0, 0.0)] {
            let score = scorer.score(object, &viewer);
            assert!((0.0..=1.0).contains(&score), "score out of range: {}", score);
        }
    }

    #[test]
    fn test_player_outranks_food_at_same_distance() {
        let scorer = RelevanceScorer::default();
        let viewer = viewer_at_origin();

        let p = scorer.score(&player(1, 100.0, 0.0), &viewer);
        let f = scorer.score(&food(2, 100.0, 0.0), &viewer);
        assert!(p > f, "player {} should beat food {}", p, f);
    }

    #[test]
    fn test_bot_scores_below_human_player() {
        let scorer = RelevanceScorer::default();
        let viewer = viewer_at_origin();

        let human = scorer.score(&player(1, 150.0, 0.0), &viewer);
        let machine = scorer.score(&bot(2, 150.0, 0.0), &viewer);
        assert!(human > machine);
        // Only the kind sub-score differs: (1.0 - 0.8) * 0.1
        assert!((human - machine - 0.02).abs() < 1e-6);
    }

    #[test]
    fn test_dead_point_ranks_below_food() {
        let scorer = RelevanceScorer::default();
        let viewer = viewer_at_origin();

        let f = scorer.score(&food(1, 100.0, 0.0), &viewer);
        let d = scorer.score(&dead_point(2, 100.0, 0.0), &viewer);
        assert!(f > d);
    }

    #[test]
    fn test_movement_score_tracks_relative_speed() {
        let mut scorer = RelevanceScorer::default();
        scorer.set_weights(single_weight("movement")).unwrap();
        let viewer = viewer_at_origin();

        let fast = scorer.score(&moving_player(1, 50.0, 0.0, 240.0), &viewer);
        let slow = scorer.score(&moving_player(2, 50.0, 0.0, 30.0), &viewer);
        assert!((fast - 0.8).abs() < 1e-6);
        assert!((slow - 0.1).abs() < 1e-6);

        // Saturates at the cap
        let blur = scorer.score(&moving_player(3, 50.0, 0.0, 900.0), &viewer);
        assert_eq!(blur, 1.0);
    }

    #[test]
    fn test_size_ratio_saturates() {
        let mut scorer = RelevanceScorer::default();
        scorer.set_weights(single_weight("size")).unwrap();
        let viewer = viewer_at_origin();

        let half = scorer.score(&sized_player(1, 50.0, 0.0, 6.0), &viewer);
        let double = scorer.score(&sized_player(2, 50.0, 0.0, 24.0), &viewer);
        let huge = scorer.score(&sized_player(3, 50.0, 0.0, 48.0), &viewer);

        assert!((half - 0.25).abs() < 1e-6);
        assert!((double - 1.0).abs() < 1e-6);
        assert_eq!(huge, 1.0);
    }

    #[test]
    fn test_interaction_bonus_falls_off_linearly() {
        let mut scorer = RelevanceScorer::default();
        scorer.set_weights(single_weight("interaction")).unwrap();
        let viewer = viewer_at_origin();

        // Reach for two radius-12 bodies: 100 + 24 * 2 = 148
        let touching = scorer.score(&player(1, 0.0, 0.0), &viewer);
        let midway = scorer.score(&player(2, 74.0, 0.0), &viewer);
        let outside = scorer.score(&player(3, 200.0, 0.0), &viewer);

        assert!((touching - 1.0).abs() < 1e-6);
        assert!((midway - 0.5).abs() < 1e-3);
        assert_eq!(outside, 0.0);
    }

    #[test]
    fn test_cutoff_keeps_players_drops_far_food() {
        let scorer = RelevanceScorer::default();
        let viewer = viewer_at_origin();

        let far_player = player(1, 600.0, 0.0);
        let far_food = food(2, 600.0, 0.0);

        let ps = scorer.score(&far_player, &viewer);
        let fs = scorer.score(&far_food, &viewer);
        assert!(ps >= scorer.min_score(ObjectKind::Player, false));
        assert!(fs < scorer.min_score(ObjectKind::Food, false));

        let objects = vec![far_player, far_food];
        let kept = scorer.filter(objects.iter(), &viewer, false);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].0.id(), 1);
    }

    #[test]
    fn test_narrowed_scope_raises_cutoffs() {
        let scorer = RelevanceScorer::default();
        let viewer = viewer_at_origin();

        // Scores 0.125: above the dead-point cutoff, below the narrowed one
        let marginal = dead_point(1, 500.0, 0.0);
        let score = scorer.score(&marginal, &viewer);
        assert!(score >= scorer.min_score(ObjectKind::DeadPoint, false));
        assert!(score < scorer.min_score(ObjectKind::DeadPoint, true));

        let objects = vec![marginal];
        assert_eq!(scorer.filter(objects.iter(), &viewer, false).len(), 1);
        assert_eq!(scorer.filter(objects.iter(), &viewer, true).len(), 0);
    }

    #[test]
    fn test_filter_caps_to_highest_scores() {
        let scorer = RelevanceScorer::new(RelevanceConfig {
            max_objects: Some(3),
            ..RelevanceConfig::default()
        });
        let viewer = viewer_at_origin();

        // Ids ordered far-to-near so the cap has to reorder
        let objects = vec![
            player(1, 1000.0, 0.0),
            player(2, 900.0, 0.0),
            player(3, 500.0, 0.0),
            player(4, 300.0, 0.0),
            player(5, 150.0, 0.0),
            player(6, 50.0, 0.0),
        ];
        let kept = scorer.filter(objects.iter(), &viewer, false);

        assert_eq!(kept.len(), 3);
        let ids: Vec<ObjectId> = kept.iter().map(|(o, _)| o.id()).collect();
        assert_eq!(ids, vec![6, 5, 4]);
        for pair in kept.windows(2) {
            assert!(pair[0].1 >= pair[1].1, "results must be score-descending");
        }
    }

    #[test]
    fn test_own_avatar_survives_cutoff_and_cap() {
        let scorer = RelevanceScorer::new(RelevanceConfig {
            max_objects: Some(3),
            ..RelevanceConfig::default()
        });

        // Tiny slow avatar among giants that outscore it
        let own = sized_player(7, 0.0, 0.0, 2.0);
        let viewer = match &own {
            WorldObject::Player(p) => ViewerContext::from_player(p),
            _ => unreachable!(),
        };

        let mut objects = vec![own];
        for id in 1..=4u64 {
            let mut giant = match sized_player(id, 40.0 * id as f32, 0.0, 40.0) {
                WorldObject::Player(p) => p,
                _ => unreachable!(),
            };
            giant.velocity = Vec2::new(200.0, 0.0);
            objects.push(WorldObject::Player(giant));
        }

        let kept = scorer.filter(objects.iter(), &viewer, false);
        assert_eq!(kept.len(), 3);
        assert!(
            kept.iter().any(|(o, _)| o.id() == 7),
            "own avatar must survive the cap"
        );
    }

    #[test]
    fn test_cadence_suggestion_bands() {
        assert_eq!(suggested_rate_hz(1.0), 20);
        assert_eq!(suggested_rate_hz(0.8), 20);
        assert_eq!(suggested_rate_hz(0.79), 10);
        assert_eq!(suggested_rate_hz(0.6), 10);
        assert_eq!(suggested_rate_hz(0.5), 5);
        assert_eq!(suggested_rate_hz(0.25), 2);
        assert_eq!(suggested_rate_hz(0.19), 1);
        assert_eq!(suggested_rate_hz(0.0), 1);
    }

    #[test]
    fn test_suggest_rates_batch() {
        let scorer = RelevanceScorer::default();
        let viewer = viewer_at_origin();

        let objects = vec![player(1, 50.0, 0.0), food(2, 300.0, 0.0)];
        let kept = scorer.filter(objects.iter(), &viewer, false);
        let rates = scorer.suggest_rates(&kept);

        assert_eq!(rates.len(), kept.len());
        for ((object, score), (id, hz)) in kept.iter().zip(rates.iter()) {
            assert_eq!(object.id(), *id);
            assert_eq!(suggested_rate_hz(*score), *hz);
        }
        // The nearby player lands in a faster band than the mid-range food
        assert!(rates[0].1 > rates[rates.len() - 1].1);
    }

    #[test]
    fn test_spectator_context_defaults() {
        let viewer = ViewerContext::spectator(Vec2::new(10.0, 10.0));
        assert_eq!(viewer.self_id, None);
        assert_eq!(viewer.speed, 0.0);
        assert!(viewer.radius > 0.0);

        // Zero-radius viewers fall back to the spectator radius in the
        // size ratio instead of dividing by zero
        let score = size_score(12.0, 0.0);
        assert!((score - 0.5).abs() < 1e-6);
    }
}
