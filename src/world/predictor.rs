//! Short-horizon movement extrapolation
//!
//! Tracks a bounded ring of position samples per entity, estimates smoothed
//! velocity and acceleration, and extrapolates a short distance ahead. The
//! orchestrator uses it to widen viewport queries toward where a viewer is
//! heading, so objects enter the filtered set before they enter the screen.

use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;

use crate::util::vec2::Vec2;
use crate::world::object::{ObjectId, Viewport};

/// Tuning for the predictor. Empirical values, override per deployment.
#[derive(Debug, Clone)]
pub struct PredictorConfig {
    /// Samples kept per entity
    pub max_samples: usize,
    /// EMA weight of the newest raw velocity
    pub velocity_smoothing: f32,
    /// Extrapolated displacement cap (world units)
    pub max_prediction_distance: f32,
    /// Scales velocity variance into confidence loss
    pub confidence_sensitivity: f32,
    /// How long a cached prediction stays valid
    pub cache_ttl_ms: u64,
    /// Viewport expansion cap as a fraction of the longer viewport side
    pub max_expansion_ratio: f32,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            max_samples: 10,
            velocity_smoothing: 0.7,
            max_prediction_distance: 200.0,
            confidence_sensitivity: 0.001,
            cache_ttl_ms: 100,
            max_expansion_ratio: 0.4,
        }
    }
}

/// One recorded position
#[derive(Debug, Clone, Copy)]
struct MovementSample {
    position: Vec2,
    t_ms: u64,
}

/// Per-entity ring plus the running smoothed velocity
#[derive(Debug, Clone, Default)]
struct MovementHistory {
    samples: VecDeque<MovementSample>,
    smoothed_velocity: Option<Vec2>,
}

impl MovementHistory {
    fn latest(&self) -> Option<&MovementSample> {
        self.samples.back()
    }

    /// Raw velocity between the two most recent samples
    fn raw_velocity(&self) -> Option<Vec2> {
        let n = self.samples.len();
        if n < 2 {
            return None;
        }
        let a = self.samples[n - 2];
        let b = self.samples[n - 1];
        let dt = (b.t_ms.saturating_sub(a.t_ms)) as f32 / 1000.0;
        if dt <= 0.0 {
            return None;
        }
        Some((b.position - a.position) * (1.0 / dt))
    }

    /// Acceleration from the three most recent samples
    fn acceleration(&self) -> Vec2 {
        let n = self.samples.len();
        if n < 3 {
            return Vec2::ZERO;
        }
        let s1 = self.samples[n - 3];
        let s2 = self.samples[n - 2];
        let s3 = self.samples[n - 1];
        let dt1 = (s2.t_ms.saturating_sub(s1.t_ms)) as f32 / 1000.0;
        let dt2 = (s3.t_ms.saturating_sub(s2.t_ms)) as f32 / 1000.0;
        if dt1 <= 0.0 || dt2 <= 0.0 {
            return Vec2::ZERO;
        }
        let v1 = (s2.position - s1.position) * (1.0 / dt1);
        let v2 = (s3.position - s2.position) * (1.0 / dt2);
        (v2 - v1) * (1.0 / dt2)
    }

    /// Variance of consecutive-sample velocities around their mean
    fn velocity_variance(&self) -> f32 {
        let n = self.samples.len();
        if n < 3 {
            return 0.0;
        }
        let mut velocities = Vec::with_capacity(n - 1);
        for i in 1..n {
            let a = self.samples[i - 1];
            let b = self.samples[i];
            let dt = (b.t_ms.saturating_sub(a.t_ms)) as f32 / 1000.0;
            if dt > 0.0 {
                velocities.push((b.position - a.position) * (1.0 / dt));
            }
        }
        if velocities.len() < 2 {
            return 0.0;
        }
        let inv = 1.0 / velocities.len() as f32;
        let mean = velocities
            .iter()
            .fold(Vec2::ZERO, |acc, v| acc + *v)
            * inv;
        velocities
            .iter()
            .map(|v| v.distance_sq_to(mean))
            .sum::<f32>()
            * inv
    }
}

/// Extrapolated state for one entity at one horizon
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub position: Vec2,
    pub velocity: Vec2,
    pub acceleration: Vec2,
    /// 0.1 (erratic movement) up to 1.0 (steady)
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy)]
struct CachedPrediction {
    prediction: Prediction,
    computed_at_ms: u64,
}

/// Movement predictor over all tracked entities
pub struct MovementPredictor {
    config: PredictorConfig,
    histories: FxHashMap<ObjectId, MovementHistory>,
    cache: FxHashMap<(ObjectId, u32), CachedPrediction>,
}

impl MovementPredictor {
    pub fn new(config: PredictorConfig) -> Self {
        Self {
            config,
            histories: FxHashMap::default(),
            cache: FxHashMap::default(),
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.histories.len()
    }

    /// Record a position sample. Out-of-order timestamps are dropped.
    pub fn record_sample(&mut self, id: ObjectId, position: Vec2, t_ms: u64) {
        let history = self.histories.entry(id).or_default();

        if let Some(last) = history.latest() {
            if t_ms < last.t_ms {
                return;
            }
        }

        history.samples.push_back(MovementSample { position, t_ms });
        while history.samples.len() > self.config.max_samples {
            history.samples.pop_front();
        }

        if let Some(raw) = history.raw_velocity() {
            history.smoothed_velocity = Some(match history.smoothed_velocity {
                Some(prev) => prev.lerp(raw, self.config.velocity_smoothing),
                None => raw,
            });
        }
    }

    /// Extrapolate `id` forward by `horizon_ms`.
    ///
    /// Returns None with fewer than two samples: too little history is "no
    /// opinion", not an error. Results are cached per (entity, horizon) until
    /// `cache_ttl_ms` passes.
    pub fn predict(&mut self, id: ObjectId, horizon_ms: u32, now_ms: u64) -> Option<Prediction> {
        if let Some(cached) = self.cache.get(&(id, horizon_ms)) {
            if now_ms.saturating_sub(cached.computed_at_ms) <= self.config.cache_ttl_ms {
                return Some(cached.prediction);
            }
        }

        let history = self.histories.get(&id)?;
        if history.samples.len() < 2 {
            return None;
        }
        let latest = history.latest()?;
        let velocity = history.smoothed_velocity.or_else(|| history.raw_velocity())?;
        let acceleration = history.acceleration();

        let t = horizon_ms as f32 / 1000.0;
        let displacement = (velocity * t + acceleration * (0.5 * t * t))
            .clamp_length(self.config.max_prediction_distance);

        let variance = history.velocity_variance();
        let confidence =
            (1.0 - self.config.confidence_sensitivity * variance).clamp(0.1, 1.0);

        let prediction = Prediction {
            position: latest.position + displacement,
            velocity,
            acceleration,
            confidence,
        };
        self.cache.insert(
            (id, horizon_ms),
            CachedPrediction {
                prediction,
                computed_at_ms: now_ms,
            },
        );
        Some(prediction)
    }

    /// Expand a viewport toward where its viewer is heading.
    ///
    /// The buffer grows with the predicted displacement and shrinks as
    /// confidence rises (a steady mover needs little slack). Without enough
    /// history the viewport is returned unchanged.
    pub fn expanded_viewport(
        &mut self,
        viewport: &Viewport,
        id: ObjectId,
        horizon_ms: u32,
        now_ms: u64,
    ) -> Viewport {
        let Some(prediction) = self.predict(id, horizon_ms, now_ms) else {
            return *viewport;
        };

        let current = viewport.viewer_position();
        let displacement = prediction.position.distance_to(current);
        if displacement < f32::EPSILON {
            return *viewport;
        }

        let max_buffer = viewport.width.max(viewport.height) * self.config.max_expansion_ratio;
        let buffer = (displacement * (1.0 - prediction.confidence * 0.5)).min(max_buffer);
        viewport.covering(prediction.position, buffer)
    }

    /// Drop a single entity's history and cached predictions
    pub fn remove(&mut self, id: ObjectId) {
        self.histories.remove(&id);
        self.cache.retain(|(cached_id, _), _| *cached_id != id);
    }

    /// Drop every entity not present in the live set
    pub fn prune(&mut self, live: &FxHashSet<ObjectId>) {
        self.histories.retain(|id, _| live.contains(id));
        self.cache.retain(|(id, _), _| live.contains(id));
    }
}

impl Default for MovementPredictor {
    fn default() -> Self {
        Self::new(PredictorConfig::default())
    }
}
