//! World data model consumed by the sync pipeline
//!
//! The simulation owns these objects; one snapshot arrives per tick and is
//! mirrored into the spatial index before any viewer work runs.

use serde::{Deserialize, Serialize};

use crate::util::vec2::Vec2;

/// Unique world object identifier, assigned by the simulation
pub type ObjectId = u64;

/// Object category, used for relevance weighting and codec dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Player,
    Food,
    DeadPoint,
}

impl ObjectKind {
    pub fn is_player(&self) -> bool {
        matches!(self, ObjectKind::Player)
    }

    /// Stable wire tag for this kind
    pub fn as_u8(&self) -> u8 {
        match self {
            ObjectKind::Player => 0,
            ObjectKind::Food => 1,
            ObjectKind::DeadPoint => 2,
        }
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ObjectKind::Player),
            1 => Some(ObjectKind::Food),
            2 => Some(ObjectKind::DeadPoint),
            _ => None,
        }
    }
}

/// A live actor: position plus heading, trailing body segments, and score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerObject {
    pub id: ObjectId,
    pub position: Vec2,
    pub velocity: Vec2,
    /// Facing direction in radians
    pub heading: f32,
    pub radius: f32,
    /// Packed 0xRRGGBB; the codec maps this to a palette index
    pub color: u32,
    /// Trailing body segments, head first
    pub body: Vec<Vec2>,
    #[serde(default)]
    pub score: u32,
    #[serde(default)]
    pub is_bot: bool,
    pub name: String,
}

impl PlayerObject {
    pub fn speed(&self) -> f32 {
        self.velocity.length()
    }
}

/// Static collectible
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodObject {
    pub id: ObjectId,
    pub position: Vec2,
    pub radius: f32,
    pub color: u32,
}

/// Remnant left behind by a dead player, collectible like food
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadPointObject {
    pub id: ObjectId,
    pub position: Vec2,
    pub radius: f32,
    pub color: u32,
}

/// Tagged union over everything the pipeline can broadcast.
///
/// Scorer and codec match on this exhaustively; adding a kind is a compile
/// error everywhere it matters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorldObject {
    Player(PlayerObject),
    Food(FoodObject),
    DeadPoint(DeadPointObject),
}

impl WorldObject {
    pub fn id(&self) -> ObjectId {
        match self {
            WorldObject::Player(p) => p.id,
            WorldObject::Food(f) => f.id,
            WorldObject::DeadPoint(d) => d.id,
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            WorldObject::Player(_) => ObjectKind::Player,
            WorldObject::Food(_) => ObjectKind::Food,
            WorldObject::DeadPoint(_) => ObjectKind::DeadPoint,
        }
    }

    pub fn position(&self) -> Vec2 {
        match self {
            WorldObject::Player(p) => p.position,
            WorldObject::Food(f) => f.position,
            WorldObject::DeadPoint(d) => d.position,
        }
    }

    /// Food and dead points never move
    pub fn velocity(&self) -> Vec2 {
        match self {
            WorldObject::Player(p) => p.velocity,
            WorldObject::Food(_) | WorldObject::DeadPoint(_) => Vec2::ZERO,
        }
    }

    pub fn radius(&self) -> f32 {
        match self {
            WorldObject::Player(p) => p.radius,
            WorldObject::Food(f) => f.radius,
            WorldObject::DeadPoint(d) => d.radius,
        }
    }
}

/// One tick's worth of world state from the simulation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub tick: u64,
    pub players: Vec<PlayerObject>,
    pub foods: Vec<FoodObject>,
    pub dead_points: Vec<DeadPointObject>,
}

impl WorldSnapshot {
    pub fn object_count(&self) -> usize {
        self.players.len() + self.foods.len() + self.dead_points.len()
    }

    /// Replace non-finite values coming out of the simulation so they cannot
    /// poison the index, the predictor, or the wire.
    pub fn sanitize(&mut self) -> usize {
        let mut fixed = 0;
        for p in &mut self.players {
            if !p.position.is_finite() {
                p.position = Vec2::ZERO;
                fixed += 1;
            }
            if !p.velocity.is_finite() {
                p.velocity = Vec2::ZERO;
                fixed += 1;
            }
            if !p.heading.is_finite() {
                p.heading = 0.0;
                fixed += 1;
            }
            if !p.radius.is_finite() || p.radius < 0.0 {
                p.radius = 1.0;
                fixed += 1;
            }
        }
        for f in &mut self.foods {
            if !f.position.is_finite() {
                f.position = Vec2::ZERO;
                fixed += 1;
            }
        }
        for d in &mut self.dead_points {
            if !d.position.is_finite() {
                d.position = Vec2::ZERO;
                fixed += 1;
            }
        }
        fixed
    }
}

/// Per-viewer filtered slice of the world, the unit the codec encodes.
///
/// Also what baselines store (unquantized) between sends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewSnapshot {
    pub tick: u64,
    pub players: Vec<PlayerObject>,
    pub foods: Vec<FoodObject>,
    pub dead_points: Vec<DeadPointObject>,
}

impl ViewSnapshot {
    pub fn object_count(&self) -> usize {
        self.players.len() + self.foods.len() + self.dead_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.object_count() == 0
    }
}

/// Rectangular world region a viewer is interested in.
///
/// `x`/`y` is the top-left origin; `viewer_x`/`viewer_y` is where the
/// viewer's own avatar sits (scoring measures distance from there, not from
/// the rectangle center).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub viewer_x: f32,
    pub viewer_y: f32,
}

impl Viewport {
    pub fn new(x: f32, y: f32, width: f32, height: f32, viewer_x: f32, viewer_y: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            viewer_x,
            viewer_y,
        }
    }

    pub fn viewer_position(&self) -> Vec2 {
        Vec2::new(self.viewer_x, self.viewer_y)
    }

    pub fn center(&self) -> Vec2 {
        Vec2::new(self.x + self.width * 0.5, self.y + self.height * 0.5)
    }

    /// Exact test: does the object's bounding circle intersect this rect?
    pub fn contains_circle(&self, center: Vec2, radius: f32) -> bool {
        let closest_x = center.x.clamp(self.x, self.x + self.width);
        let closest_y = center.y.clamp(self.y, self.y + self.height);
        let closest = Vec2::new(closest_x, closest_y);
        center.distance_sq_to(closest) <= radius * radius
    }

    /// Uniform growth by `margin` on every side
    pub fn expanded(&self, margin: f32) -> Viewport {
        Viewport {
            x: self.x - margin,
            y: self.y - margin,
            width: self.width + margin * 2.0,
            height: self.height + margin * 2.0,
            viewer_x: self.viewer_x,
            viewer_y: self.viewer_y,
        }
    }

    /// Smallest viewport covering both this rect and a same-sized rect
    /// centered at `target`, grown by `buffer` on every side. Used for
    /// prediction-expanded queries.
    pub fn covering(&self, target: Vec2, buffer: f32) -> Viewport {
        let half_w = self.width * 0.5;
        let half_h = self.height * 0.5;
        let min_x = (self.x).min(target.x - half_w) - buffer;
        let min_y = (self.y).min(target.y - half_h) - buffer;
        let max_x = (self.x + self.width).max(target.x + half_w) + buffer;
        let max_y = (self.y + self.height).max(target.y + half_h) + buffer;
        Viewport {
            x: min_x,
            y: min_y,
            width: max_x - min_x,
            height: max_y - min_y,
            viewer_x: self.viewer_x,
            viewer_y: self.viewer_y,
        }
    }
}
