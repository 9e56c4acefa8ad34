//! Built-in world source
//!
//! A small self-contained simulation for running the pipeline without an
//! external world attached. Players wander with smooth heading drift and
//! bounce off the map edge, food occasionally respawns elsewhere, and
//! wanderers sometimes leave a dead point behind. Enough churn to keep
//! every delta path busy.

use rand::Rng;

use crate::util::vec2::Vec2;
use crate::world::object::{
    DeadPointObject, FoodObject, ObjectId, PlayerObject, WorldSnapshot,
};

const PLAYER_COLORS: [u32; 8] = [
    0xe6194b, 0x3cb44b, 0xffe119, 0x4363d8, 0xf58231, 0x911eb4, 0x46f0f0, 0xf032e6,
];
const FOOD_COLORS: [u32; 4] = [0xbfef45, 0xfabed4, 0xaaffc3, 0xffd8b1];

/// Trail length kept per wanderer
const BODY_LEN: usize = 12;
/// Dead points retained before the oldest is dropped
const MAX_DEAD_POINTS: usize = 64;
/// Fraction of foods respawned per simulated second
const FOOD_CHURN_PER_SEC: f32 = 0.02;

struct Wanderer {
    player: PlayerObject,
    speed: f32,
    /// Heading drift in radians per second
    turn_rate: f32,
    /// Seconds until the drift is re-rolled
    retarget_in: f32,
}

pub struct WanderSim {
    width: f32,
    height: f32,
    tick: u64,
    wanderers: Vec<Wanderer>,
    foods: Vec<FoodObject>,
    dead_points: Vec<DeadPointObject>,
    next_food_id: ObjectId,
    next_dead_id: ObjectId,
}

impl WanderSim {
    pub fn new(width: f32, height: f32, players: usize, foods: usize) -> Self {
        let mut rng = rand::thread_rng();

        let wanderers = (0..players)
            .map(|i| {
                let id = (i + 1) as ObjectId;
                let position = Vec2::new(
                    spawn_coord(&mut rng, width, 40.0),
                    spawn_coord(&mut rng, height, 40.0),
                );
                let heading = rng.gen_range(0.0..std::f32::consts::TAU);
                let speed = rng.gen_range(60.0..140.0);
                Wanderer {
                    player: PlayerObject {
                        id,
                        position,
                        velocity: Vec2::from_angle(heading) * speed,
                        heading,
                        radius: rng.gen_range(10.0..16.0),
                        color: PLAYER_COLORS[i % PLAYER_COLORS.len()],
                        body: vec![position],
                        score: 0,
                        is_bot: true,
                        name: format!("wanderer-{}", id),
                    },
                    speed,
                    turn_rate: rng.gen_range(-1.2..1.2),
                    retarget_in: rng.gen_range(1.0..4.0),
                }
            })
            .collect();

        let mut sim = Self {
            width,
            height,
            tick: 0,
            wanderers,
            foods: Vec::with_capacity(foods),
            dead_points: Vec::new(),
            next_food_id: 100_000,
            next_dead_id: 1_000_000,
        };
        for _ in 0..foods {
            let food = sim.spawn_food(&mut rng);
            sim.foods.push(food);
        }
        sim
    }

    fn spawn_food(&mut self, rng: &mut impl Rng) -> FoodObject {
        let id = self.next_food_id;
        self.next_food_id += 1;
        FoodObject {
            id,
            position: Vec2::new(
                spawn_coord(rng, self.width, 10.0),
                spawn_coord(rng, self.height, 10.0),
            ),
            radius: rng.gen_range(2.0..4.0),
            color: FOOD_COLORS[rng.gen_range(0..FOOD_COLORS.len())],
        }
    }

    /// Advance the world by `dt_ms` and return the resulting snapshot
    pub fn step(&mut self, dt_ms: u64) -> WorldSnapshot {
        let mut rng = rand::thread_rng();
        let dt = dt_ms as f32 / 1000.0;
        self.tick += 1;

        for w in &mut self.wanderers {
            w.retarget_in -= dt;
            if w.retarget_in <= 0.0 {
                w.turn_rate = rng.gen_range(-1.2..1.2);
                w.retarget_in = rng.gen_range(1.0..4.0);
                if rng.gen_bool(0.3) {
                    w.player.score += 1;
                }
                if rng.gen_bool(0.1) {
                    let id = self.next_dead_id;
                    self.next_dead_id += 1;
                    self.dead_points.push(DeadPointObject {
                        id,
                        position: w.player.position,
                        radius: 3.0,
                        color: w.player.color,
                    });
                    if self.dead_points.len() > MAX_DEAD_POINTS {
                        self.dead_points.remove(0);
                    }
                }
            }

            w.player.heading += w.turn_rate * dt;
            let mut position = w.player.position + Vec2::from_angle(w.player.heading) * w.speed * dt;

            // Bounce off the map edge; the effective radius is capped at the
            // half-extent so the clamp bounds stay ordered on tiny maps
            let rx = w.player.radius.min(self.width * 0.5);
            let ry = w.player.radius.min(self.height * 0.5);
            if position.x < rx || position.x > self.width - rx {
                w.player.heading = std::f32::consts::PI - w.player.heading;
                position.x = position.x.clamp(rx, self.width - rx);
            }
            if position.y < ry || position.y > self.height - ry {
                w.player.heading = -w.player.heading;
                position.y = position.y.clamp(ry, self.height - ry);
            }

            w.player.position = position;
            w.player.velocity = Vec2::from_angle(w.player.heading) * w.speed;
            w.player.body.insert(0, position);
            w.player.body.truncate(BODY_LEN);
        }

        // Churn a fraction of the food so add/remove deltas stay exercised
        if !self.foods.is_empty() {
            let expected = self.foods.len() as f32 * FOOD_CHURN_PER_SEC * dt;
            let mut respawns = expected.floor() as usize;
            if rng.gen_bool((expected.fract() as f64).clamp(0.0, 1.0)) {
                respawns += 1;
            }
            for _ in 0..respawns {
                let slot = rng.gen_range(0..self.foods.len());
                self.foods[slot] = self.spawn_food(&mut rng);
            }
        }

        WorldSnapshot {
            tick: self.tick,
            players: self.wanderers.iter().map(|w| w.player.clone()).collect(),
            foods: self.foods.clone(),
            dead_points: self.dead_points.clone(),
        }
    }
}

/// Coordinate inside `margin` of neither edge, or anywhere along the axis
/// when the map is too narrow to honor the margin
fn spawn_coord(rng: &mut impl Rng, extent: f32, margin: f32) -> f32 {
    if extent > margin * 2.0 {
        rng.gen_range(margin..extent - margin)
    } else {
        rng.gen_range(0.0..extent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_population() {
        let mut sim = WanderSim::new(1000.0, 1000.0, 8, 50);
        let snapshot = sim.step(33);
        assert_eq!(snapshot.tick, 1);
        assert_eq!(snapshot.players.len(), 8);
        assert_eq!(snapshot.foods.len(), 50);
    }

    #[test]
    fn test_players_stay_in_bounds() {
        let mut sim = WanderSim::new(500.0, 500.0, 6, 10);
        for _ in 0..600 {
            let snapshot = sim.step(33);
            for p in &snapshot.players {
                assert!(p.position.x >= 0.0 && p.position.x <= 500.0, "x = {}", p.position.x);
                assert!(p.position.y >= 0.0 && p.position.y <= 500.0, "y = {}", p.position.y);
                assert!(p.position.is_finite());
            }
        }
    }

    #[test]
    fn test_tiny_world_spawns_and_steps_in_bounds() {
        let mut sim = WanderSim::new(60.0, 60.0, 3, 5);
        for _ in 0..50 {
            let snapshot = sim.step(33);
            for p in &snapshot.players {
                assert!(p.position.x >= 0.0 && p.position.x <= 60.0, "x = {}", p.position.x);
                assert!(p.position.y >= 0.0 && p.position.y <= 60.0, "y = {}", p.position.y);
            }
        }

        // Narrower than a wanderer's diameter still steps without panicking
        let mut cramped = WanderSim::new(24.0, 24.0, 2, 3);
        for _ in 0..20 {
            cramped.step(33);
        }
        assert_eq!(cramped.step(33).players.len(), 2);
    }

    #[test]
    fn test_players_actually_move() {
        let mut sim = WanderSim::new(2000.0, 2000.0, 4, 0);
        let before = sim.step(33);
        for _ in 0..30 {
            sim.step(33);
        }
        let after = sim.step(33);
        let moved = before
            .players
            .iter()
            .zip(&after.players)
            .any(|(a, b)| (a.position - b.position).length() > 1.0);
        assert!(moved, "a second of wandering should relocate someone");
    }

    #[test]
    fn test_body_trail_tracks_head() {
        let mut sim = WanderSim::new(2000.0, 2000.0, 1, 0);
        for _ in 0..BODY_LEN + 4 {
            sim.step(33);
        }
        let snapshot = sim.step(33);
        let p = &snapshot.players[0];
        assert_eq!(p.body.len(), BODY_LEN);
        assert_eq!(p.body[0], p.position);
    }
}
