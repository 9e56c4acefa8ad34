use crate::net::orchestrator::OrchestratorConfig;
use crate::net::relevance::{RelevanceConfig, ScoreWeights};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// World width in world units
    pub world_width: f32,
    /// World height in world units
    pub world_height: f32,
    /// Maximum number of concurrent viewers
    pub max_viewers: usize,
    /// Base broadcast interval under low load
    pub tick_interval_ms: u64,
    /// Viewers silent for this long are dropped
    pub stale_timeout_ms: u64,
    /// Relevance score weights, must sum to 1
    pub score_weights: ScoreWeights,
    /// Wandering players in the built-in simulation
    pub sim_players: usize,
    /// Food objects in the built-in simulation
    pub sim_foods: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            world_width: 4000.0,
            world_height: 4000.0,
            max_viewers: 500,
            tick_interval_ms: 50,
            stale_timeout_ms: 30_000,
            score_weights: ScoreWeights::default(),
            sim_players: 24,
            sim_foods: 400,
        }
    }
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(width) = std::env::var("WORLD_WIDTH") {
            if let Ok(parsed) = width.parse::<f32>() {
                if parsed.is_finite() && parsed > 0.0 {
                    config.world_width = parsed;
                } else {
                    tracing::warn!("WORLD_WIDTH must be positive, using default");
                }
            } else {
                tracing::warn!("Invalid WORLD_WIDTH '{}', using default", width);
            }
        }

        if let Ok(height) = std::env::var("WORLD_HEIGHT") {
            if let Ok(parsed) = height.parse::<f32>() {
                if parsed.is_finite() && parsed > 0.0 {
                    config.world_height = parsed;
                } else {
                    tracing::warn!("WORLD_HEIGHT must be positive, using default");
                }
            } else {
                tracing::warn!("Invalid WORLD_HEIGHT '{}', using default", height);
            }
        }

        if let Ok(max_viewers) = std::env::var("MAX_VIEWERS") {
            if let Ok(parsed) = max_viewers.parse::<usize>() {
                if parsed > 0 && parsed <= 100_000 {
                    config.max_viewers = parsed;
                } else {
                    tracing::warn!("MAX_VIEWERS must be 1-100000, using default");
                }
            } else {
                tracing::warn!("Invalid MAX_VIEWERS '{}', using default", max_viewers);
            }
        }

        if let Ok(interval) = std::env::var("TICK_INTERVAL_MS") {
            if let Ok(parsed) = interval.parse::<u64>() {
                if (1..=1000).contains(&parsed) {
                    config.tick_interval_ms = parsed;
                } else {
                    tracing::warn!("TICK_INTERVAL_MS must be 1-1000, using default");
                }
            } else {
                tracing::warn!("Invalid TICK_INTERVAL_MS '{}', using default", interval);
            }
        }

        if let Ok(timeout) = std::env::var("STALE_TIMEOUT_MS") {
            if let Ok(parsed) = timeout.parse::<u64>() {
                if parsed > 0 {
                    config.stale_timeout_ms = parsed;
                } else {
                    tracing::warn!("STALE_TIMEOUT_MS must be > 0, using default");
                }
            } else {
                tracing::warn!("Invalid STALE_TIMEOUT_MS '{}', using default", timeout);
            }
        }

        if let Ok(weights) = std::env::var("SCORE_WEIGHTS") {
            match parse_weights(&weights) {
                Some(parsed) => config.score_weights = parsed,
                None => tracing::warn!(
                    "SCORE_WEIGHTS must be 5 comma-separated values summing to 1, using default"
                ),
            }
        }

        if let Ok(sim_players) = std::env::var("SIM_PLAYERS") {
            if let Ok(parsed) = sim_players.parse::<usize>() {
                if parsed <= 10_000 {
                    config.sim_players = parsed;
                } else {
                    tracing::warn!("SIM_PLAYERS must be 0-10000, using default");
                }
            } else {
                tracing::warn!("Invalid SIM_PLAYERS '{}', using default", sim_players);
            }
        }

        if let Ok(sim_foods) = std::env::var("SIM_FOODS") {
            if let Ok(parsed) = sim_foods.parse::<usize>() {
                if parsed <= 100_000 {
                    config.sim_foods = parsed;
                } else {
                    tracing::warn!("SIM_FOODS must be 0-100000, using default");
                }
            } else {
                tracing::warn!("Invalid SIM_FOODS '{}', using default", sim_foods);
            }
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if !self.world_width.is_finite() || self.world_width <= 0.0 {
            return Err("world_width must be positive".to_string());
        }
        if !self.world_height.is_finite() || self.world_height <= 0.0 {
            return Err("world_height must be positive".to_string());
        }
        if self.max_viewers == 0 {
            return Err("max_viewers must be at least 1".to_string());
        }
        if self.tick_interval_ms == 0 || self.tick_interval_ms > 1000 {
            return Err("tick_interval_ms must be 1-1000".to_string());
        }
        if self.stale_timeout_ms == 0 {
            return Err("stale_timeout_ms must be > 0".to_string());
        }
        self.score_weights
            .validate()
            .map_err(|e| format!("score_weights: {}", e))?;
        Ok(())
    }

    /// Pipeline configuration derived from this server config
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            world_width: self.world_width,
            world_height: self.world_height,
            max_viewers: self.max_viewers,
            base_tick_interval_ms: self.tick_interval_ms,
            stale_timeout_ms: self.stale_timeout_ms,
            relevance: RelevanceConfig {
                weights: self.score_weights,
                ..RelevanceConfig::default()
            },
            ..OrchestratorConfig::default()
        }
    }
}

fn parse_weights(raw: &str) -> Option<ScoreWeights> {
    let parts: Vec<f32> = raw
        .split(',')
        .map(|p| p.trim().parse::<f32>())
        .collect::<Result<_, _>>()
        .ok()?;
    if parts.len() != 5 {
        return None;
    }
    let weights = ScoreWeights {
        distance: parts[0],
        size: parts[1],
        movement: parts[2],
        interaction: parts[3],
        kind: parts[4],
    };
    weights.validate().ok()?;
    Some(weights)
}
