//! Per-viewer send rate limiting
//!
//! Fixed one-second windows with a burst credit on top: a viewer that sat
//! quiet for a window may briefly exceed the steady cap, while sustained
//! overuse exhausts the credit and stays pinned at the cap. Refused
//! acquisitions count as violations so persistent offenders can be dropped.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Steady-state acquisitions per window
    pub max_per_window: u32,
    /// Window length (ms)
    pub window_ms: u64,
    /// Extra acquisitions available after a quiet window
    pub burst_allowance: u32,
    /// Refusals before the viewer counts as abusive
    pub violations_before_drop: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_window: 60,
            window_ms: 1_000,
            burst_allowance: 10,
            violations_before_drop: 120,
        }
    }
}

/// Fixed-window limiter for one viewer
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    window_start_ms: u64,
    count: u32,
    burst_credit: u32,
    violations: u32,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let burst = config.burst_allowance;
        Self {
            config,
            window_start_ms: 0,
            count: 0,
            burst_credit: burst,
            violations: 0,
        }
    }

    /// Take one slot. Refusals are recorded as violations.
    pub fn try_acquire(&mut self, now_ms: u64) -> bool {
        self.roll_window(now_ms);

        if self.count < self.config.max_per_window {
            self.count += 1;
            return true;
        }
        if self.burst_credit > 0 {
            self.burst_credit -= 1;
            self.count += 1;
            return true;
        }
        self.violations += 1;
        false
    }

    fn roll_window(&mut self, now_ms: u64) {
        if now_ms.saturating_sub(self.window_start_ms) >= self.config.window_ms {
            // Burst credit only refills after a window that stayed under the
            // cap; a saturated window keeps whatever credit is left
            if self.count < self.config.max_per_window {
                self.burst_credit = self.config.burst_allowance;
            }
            self.window_start_ms = now_ms;
            self.count = 0;
        }
    }

    pub fn violations(&self) -> u32 {
        self.violations
    }

    /// Enough refusals accumulated to warrant dropping the viewer
    pub fn is_abusive(&self) -> bool {
        self.violations >= self.config.violations_before_drop
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.burst_credit = self.config.burst_allowance;
        self.violations = 0;
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32, burst: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_per_window: max,
            window_ms: 1_000,
            burst_allowance: burst,
            violations_before_drop: 5,
        })
    }

    #[test]
    fn test_within_limit_passes() {
        let mut rl = limiter(3, 0);
        assert!(rl.try_acquire(1_000));
        assert!(rl.try_acquire(1_100));
        assert!(rl.try_acquire(1_200));
        assert!(!rl.try_acquire(1_300));
        assert_eq!(rl.violations(), 1);
    }

    #[test]
    fn test_window_rollover_resets_count() {
        let mut rl = limiter(2, 0);
        assert!(rl.try_acquire(1_000));
        assert!(rl.try_acquire(1_100));
        assert!(!rl.try_acquire(1_200));

        // Next window
        assert!(rl.try_acquire(2_100));
        assert!(rl.try_acquire(2_200));
    }

    #[test]
    fn test_burst_extends_cap() {
        let mut rl = limiter(2, 2);
        // Steady cap plus both credits
        assert!(rl.try_acquire(1_000));
        assert!(rl.try_acquire(1_010));
        assert!(rl.try_acquire(1_020));
        assert!(rl.try_acquire(1_030));
        assert!(!rl.try_acquire(1_040));
    }

    #[test]
    fn test_burst_refills_after_quiet_window() {
        let mut rl = limiter(2, 2);
        // Exhaust cap and burst
        for t in [1_000, 1_010, 1_020, 1_030] {
            assert!(rl.try_acquire(t));
        }
        assert!(!rl.try_acquire(1_040));

        // Saturated window rolls over: count resets but no refill
        assert!(rl.try_acquire(2_100));
        assert!(rl.try_acquire(2_110));
        assert!(!rl.try_acquire(2_120), "no burst credit after saturation");

        // A quiet window follows, credit comes back
        assert!(rl.try_acquire(3_200));
        rl.try_acquire(4_300); // quiet window boundary, one use
        for t in [5_400, 5_410, 5_420, 5_430] {
            assert!(rl.try_acquire(t));
        }
    }

    #[test]
    fn test_abusive_after_repeated_refusals() {
        let mut rl = limiter(1, 0);
        assert!(rl.try_acquire(1_000));
        for t in 0..5 {
            assert!(!rl.try_acquire(1_010 + t));
        }
        assert!(rl.is_abusive());

        rl.reset();
        assert!(!rl.is_abusive());
        assert_eq!(rl.violations(), 0);
    }
}
