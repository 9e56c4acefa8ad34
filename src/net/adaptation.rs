//! Degradation strategies and recovery under network pressure
//!
//! The controller evaluates aggregate conditions (latency, jitter, loss,
//! viewer count, congestion findings) against two-tier thresholds and applies
//! named bundles of primitive actions. A bundle already in the active set is
//! never applied twice, and a cooldown separates consecutive changes so one
//! bad sample cannot trigger a cascade. Under severe conditions the cooldown
//! is halved (close monitoring), floored at one second.
//!
//! Recovery is stepwise and ordered: cadence first, then compression, then
//! precision, then the residual flags. Each step needs a run of calm
//! evaluations before it fires.
//!
//! All knobs live in `SyncSettings` behind a shared lock; the send loop and
//! the codec read them fresh every iteration.

use std::collections::VecDeque;
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::net::monitor::CongestionLevel;

// ============================================================================
// Shared settings
// ============================================================================

/// Live tuning state read by the send loop, the codec, and the cadence
/// calculator. Written only by the adaptation controller and the global pace
/// recomputation.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSettings {
    /// Pace chosen from viewer load, before degradation
    pub base_tick_interval_ms: u64,
    /// Degradation multiplier on top of the base pace, 1.0 = none
    pub slowdown: f32,
    pub min_tick_interval_ms: u64,
    pub max_tick_interval_ms: u64,
    pub compression_enabled: bool,
    pub reduced_precision: bool,
    pub redundancy_enabled: bool,
    pub error_recovery_enabled: bool,
    pub scope_narrowed: bool,
    pub smoothing_aggressive: bool,
}

impl SyncSettings {
    pub fn baseline(tick_interval_ms: u64, min_ms: u64, max_ms: u64) -> Self {
        Self {
            base_tick_interval_ms: tick_interval_ms,
            slowdown: 1.0,
            min_tick_interval_ms: min_ms,
            max_tick_interval_ms: max_ms,
            compression_enabled: false,
            reduced_precision: false,
            redundancy_enabled: false,
            error_recovery_enabled: false,
            scope_narrowed: false,
            smoothing_aggressive: false,
        }
    }

    /// What the scheduler actually sleeps between send passes
    pub fn effective_tick_interval_ms(&self) -> u64 {
        let scaled = (self.base_tick_interval_ms as f32 * self.slowdown) as u64;
        scaled.clamp(self.min_tick_interval_ms, self.max_tick_interval_ms)
    }
}

pub type SharedSettings = Arc<RwLock<SyncSettings>>;

// ============================================================================
// Actions and bundles
// ============================================================================

/// Primitive degradation steps a bundle is built from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdaptationAction {
    ReduceCadence,
    EnableCompression,
    ReducePrecision,
    EnableRedundancy,
    NarrowScope,
    IncreaseSmoothing,
    EnableErrorRecovery,
}

/// Named, idempotent strategy bundles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BundleKind {
    HighLatency,
    SevereLatency,
    HighJitter,
    SevereJitter,
    HeavyLoss,
    SevereLoss,
    Crowded,
    Overloaded,
    CongestionMild,
    CongestionModerate,
    CongestionSevere,
}

impl BundleKind {
    pub fn name(&self) -> &'static str {
        match self {
            BundleKind::HighLatency => "high-latency",
            BundleKind::SevereLatency => "severe-latency",
            BundleKind::HighJitter => "high-jitter",
            BundleKind::SevereJitter => "severe-jitter",
            BundleKind::HeavyLoss => "heavy-loss",
            BundleKind::SevereLoss => "severe-loss",
            BundleKind::Crowded => "crowded",
            BundleKind::Overloaded => "overloaded",
            BundleKind::CongestionMild => "congestion-mild",
            BundleKind::CongestionModerate => "congestion-moderate",
            BundleKind::CongestionSevere => "congestion-severe",
        }
    }

    /// Ordered actions this bundle applies
    pub fn actions(&self) -> &'static [AdaptationAction] {
        use AdaptationAction::*;
        match self {
            BundleKind::HighLatency => &[ReduceCadence, EnableCompression],
            BundleKind::SevereLatency => {
                &[ReduceCadence, EnableCompression, ReducePrecision, EnableErrorRecovery]
            }
            BundleKind::HighJitter => &[IncreaseSmoothing],
            BundleKind::SevereJitter => &[IncreaseSmoothing, EnableRedundancy],
            BundleKind::HeavyLoss => &[EnableRedundancy],
            BundleKind::SevereLoss => &[EnableRedundancy, EnableErrorRecovery, ReduceCadence],
            BundleKind::Crowded => &[NarrowScope],
            BundleKind::Overloaded => &[NarrowScope, ReduceCadence, EnableCompression],
            BundleKind::CongestionMild => &[IncreaseSmoothing],
            BundleKind::CongestionModerate => &[ReduceCadence, EnableCompression],
            BundleKind::CongestionSevere => {
                &[ReduceCadence, EnableCompression, ReducePrecision, NarrowScope]
            }
        }
    }

    pub fn is_severe(&self) -> bool {
        matches!(
            self,
            BundleKind::SevereLatency
                | BundleKind::SevereJitter
                | BundleKind::SevereLoss
                | BundleKind::Overloaded
                | BundleKind::CongestionSevere
        )
    }

    /// Reporting weight; a higher value means a worse condition triggered it
    pub fn priority(&self) -> u8 {
        match self {
            BundleKind::CongestionSevere => 5,
            BundleKind::SevereLatency
            | BundleKind::SevereJitter
            | BundleKind::SevereLoss
            | BundleKind::Overloaded => 4,
            BundleKind::CongestionModerate => 3,
            BundleKind::HighLatency
            | BundleKind::HighJitter
            | BundleKind::HeavyLoss
            | BundleKind::Crowded => 2,
            BundleKind::CongestionMild => 1,
        }
    }
}

/// Mitigation bundle for a graded congestion finding
pub fn congestion_bundle(level: CongestionLevel) -> BundleKind {
    match level {
        CongestionLevel::Mild => BundleKind::CongestionMild,
        CongestionLevel::Moderate => BundleKind::CongestionModerate,
        CongestionLevel::Severe => BundleKind::CongestionSevere,
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptationThresholds {
    pub latency_moderate_ms: f32,
    pub latency_severe_ms: f32,
    pub jitter_moderate_ms: f32,
    pub jitter_severe_ms: f32,
    pub loss_moderate: f32,
    pub loss_severe: f32,
    pub viewers_moderate: usize,
    pub viewers_severe: usize,
}

impl Default for AdaptationThresholds {
    fn default() -> Self {
        Self {
            latency_moderate_ms: 150.0,
            latency_severe_ms: 300.0,
            jitter_moderate_ms: 30.0,
            jitter_severe_ms: 60.0,
            loss_moderate: 0.05,
            loss_severe: 0.15,
            viewers_moderate: 150,
            viewers_severe: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptationConfig {
    pub thresholds: AdaptationThresholds,
    /// Minimum gap between strategy changes
    pub cooldown_ms: u64,
    /// Cooldown floor while close monitoring halves it
    pub cooldown_floor_ms: u64,
    /// Geometric pace factor for one ReduceCadence step
    pub slowdown_factor: f32,
    /// Geometric pace factor for one recovery step
    pub speedup_factor: f32,
    /// Ceiling for the accumulated slowdown multiplier
    pub max_slowdown: f32,
    /// Condition snapshots kept
    pub history_size: usize,
    /// Calm snapshots required before a recovery step
    pub recovery_window: usize,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            thresholds: AdaptationThresholds::default(),
            cooldown_ms: 5_000,
            cooldown_floor_ms: 1_000,
            slowdown_factor: 1.25,
            speedup_factor: 0.8,
            max_slowdown: 4.0,
            history_size: 120,
            recovery_window: 5,
        }
    }
}

// ============================================================================
// Inputs, history, events
// ============================================================================

/// Aggregate conditions for one evaluation
#[derive(Debug, Clone, Copy, Default)]
pub struct AdaptationInputs {
    pub mean_latency_ms: f32,
    pub mean_jitter_ms: f32,
    pub loss_rate: f32,
    pub viewer_count: usize,
    pub congestion: Option<CongestionLevel>,
}

/// One recorded evaluation
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ConditionSnapshot {
    pub at_ms: u64,
    pub latency_ms: f32,
    pub jitter_ms: f32,
    pub loss_rate: f32,
    pub viewer_count: usize,
}

/// Which knob a recovery step turned back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecoveryStep {
    RestoreCadence,
    DisableCompression,
    RestorePrecision,
    ClearResidual,
}

/// Measurement that pushed a bundle over its threshold
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum BundleReason {
    Latency { ms: f32 },
    Jitter { ms: f32 },
    Loss { rate: f32 },
    ViewerPressure { count: usize },
    Congestion { level: CongestionLevel },
}

/// Emitted whenever the controller changes anything
#[derive(Debug, Clone)]
pub enum AdaptationEvent {
    BundleApplied {
        bundle: BundleKind,
        /// Measurement that crossed the threshold
        reason: BundleReason,
        priority: u8,
        at_ms: u64,
    },
    Recovered { step: RecoveryStep, at_ms: u64 },
}

// ============================================================================
// Controller
// ============================================================================

pub struct AdaptationController {
    config: AdaptationConfig,
    settings: SharedSettings,
    active: FxHashSet<BundleKind>,
    history: VecDeque<ConditionSnapshot>,
    last_change_at_ms: Option<u64>,
    close_monitoring: bool,
    events_tx: Sender<AdaptationEvent>,
    events_rx: Receiver<AdaptationEvent>,
}

impl AdaptationController {
    pub fn new(config: AdaptationConfig, settings: SharedSettings) -> Self {
        let (events_tx, events_rx) = bounded(256);
        let history_size = config.history_size;
        Self {
            config,
            settings,
            active: FxHashSet::default(),
            history: VecDeque::with_capacity(history_size),
            last_change_at_ms: None,
            close_monitoring: false,
            events_tx,
            events_rx,
        }
    }

    /// Non-blocking event feed; one consumer expected
    pub fn event_receiver(&self) -> Receiver<AdaptationEvent> {
        self.events_rx.clone()
    }

    pub fn active_bundles(&self) -> Vec<BundleKind> {
        self.active.iter().copied().collect()
    }

    pub fn is_close_monitoring(&self) -> bool {
        self.close_monitoring
    }

    /// Last `n` condition snapshots, oldest first
    pub fn recent_history(&self, n: usize) -> Vec<ConditionSnapshot> {
        let skip = self.history.len().saturating_sub(n);
        self.history.iter().skip(skip).copied().collect()
    }

    /// Gap currently required between changes
    pub fn cooldown_ms(&self) -> u64 {
        if self.close_monitoring {
            (self.config.cooldown_ms / 2).max(self.config.cooldown_floor_ms)
        } else {
            self.config.cooldown_ms
        }
    }

    /// One evaluation pass. Records the snapshot unconditionally; applies new
    /// bundles or a recovery step only when the cooldown has elapsed. Returns
    /// the bundles applied this pass.
    pub fn evaluate(&mut self, inputs: &AdaptationInputs, now_ms: u64) -> Vec<BundleKind> {
        self.record_snapshot(inputs, now_ms);

        if let Some(last) = self.last_change_at_ms {
            if now_ms.saturating_sub(last) < self.cooldown_ms() {
                return Vec::new();
            }
        }

        let desired = self.assess(inputs);
        let fresh: Vec<(BundleKind, BundleReason)> = desired
            .iter()
            .copied()
            .filter(|(kind, _)| !self.active.contains(kind))
            .collect();

        if !fresh.is_empty() {
            for (bundle, reason) in &fresh {
                self.apply_bundle(*bundle, *reason, now_ms);
            }
            self.close_monitoring = self.active.iter().any(|b| b.is_severe());
            self.last_change_at_ms = Some(now_ms);
            return fresh.into_iter().map(|(kind, _)| kind).collect();
        }

        if self.try_recovery_step(now_ms) {
            self.last_change_at_ms = Some(now_ms);
        }
        Vec::new()
    }

    /// Map conditions onto bundle names, worst tier wins per signal. Each
    /// bundle carries the measurement that tripped it.
    fn assess(&self, inputs: &AdaptationInputs) -> SmallVec<[(BundleKind, BundleReason); 8]> {
        let t = &self.config.thresholds;
        let mut bundles = SmallVec::new();

        let latency = BundleReason::Latency { ms: inputs.mean_latency_ms };
        if inputs.mean_latency_ms >= t.latency_severe_ms {
            bundles.push((BundleKind::SevereLatency, latency));
        } else if inputs.mean_latency_ms >= t.latency_moderate_ms {
            bundles.push((BundleKind::HighLatency, latency));
        }

        let jitter = BundleReason::Jitter { ms: inputs.mean_jitter_ms };
        if inputs.mean_jitter_ms >= t.jitter_severe_ms {
            bundles.push((BundleKind::SevereJitter, jitter));
        } else if inputs.mean_jitter_ms >= t.jitter_moderate_ms {
            bundles.push((BundleKind::HighJitter, jitter));
        }

        let loss = BundleReason::Loss { rate: inputs.loss_rate };
        if inputs.loss_rate >= t.loss_severe {
            bundles.push((BundleKind::SevereLoss, loss));
        } else if inputs.loss_rate >= t.loss_moderate {
            bundles.push((BundleKind::HeavyLoss, loss));
        }

        let pressure = BundleReason::ViewerPressure { count: inputs.viewer_count };
        if inputs.viewer_count >= t.viewers_severe {
            bundles.push((BundleKind::Overloaded, pressure));
        } else if inputs.viewer_count >= t.viewers_moderate {
            bundles.push((BundleKind::Crowded, pressure));
        }

        if let Some(level) = inputs.congestion {
            bundles.push((congestion_bundle(level), BundleReason::Congestion { level }));
        }

        bundles
    }

    fn apply_bundle(&mut self, bundle: BundleKind, reason: BundleReason, now_ms: u64) {
        {
            let mut settings = self.settings.write();
            for action in bundle.actions() {
                Self::apply_action(&mut settings, *action, &self.config);
            }
        }
        self.active.insert(bundle);
        tracing::info!(
            bundle = bundle.name(),
            priority = bundle.priority(),
            reason = ?reason,
            actions = ?bundle.actions(),
            "adaptation bundle applied"
        );
        self.emit(AdaptationEvent::BundleApplied {
            bundle,
            reason,
            priority: bundle.priority(),
            at_ms: now_ms,
        });
    }

    fn apply_action(settings: &mut SyncSettings, action: AdaptationAction, config: &AdaptationConfig) {
        match action {
            AdaptationAction::ReduceCadence => {
                settings.slowdown =
                    (settings.slowdown * config.slowdown_factor).min(config.max_slowdown);
            }
            AdaptationAction::EnableCompression => settings.compression_enabled = true,
            AdaptationAction::ReducePrecision => settings.reduced_precision = true,
            AdaptationAction::EnableRedundancy => settings.redundancy_enabled = true,
            AdaptationAction::NarrowScope => settings.scope_narrowed = true,
            AdaptationAction::IncreaseSmoothing => settings.smoothing_aggressive = true,
            AdaptationAction::EnableErrorRecovery => settings.error_recovery_enabled = true,
        }
    }

    /// The last `recovery_window` snapshots must all sit comfortably below
    /// the severe tier before anything is turned back
    fn conditions_calm(&self) -> bool {
        if self.history.len() < self.config.recovery_window {
            return false;
        }
        let t = &self.config.thresholds;
        self.history
            .iter()
            .rev()
            .take(self.config.recovery_window)
            .all(|s| {
                s.latency_ms < t.latency_severe_ms * 0.8
                    && s.loss_rate < t.loss_severe * 0.5
                    && s.viewer_count < t.viewers_severe
            })
    }

    /// Reverse one thing, in the fixed order: cadence, compression,
    /// precision, then the residual flags in one sweep
    fn try_recovery_step(&mut self, now_ms: u64) -> bool {
        if !self.conditions_calm() {
            return false;
        }

        let step = {
            let mut settings = self.settings.write();
            if settings.slowdown > 1.0 {
                settings.slowdown = (settings.slowdown * self.config.speedup_factor).max(1.0);
                if settings.slowdown <= 1.001 {
                    settings.slowdown = 1.0;
                }
                Some(RecoveryStep::RestoreCadence)
            } else if settings.compression_enabled {
                settings.compression_enabled = false;
                Some(RecoveryStep::DisableCompression)
            } else if settings.reduced_precision {
                settings.reduced_precision = false;
                Some(RecoveryStep::RestorePrecision)
            } else if settings.redundancy_enabled
                || settings.scope_narrowed
                || settings.smoothing_aggressive
                || settings.error_recovery_enabled
            {
                settings.redundancy_enabled = false;
                settings.scope_narrowed = false;
                settings.smoothing_aggressive = false;
                settings.error_recovery_enabled = false;
                Some(RecoveryStep::ClearResidual)
            } else {
                None
            }
        };

        let Some(step) = step else {
            if !self.active.is_empty() {
                self.active.clear();
                self.close_monitoring = false;
            }
            return false;
        };

        match step {
            RecoveryStep::RestoreCadence => {
                let restored = self.settings.read().slowdown <= 1.0;
                if restored {
                    self.retire_bundles_with(AdaptationAction::ReduceCadence);
                }
            }
            RecoveryStep::DisableCompression => {
                self.retire_bundles_with(AdaptationAction::EnableCompression);
            }
            RecoveryStep::RestorePrecision => {
                self.retire_bundles_with(AdaptationAction::ReducePrecision);
            }
            RecoveryStep::ClearResidual => {
                self.active.clear();
                self.close_monitoring = false;
            }
        }

        tracing::info!(step = ?step, "adaptation recovery step");
        self.emit(AdaptationEvent::Recovered { step, at_ms: now_ms });
        true
    }

    /// Bundles whose actions were just reversed may fire again
    fn retire_bundles_with(&mut self, action: AdaptationAction) {
        self.active.retain(|b| !b.actions().contains(&action));
    }

    fn record_snapshot(&mut self, inputs: &AdaptationInputs, now_ms: u64) {
        if self.history.len() >= self.config.history_size {
            self.history.pop_front();
        }
        self.history.push_back(ConditionSnapshot {
            at_ms: now_ms,
            latency_ms: inputs.mean_latency_ms,
            jitter_ms: inputs.mean_jitter_ms,
            loss_rate: inputs.loss_rate,
            viewer_count: inputs.viewer_count,
        });
    }

    fn emit(&self, event: AdaptationEvent) {
        // Observers are optional; a full buffer just drops the event
        let _ = self.events_tx.try_send(event);
    }
}
