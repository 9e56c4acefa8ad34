//! Per-connection latency tracking and aggregate congestion detection
//!
//! `ConnectionMetrics` keeps a bounded raw RTT window per viewer and derives
//! smoothed latency, jitter, link quality, and a loss estimate from it.
//! Smoothing uses an EMA whose weight adapts to the measured jitter, with a
//! 3-sigma gate that keeps single outliers from yanking the estimate. The
//! outlier still lands in the raw window, so a genuine latency shift widens
//! the window's deviation and passes the gate within a few samples.
//!
//! `CongestionDetector` works on the aggregate: recent means for latency,
//! loss, and jitter against their older baselines, each channel graded into
//! three spike levels against its own threshold, the worst channel winning.
//! With too little data it reports nothing rather than guessing.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Raw RTT samples kept per connection
    pub window_size: usize,
    /// Deviations beyond this many sigmas bypass the EMA
    pub outlier_sigma: f32,
    /// EMA weight under ordinary jitter
    pub alpha_default: f32,
    /// EMA weight when jitter is high (track the swings quickly)
    pub alpha_high_jitter: f32,
    /// EMA weight when the link is very steady
    pub alpha_low_jitter: f32,
    /// Jitter above this selects the high weight (ms)
    pub high_jitter_ms: f32,
    /// Jitter below this selects the low weight (ms)
    pub low_jitter_ms: f32,
    /// Consecutive timeouts before the link counts as unstable
    pub unstable_timeout_count: u32,
    /// Ping outcomes kept for the loss estimate
    pub outcome_window: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            outlier_sigma: 3.0,
            alpha_default: 0.3,
            alpha_high_jitter: 0.5,
            alpha_low_jitter: 0.1,
            high_jitter_ms: 30.0,
            low_jitter_ms: 5.0,
            unstable_timeout_count: 3,
            outcome_window: 50,
        }
    }
}

// ============================================================================
// Link quality
// ============================================================================

/// Coarse link grade derived from smoothed latency, jitter, and loss
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl LinkQuality {
    /// Latency/jitter band edges in ms, loss as a rate. A band requires all
    /// three metrics under its edges, so one bad metric alone degrades the
    /// grade.
    pub fn classify(latency_ms: f32, jitter_ms: f32, loss_rate: f32) -> Self {
        if latency_ms < 80.0 && jitter_ms < 15.0 && loss_rate < 0.02 {
            LinkQuality::Excellent
        } else if latency_ms < 140.0 && jitter_ms < 35.0 && loss_rate < 0.08 {
            LinkQuality::Good
        } else if latency_ms < 250.0 && jitter_ms < 75.0 && loss_rate < 0.20 {
            LinkQuality::Fair
        } else {
            LinkQuality::Poor
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, LinkQuality::Fair | LinkQuality::Poor)
    }
}

// ============================================================================
// Per-connection metrics
// ============================================================================

/// Latency state for one viewer connection
#[derive(Debug, Clone)]
pub struct ConnectionMetrics {
    config: MonitorConfig,
    samples: VecDeque<f32>,
    smoothed_rtt: Option<f32>,
    consecutive_timeouts: u32,
    outcomes: VecDeque<bool>,
    last_sample_at_ms: Option<u64>,
}

impl ConnectionMetrics {
    pub fn new(config: MonitorConfig) -> Self {
        let window = config.window_size;
        let outcomes = config.outcome_window;
        Self {
            config,
            samples: VecDeque::with_capacity(window),
            smoothed_rtt: None,
            consecutive_timeouts: 0,
            outcomes: VecDeque::with_capacity(outcomes),
            last_sample_at_ms: None,
        }
    }

    /// Feed one measured round trip. The raw window always takes the sample;
    /// the smoothed estimate only follows it when it passes the outlier gate.
    pub fn record_rtt(&mut self, sample_ms: f32, now_ms: u64, aggressive: bool) {
        if !sample_ms.is_finite() || sample_ms < 0.0 {
            return;
        }
        let jitter_before = self.jitter();

        if self.samples.len() >= self.config.window_size {
            self.samples.pop_front();
        }
        self.samples.push_back(sample_ms);
        self.push_outcome(true);
        self.consecutive_timeouts = 0;
        self.last_sample_at_ms = Some(now_ms);

        match self.smoothed_rtt {
            None => self.smoothed_rtt = Some(sample_ms),
            Some(smoothed) => {
                // Zero measured jitter gives the gate no scale, so it stays
                // open until the window has some spread
                let outlier = jitter_before > 0.0
                    && (sample_ms - smoothed).abs() > self.config.outlier_sigma * jitter_before;
                if !outlier {
                    let alpha = self.current_alpha(aggressive);
                    self.smoothed_rtt = Some(smoothed + alpha * (sample_ms - smoothed));
                }
                // Outliers keep the previous smoothed value
            }
        }
    }

    /// A probe went unanswered
    pub fn record_timeout(&mut self) {
        self.consecutive_timeouts += 1;
        self.push_outcome(false);
    }

    /// The viewer confirmed a delivered frame: ends any timeout streak and
    /// counts as a success in the loss window
    pub fn record_ack(&mut self) {
        self.consecutive_timeouts = 0;
        self.push_outcome(true);
    }

    fn push_outcome(&mut self, delivered: bool) {
        if self.outcomes.len() >= self.config.outcome_window {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(delivered);
    }

    /// EMA weight for the next sample, picked from the measured jitter
    pub fn current_alpha(&self, aggressive: bool) -> f32 {
        let jitter = self.jitter();
        let alpha = if jitter > self.config.high_jitter_ms {
            self.config.alpha_high_jitter
        } else if jitter < self.config.low_jitter_ms {
            self.config.alpha_low_jitter
        } else {
            self.config.alpha_default
        };
        if aggressive {
            alpha.max(self.config.alpha_high_jitter)
        } else {
            alpha
        }
    }

    pub fn smoothed_rtt(&self) -> Option<f32> {
        self.smoothed_rtt
    }

    /// Population standard deviation of the raw window (0 with under two
    /// samples)
    pub fn jitter(&self) -> f32 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let n = self.samples.len() as f32;
        let mean = self.samples.iter().sum::<f32>() / n;
        let variance = self
            .samples
            .iter()
            .map(|s| (s - mean) * (s - mean))
            .sum::<f32>()
            / n;
        variance.sqrt()
    }

    /// None until at least one sample has arrived
    pub fn quality(&self) -> Option<LinkQuality> {
        self.smoothed_rtt
            .map(|rtt| LinkQuality::classify(rtt, self.jitter(), self.loss_rate()))
    }

    /// Too many probes in a row went unanswered
    pub fn is_unstable(&self) -> bool {
        self.consecutive_timeouts >= self.config.unstable_timeout_count
    }

    /// Fraction of recent probes that never came back
    pub fn loss_rate(&self) -> f32 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let lost = self.outcomes.iter().filter(|ok| !**ok).count();
        lost as f32 / self.outcomes.len() as f32
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Milliseconds since the last answered probe, None before the first
    pub fn sample_age_ms(&self, now_ms: u64) -> Option<u64> {
        self.last_sample_at_ms
            .map(|at| now_ms.saturating_sub(at))
    }
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

// ============================================================================
// Aggregate congestion
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CongestionConfig {
    /// Aggregate sample points kept
    pub window_size: usize,
    /// Points counted as "recent" for the spike comparison
    pub recent_count: usize,
    /// Latency spike grading unit (ms above baseline)
    pub latency_spike_ms: f32,
    /// Loss spike grading unit (rate above baseline)
    pub loss_spike: f32,
    /// Jitter spike grading unit (ms above baseline)
    pub jitter_spike_ms: f32,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            window_size: 30,
            recent_count: 3,
            latency_spike_ms: 50.0,
            loss_spike: 0.05,
            jitter_spike_ms: 20.0,
        }
    }
}

/// One aggregate reading across the viewer population
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkSample {
    pub latency_ms: f32,
    pub loss_rate: f32,
    pub jitter_ms: f32,
}

/// Spike grade, mild to severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CongestionLevel {
    Mild,
    Moderate,
    Severe,
}

impl CongestionLevel {
    pub fn severity(&self) -> u8 {
        match self {
            CongestionLevel::Mild => 1,
            CongestionLevel::Moderate => 2,
            CongestionLevel::Severe => 3,
        }
    }

    pub fn is_severe(&self) -> bool {
        matches!(self, CongestionLevel::Severe)
    }
}

/// The channel a spike was measured on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CongestionSignal {
    Latency,
    Loss,
    Jitter,
}

/// One positive congestion finding
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CongestionReport {
    pub level: CongestionLevel,
    /// The channel whose spike graded highest
    pub signal: CongestionSignal,
    /// How far the recent mean sits above the baseline, in the channel's unit
    pub spike: f32,
    pub recent_mean: f32,
    pub baseline_mean: f32,
}

/// Detects latency, loss, and jitter spikes across the whole viewer
/// population
#[derive(Debug, Clone)]
pub struct CongestionDetector {
    config: CongestionConfig,
    points: VecDeque<NetworkSample>,
}

impl CongestionDetector {
    pub fn new(config: CongestionConfig) -> Self {
        let window = config.window_size;
        Self {
            config,
            points: VecDeque::with_capacity(window),
        }
    }

    /// Feed one aggregate observation (means across viewers)
    pub fn record(&mut self, sample: NetworkSample) {
        let valid = |v: f32| v.is_finite() && v >= 0.0;
        if !valid(sample.latency_ms) || !valid(sample.loss_rate) || !valid(sample.jitter_ms) {
            return;
        }
        if self.points.len() >= self.config.window_size {
            self.points.pop_front();
        }
        self.points.push_back(sample);
    }

    /// Compare recent points against the older baseline, channel by channel,
    /// each graded against its own threshold. The worst channel wins;
    /// latency breaks ties. With fewer than `recent_count` points, or no
    /// baseline to compare against, this has no opinion and returns None.
    pub fn detect(&self) -> Option<CongestionReport> {
        if self.points.len() <= self.config.recent_count {
            return None;
        }
        let channels = [
            (CongestionSignal::Latency, self.config.latency_spike_ms),
            (CongestionSignal::Loss, self.config.loss_spike),
            (CongestionSignal::Jitter, self.config.jitter_spike_ms),
        ];

        let mut worst: Option<CongestionReport> = None;
        for (signal, threshold) in channels {
            let (baseline_mean, recent_mean) = self.channel_means(signal);
            let spike = recent_mean - baseline_mean;
            let level = if spike > 2.0 * threshold {
                CongestionLevel::Severe
            } else if spike > threshold {
                CongestionLevel::Moderate
            } else if spike > 0.5 * threshold {
                CongestionLevel::Mild
            } else {
                continue;
            };
            if worst.as_ref().map_or(true, |w| level > w.level) {
                worst = Some(CongestionReport {
                    level,
                    signal,
                    spike,
                    recent_mean,
                    baseline_mean,
                });
            }
        }
        worst
    }

    fn channel_means(&self, signal: CongestionSignal) -> (f32, f32) {
        let split = self.points.len() - self.config.recent_count;
        let pick = |p: &NetworkSample| match signal {
            CongestionSignal::Latency => p.latency_ms,
            CongestionSignal::Loss => p.loss_rate,
            CongestionSignal::Jitter => p.jitter_ms,
        };
        let baseline = self.points.iter().take(split).map(pick).sum::<f32>() / split as f32;
        let recent = self.points.iter().skip(split).map(pick).sum::<f32>()
            / self.config.recent_count as f32;
        (baseline, recent)
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }
}

impl Default for CongestionDetector {
    fn default() -> Self {
        Self::new(CongestionConfig::default())
    }
}
