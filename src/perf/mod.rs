//! CPU-adaptive performance control for the detection loop.
//! A CPU reading is taken at most every `cpu_check_interval`; in between,
//! `sample()` hands back the cached profile.
//!
//! Two outputs per reading:
//! - adaptive frame skip, driven by the instantaneous reading with a
//!   hysteresis band between the low and high thresholds;
//! - a profile tier (detector size, pacing), driven by the mean of a
//!   rolling window of readings.

pub mod cpu;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::PerformanceConfig;
use crate::metrics::{metric_names, MetricsRegistry, SampleRing};
use cpu::CpuSampler;

/// Coarse load tier selecting a detector/pacing preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PerformanceTier {
    Performance,
    Balanced,
    Economy,
}

impl std::fmt::Display for PerformanceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PerformanceTier::Performance => write!(f, "performance"),
            PerformanceTier::Balanced => write!(f, "balanced"),
            PerformanceTier::Economy => write!(f, "economy"),
        }
    }
}

/// Read-only pacing/detector snapshot consumed by the tracker each cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceProfile {
    pub tier: PerformanceTier,
    pub detection_size: (u32, u32),
    pub camera_resolution: (u32, u32),
    pub target_fps: u32,
    pub detection_interval: Duration,
    pub frame_skip_when_absent: u32,
    pub sleep_multiplier: f64,
}

impl PerformanceProfile {
    /// Build the preset for `tier`. `base_frame_skip` is the static absent-skip
    /// floor, scaled up by the tier's sleep multiplier.
    pub fn for_tier(tier: PerformanceTier, base_frame_skip: u32) -> Self {
        let (detection_size, camera_resolution, target_fps, interval_ms, sleep_multiplier) =
            match tier {
                PerformanceTier::Performance => ((640, 640), (640, 480), 3, 600, 1.0),
                PerformanceTier::Balanced => ((480, 480), (640, 480), 2, 800, 1.5),
                PerformanceTier::Economy => ((320, 320), (320, 240), 1, 1200, 2.0),
            };
        let scaled = (base_frame_skip as f64 * sleep_multiplier).floor() as u32;
        Self {
            tier,
            detection_size,
            camera_resolution,
            target_fps,
            detection_interval: Duration::from_millis(interval_ms),
            frame_skip_when_absent: base_frame_skip.max(scaled),
            sleep_multiplier,
        }
    }

    /// Profile used whenever CPU sampling is unavailable.
    pub fn fallback(base_frame_skip: u32) -> Self {
        Self::for_tier(PerformanceTier::Balanced, base_frame_skip)
    }

    /// Minimum spacing between accepted frames.
    pub fn frame_time(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.target_fps.max(1) as f64)
    }

    /// Scale a base sleep by this profile's multiplier.
    pub fn scaled_sleep(&self, base: Duration) -> Duration {
        base.mul_f64(self.sleep_multiplier)
    }
}

/// Samples CPU load and maps it onto a [`PerformanceProfile`].
pub struct PerformanceOptimizer {
    sampler: Box<dyn CpuSampler>,
    cfg: PerformanceConfig,
    check_interval: Duration,
    window: SampleRing,
    adaptive_skip: u32,
    last_check: Option<Instant>,
    profile: PerformanceProfile,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl PerformanceOptimizer {
    pub fn new(sampler: Box<dyn CpuSampler>, cfg: PerformanceConfig) -> Self {
        let profile = PerformanceProfile::fallback(cfg.base_frame_skip);
        Self {
            sampler,
            check_interval: Duration::from_secs_f64(cfg.cpu_check_interval_secs),
            window: SampleRing::new(cfg.cpu_window),
            adaptive_skip: 0,
            last_check: None,
            profile,
            cfg,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Current profile; takes a fresh CPU reading only if the check interval
    /// has elapsed since the previous one. Never fails.
    pub fn sample(&mut self, now: Instant) -> PerformanceProfile {
        if let Some(last) = self.last_check {
            if now.saturating_duration_since(last) < self.check_interval {
                return self.profile;
            }
        }
        self.last_check = Some(now);

        match self.sampler.sample() {
            Ok(percent) => self.apply_reading(percent),
            Err(e) => {
                warn!(error = %e, "cpu sampling failed, using fallback profile");
                self.adaptive_skip = 0;
                self.profile = PerformanceProfile::fallback(self.cfg.base_frame_skip);
            }
        }
        self.profile
    }

    /// Adaptive component of the absent frame skip (0..=max_adaptive_skip).
    pub fn adaptive_frame_skip(&self) -> u32 {
        self.adaptive_skip
    }

    /// Total number of frames to skip per absent stretch.
    pub fn absent_skip_budget(&self, profile: &PerformanceProfile) -> u32 {
        profile.frame_skip_when_absent + self.adaptive_skip
    }

    fn apply_reading(&mut self, percent: f32) {
        if let Some(m) = &self.metrics {
            m.record(metric_names::CPU_PERCENT, percent as f64);
        }

        let before = self.adaptive_skip;
        if percent > self.cfg.cpu_high_threshold {
            self.adaptive_skip = (self.adaptive_skip + 2).min(self.cfg.max_adaptive_skip);
            if self.adaptive_skip != before {
                info!(cpu = percent, frame_skip = self.adaptive_skip, "high_cpu_increase_skip");
            }
        } else if percent < self.cfg.cpu_low_threshold {
            self.adaptive_skip = self.adaptive_skip.saturating_sub(1);
        }

        self.window.push(percent as f64);
        let mean = self.window.mean().unwrap_or(percent as f64) as f32;
        let tier = if mean > self.cfg.cpu_high_threshold {
            PerformanceTier::Economy
        } else if mean < self.cfg.cpu_low_threshold {
            PerformanceTier::Performance
        } else {
            PerformanceTier::Balanced
        };

        if tier != self.profile.tier {
            info!(from = %self.profile.tier, to = %tier, cpu_mean = mean, "performance_tier_change");
        }
        self.profile = PerformanceProfile::for_tier(tier, self.cfg.base_frame_skip);
        debug!(cpu = percent, cpu_mean = mean, frame_skip = self.adaptive_skip, "cpu_sampled");
    }
}
