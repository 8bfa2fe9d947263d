//! Presence tracker loop. Runs on its own OS thread: camera grabs and detector
//! calls block.
//!
//! Per cycle:
//! 1. take the optimizer's profile (new profiles adopted at most every
//!    `profile_refresh_secs`)
//! 2. throttle to the profile's frame rate
//! 3. grab a frame (failure ends the loop)
//! 4. during an absence episode, skip up to the absent-skip budget of frames
//! 5. detect if the detection interval elapsed, else reuse the cached faces
//! 6. fold faces into [`PresenceState`]
//! 7. fire the one-shot greeting
//! 8. publish the snapshot (presence handle + status publisher)
//! 9. overlay, metrics, pacing sleep

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::{Observation, PresenceHandle, PresenceState, Transition};
use crate::cancellation::StopFlag;
use crate::config::{KioskConfig, PresenceConfig};
use crate::detect::{DetectError, DetectionFrame, FaceDetector, Frame, Overlay, VideoSource};
use crate::dispatch::Dispatcher;
use crate::metrics::{metric_names, MetricsRegistry};
use crate::perf::{PerformanceOptimizer, PerformanceProfile};
use crate::status::{PresenceUpdate, StatusPublisher};

const THROTTLE_SLEEP: Duration = Duration::from_millis(50);
const ABSENT_SKIP_SLEEP: Duration = Duration::from_millis(100);
const HEADLESS_CYCLE_SLEEP: Duration = Duration::from_millis(150);
const OVERLAY_CYCLE_SLEEP: Duration = Duration::from_millis(30);
const SUMMARY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("video source lost: {0}")]
    SourceLost(#[source] DetectError),
}

/// Camera, detector and optional overlay.
pub struct TrackerIo {
    pub source: Arc<dyn VideoSource>,
    pub detector: Arc<dyn FaceDetector>,
    pub overlay: Option<Arc<dyn Overlay>>,
}

/// Units the tracker reports to.
pub struct TrackerSinks {
    pub dispatcher: Arc<Dispatcher>,
    pub publisher: Arc<StatusPublisher>,
    pub presence: Arc<PresenceHandle>,
    pub metrics: Arc<MetricsRegistry>,
}

pub struct PresenceTracker {
    io: TrackerIo,
    sinks: TrackerSinks,
    optimizer: PerformanceOptimizer,
    cfg: PresenceConfig,
    profile_refresh: Duration,
    stop: StopFlag,
}

impl PresenceTracker {
    pub fn new(
        io: TrackerIo,
        sinks: TrackerSinks,
        optimizer: PerformanceOptimizer,
        cfg: &KioskConfig,
        stop: StopFlag,
    ) -> Self {
        Self {
            io,
            sinks,
            optimizer,
            cfg: cfg.presence.clone(),
            profile_refresh: Duration::from_secs_f64(cfg.performance.profile_refresh_secs),
            stop,
        }
    }

    fn apply_profile(&self, profile: &PerformanceProfile) {
        if let Err(e) = self.io.source.configure(profile) {
            warn!(error = %e, tier = %profile.tier, "video source rejected profile");
        }
        if let Err(e) = self.io.detector.configure(profile) {
            warn!(error = %e, tier = %profile.tier, "detector rejected profile");
        }
    }

    /// Drive the loop until the stop flag is raised or the video source is lost.
    pub fn run(mut self) -> Result<(), TrackerError> {
        let mut state = PresenceState::new();
        let mut cached: DetectionFrame = Vec::new();

        let started = Instant::now();
        let mut profile = self.optimizer.sample(started);
        self.apply_profile(&profile);
        let mut last_profile_at = started;
        let mut last_frame_at: Option<Instant> = None;
        let mut last_detection_at: Option<Instant> = None;
        let mut absent_skipped: u32 = 0;
        let mut last_summary = started;

        info!(tier = %profile.tier, fps = profile.target_fps, "presence tracker started");

        while !self.stop.is_stopped() {
            let cycle_start = Instant::now();

            let candidate = self.optimizer.sample(cycle_start);
            if candidate != profile
                && cycle_start.saturating_duration_since(last_profile_at) >= self.profile_refresh
            {
                info!(from = %profile.tier, to = %candidate.tier, "profile_applied");
                profile = candidate;
                self.apply_profile(&profile);
                last_profile_at = cycle_start;
            }

            if let Some(last) = last_frame_at {
                if cycle_start.saturating_duration_since(last) < profile.frame_time() {
                    if self.stop.sleep(profile.scaled_sleep(THROTTLE_SLEEP)) {
                        break;
                    }
                    continue;
                }
            }

            let grab = self.sinks.metrics.span(metric_names::FRAME_GRAB);
            let frame = match self.io.source.grab() {
                Ok(frame) => frame,
                Err(e) => {
                    error!(error = %e, "frame grab failed, stopping tracker");
                    return Err(TrackerError::SourceLost(e));
                }
            };
            grab.finish();
            last_frame_at = Some(cycle_start);

            if state.in_absence_episode() {
                let budget = self.optimizer.absent_skip_budget(&profile);
                if absent_skipped < budget {
                    absent_skipped += 1;
                    if self.stop.sleep(profile.scaled_sleep(ABSENT_SKIP_SLEEP)) {
                        break;
                    }
                    continue;
                }
            }
            absent_skipped = 0;

            let detection_due = last_detection_at.map_or(true, |t| {
                cycle_start.saturating_duration_since(t) >= profile.detection_interval
            });
            if detection_due {
                self.detect_into(&frame, &mut cached, &mut last_detection_at, cycle_start);
            }

            let observation = state.observe(Instant::now(), &cached, &self.cfg);
            self.log_transition(&observation);

            if observation.greeting_due {
                if let Some(closest) = observation.closest {
                    if self.sinks.dispatcher.try_greet(closest.sex) {
                        state.mark_greeted();
                        info!(
                            sex = ?closest.sex,
                            distance_m = closest.distance_m,
                            age = closest.age_years,
                            "greeting_triggered"
                        );
                    }
                }
            }

            self.sinks.presence.store(state.view(observation.face_count));
            self.sinks.publisher.publish(PresenceUpdate {
                user_present: state.is_present,
                user_count: observation.face_count,
                distance_m: observation.closest.map(|c| c.distance_m),
                sex: observation.closest.map(|c| c.sex),
                age_years: observation.closest.map(|c| c.age_years),
            });

            if let Some(overlay) = &self.io.overlay {
                overlay.render(&frame, &cached, &overlay_lines(&state, &observation));
            }

            self.sinks
                .metrics
                .record(metric_names::CYCLE, cycle_start.elapsed().as_micros() as f64);
            if last_summary.elapsed() >= SUMMARY_INTERVAL {
                self.log_summary();
                last_summary = Instant::now();
            }

            let pause = if self.io.overlay.is_some() {
                OVERLAY_CYCLE_SLEEP
            } else {
                HEADLESS_CYCLE_SLEEP
            };
            if self.stop.sleep(profile.scaled_sleep(pause)) {
                break;
            }
        }

        info!("presence tracker stopped");
        Ok(())
    }

    /// Run the detector; on failure keep the previous faces and retry next cycle.
    fn detect_into(
        &self,
        frame: &Frame,
        cached: &mut DetectionFrame,
        last_detection_at: &mut Option<Instant>,
        now: Instant,
    ) {
        let span = self.sinks.metrics.span(metric_names::DETECTION);
        match self.io.detector.detect(frame) {
            Ok(faces) => {
                let elapsed_us = span.finish();
                if let Some((emotion, confidence)) = faces.first().and_then(|f| f.dominant_emotion())
                {
                    debug!(%emotion, confidence, "dominant_emotion");
                }
                debug!(faces = faces.len(), elapsed_us, seq = frame.seq, "detection");
                *cached = faces;
                *last_detection_at = Some(now);
            }
            Err(e) => {
                warn!(error = %e, cached_faces = cached.len(), "detection failed, reusing last result");
            }
        }
    }

    fn log_transition(&self, observation: &Observation) {
        match observation.transition {
            Some(Transition::Arrived) => info!(
                transition = "arrived",
                faces = observation.face_count,
                distance_m = observation.closest.map(|c| c.distance_m),
                "presence_transition"
            ),
            Some(Transition::Departed) => info!(
                transition = "departed",
                too_far = observation.any_face_far,
                "presence_transition"
            ),
            None => {}
        }
    }

    fn log_summary(&self) {
        let summary = self.sinks.metrics.summary();
        for name in [
            metric_names::CYCLE,
            metric_names::DETECTION,
            metric_names::FRAME_GRAB,
            metric_names::CPU_PERCENT,
        ] {
            if let Some(s) = summary.get(name) {
                info!(
                    metric = name,
                    count = s.count,
                    mean = s.mean,
                    p50 = s.p50,
                    p95 = s.p95,
                    max = s.max,
                    "metrics_summary"
                );
            }
        }
        info!(
            adaptive_skip = self.optimizer.adaptive_frame_skip(),
            "metrics_summary"
        );
    }
}

/// Status text for the overlay window.
pub fn overlay_lines(state: &PresenceState, observation: &Observation) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(closest) = observation.closest.filter(|c| c.distance_m.is_finite()) {
        lines.push(format!("Distance: {:.2}m", closest.distance_m));
    }
    if let Some(left) = observation.absence_remaining {
        lines.push(format!("User away: {}s", left.as_secs_f64().ceil() as u64));
    }
    if let Some(left) = observation.far_remaining {
        lines.push(format!("Too far: {}s", left.as_secs_f64().ceil() as u64));
    }
    if !state.is_present {
        lines.push("User not exist".to_string());
        if observation.any_face_far {
            lines.push("User too far".to_string());
        }
    }
    lines
}
