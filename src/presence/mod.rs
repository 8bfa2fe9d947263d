//! Presence state: fuses per-frame face detections into a debounced
//! present / absent decision and arms the one-shot greeting.
//!
//! Two independent hysteresis tracks can force absence:
//! - absence track: no face at all for `absence_threshold`;
//! - too-far track: the closest face beyond `distance_threshold` for
//!   `absence_threshold`.
//! The absence track restarts when any face is seen; the too-far track only
//! when a face comes within the threshold (a blank frame leaves it running).
//! Rising edge is immediate: any face makes the user present unless the
//! too-far track has already expired.
//!
//! Frames are only skipped during an absence episode, which begins on a
//! departure. The state at startup is absent but not in an episode.

pub mod tracker;

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

use crate::config::PresenceConfig;
use crate::detect::{FaceObservation, Sex};

/// Pixel widths at or below this are treated as degenerate boxes.
const MIN_FACE_WIDTH_PX: f64 = 1e-6;

/// Pinhole-camera distance estimate: `known_width × focal_length / pixel_width`.
/// Degenerate widths report infinity ("too far") instead of dividing by zero.
pub fn estimate_distance(pixel_width: f64, known_width_m: f64, focal_length_px: f64) -> f64 {
    if !(pixel_width > MIN_FACE_WIDTH_PX) {
        return f64::INFINITY;
    }
    known_width_m * focal_length_px / pixel_width
}

/// Nearest face of the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClosestFace {
    pub distance_m: f64,
    pub sex: Sex,
    pub age_years: u32,
}

/// Presence edge produced by one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Arrived,
    Departed,
}

/// Result of folding one detection frame into the state.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub face_count: usize,
    pub closest: Option<ClosestFace>,
    /// At least one face beyond the distance threshold.
    pub any_face_far: bool,
    pub transition: Option<Transition>,
    /// Greeting conditions hold and none has fired this episode.
    pub greeting_due: bool,
    /// Time left on the absence track, while it runs.
    pub absence_remaining: Option<Duration>,
    /// Time left on the too-far track, while it runs.
    pub far_remaining: Option<Duration>,
}

/// The tracker's mutable presence state. Only the tracker loop mutates it.
#[derive(Debug, Clone, Default)]
pub struct PresenceState {
    pub is_present: bool,
    pub is_greeted: bool,
    pub absence_start: Option<Instant>,
    pub distance_far_start: Option<Instant>,
    pub closest: Option<ClosestFace>,
    absence_episode: bool,
}

impl PresenceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one detection frame observed at `now` into the state.
    pub fn observe(
        &mut self,
        now: Instant,
        faces: &[FaceObservation],
        cfg: &PresenceConfig,
    ) -> Observation {
        let threshold = cfg.absence_threshold();
        let was_present = self.is_present;

        let mut closest: Option<ClosestFace> = None;
        let mut any_face_far = false;
        for face in faces {
            let distance = estimate_distance(
                face.bbox.width() as f64,
                cfg.known_face_width_m,
                cfg.focal_length_px,
            );
            if distance > cfg.distance_threshold_m {
                any_face_far = true;
            }
            // first minimum wins on ties
            if closest.map_or(true, |c| distance < c.distance_m) {
                closest = Some(ClosestFace {
                    distance_m: distance,
                    sex: face.sex,
                    age_years: face.age_years,
                });
            }
        }
        self.closest = closest;

        let mut absence_remaining = None;
        let mut far_remaining = None;

        match closest {
            Some(nearest) => {
                self.absence_start = None;

                let mut far_expired = false;
                if nearest.distance_m > cfg.distance_threshold_m {
                    let start = *self.distance_far_start.get_or_insert(now);
                    let elapsed = now.saturating_duration_since(start);
                    far_expired = elapsed >= threshold;
                    far_remaining = Some(threshold.saturating_sub(elapsed));
                } else {
                    self.distance_far_start = None;
                }
                self.is_present = !far_expired;
            }
            None => {
                let start = *self.absence_start.get_or_insert(now);
                let elapsed = now.saturating_duration_since(start);
                if elapsed >= threshold {
                    self.is_present = false;
                }
                absence_remaining = Some(threshold.saturating_sub(elapsed));
            }
        }

        if !self.is_present {
            self.is_greeted = false;
        }

        let transition = match (was_present, self.is_present) {
            (false, true) => Some(Transition::Arrived),
            (true, false) => Some(Transition::Departed),
            _ => None,
        };
        match transition {
            Some(Transition::Departed) => self.absence_episode = true,
            Some(Transition::Arrived) => self.absence_episode = false,
            None => {}
        }

        let greeting_due = self.is_present
            && !self.is_greeted
            && !any_face_far
            && closest.map_or(false, |c| c.distance_m <= cfg.distance_threshold_m);

        Observation {
            face_count: faces.len(),
            closest,
            any_face_far,
            transition,
            greeting_due,
            absence_remaining,
            far_remaining,
        }
    }

    /// True between a departure and the next arrival.
    pub fn in_absence_episode(&self) -> bool {
        self.absence_episode
    }

    /// Record that a greeting fired for the current episode.
    pub fn mark_greeted(&mut self) {
        if self.is_present {
            self.is_greeted = true;
        }
    }

    pub fn view(&self, face_count: usize) -> PresenceView {
        PresenceView {
            is_present: self.is_present,
            is_greeted: self.is_greeted,
            face_count,
            closest: self.closest,
        }
    }
}

/// Immutable snapshot of the presence state for other units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PresenceView {
    pub is_present: bool,
    pub is_greeted: bool,
    pub face_count: usize,
    pub closest: Option<ClosestFace>,
}

/// Shared read side of the presence state. The tracker is the only writer;
/// readers always see a whole snapshot.
pub struct PresenceHandle {
    view: RwLock<PresenceView>,
}

impl PresenceHandle {
    pub fn new() -> Self {
        Self {
            view: RwLock::new(PresenceView::default()),
        }
    }

    /// Current snapshot (non-blocking read).
    pub fn snapshot(&self) -> PresenceView {
        *self.view.read()
    }

    pub fn is_present(&self) -> bool {
        self.view.read().is_present
    }

    pub(crate) fn store(&self, view: PresenceView) {
        *self.view.write() = view;
    }
}

impl Default for PresenceHandle {
    fn default() -> Self {
        Self::new()
    }
}
