//! Face detection boundary.
//! The detector model is a black box; this module fixes the shape of what it
//! returns (bounding box, age, sex, optional emotion vector) and the traits the
//! tracker drives: a video source, a detector, and an optional overlay.

pub mod worker;

use serde::{Deserialize, Serialize};

use crate::perf::PerformanceProfile;

/// Axis-aligned face box in pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Observed face width in pixels. Degenerate boxes report 0 or less.
    #[inline]
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }
}

/// Detector sex label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sex {
    Male,
    Female,
    Unknown,
}

impl Sex {
    /// Parse the detector's label (`"M"` / `"F"`); anything else is unknown.
    pub fn from_label(label: &str) -> Self {
        match label.trim() {
            "M" | "m" => Sex::Male,
            "F" | "f" => Sex::Female,
            _ => Sex::Unknown,
        }
    }

    /// Wire label, `None` when unknown.
    pub fn label(&self) -> Option<&'static str> {
        match self {
            Sex::Male => Some("M"),
            Sex::Female => Some("F"),
            Sex::Unknown => None,
        }
    }
}

/// Emotion classes in detector output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Emotion {
    Anger,
    Disgust,
    Fear,
    Happy,
    Sad,
    Surprise,
    Neutral,
}

impl Emotion {
    pub const ALL: [Emotion; 7] = [
        Emotion::Anger,
        Emotion::Disgust,
        Emotion::Fear,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Surprise,
        Emotion::Neutral,
    ];
}

impl std::fmt::Display for Emotion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// One detected face.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceObservation {
    pub bbox: BoundingBox,
    pub age_years: u32,
    pub sex: Sex,
    /// Per-class probabilities, only when the detector runs the emotion head.
    pub emotion: Option<[f32; 7]>,
}

impl FaceObservation {
    /// Highest-probability emotion and its confidence.
    pub fn dominant_emotion(&self) -> Option<(Emotion, f32)> {
        self.top_emotions(1).into_iter().next()
    }

    /// Up to `n` emotions, most probable first.
    pub fn top_emotions(&self, n: usize) -> Vec<(Emotion, f32)> {
        let Some(probs) = self.emotion else {
            return Vec::new();
        };
        let mut ranked: Vec<(Emotion, f32)> = Emotion::ALL.iter().copied().zip(probs).collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(n);
        ranked
    }
}

/// Faces found in one detector invocation.
pub type DetectionFrame = Vec<FaceObservation>;

/// Handle to a captured frame. Pixel data stays with the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub seq: u64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("vision worker not running")]
    WorkerNotRunning,
    #[error("vision worker IPC failed: {0}")]
    Ipc(String),
    #[error("video source unavailable: {0}")]
    SourceLost(String),
    #[error("detection failed: {0}")]
    Detection(String),
}

/// Camera (or any frame producer).
pub trait VideoSource: Send + Sync {
    /// Grab the next frame. An error means the source is gone.
    fn grab(&self) -> Result<Frame, DetectError>;

    /// Apply camera resolution / fps from a new profile.
    fn configure(&self, _profile: &PerformanceProfile) -> Result<(), DetectError> {
        Ok(())
    }
}

/// Face detector. Errors are transient; callers keep the last good result.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<DetectionFrame, DetectError>;

    /// Apply detection input size from a new profile.
    fn configure(&self, _profile: &PerformanceProfile) -> Result<(), DetectError> {
        Ok(())
    }
}

/// Visual overlay (disabled in headless mode).
pub trait Overlay: Send + Sync {
    fn render(&self, frame: &Frame, faces: &[FaceObservation], lines: &[String]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(emotion: Option<[f32; 7]>) -> FaceObservation {
        FaceObservation {
            bbox: BoundingBox::new(10.0, 10.0, 85.0, 100.0),
            age_years: 30,
            sex: Sex::Female,
            emotion,
        }
    }

    #[test]
    fn dominant_emotion_picks_highest() {
        let f = face(Some([0.05, 0.0, 0.05, 0.6, 0.1, 0.1, 0.1]));
        let (emotion, conf) = f.dominant_emotion().unwrap();
        assert_eq!(emotion, Emotion::Happy);
        assert!((conf - 0.6).abs() < f32::EPSILON);

        let top = f.top_emotions(3);
        assert_eq!(top.len(), 3);
        assert_eq!(top[0].0, Emotion::Happy);
    }

    #[test]
    fn no_emotion_head() {
        assert!(face(None).dominant_emotion().is_none());
        assert!(face(None).top_emotions(3).is_empty());
    }

    #[test]
    fn sex_labels() {
        assert_eq!(Sex::from_label("M"), Sex::Male);
        assert_eq!(Sex::from_label("F"), Sex::Female);
        assert_eq!(Sex::from_label("?"), Sex::Unknown);
        assert_eq!(Sex::Unknown.label(), None);
        assert_eq!(BoundingBox::new(10.0, 0.0, 85.0, 1.0).width(), 75.0);
    }
}
