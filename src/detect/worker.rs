//! Python vision worker IPC client.
//! Spawns the insightface worker script, which owns the camera, the face
//! model and (when not headless) the overlay window. Communication is over
//! stdin/stdout with MessagePack framing (4-byte BE length prefix + payload).
//! Frames never cross the pipe; the worker keeps the latest grabbed frame and
//! the client refers to it by sequence number.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    BoundingBox, DetectError, DetectionFrame, FaceDetector, FaceObservation, Frame, Overlay, Sex,
    VideoSource,
};
use crate::config::VisionConfig;
use crate::perf::PerformanceProfile;

const MAX_MESSAGE_BYTES: usize = 8 * 1024 * 1024;

/// Managed worker process with stdin/stdout handles.
struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl WorkerProcess {
    /// Send a msgpack message with 4-byte BE length prefix.
    fn send(&mut self, msg: &[u8]) -> Result<(), DetectError> {
        let len = msg.len() as u32;
        self.stdin
            .write_all(&len.to_be_bytes())
            .map_err(|e| DetectError::Ipc(format!("write len: {e}")))?;
        self.stdin
            .write_all(msg)
            .map_err(|e| DetectError::Ipc(format!("write payload: {e}")))?;
        self.stdin
            .flush()
            .map_err(|e| DetectError::Ipc(format!("flush: {e}")))?;
        Ok(())
    }

    /// Read a msgpack response with 4-byte BE length prefix.
    fn recv(&mut self) -> Result<Vec<u8>, DetectError> {
        let mut len_buf = [0u8; 4];
        self.stdout
            .read_exact(&mut len_buf)
            .map_err(|e| DetectError::Ipc(format!("read len: {e}")))?;
        let msg_len = u32::from_be_bytes(len_buf) as usize;
        if msg_len > MAX_MESSAGE_BYTES {
            return Err(DetectError::Ipc(format!("message too large: {msg_len}")));
        }
        let mut payload = vec![0u8; msg_len];
        self.stdout
            .read_exact(&mut payload)
            .map_err(|e| DetectError::Ipc(format!("read payload: {e}")))?;
        Ok(payload)
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        // Best-effort shutdown; the worker releases the camera on exit.
        if let Ok(bytes) = rmp_serde::to_vec_named(&WorkerRequest::Shutdown) {
            let _ = self.send(&bytes);
        }
        std::thread::sleep(Duration::from_millis(100));
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

// --- IPC message types ---

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WorkerRequest<'a> {
    Ping,
    Configure {
        det_size: (u32, u32),
        camera_resolution: (u32, u32),
        fps: u32,
        rotate_ccw: bool,
    },
    Grab,
    Detect {
        seq: u64,
    },
    Annotate {
        seq: u64,
        boxes: Vec<(f32, f32, f32, f32)>,
        lines: &'a [String],
    },
    Shutdown,
}

#[derive(Deserialize, Debug)]
struct WorkerResponse {
    #[serde(rename = "type")]
    msg_type: String,
    seq: Option<u64>,
    width: Option<u32>,
    height: Option<u32>,
    faces: Option<Vec<WorkerFace>>,
    message: Option<String>,
}

#[derive(Deserialize, Debug)]
struct WorkerFace {
    bbox: (f32, f32, f32, f32),
    age: f32,
    sex: String,
    emotion: Option<Vec<f32>>,
}

impl WorkerFace {
    fn into_observation(self) -> FaceObservation {
        let (x1, y1, x2, y2) = self.bbox;
        let emotion = self
            .emotion
            .and_then(|v| <[f32; 7]>::try_from(v.as_slice()).ok());
        FaceObservation {
            bbox: BoundingBox::new(x1, y1, x2, y2),
            age_years: self.age.max(0.0).round() as u32,
            sex: Sex::from_label(&self.sex),
            emotion,
        }
    }
}

/// Vision worker: camera + face model + overlay behind one child process.
pub struct VisionWorker {
    worker: Mutex<Option<WorkerProcess>>,
    python_bin: String,
    worker_script: PathBuf,
    camera_index: u32,
    headless: bool,
    rotate_ccw: bool,
}

impl VisionWorker {
    pub fn new(cfg: &VisionConfig, camera_index: u32, headless: bool) -> Self {
        Self {
            worker: Mutex::new(None),
            python_bin: cfg.python_bin.clone(),
            worker_script: cfg.worker_script.clone(),
            camera_index,
            headless,
            rotate_ccw: cfg.rotate_ccw,
        }
    }

    fn spawn_worker(&self) -> Result<WorkerProcess, DetectError> {
        info!(
            script = %self.worker_script.display(),
            python = %self.python_bin,
            camera = self.camera_index,
            headless = self.headless,
            "spawning vision worker"
        );

        let mut cmd = Command::new(&self.python_bin);
        cmd.arg(&self.worker_script)
            .arg("--camid")
            .arg(self.camera_index.to_string());
        if self.headless {
            cmd.arg("--headless");
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| DetectError::Ipc(format!("failed to spawn vision worker: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DetectError::Ipc("failed to get worker stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DetectError::Ipc("failed to get worker stdout".into()))?;

        info!(pid = child.id(), "vision worker spawned");

        Ok(WorkerProcess {
            child,
            stdin,
            stdout,
        })
    }

    fn send_recv(&self, msg: &WorkerRequest<'_>) -> Result<WorkerResponse, DetectError> {
        let mut guard = self.worker.lock();
        let needs_spawn = match guard.as_mut() {
            Some(w) => !w.is_alive(),
            None => true,
        };
        if needs_spawn {
            *guard = Some(self.spawn_worker()?);
        }
        let worker = guard.as_mut().ok_or(DetectError::WorkerNotRunning)?;

        let payload = rmp_serde::to_vec_named(msg)
            .map_err(|e| DetectError::Ipc(format!("serialize: {e}")))?;
        let result = worker.send(&payload).and_then(|_| worker.recv());
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(e) => {
                // Desynchronised pipe; drop the process so the next call respawns.
                *guard = None;
                return Err(e);
            }
        };
        rmp_serde::from_slice(&bytes).map_err(|e| DetectError::Ipc(format!("deserialize: {e}")))
    }

    /// Ping/pong round trip.
    pub fn health_check(&self) -> bool {
        match self.send_recv(&WorkerRequest::Ping) {
            Ok(resp) if resp.msg_type == "pong" => true,
            Ok(resp) => {
                warn!(msg_type = %resp.msg_type, "unexpected health check response");
                false
            }
            Err(e) => {
                warn!(error = %e, "vision worker health check failed");
                false
            }
        }
    }

    fn expect_ok(resp: WorkerResponse, expected: &str) -> Result<WorkerResponse, DetectError> {
        if resp.msg_type == expected {
            return Ok(resp);
        }
        if resp.msg_type == "error" {
            return Err(DetectError::Detection(
                resp.message.unwrap_or_else(|| "unknown error".into()),
            ));
        }
        Err(DetectError::Ipc(format!("unexpected response type: {}", resp.msg_type)))
    }

    fn apply_profile(&self, profile: &PerformanceProfile) -> Result<(), DetectError> {
        let resp = self.send_recv(&WorkerRequest::Configure {
            det_size: profile.detection_size,
            camera_resolution: profile.camera_resolution,
            fps: profile.target_fps,
            rotate_ccw: self.rotate_ccw,
        })?;
        Self::expect_ok(resp, "ok")?;
        debug!(det_size = ?profile.detection_size, tier = %profile.tier, "vision worker configured");
        Ok(())
    }
}

impl VideoSource for VisionWorker {
    fn grab(&self) -> Result<Frame, DetectError> {
        let resp = self
            .send_recv(&WorkerRequest::Grab)
            .map_err(|e| DetectError::SourceLost(e.to_string()))?;
        let resp = Self::expect_ok(resp, "frame")
            .map_err(|e| DetectError::SourceLost(e.to_string()))?;
        Ok(Frame {
            seq: resp.seq.unwrap_or_default(),
            width: resp.width.unwrap_or_default(),
            height: resp.height.unwrap_or_default(),
        })
    }

    fn configure(&self, profile: &PerformanceProfile) -> Result<(), DetectError> {
        self.apply_profile(profile)
    }
}

impl FaceDetector for VisionWorker {
    fn detect(&self, frame: &Frame) -> Result<DetectionFrame, DetectError> {
        let resp = self.send_recv(&WorkerRequest::Detect { seq: frame.seq })?;
        let resp = Self::expect_ok(resp, "faces")?;
        Ok(resp
            .faces
            .unwrap_or_default()
            .into_iter()
            .map(WorkerFace::into_observation)
            .collect())
    }

    // Camera and detector share one worker; VideoSource::configure already
    // pushed the whole profile.
}

impl Overlay for VisionWorker {
    fn render(&self, frame: &Frame, faces: &[FaceObservation], lines: &[String]) {
        if self.headless {
            return;
        }
        let boxes = faces
            .iter()
            .map(|f| (f.bbox.x1, f.bbox.y1, f.bbox.x2, f.bbox.y2))
            .collect();
        let msg = WorkerRequest::Annotate {
            seq: frame.seq,
            boxes,
            lines,
        };
        if let Err(e) = self.send_recv(&msg) {
            debug!(error = %e, "overlay annotate failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_face_maps_to_observation() {
        let face = WorkerFace {
            bbox: (100.0, 50.0, 175.0, 140.0),
            age: 27.6,
            sex: "M".into(),
            emotion: Some(vec![0.1, 0.0, 0.0, 0.7, 0.1, 0.05, 0.05]),
        };
        let obs = face.into_observation();
        assert_eq!(obs.bbox.width(), 75.0);
        assert_eq!(obs.age_years, 28);
        assert_eq!(obs.sex, Sex::Male);
        assert!(obs.emotion.is_some());
    }

    #[test]
    fn malformed_emotion_vector_is_dropped() {
        let face = WorkerFace {
            bbox: (0.0, 0.0, 10.0, 10.0),
            age: -1.0,
            sex: "".into(),
            emotion: Some(vec![0.5, 0.5]),
        };
        let obs = face.into_observation();
        assert_eq!(obs.emotion, None);
        assert_eq!(obs.age_years, 0);
        assert_eq!(obs.sex, Sex::Unknown);
    }

    #[test]
    fn requests_encode_with_type_tag() {
        let bytes = rmp_serde::to_vec_named(&WorkerRequest::Detect { seq: 7 }).unwrap();
        let value: serde_json::Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "detect");
        assert_eq!(value["seq"], 7);
    }

    #[test]
    fn error_response_surfaces_message() {
        let resp = WorkerResponse {
            msg_type: "error".into(),
            seq: None,
            width: None,
            height: None,
            faces: None,
            message: Some("model not loaded".into()),
        };
        let err = VisionWorker::expect_ok(resp, "faces").unwrap_err();
        assert!(err.to_string().contains("model not loaded"));
    }
}
