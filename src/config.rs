//! Process configuration: CLI flags plus an optional TOML file.
//! Resolution order: built-in defaults → config file → environment → validation.
//! Every section is optional in the file; missing keys keep their defaults.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

/// Upper bound for any interval setting, one day.
const MAX_INTERVAL_SECS: f64 = 86_400.0;

/// Command line surface.
#[derive(Debug, Clone, Parser)]
#[command(name = "presence-kiosk", about = "Presence-aware greeting kiosk")]
pub struct Cli {
    /// Run without the visual overlay window.
    #[arg(long)]
    pub headless: bool,

    /// Camera index handed to the vision worker.
    #[arg(long, default_value_t = 1)]
    pub camid: u32,

    /// Optional TOML configuration file.
    #[arg(long, env = "KIOSK_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub absence_threshold_secs: f64,
    pub distance_threshold_m: f64,
    pub known_face_width_m: f64,
    pub focal_length_px: f64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            absence_threshold_secs: 5.0,
            distance_threshold_m: 1.0,
            known_face_width_m: 0.15,
            focal_length_px: 500.0,
        }
    }
}

impl PresenceConfig {
    pub fn absence_threshold(&self) -> Duration {
        Duration::from_secs_f64(self.absence_threshold_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub cpu_check_interval_secs: f64,
    pub profile_refresh_secs: f64,
    pub cpu_high_threshold: f32,
    pub cpu_low_threshold: f32,
    pub max_adaptive_skip: u32,
    pub base_frame_skip: u32,
    pub cpu_window: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            cpu_check_interval_secs: 1.5,
            profile_refresh_secs: 3.0,
            cpu_high_threshold: 70.0,
            cpu_low_threshold: 40.0,
            max_adaptive_skip: 5,
            base_frame_skip: 8,
            cpu_window: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub suggest_interval_secs: f64,
    pub male_honorific: String,
    pub female_honorific: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            suggest_interval_secs: 30.0,
            male_honorific: "先生".into(),
            female_honorific: "女士".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub base_url: String,
    pub machine_id: String,
    pub timeout_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: "http://192.168.2.35:8000".into(),
            machine_id: "6".into(),
            timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub bind: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8765".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub python_bin: String,
    pub worker_script: PathBuf,
    pub rotate_ccw: bool,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            python_bin: "python3".into(),
            worker_script: PathBuf::from("vision-worker/worker.py"),
            rotate_ccw: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub url: Option<String>,
    pub voice: String,
    pub ffmpeg_bin: String,
    pub sample_rate: u32,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            url: None,
            voice: "longxiaochun".into(),
            ffmpeg_bin: "ffmpeg".into(),
            sample_rate: 22050,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub history_turns: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://dashscope.aliyuncs.com/compatible-mode".into(),
            model: "qwen-plus".into(),
            history_turns: 6,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    pub stdin_listener: bool,
}

/// Fully resolved configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KioskConfig {
    pub presence: PresenceConfig,
    pub performance: PerformanceConfig,
    pub dispatch: DispatchConfig,
    pub catalog: CatalogConfig,
    pub status: StatusConfig,
    pub vision: VisionConfig,
    pub tts: TtsConfig,
    pub llm: LlmConfig,
    pub conversation: ConversationConfig,
}

impl KioskConfig {
    /// Load from `path` (if any), apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    fn apply_env(&mut self) {
        if let Ok(bind) = std::env::var("KIOSK_STATUS_BIND") {
            self.status.bind = bind;
        }
        if let Ok(url) = std::env::var("KIOSK_CATALOG_URL") {
            self.catalog.base_url = url;
        }
        if let Ok(id) = std::env::var("KIOSK_MACHINE_ID") {
            self.catalog.machine_id = id;
        }
        if let Ok(url) = std::env::var("KIOSK_TTS_URL") {
            self.tts.url = Some(url);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.presence;
        for (name, value) in [
            ("presence.distance_threshold_m", p.distance_threshold_m),
            ("presence.known_face_width_m", p.known_face_width_m),
            ("presence.focal_length_px", p.focal_length_px),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid(format!("{name} must be > 0")));
            }
        }

        // these become Durations
        for (name, value) in [
            ("presence.absence_threshold_secs", p.absence_threshold_secs),
            (
                "performance.cpu_check_interval_secs",
                self.performance.cpu_check_interval_secs,
            ),
            (
                "performance.profile_refresh_secs",
                self.performance.profile_refresh_secs,
            ),
            (
                "dispatch.suggest_interval_secs",
                self.dispatch.suggest_interval_secs,
            ),
        ] {
            if !(value.is_finite() && value > 0.0 && value <= MAX_INTERVAL_SECS) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be in (0, {MAX_INTERVAL_SECS}]"
                )));
            }
        }

        let perf = &self.performance;
        if perf.cpu_low_threshold >= perf.cpu_high_threshold {
            return Err(ConfigError::Invalid(
                "performance.cpu_low_threshold must be below cpu_high_threshold".into(),
            ));
        }
        if perf.cpu_window == 0 {
            return Err(ConfigError::Invalid("performance.cpu_window must be >= 1".into()));
        }
        if self.tts.sample_rate == 0 {
            return Err(ConfigError::Invalid("tts.sample_rate must be > 0".into()));
        }
        self.status_addr()?;
        Ok(())
    }

    pub fn status_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.status
            .bind
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("status.bind {:?}: {e}", self.status.bind)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let cfg = KioskConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.presence.absence_threshold(), Duration::from_secs(5));
        assert_eq!(cfg.dispatch.suggest_interval_secs, 30.0);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[presence]\ndistance_threshold_m = 1.5\n\n[status]\nbind = \"127.0.0.1:9000\""
        )
        .unwrap();

        let cfg = KioskConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.presence.distance_threshold_m, 1.5);
        assert_eq!(cfg.presence.focal_length_px, 500.0);
        assert_eq!(cfg.status_addr().unwrap().port(), 9000);
        assert_eq!(cfg.performance.base_frame_skip, 8);
    }

    #[test]
    fn oversized_intervals_rejected() {
        for raw in [
            "[dispatch]\nsuggest_interval_secs = 1e30",
            "[presence]\nabsence_threshold_secs = 86401.0",
            "[performance]\nprofile_refresh_secs = inf",
        ] {
            let cfg = KioskConfig::from_toml(raw).unwrap();
            let err = cfg.validate().unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{raw}: {err}");
        }

        let cfg = KioskConfig::from_toml("[dispatch]\nsuggest_interval_secs = 86400.0").unwrap();
        cfg.validate().unwrap();
    }

    #[test]
    fn inverted_cpu_thresholds_rejected() {
        let cfg = KioskConfig::from_toml(
            "[performance]\ncpu_high_threshold = 30.0\ncpu_low_threshold = 60.0",
        )
        .unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_threshold_rejected() {
        let cfg = KioskConfig::from_toml("[presence]\nabsence_threshold_secs = 0.0").unwrap();
        assert!(cfg.validate().is_err());
    }
}
