use std::{fs, io, path::Path, path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::error::ConfigError;

/// Hard ceiling on the pacing rate regardless of what is requested.
pub const MAX_TARGET_FPS: f64 = 30.0;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub render: RenderConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Native device index
    #[serde(default)]
    pub index: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self { index: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    RawFrame,
    Keypoints,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_target_fps")]
    pub target_fps: f64,
    /// Weight of the previous smoothed pose, in [0, 1]
    #[serde(default = "default_smoothing_factor")]
    pub smoothing_factor: f32,
    #[serde(default = "default_true")]
    pub smoothing_enabled: bool,
    #[serde(default = "default_transport_mode")]
    pub transport_mode: TransportMode,
    /// Consecutive empty detections before smoothing state is dropped (0 = never)
    #[serde(default = "default_reset_after_missed")]
    pub reset_after_missed: u32,
}

fn default_target_fps() -> f64 { MAX_TARGET_FPS }
fn default_smoothing_factor() -> f32 { 0.5 }
fn default_true() -> bool { true }
fn default_transport_mode() -> TransportMode { TransportMode::Keypoints }
fn default_reset_after_missed() -> u32 { 3 }

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_fps: default_target_fps(),
            smoothing_factor: default_smoothing_factor(),
            smoothing_enabled: default_true(),
            transport_mode: default_transport_mode(),
            reset_after_missed: default_reset_after_missed(),
        }
    }
}

impl PipelineConfig {
    /// Requested rate capped at [`MAX_TARGET_FPS`].
    pub fn effective_fps(&self) -> f64 {
        self.target_fps.min(MAX_TARGET_FPS)
    }

    pub fn target_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.effective_fps())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.target_fps.is_finite() || self.target_fps <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "pipeline.target_fps must be a positive number, got {}",
                self.target_fps
            )));
        }
        if !(0.0..=1.0).contains(&self.smoothing_factor) {
            return Err(ConfigError::Invalid(format!(
                "pipeline.smoothing_factor must be within [0, 1], got {}",
                self.smoothing_factor
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    Lite,
    Full,
    Heavy,
}

impl ModelVariant {
    pub fn file_name(self) -> &'static str {
        match self {
            ModelVariant::Lite => "pose_landmark_lite.onnx",
            ModelVariant::Full => "pose_landmark_full.onnx",
            ModelVariant::Heavy => "pose_landmark_heavy.onnx",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delegate {
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
    #[serde(default = "default_variant")]
    pub variant: ModelVariant,
    #[serde(default = "default_delegate")]
    pub delegate: Delegate,
    /// Minimum pose presence probability to report a subject
    #[serde(default = "default_min_pose_presence")]
    pub min_pose_presence: f32,
}

fn default_model_dir() -> PathBuf { PathBuf::from("models") }
fn default_variant() -> ModelVariant { ModelVariant::Full }
fn default_delegate() -> Delegate { Delegate::Cpu }
fn default_min_pose_presence() -> f32 { 0.5 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            variant: default_variant(),
            delegate: default_delegate(),
            min_pose_presence: default_min_pose_presence(),
        }
    }
}

impl EngineConfig {
    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join(self.variant.file_name())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_addr() -> String { "127.0.0.1:5001".to_string() }
fn default_jpeg_quality() -> u8 { 80 }

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            addr: default_addr(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RenderConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Where the latest overlay is written as PNG, if anywhere
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        match Self::load(&path) {
            Err(ConfigError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                log::warn!(
                    "config {} not found, using defaults",
                    path.as_ref().display()
                );
                Ok(Self::default())
            }
            other => other,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pipeline.validate()?;
        if self.transport.enabled && self.transport.addr.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "transport.addr must be set when the transport is enabled".to_string(),
            ));
        }
        if !(1..=100).contains(&self.transport.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "transport.jpeg_quality must be within 1..=100, got {}",
                self.transport.jpeg_quality
            )));
        }
        if !(0.0..=1.0).contains(&self.engine.min_pose_presence) {
            return Err(ConfigError::Invalid(format!(
                "engine.min_pose_presence must be within [0, 1], got {}",
                self.engine.min_pose_presence
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.pipeline.transport_mode, TransportMode::Keypoints);
        assert_eq!(config.transport.jpeg_quality, 80);
        assert_eq!(config.engine.model_path(), PathBuf::from("models/pose_landmark_full.onnx"));
    }

    #[test]
    fn target_rate_is_capped() {
        let mut pipeline = PipelineConfig::default();
        pipeline.target_fps = 120.0;
        assert_eq!(pipeline.effective_fps(), MAX_TARGET_FPS);

        pipeline.target_fps = 10.0;
        assert_eq!(pipeline.target_interval(), Duration::from_millis(100));
    }

    #[test]
    fn parses_sections() {
        let config: Config = toml::from_str(
            r#"
            [pipeline]
            target_fps = 15
            smoothing_factor = 0.8
            transport_mode = "raw_frame"

            [engine]
            variant = "lite"
            delegate = "gpu"

            [transport]
            addr = "10.0.0.2:9000"
            "#,
        )
        .unwrap();
        assert_eq!(config.pipeline.target_fps, 15.0);
        assert_eq!(config.pipeline.transport_mode, TransportMode::RawFrame);
        assert!(config.pipeline.smoothing_enabled);
        assert_eq!(config.engine.variant, ModelVariant::Lite);
        assert_eq!(config.engine.delegate, Delegate::Gpu);
        assert_eq!(config.transport.addr, "10.0.0.2:9000");
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = Config::default();
        config.pipeline.smoothing_factor = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.pipeline.target_fps = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pipeline.target_fps = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transport.jpeg_quality = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load_or_default("definitely/not/here.toml").unwrap();
        assert_eq!(config.camera.index, 0);
    }
}
