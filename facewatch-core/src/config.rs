use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraConfig,
    pub detection: DetectionConfig,
    pub embedding: EmbeddingConfig,
    pub runtime: RuntimeConfig,
    pub tracking: TrackingConfig,
    pub matching: MatchingConfig,
    pub enrollment: EnrollmentConfig,
    pub results: ResultsConfig,
    pub recognition: RecognitionConfig,
    pub storage: StorageConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// V4L2 device path, or an http(s) URL for a network MJPEG stream
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Pause after a failed frame read before trying again
    pub retry_delay_ms: u64,
}

impl CameraConfig {
    pub fn is_network_stream(&self) -> bool {
        self.device.starts_with("http://") || self.device.starts_with("https://")
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            retry_delay_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub model_path: PathBuf,
    pub confidence_threshold: f32,
    /// Square input edge fed to the detector (letterboxed)
    pub input_size: u32,
    pub nms_threshold: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/det_10g.onnx"),
            confidence_threshold: 0.5,
            input_size: 320,
            nms_threshold: 0.4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub model_path: PathBuf,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/w600k_r50.onnx"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub intra_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { intra_threads: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Frames a track survives without a detection during live recognition
    pub max_age: u32,
    /// Same, for the interactive preview
    pub preview_max_age: u32,
    /// Maximum cosine distance for a detection to join an existing track
    pub distance_threshold: f32,
    /// Weight of the incoming embedding in the moving average
    pub smoothing: f32,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            max_age: 10,
            preview_max_age: 30,
            distance_threshold: 0.3,
            smoothing: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub threshold: f32,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self { threshold: 0.5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrollmentConfig {
    pub samples: u32,
    pub interval_ms: u64,
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            samples: 5,
            interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultsConfig {
    pub capacity: usize,
    /// Write a crop of every published face under `storage.detected_dir`
    pub save_faces: bool,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            save_faces: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Process every Nth frame read from the source
    pub frame_stride: u32,
    pub idle_sleep_ms: u64,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            frame_stride: 2,
            idle_sleep_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub gallery_path: PathBuf,
    pub images_dir: PathBuf,
    pub detected_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            gallery_path: PathBuf::from("faces_db/face_database.bin"),
            images_dir: PathBuf::from("faces_db"),
            detected_dir: PathBuf::from("detected_faces"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub output_dir: PathBuf,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("~/.cache/facewatch/preview"),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain:
    /// 1. /etc/facewatch/facewatch.toml (system-wide)
    /// 2. ~/.config/facewatch/facewatch.toml (user)
    /// 3. Compiled defaults
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(config) = Self::load_from_path("/etc/facewatch/facewatch.toml") {
            config.validate()?;
            return Ok(config);
        }

        if let Some(home) = std::env::var_os("HOME") {
            let user_config = PathBuf::from(home)
                .join(".config")
                .join("facewatch")
                .join("facewatch.toml");
            if let Ok(config) = Self::load_from_path(&user_config) {
                config.validate()?;
                return Ok(config);
            }
        }

        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camera.device.is_empty() {
            return Err(ConfigError::Validation(
                "Camera device cannot be empty".to_string(),
            ));
        }

        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(ConfigError::Validation(
                "Camera dimensions must be non-zero".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            return Err(ConfigError::Validation(
                "Detection confidence threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.detection.input_size == 0 || self.detection.input_size % 32 != 0 {
            return Err(ConfigError::Validation(
                "Detection input size must be a positive multiple of 32".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.detection.nms_threshold) {
            return Err(ConfigError::Validation(
                "NMS threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.tracking.max_age == 0 || self.tracking.preview_max_age == 0 {
            return Err(ConfigError::Validation(
                "Track max age must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.tracking.distance_threshold) {
            return Err(ConfigError::Validation(
                "Track distance threshold must be between 0.0 and 2.0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.tracking.smoothing) || self.tracking.smoothing == 0.0 {
            return Err(ConfigError::Validation(
                "Track smoothing must be in (0.0, 1.0]".to_string(),
            ));
        }

        if !(-1.0..=1.0).contains(&self.matching.threshold) {
            return Err(ConfigError::Validation(
                "Matching threshold must be between -1.0 and 1.0".to_string(),
            ));
        }

        if self.enrollment.samples == 0 {
            return Err(ConfigError::Validation(
                "Enrollment samples must be greater than 0".to_string(),
            ));
        }

        if self.results.capacity == 0 {
            return Err(ConfigError::Validation(
                "Result capacity must be greater than 0".to_string(),
            ));
        }

        if self.recognition.frame_stride == 0 {
            return Err(ConfigError::Validation(
                "Frame stride must be greater than 0".to_string(),
            ));
        }

        if self.storage.gallery_path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "Gallery path cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl Config {
    /// Copy of this config with a leading `~` expanded in every path
    pub fn expanded(&self) -> Self {
        let mut config = self.clone();
        for path in [
            &mut config.detection.model_path,
            &mut config.embedding.model_path,
            &mut config.storage.gallery_path,
            &mut config.storage.images_dir,
            &mut config.storage.detected_dir,
            &mut config.debug.output_dir,
        ] {
            *path = expand_home(path);
        }
        config
    }
}

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
