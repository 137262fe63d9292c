use photomatch_core::{AnalysisConfig, SearchConfig};
use photomatch_hw::CameraOptions;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Daemon configuration: `PHOTOMATCH_*` environment plus an optional TOML file.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the photo folders and JSON stores.
    pub data_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Station whose settings apply to watcher-driven processing.
    pub station: String,
    /// TrueType font for annotation labels. Boxes are drawn without one.
    pub font_path: Option<PathBuf>,
    /// Print spooler binary (default: lp).
    pub print_command: String,
    /// Use the session bus instead of the system bus.
    pub session_bus: bool,
    pub file: FileConfig,
}

/// Tuning loaded from `photomatch.toml`. Every field has a default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub analysis: AnalysisConfig,
    pub processing: ProcessingConfig,
    pub search: SearchConfig,
    pub camera: CameraOptions,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Queue newly created intake files while the watcher runs.
    pub auto_process: bool,
    /// Remove the intake file once its record is stored.
    pub delete_original: bool,
    pub jpeg_quality: u8,
    /// Pause before processing a watched file so the writer can finish.
    pub settle_delay_ms: u64,
    pub stop_timeout_ms: u64,
    /// Start the watcher when the daemon comes up.
    pub watch_on_start: bool,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            auto_process: true,
            delete_original: false,
            jpeg_quality: 85,
            settle_delay_ms: 1000,
            stop_timeout_ms: 5000,
            watch_on_start: true,
        }
    }
}

impl FileConfig {
    /// Parse the TOML file at `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read { path: path.display().to_string(), source });
            }
        };
        toml::from_str(&text).map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })
    }
}

impl Config {
    /// Load configuration from `PHOTOMATCH_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = std::env::var("PHOTOMATCH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("XDG_DATA_HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| {
                        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                        PathBuf::from(home).join(".local/share")
                    })
                    .join("photomatch")
            });

        let model_dir = std::env::var("PHOTOMATCH_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        let config_path = std::env::var("PHOTOMATCH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("photomatch.toml"));

        let mut file = FileConfig::load(&config_path)?;
        file.processing.jpeg_quality = env_u8("PHOTOMATCH_JPEG_QUALITY", file.processing.jpeg_quality);
        file.processing.settle_delay_ms = env_u64("PHOTOMATCH_SETTLE_DELAY_MS", file.processing.settle_delay_ms);
        file.search.max_results = env_usize("PHOTOMATCH_MAX_RESULTS", file.search.max_results);

        Ok(Self {
            data_dir,
            model_dir,
            camera_device: std::env::var("PHOTOMATCH_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            station: std::env::var("PHOTOMATCH_STATION").unwrap_or_else(|_| "default".to_string()),
            font_path: std::env::var("PHOTOMATCH_FONT").ok().map(PathBuf::from),
            print_command: std::env::var("PHOTOMATCH_PRINT_COMMAND").unwrap_or_else(|_| "lp".to_string()),
            session_bus: std::env::var("PHOTOMATCH_SESSION_BUS")
                .map(|v| v != "0")
                .unwrap_or(false),
            file,
        })
    }

    /// Folder watched for new photos.
    pub fn input_dir(&self) -> PathBuf {
        self.data_dir.join("photos/input")
    }

    /// Cropped working copies, removed after analysis.
    pub fn scratch_dir(&self) -> PathBuf {
        self.data_dir.join("photos/temp")
    }

    /// Annotated operator overlays.
    pub fn processed_dir(&self) -> PathBuf {
        self.data_dir.join("photos/processed")
    }

    /// Clean cropped copies for customers.
    pub fn output_dir(&self) -> PathBuf {
        self.data_dir.join("photos/output")
    }

    /// Camera captures taken for search queries.
    pub fn capture_dir(&self) -> PathBuf {
        self.data_dir.join("photos/captures")
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("data/images.json")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("data/settings.json")
    }
}

fn env_u8(key: &str, default: u8) -> u8 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
