//! Analysis tuning. Every field has a default so partial TOML sections and
//! per-station JSON overrides deserialize cleanly.

use crate::color::ClustererKind;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceConfig {
    pub enabled: bool,
    /// Detection sensitivity: minimum detector confidence.
    pub confidence: f32,
    /// Detector canvas multiplier (640 px × upsample).
    pub upsample: u32,
    /// Boxes narrower or shorter than this are dropped after detection.
    pub min_face_size: u32,
}

impl Default for FaceConfig {
    fn default() -> Self {
        Self { enabled: true, confidence: 0.5, upsample: 1, min_face_size: 20 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersonMethod {
    /// YOLO first, HOG when YOLO is unavailable.
    #[default]
    Auto,
    Yolo,
    Hog,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonConfig {
    pub enabled: bool,
    pub method: PersonMethod,
    pub confidence: f32,
    pub min_width: u32,
    pub min_height: u32,
    /// HOG sliding-window step in pixels.
    pub win_stride: u32,
    /// HOG pyramid scale factor between levels.
    pub scale: f32,
}

impl Default for PersonConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            method: PersonMethod::Auto,
            confidence: 0.5,
            min_width: 50,
            min_height: 100,
            win_stride: 8,
            scale: 1.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClothingConfig {
    pub enabled: bool,
    pub num_colors: usize,
    /// Body height as a multiple of face height.
    pub body_ratio: f32,
    /// Body width as a multiple of face width.
    pub body_width_ratio: f32,
    pub clusterer: ClustererKind,
}

impl Default for ClothingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            num_colors: 3,
            body_ratio: 2.5,
            body_width_ratio: 1.5,
            clusterer: ClustererKind::Kmeans,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub face: FaceConfig,
    pub person: PersonConfig,
    pub clothing: ClothingConfig,
}

impl ClothingConfig {
    /// Overlay the per-station `clothing` settings blob.
    pub fn with_overrides(&self, overrides: &Value) -> ClothingConfig {
        apply_overrides(self, overrides)
    }
}

/// Overlay the keys of a JSON object onto `base`. Unknown keys are ignored;
/// a patch that no longer deserializes leaves `base` untouched.
pub fn apply_overrides<T>(base: &T, overrides: &Value) -> T
where
    T: Serialize + DeserializeOwned + Clone,
{
    let Some(patch) = overrides.as_object() else {
        return base.clone();
    };
    let Ok(Value::Object(mut merged)) = serde_json::to_value(base) else {
        return base.clone();
    };
    for (key, value) in patch {
        if merged.contains_key(key) {
            merged.insert(key.clone(), value.clone());
        }
    }
    match serde_json::from_value(Value::Object(merged)) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "ignoring malformed settings overrides");
            base.clone()
        }
    }
}

/// Model file locations under one directory.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub dir: PathBuf,
}

impl ModelPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn scrfd(&self) -> PathBuf {
        self.dir.join("det_10g.onnx")
    }

    pub fn arcface(&self) -> PathBuf {
        self.dir.join("w600k_r50.onnx")
    }

    pub fn yolo(&self) -> PathBuf {
        self.dir.join("yolov8n.onnx")
    }

    /// Linear SVM weights for the 64×128 HOG people window.
    pub fn hog_svm(&self) -> PathBuf {
        self.dir.join("hog_people_svm.json")
    }
}
