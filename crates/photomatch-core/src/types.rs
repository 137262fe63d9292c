use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// An RGB triple.
pub type Rgb = [u8; 3];

/// Raw detector output, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Euclidean distance, or `None` when the dimensionalities differ.
    pub fn distance(&self, other: &Embedding) -> Option<f32> {
        (self.values.len() == other.values.len() && !self.values.is_empty())
            .then(|| self.euclidean_distance(other))
    }
}

/// A detected face in pixel coordinates (top-left origin) with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
    pub embedding: Embedding,
}

impl FaceBox {
    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    pub fn center(&self) -> (u32, u32) {
        ((self.left + self.right) / 2, (self.top + self.bottom) / 2)
    }

    /// `top < bottom` and `left < right`.
    pub fn is_valid(&self) -> bool {
        self.top < self.bottom && self.left < self.right
    }
}

/// Which strategy produced a person box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    Yolo,
    Hog,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Detection confidence in [0, 1].
    pub confidence: f32,
    pub method: DetectionMethod,
}

/// Axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    /// Build a region from edge coordinates, clamped to `bounds` (width, height).
    pub fn from_edges(left: i64, top: i64, right: i64, bottom: i64, bounds: (u32, u32)) -> Self {
        let (bw, bh) = (bounds.0 as i64, bounds.1 as i64);
        let left = left.clamp(0, bw);
        let top = top.clamp(0, bh);
        let right = right.clamp(left, bw);
        let bottom = bottom.clamp(top, bh);
        Self {
            x: left as u32,
            y: top as u32,
            width: (right - left) as u32,
            height: (bottom - top) as u32,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionSource {
    Face,
    Person,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Brightness {
    Light,
    Dark,
}

impl Brightness {
    /// Luma-weighted bucket: `(299r + 587g + 114b) / 1000 > 128` is light.
    pub fn of(rgb: Rgb) -> Self {
        let [r, g, b] = rgb.map(u32::from);
        if (r * 299 + g * 587 + b * 114) as f32 / 1000.0 > 128.0 {
            Brightness::Light
        } else {
            Brightness::Dark
        }
    }
}

/// One dominant color of a sampled region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorSwatch {
    pub rgb: Rgb,
    /// Share of the sampled region, 0–100.
    pub percentage: f32,
    pub name: String,
    pub brightness: Brightness,
}

impl ColorSwatch {
    pub fn hex(&self) -> String {
        let [r, g, b] = self.rgb;
        format!("#{r:02x}{g:02x}{b:02x}")
    }
}

/// Dominant colors of one body region, ordered by descending prevalence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorSet {
    pub source: RegionSource,
    /// Index into the originating faces/persons list.
    pub index: usize,
    pub region: Region,
    pub colors: Vec<ColorSwatch>,
}

/// Output of one analyzer run, before persistence metadata is attached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub width: u32,
    pub height: u32,
    pub faces: Vec<FaceBox>,
    pub persons: Vec<PersonBox>,
    pub clothing_color_sets: Vec<ColorSet>,
}

/// Stored result of analyzing one photograph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub id: String,
    pub filename: String,
    pub original_path: PathBuf,
    /// Operator overlay; absent when annotation failed.
    pub annotated_path: Option<PathBuf>,
    pub output_path: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub faces: Vec<FaceBox>,
    pub persons: Vec<PersonBox>,
    pub clothing_color_sets: Vec<ColorSet>,
    pub created_at: DateTime<Utc>,
}

impl FeatureRecord {
    /// Iterate every swatch across all color sets.
    pub fn swatches(&self) -> impl Iterator<Item = &ColorSwatch> {
        self.clothing_color_sets.iter().flat_map(|set| set.colors.iter())
    }
}

/// Generate a record id: `IMG_<yyyymmddHHMMSSffffff>_<8 hex>`.
pub fn record_id(filename: &str, now: DateTime<Utc>) -> String {
    let stamp = now.format("%Y%m%d%H%M%S%6f").to_string();
    let digest = Sha256::digest(format!("{filename}_{stamp}").as_bytes());
    let short: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    format!("IMG_{stamp}_{short}")
}
