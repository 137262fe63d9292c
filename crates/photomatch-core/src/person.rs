//! Person detection strategies.
//!
//! - `yolo`: YOLOv8 ONNX export, COCO class 0 only.
//! - `hog`: HOG descriptor over a 64×128 sliding window scored by a linear SVM.
//! - `auto`: YOLO, falling back to HOG when the YOLO model is unavailable.
//!
//! Size filtering is left to the caller.

use crate::backend::{BackendError, LazyModel, PersonDetector};
use crate::config::{ModelPaths, PersonConfig, PersonMethod};
use crate::detector::{self, LetterboxInfo};
use crate::types::{BoundingBox, DetectionMethod, PersonBox};
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use imageproc::gradients::{horizontal_sobel, vertical_sobel};
use ort::session::Session;
use ort::value::TensorRef;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

const YOLO_INPUT_SIZE: usize = 640;
const YOLO_PAD_VALUE: u8 = 114;
const YOLO_NUM_CLASSES: usize = 80;
const YOLO_PERSON_CLASS: usize = 0;
const YOLO_NMS_THRESHOLD: f32 = 0.45;

const HOG_WINDOW: (u32, u32) = (64, 128);
const HOG_CELL: u32 = 8;
const HOG_BINS: usize = 9;
/// 2×2 cells per block.
const HOG_BLOCK_LEN: usize = 4 * HOG_BINS;
/// Blocks per window at a one-cell block stride.
const HOG_WINDOW_BLOCKS: (usize, usize) = (7, 15);
const HOG_DESCRIPTOR_LEN: usize = HOG_WINDOW_BLOCKS.0 * HOG_WINDOW_BLOCKS.1 * HOG_BLOCK_LEN;
const HOG_MAX_SIDE: u32 = 640;
const HOG_NMS_THRESHOLD: f32 = 0.3;

#[derive(Error, Debug)]
pub enum PersonError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("invalid model: {0}")]
    InvalidModel(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<PersonError> for BackendError {
    fn from(e: PersonError) -> Self {
        BackendError::Failed(e.to_string())
    }
}

/// YOLOv8 detector restricted to the person class.
pub struct YoloModel {
    session: Session,
}

impl YoloModel {
    pub fn load(model_path: &Path) -> Result<Self, PersonError> {
        if !model_path.exists() {
            return Err(PersonError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded YOLO model");
        Ok(Self { session })
    }

    pub fn detect(&mut self, image: &RgbImage, confidence: f32) -> Result<Vec<BoundingBox>, PersonError> {
        let (input, letterbox) = detector::letterbox_tensor(image, YOLO_INPUT_SIZE, YOLO_PAD_VALUE, |p| p / 255.0);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| PersonError::InferenceFailed(format!("yolo output: {e}")))?;

        let candidates = decode_yolo(raw, &letterbox, confidence)?;
        Ok(detector::nms(candidates, YOLO_NMS_THRESHOLD))
    }
}

/// Decode a `[1, 4 + classes, anchors]` YOLOv8 head, keeping person boxes
/// above `confidence`, mapped back to image space.
fn decode_yolo(raw: &[f32], letterbox: &LetterboxInfo, confidence: f32) -> Result<Vec<BoundingBox>, PersonError> {
    let rows = 4 + YOLO_NUM_CLASSES;
    if raw.is_empty() || raw.len() % rows != 0 {
        return Err(PersonError::InferenceFailed(format!(
            "unexpected yolo output length {} (not a multiple of {rows})",
            raw.len()
        )));
    }
    let anchors = raw.len() / rows;
    let at = |row: usize, i: usize| raw[row * anchors + i];

    let mut boxes = Vec::new();
    for i in 0..anchors {
        let score = at(4 + YOLO_PERSON_CLASS, i);
        if score < confidence {
            continue;
        }
        let (cx, cy, w, h) = (at(0, i), at(1, i), at(2, i), at(3, i));
        let (x1, y1) = letterbox.unmap(cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = letterbox.unmap(cx + w / 2.0, cy + h / 2.0);
        boxes.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks: None,
        });
    }
    Ok(boxes)
}

/// Linear SVM over a HOG descriptor: `score = w · x + b`.
#[derive(Debug, Clone, Deserialize)]
pub struct HogModel {
    weights: Vec<f32>,
    bias: f32,
}

impl HogModel {
    pub fn load(path: &Path) -> Result<Self, PersonError> {
        if !path.exists() {
            return Err(PersonError::ModelNotFound(path.display().to_string()));
        }
        let model: HogModel = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        if model.weights.len() != HOG_DESCRIPTOR_LEN {
            return Err(PersonError::InvalidModel(format!(
                "expected {HOG_DESCRIPTOR_LEN} SVM weights, got {}",
                model.weights.len()
            )));
        }
        tracing::info!(path = %path.display(), "loaded HOG people SVM");
        Ok(model)
    }

    fn score(&self, descriptor: &[f32]) -> f32 {
        let dot: f32 = self.weights.iter().zip(descriptor).map(|(w, x)| w * x).sum();
        sigmoid(dot + self.bias)
    }

    /// Slide the window over an image pyramid and collect windows whose
    /// squashed SVM score clears `confidence`.
    pub fn detect(&self, image: &RgbImage, config: &PersonConfig) -> Result<Vec<BoundingBox>, PersonError> {
        let gray = imageops::grayscale(image);
        let longest = gray.width().max(gray.height()).max(1);
        let work_scale = (HOG_MAX_SIDE as f32 / longest as f32).min(1.0);
        let mut level = if work_scale < 1.0 {
            resize_gray(&gray, work_scale)
        } else {
            gray
        };

        // Windows move in whole cells so every level's grid is reused.
        let stride = ((config.win_stride.max(1) as f32 / HOG_CELL as f32).round() as usize).max(1);
        let step = config.scale.max(1.01);
        let (win_w, win_h) = HOG_WINDOW;
        let (blocks_w, blocks_h) = HOG_WINDOW_BLOCKS;

        let mut level_scale = work_scale;
        let mut candidates = Vec::new();
        let mut descriptor = Vec::with_capacity(HOG_DESCRIPTOR_LEN);
        while level.width() >= win_w && level.height() >= win_h {
            let grid = HogGrid::new(&level);
            for cy in (0..=grid.blocks_y - blocks_h).step_by(stride) {
                for cx in (0..=grid.blocks_x - blocks_w).step_by(stride) {
                    grid.window(cx, cy, &mut descriptor);
                    let confidence = self.score(&descriptor);
                    if confidence >= config.confidence {
                        candidates.push(BoundingBox {
                            x: (cx as u32 * HOG_CELL) as f32 / level_scale,
                            y: (cy as u32 * HOG_CELL) as f32 / level_scale,
                            width: win_w as f32 / level_scale,
                            height: win_h as f32 / level_scale,
                            confidence,
                            landmarks: None,
                        });
                    }
                }
            }
            level_scale /= step;
            level = resize_gray(&level, 1.0 / step);
        }

        Ok(detector::nms(candidates, HOG_NMS_THRESHOLD))
    }
}

/// HOG features of one pyramid level: unsigned 9-bin cell histograms,
/// grouped into L2-normalized 2×2-cell blocks at a one-cell stride.
/// A window descriptor is the row-major run of its 7×15 blocks.
struct HogGrid {
    blocks_x: usize,
    blocks_y: usize,
    blocks: Vec<f32>,
}

impl HogGrid {
    fn new(image: &GrayImage) -> Self {
        let cells_x = (image.width() / HOG_CELL) as usize;
        let cells_y = (image.height() / HOG_CELL) as usize;
        let gx = horizontal_sobel(image);
        let gy = vertical_sobel(image);
        let bin_width = std::f32::consts::PI / HOG_BINS as f32;

        let mut cells = vec![0.0f32; cells_x * cells_y * HOG_BINS];
        for y in 0..cells_y as u32 * HOG_CELL {
            for x in 0..cells_x as u32 * HOG_CELL {
                let dx = gx.get_pixel(x, y)[0] as f32;
                let dy = gy.get_pixel(x, y)[0] as f32;
                let magnitude = (dx * dx + dy * dy).sqrt();
                if magnitude == 0.0 {
                    continue;
                }
                // Split the vote between the two nearest bin centers.
                let pos = dy.atan2(dx).rem_euclid(std::f32::consts::PI) / bin_width - 0.5;
                let lower = pos.floor();
                let frac = pos - lower;
                let lo = (lower as i32).rem_euclid(HOG_BINS as i32) as usize;
                let hi = (lo + 1) % HOG_BINS;
                let cell = ((y / HOG_CELL) as usize * cells_x + (x / HOG_CELL) as usize) * HOG_BINS;
                cells[cell + lo] += magnitude * (1.0 - frac);
                cells[cell + hi] += magnitude * frac;
            }
        }

        let blocks_x = cells_x.saturating_sub(1);
        let blocks_y = cells_y.saturating_sub(1);
        let mut blocks = Vec::with_capacity(blocks_x * blocks_y * HOG_BLOCK_LEN);
        for by in 0..blocks_y {
            for bx in 0..blocks_x {
                let start = blocks.len();
                for (cy, cx) in [(by, bx), (by, bx + 1), (by + 1, bx), (by + 1, bx + 1)] {
                    let cell = (cy * cells_x + cx) * HOG_BINS;
                    blocks.extend_from_slice(&cells[cell..cell + HOG_BINS]);
                }
                let norm = (blocks[start..].iter().map(|v| v * v).sum::<f32>() + 1e-6).sqrt();
                blocks[start..].iter_mut().for_each(|v| *v /= norm);
            }
        }

        Self { blocks_x, blocks_y, blocks }
    }

    /// Descriptor of the window whose top-left block is `(cx, cy)`.
    fn window(&self, cx: usize, cy: usize, out: &mut Vec<f32>) {
        let (blocks_w, blocks_h) = HOG_WINDOW_BLOCKS;
        out.clear();
        for by in cy..cy + blocks_h {
            let row = (by * self.blocks_x + cx) * HOG_BLOCK_LEN;
            out.extend_from_slice(&self.blocks[row..row + blocks_w * HOG_BLOCK_LEN]);
        }
    }
}

fn resize_gray(image: &GrayImage, factor: f32) -> GrayImage {
    let w = ((image.width() as f32 * factor).round() as u32).max(1);
    let h = ((image.height() as f32 * factor).round() as u32).max(1);
    imageops::resize(image, w, h, FilterType::Triangle)
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Convert detector output to clamped integer person boxes.
fn to_person_boxes(boxes: Vec<BoundingBox>, bounds: (u32, u32), method: DetectionMethod) -> Vec<PersonBox> {
    let (bw, bh) = (bounds.0 as f32, bounds.1 as f32);
    boxes
        .into_iter()
        .filter_map(|b| {
            let x1 = b.x.clamp(0.0, bw);
            let y1 = b.y.clamp(0.0, bh);
            let x2 = (b.x + b.width).clamp(x1, bw);
            let y2 = (b.y + b.height).clamp(y1, bh);
            let (width, height) = ((x2 - x1) as u32, (y2 - y1) as u32);
            (width > 0 && height > 0).then_some(PersonBox {
                x: x1 as u32,
                y: y1 as u32,
                width,
                height,
                confidence: b.confidence.clamp(0.0, 1.0),
                method,
            })
        })
        .collect()
}

/// Lazily loaded YOLO strategy.
pub struct YoloPersons {
    model: LazyModel<YoloModel>,
    confidence: f32,
}

impl YoloPersons {
    pub fn new(model_path: &Path, config: &PersonConfig) -> Self {
        Self { model: LazyModel::new(model_path), confidence: config.confidence }
    }
}

impl PersonDetector for YoloPersons {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<PersonBox>, BackendError> {
        let model = self.model.get_or_load(YoloModel::load)?;
        let boxes = model.detect(image, self.confidence)?;
        Ok(to_person_boxes(boxes, image.dimensions(), DetectionMethod::Yolo))
    }
}

/// Lazily loaded HOG strategy.
pub struct HogPersons {
    model: LazyModel<HogModel>,
    config: PersonConfig,
}

impl HogPersons {
    pub fn new(svm_path: &Path, config: &PersonConfig) -> Self {
        Self { model: LazyModel::new(svm_path), config: config.clone() }
    }
}

impl PersonDetector for HogPersons {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<PersonBox>, BackendError> {
        let model = self.model.get_or_load(HogModel::load)?;
        let boxes = model.detect(image, &self.config)?;
        Ok(to_person_boxes(boxes, image.dimensions(), DetectionMethod::Hog))
    }
}

/// Tries the learned detector first and falls back to the classical one
/// only when the learned one is unavailable.
pub struct AutoPersons<P: PersonDetector, F: PersonDetector> {
    primary: P,
    fallback: F,
}

impl<P: PersonDetector, F: PersonDetector> AutoPersons<P, F> {
    pub fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }
}

impl<P: PersonDetector, F: PersonDetector> PersonDetector for AutoPersons<P, F> {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<PersonBox>, BackendError> {
        match self.primary.detect(image) {
            Err(BackendError::Unavailable(reason)) => {
                tracing::debug!(%reason, "primary person detector unavailable, using fallback");
                self.fallback.detect(image)
            }
            other => other,
        }
    }
}

/// Construct the configured person strategy. Models load on first use.
pub fn build_person_detector(models: &ModelPaths, config: &PersonConfig) -> Box<dyn PersonDetector> {
    match config.method {
        PersonMethod::Yolo => Box::new(YoloPersons::new(&models.yolo(), config)),
        PersonMethod::Hog => Box::new(HogPersons::new(&models.hog_svm(), config)),
        PersonMethod::Auto => Box::new(AutoPersons::new(
            YoloPersons::new(&models.yolo(), config),
            HogPersons::new(&models.hog_svm(), config),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Result<Vec<PersonBox>, &'static str>, bool);

    impl PersonDetector for Fixed {
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<PersonBox>, BackendError> {
            match &self.0 {
                Ok(boxes) => Ok(boxes.clone()),
                Err(msg) if self.1 => Err(BackendError::Unavailable(msg.to_string())),
                Err(msg) => Err(BackendError::Failed(msg.to_string())),
            }
        }
    }

    fn person(method: DetectionMethod) -> PersonBox {
        PersonBox { x: 1, y: 2, width: 60, height: 120, confidence: 0.9, method }
    }

    fn identity_letterbox() -> LetterboxInfo {
        LetterboxInfo { scale: 1.0, pad_x: 0.0, pad_y: 0.0 }
    }

    #[test]
    fn test_decode_yolo_keeps_person_class_only() {
        let rows = 4 + YOLO_NUM_CLASSES;
        let anchors = 2;
        let mut raw = vec![0.0f32; rows * anchors];
        // Anchor 0: person at (100, 200) 50×80, score 0.9.
        raw[0] = 100.0;
        raw[anchors] = 200.0;
        raw[2 * anchors] = 50.0;
        raw[3 * anchors] = 80.0;
        raw[4 * anchors] = 0.9;
        // Anchor 1: high score for class 2 (car) only.
        raw[1] = 300.0;
        raw[anchors + 1] = 300.0;
        raw[2 * anchors + 1] = 40.0;
        raw[3 * anchors + 1] = 40.0;
        raw[6 * anchors + 1] = 0.95;

        let boxes = decode_yolo(&raw, &identity_letterbox(), 0.5).unwrap();
        assert_eq!(boxes.len(), 1);
        let b = &boxes[0];
        assert!((b.x - 75.0).abs() < 1e-4 && (b.y - 160.0).abs() < 1e-4);
        assert!((b.width - 50.0).abs() < 1e-4 && (b.height - 80.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_yolo_rejects_bad_shape() {
        assert!(decode_yolo(&[0.0; 85], &identity_letterbox(), 0.5).is_err());
    }

    #[test]
    fn test_to_person_boxes_clamps_and_drops_empty() {
        let boxes = vec![
            BoundingBox { x: -10.0, y: 5.0, width: 60.0, height: 500.0, confidence: 1.2, landmarks: None },
            BoundingBox { x: 700.0, y: 5.0, width: 60.0, height: 50.0, confidence: 0.7, landmarks: None },
        ];
        let persons = to_person_boxes(boxes, (640, 480), DetectionMethod::Yolo);
        assert_eq!(persons.len(), 1);
        assert_eq!((persons[0].x, persons[0].y, persons[0].width, persons[0].height), (0, 5, 50, 475));
        assert!((persons[0].confidence - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_auto_falls_back_when_unavailable() {
        let mut auto = AutoPersons::new(Fixed(Err("no model"), true), Fixed(Ok(vec![person(DetectionMethod::Hog)]), false));
        let found = auto.detect(&RgbImage::new(10, 10)).unwrap();
        assert_eq!(found[0].method, DetectionMethod::Hog);
    }

    #[test]
    fn test_auto_propagates_inference_failure() {
        let mut auto = AutoPersons::new(Fixed(Err("boom"), false), Fixed(Ok(vec![person(DetectionMethod::Hog)]), false));
        assert!(matches!(auto.detect(&RgbImage::new(10, 10)), Err(BackendError::Failed(_))));
    }

    #[test]
    fn test_auto_prefers_primary() {
        let mut auto = AutoPersons::new(
            Fixed(Ok(vec![person(DetectionMethod::Yolo)]), false),
            Fixed(Ok(vec![person(DetectionMethod::Hog)]), false),
        );
        assert_eq!(auto.detect(&RgbImage::new(10, 10)).unwrap()[0].method, DetectionMethod::Yolo);
    }

    #[test]
    fn test_missing_models_are_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let models = ModelPaths::new(dir.path());
        let mut detector = build_person_detector(&models, &PersonConfig::default());
        assert!(matches!(detector.detect(&RgbImage::new(64, 128)), Err(BackendError::Unavailable(_))));
    }

    #[test]
    fn test_hog_model_rejects_wrong_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svm.json");
        std::fs::write(&path, r#"{"weights": [0.1, 0.2], "bias": 0.0}"#).unwrap();
        assert!(matches!(HogModel::load(&path), Err(PersonError::InvalidModel(_))));
    }

    #[test]
    fn test_hog_zero_weights_detect_nothing_above_threshold() {
        // sigmoid(bias) is the score for every window.
        let model = HogModel { weights: vec![0.0; HOG_DESCRIPTOR_LEN], bias: -2.0 };
        let image = RgbImage::from_pixel(80, 140, image::Rgb([120, 120, 120]));
        let boxes = model.detect(&image, &PersonConfig::default()).unwrap();
        assert!(boxes.is_empty());

        let model = HogModel { weights: vec![0.0; HOG_DESCRIPTOR_LEN], bias: 2.0 };
        let boxes = model.detect(&image, &PersonConfig::default()).unwrap();
        assert!(!boxes.is_empty());
        assert!(boxes.iter().all(|b| b.width >= 64.0 && b.height >= 128.0));
    }

    #[test]
    fn test_hog_grid_windows_slice_shared_blocks() {
        let image = GrayImage::from_fn(80, 144, |x, y| image::Luma([((x * 7 + y * 3) % 256) as u8]));
        let grid = HogGrid::new(&image);
        assert_eq!((grid.blocks_x, grid.blocks_y), (9, 17));

        let mut window = Vec::new();
        grid.window(1, 2, &mut window);
        assert_eq!(window.len(), HOG_DESCRIPTOR_LEN);

        let block = |bx: usize, by: usize| {
            let at = (by * grid.blocks_x + bx) * HOG_BLOCK_LEN;
            grid.blocks[at..at + HOG_BLOCK_LEN].to_vec()
        };
        assert_eq!(window[..HOG_BLOCK_LEN], block(1, 2)[..]);
        assert_eq!(window[HOG_BLOCK_LEN..2 * HOG_BLOCK_LEN], block(2, 2)[..]);
        let second_row = HOG_WINDOW_BLOCKS.0 * HOG_BLOCK_LEN;
        assert_eq!(window[second_row..second_row + HOG_BLOCK_LEN], block(1, 3)[..]);
    }

    #[test]
    fn test_hog_blocks_are_normalized() {
        let textured = GrayImage::from_fn(64, 128, |x, y| image::Luma([if (x / 4 + y / 6) % 2 == 0 { 30 } else { 220 }]));
        let grid = HogGrid::new(&textured);
        for block in grid.blocks.chunks(HOG_BLOCK_LEN) {
            let norm: f32 = block.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-3, "norm = {norm}");
        }

        let flat = GrayImage::from_pixel(64, 128, image::Luma([90]));
        assert!(HogGrid::new(&flat).blocks.iter().all(|&v| v == 0.0));
    }
}
