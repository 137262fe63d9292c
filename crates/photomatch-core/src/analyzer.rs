//! Feature extraction: faces, persons and clothing colors for one image.

use crate::backend::{BackendError, ColorClusterer, FaceBackend, LazyModel, PersonDetector};
use crate::color::{self, build_clusterer};
use crate::config::{AnalysisConfig, ClothingConfig, FaceConfig, ModelPaths};
use crate::detector::{FaceDetector, SCRFD_INPUT_SIZE};
use crate::person::build_person_detector;
use crate::recognizer::FaceRecognizer;
use crate::types::{Analysis, BoundingBox, ColorSet, Embedding, FaceBox, PersonBox, Region, RegionSource};
use image::imageops;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("face stage failed: {0}")]
    Face(BackendError),
}

/// SCRFD locator + ArcFace embedder, both loaded on first use.
pub struct ScrfdArcFace {
    detector: LazyModel<FaceDetector>,
    recognizer: LazyModel<FaceRecognizer>,
    input_size: usize,
    confidence: f32,
}

impl ScrfdArcFace {
    pub fn new(models: &ModelPaths, config: &FaceConfig) -> Self {
        Self {
            detector: LazyModel::new(models.scrfd()),
            recognizer: LazyModel::new(models.arcface()),
            input_size: SCRFD_INPUT_SIZE * config.upsample.clamp(1, 4) as usize,
            confidence: config.confidence,
        }
    }
}

impl FaceBackend for ScrfdArcFace {
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, BackendError> {
        let (size, confidence) = (self.input_size, self.confidence);
        let detector = self
            .detector
            .get_or_load(|path| FaceDetector::load(path, size, confidence))?;
        detector.detect(image).map_err(|e| BackendError::Failed(e.to_string()))
    }

    fn embed(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, BackendError> {
        let recognizer = self.recognizer.get_or_load(FaceRecognizer::load)?;
        recognizer
            .extract(image, face)
            .map_err(|e| BackendError::Failed(e.to_string()))
    }
}

/// Runs the configured backends over one image.
pub struct Analyzer {
    config: AnalysisConfig,
    faces: Box<dyn FaceBackend>,
    persons: Box<dyn PersonDetector>,
    colors: Box<dyn ColorClusterer>,
}

impl Analyzer {
    /// Wire the production backends from model files under `models`.
    pub fn new(config: AnalysisConfig, models: &ModelPaths) -> Self {
        let faces = Box::new(ScrfdArcFace::new(models, &config.face));
        let persons = build_person_detector(models, &config.person);
        let colors = build_clusterer(config.clothing.clusterer);
        Self::with_backends(config, faces, persons, colors)
    }

    pub fn with_backends(
        config: AnalysisConfig,
        faces: Box<dyn FaceBackend>,
        persons: Box<dyn PersonDetector>,
        colors: Box<dyn ColorClusterer>,
    ) -> Self {
        Self { config, faces, persons, colors }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Analyze one image. `clothing` carries the per-station clothing
    /// tuning; the face and person stages use the analyzer's own config.
    ///
    /// An unavailable backend degrades its stage to an empty result; a
    /// face backend failing on this input aborts the image.
    pub fn analyze(&mut self, image: &RgbImage, clothing: &ClothingConfig) -> Result<Analysis, AnalyzerError> {
        let (width, height) = image.dimensions();

        let faces = if self.config.face.enabled {
            self.detect_faces(image)?
        } else {
            Vec::new()
        };

        let persons = if self.config.person.enabled {
            self.detect_persons(image)
        } else {
            Vec::new()
        };

        let clothing_color_sets = if clothing.enabled {
            self.clothing_colors(image, &faces, &persons, clothing)
        } else {
            Vec::new()
        };

        tracing::info!(
            width,
            height,
            faces = faces.len(),
            persons = persons.len(),
            color_sets = clothing_color_sets.len(),
            "image analyzed"
        );

        Ok(Analysis { width, height, faces, persons, clothing_color_sets })
    }

    /// Embedding of the most confident qualifying face, for search queries.
    pub fn embed_query_face(&mut self, image: &RgbImage) -> Result<Option<Embedding>, AnalyzerError> {
        let mut faces = self.detect_faces(image)?;
        Ok((!faces.is_empty()).then(|| faces.swap_remove(0).embedding))
    }

    /// Locate faces, drop undersized or degenerate boxes, embed the rest.
    fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<FaceBox>, AnalyzerError> {
        let located = match self.faces.locate(image) {
            Ok(boxes) => boxes,
            Err(BackendError::Unavailable(reason)) => {
                tracing::warn!(%reason, "face backend unavailable, skipping face stage");
                return Ok(Vec::new());
            }
            Err(e) => return Err(AnalyzerError::Face(e)),
        };

        let min_size = self.config.face.min_face_size;
        let mut faces = Vec::with_capacity(located.len());
        for candidate in located {
            let Some((top, right, bottom, left)) = face_edges(&candidate, image.dimensions()) else {
                continue;
            };
            if right - left < min_size || bottom - top < min_size {
                tracing::debug!(width = right - left, height = bottom - top, min_size, "face below minimum size");
                continue;
            }

            let embedding = match self.faces.embed(image, &candidate) {
                Ok(embedding) => embedding,
                Err(BackendError::Unavailable(reason)) => {
                    tracing::warn!(%reason, "face embedder unavailable, skipping face stage");
                    return Ok(Vec::new());
                }
                Err(e) => return Err(AnalyzerError::Face(e)),
            };

            faces.push(FaceBox { top, right, bottom, left, embedding });
        }
        Ok(faces)
    }

    fn detect_persons(&mut self, image: &RgbImage) -> Vec<PersonBox> {
        let config = &self.config.person;
        match self.persons.detect(image) {
            Ok(found) => found
                .into_iter()
                .filter(|p| p.width >= config.min_width && p.height >= config.min_height)
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "person detection degraded to empty");
                Vec::new()
            }
        }
    }

    fn clothing_colors(
        &self,
        image: &RgbImage,
        faces: &[FaceBox],
        persons: &[PersonBox],
        config: &ClothingConfig,
    ) -> Vec<ColorSet> {
        let bounds = image.dimensions();
        let regions: Vec<(RegionSource, usize, Region)> = if !faces.is_empty() {
            faces
                .iter()
                .enumerate()
                .map(|(i, f)| (RegionSource::Face, i, body_region_from_face(f, config, bounds)))
                .collect()
        } else {
            persons
                .iter()
                .enumerate()
                .map(|(i, p)| (RegionSource::Person, i, body_region_from_person(p, bounds)))
                .collect()
        };

        regions
            .into_iter()
            .map(|(source, index, region)| {
                let colors = if region.is_empty() {
                    Vec::new()
                } else {
                    let crop = imageops::crop_imm(image, region.x, region.y, region.width, region.height).to_image();
                    self.colors
                        .dominant_colors(&crop, config.num_colors)
                        .into_iter()
                        .map(color::swatch)
                        .collect()
                };
                ColorSet { source, index, region, colors }
            })
            .collect()
    }
}

/// Detector float box → clamped integer edges, or `None` if degenerate.
fn face_edges(b: &BoundingBox, bounds: (u32, u32)) -> Option<(u32, u32, u32, u32)> {
    let region = Region::from_edges(
        b.x.round() as i64,
        b.y.round() as i64,
        (b.x + b.width).round() as i64,
        (b.y + b.height).round() as i64,
        bounds,
    );
    (!region.is_empty()).then(|| (region.y, region.right(), region.bottom(), region.x))
}

/// Torso below a face: starts at the chin, `body_width_ratio` face widths
/// wide centered on the face, `body_ratio` face heights tall.
///
/// Near the left edge the box shifts right instead of narrowing.
pub fn body_region_from_face(face: &FaceBox, config: &ClothingConfig, bounds: (u32, u32)) -> Region {
    let fw = face.width() as f32;
    let fh = face.height() as f32;
    let left = (face.left as i64 - (fw * (config.body_width_ratio - 1.0) / 2.0) as i64).max(0);
    let width = (fw * config.body_width_ratio) as i64;
    let height = (fh * config.body_ratio) as i64;
    let top = face.bottom as i64;
    Region::from_edges(left, top, left + width, top + height, bounds)
}

/// Middle band of a person box: 20%–60% of the height, 10%–90% of the width.
pub fn body_region_from_person(p: &PersonBox, bounds: (u32, u32)) -> Region {
    let (x, y) = (p.x as f32, p.y as f32);
    let (w, h) = (p.width as f32, p.height as f32);
    Region::from_edges(
        (x + 0.1 * w) as i64,
        (y + 0.2 * h) as i64,
        (x + 0.9 * w) as i64,
        (y + 0.6 * h) as i64,
        bounds,
    )
}
