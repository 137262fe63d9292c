//! Capability contracts for the pluggable analysis backends.
//!
//! The analyzer only ever talks to these traits. Concrete implementations
//! (SCRFD/ArcFace, YOLO, HOG, k-means) are picked at construction time from
//! configuration.

use crate::types::{BoundingBox, Embedding, PersonBox, Rgb};
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    /// The capability is not present at runtime (missing model file, failed load).
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// The capability is present but failed on this input.
    #[error("backend failed: {0}")]
    Failed(String),
}

/// Face locator + embedder.
pub trait FaceBackend: Send {
    /// Locate faces in an RGB image. Boxes are in image pixel coordinates.
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, BackendError>;

    /// Compute the identity embedding for one located face.
    fn embed(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, BackendError>;
}

/// Person detector restricted to the "person" class.
pub trait PersonDetector: Send {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<PersonBox>, BackendError>;
}

/// A dominant color with its share of the sampled pixels (0–100).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedColor {
    pub rgb: Rgb,
    pub percentage: f32,
}

/// Dominant color extraction. Never fails: returns an empty or partial list.
pub trait ColorClusterer: Send + Sync {
    fn dominant_colors(&self, region: &RgbImage, count: usize) -> Vec<WeightedColor>;
}

/// Lazily loaded model state.
///
/// Loading happens on the first call to [`get_or_load`](Self::get_or_load);
/// a failed load is remembered, so later calls fail soft without touching
/// the disk again.
pub enum LazyModel<T> {
    Unloaded(PathBuf),
    Loaded(T),
    Unavailable(String),
}

impl<T> LazyModel<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        LazyModel::Unloaded(path.into())
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, LazyModel::Loaded(_))
    }

    pub fn get_or_load<E, F>(&mut self, load: F) -> Result<&mut T, BackendError>
    where
        E: std::fmt::Display,
        F: FnOnce(&Path) -> Result<T, E>,
    {
        if let LazyModel::Unloaded(path) = self {
            let path = std::mem::take(path);
            *self = match load(&path) {
                Ok(model) => LazyModel::Loaded(model),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "model unavailable");
                    LazyModel::Unavailable(format!("{}: {e}", path.display()))
                }
            };
        }

        match self {
            LazyModel::Loaded(model) => Ok(model),
            LazyModel::Unavailable(reason) => Err(BackendError::Unavailable(reason.clone())),
            LazyModel::Unloaded(_) => unreachable!("slot resolved above"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_model_loads_once() {
        let mut slot: LazyModel<u32> = LazyModel::new("/models/a.onnx");
        let mut calls = 0;
        for _ in 0..3 {
            let v = slot
                .get_or_load(|_| {
                    calls += 1;
                    Ok::<_, String>(7)
                })
                .unwrap();
            assert_eq!(*v, 7);
        }
        assert_eq!(calls, 1);
        assert!(slot.is_loaded());
    }

    #[test]
    fn test_lazy_model_remembers_failure() {
        let mut slot: LazyModel<u32> = LazyModel::new("/missing.onnx");
        let mut calls = 0;
        for _ in 0..2 {
            let err = slot
                .get_or_load(|_| {
                    calls += 1;
                    Err::<u32, _>("not found")
                })
                .unwrap_err();
            assert!(matches!(err, BackendError::Unavailable(_)));
        }
        assert_eq!(calls, 1);
    }
}
