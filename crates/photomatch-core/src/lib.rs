//! photomatch-core: photo analysis and similarity matching engine.
//!
//! Locates faces (SCRFD) and embeds them (ArcFace), detects people (YOLO or
//! HOG), extracts dominant clothing colors, and scores stored feature
//! records against face and color queries. Models run on ONNX Runtime.

pub mod alignment;
pub mod analyzer;
pub mod annotator;
pub mod backend;
pub mod color;
pub mod config;
pub mod detector;
pub mod matcher;
pub mod person;
pub mod recognizer;
pub mod types;

pub use analyzer::{Analyzer, AnalyzerError};
pub use annotator::Annotator;
pub use backend::{BackendError, ColorClusterer, FaceBackend, PersonDetector};
pub use config::{AnalysisConfig, ClothingConfig, FaceConfig, ModelPaths, PersonConfig, PersonMethod};
pub use matcher::{MatchResult, MatchType, Matcher, Query, SearchConfig, SearchStats};
pub use types::{
    Analysis, BoundingBox, Brightness, ColorSet, ColorSwatch, DetectionMethod, Embedding, FaceBox,
    FeatureRecord, PersonBox, Region, RegionSource, Rgb,
};
