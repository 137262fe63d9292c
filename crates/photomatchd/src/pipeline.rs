//! Intake pipeline: validate, crop, analyze, annotate, store.

use crate::config::ProcessingConfig;
use crate::crop::{self, CropSettings};
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use photomatch_core::types::record_id;
use photomatch_core::{Analyzer, AnalyzerError, Annotator, Embedding, FeatureRecord};
use photomatch_store::{FeatureStore, SettingsSource, StoreError};
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// File extensions accepted at intake (compared case-insensitively).
pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif", "webp"];

const SCRATCH_PREFIX: &str = "scratch_";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("not a supported image file: {0}")]
    Unsupported(String),
    #[error("cannot decode {path}: {source}")]
    Input {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to write {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("analysis failed: {0}")]
    Analysis(#[from] AnalyzerError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("analyzer lock poisoned")]
    Poisoned,
}

/// True if the path has a supported image extension. Does not touch the disk.
pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| SUPPORTED_EXTENSIONS.iter().any(|s| s.eq_ignore_ascii_case(e)))
}

/// Folder layout the pipeline reads from and writes to.
#[derive(Debug, Clone)]
pub struct PipelineDirs {
    pub input: PathBuf,
    pub scratch: PathBuf,
    pub processed: PathBuf,
    pub output: PathBuf,
}

impl PipelineDirs {
    fn all(&self) -> [&Path; 4] {
        [&self.input, &self.scratch, &self.processed, &self.output]
    }
}

/// Outcome of one intake sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub processed: usize,
    pub errors: usize,
    pub skipped: usize,
    /// Filenames stored during this sweep.
    pub files: Vec<String>,
}

/// Running counters plus current folder sizes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub processed: u64,
    pub errors: u64,
    pub last_processed: Option<DateTime<Utc>>,
    pub input_count: usize,
    pub scratch_count: usize,
    pub processed_count: usize,
    pub output_count: usize,
}

#[derive(Default)]
struct Counters {
    processed: u64,
    errors: u64,
    last_processed: Option<DateTime<Utc>>,
}

/// Turns intake photos into stored feature records.
///
/// Safe to share between the watcher thread and request handlers; analysis
/// runs one image at a time on the shared analyzer.
pub struct Pipeline {
    dirs: PipelineDirs,
    options: ProcessingConfig,
    analyzer: Mutex<Analyzer>,
    annotator: Annotator,
    store: Arc<dyn FeatureStore>,
    settings: Arc<dyn SettingsSource>,
    counters: Mutex<Counters>,
}

impl Pipeline {
    /// Create the pipeline, making sure every folder exists.
    pub fn new(
        dirs: PipelineDirs,
        options: ProcessingConfig,
        analyzer: Analyzer,
        annotator: Annotator,
        store: Arc<dyn FeatureStore>,
        settings: Arc<dyn SettingsSource>,
    ) -> Result<Self, PipelineError> {
        for dir in dirs.all() {
            std::fs::create_dir_all(dir).map_err(|source| io_error(dir, source))?;
        }
        Ok(Self {
            dirs,
            options,
            analyzer: Mutex::new(analyzer),
            annotator,
            store,
            settings,
            counters: Mutex::new(Counters::default()),
        })
    }

    pub fn dirs(&self) -> &PipelineDirs {
        &self.dirs
    }

    pub fn store(&self) -> &Arc<dyn FeatureStore> {
        &self.store
    }

    /// Process one photo for `station` and store its record.
    ///
    /// Nothing is stored when any step before the store append fails. A
    /// failed annotation only leaves the record without an overlay.
    pub fn process(&self, path: &Path, station: &str) -> Result<FeatureRecord, PipelineError> {
        let result = self.run(path, station);
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        match &result {
            Ok(record) => {
                counters.processed += 1;
                counters.last_processed = Some(Utc::now());
                tracing::info!(
                    id = %record.id,
                    file = %record.filename,
                    faces = record.faces.len(),
                    persons = record.persons.len(),
                    "image processed"
                );
            }
            Err(e) => {
                counters.errors += 1;
                tracing::error!(path = %path.display(), error = %e, "image processing failed");
            }
        }
        result
    }

    /// Process every intake file that has no record yet.
    pub fn process_all_pending(&self, station: &str) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for path in self.pending_files() {
            let Some(filename) = file_name(&path) else {
                continue;
            };
            if self.store.get_by_filename(&filename).is_some() {
                outcome.skipped += 1;
                continue;
            }
            match self.process(&path, station) {
                Ok(_) => {
                    outcome.processed += 1;
                    outcome.files.push(filename);
                }
                Err(_) => outcome.errors += 1,
            }
        }
        tracing::info!(
            processed = outcome.processed,
            skipped = outcome.skipped,
            errors = outcome.errors,
            "intake sweep finished"
        );
        outcome
    }

    /// Embedding of the most confident face in the image at `path`.
    pub fn embed_query_face(&self, path: &Path) -> Result<Option<Embedding>, PipelineError> {
        let image = decode(path)?;
        self.embed_query_image(&image)
    }

    pub fn embed_query_image(&self, image: &RgbImage) -> Result<Option<Embedding>, PipelineError> {
        let mut analyzer = self.analyzer.lock().map_err(|_| PipelineError::Poisoned)?;
        Ok(analyzer.embed_query_face(image)?)
    }

    /// Remove leftover scratch files. Returns how many were deleted.
    pub fn cleanup_scratch(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.dirs.scratch) else {
            return 0;
        };
        let deleted = entries
            .flatten()
            .filter(|e| e.path().is_file())
            .filter(|e| std::fs::remove_file(e.path()).is_ok())
            .count();
        tracing::info!(deleted, "scratch folder cleaned");
        deleted
    }

    pub fn stats(&self) -> PipelineStats {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        PipelineStats {
            processed: counters.processed,
            errors: counters.errors,
            last_processed: counters.last_processed,
            input_count: count_images(&self.dirs.input),
            scratch_count: count_images(&self.dirs.scratch),
            processed_count: count_images(&self.dirs.processed),
            output_count: count_images(&self.dirs.output),
        }
    }

    /// Supported files in the intake folder, sorted by name.
    fn pending_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.dirs.input) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_supported(p))
            .collect();
        files.sort();
        files
    }

    fn run(&self, path: &Path, station: &str) -> Result<FeatureRecord, PipelineError> {
        if !path.is_file() || !is_supported(path) {
            return Err(PipelineError::Unsupported(path.display().to_string()));
        }
        let filename = file_name(path).ok_or_else(|| PipelineError::Unsupported(path.display().to_string()))?;
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| filename.clone());

        let image = decode(path)?;
        tracing::debug!(file = %filename, width = image.width(), height = image.height(), "image loaded");

        let crop = CropSettings::for_station(self.settings.as_ref(), station);
        let image = crop::apply(image, &crop);

        let scratch = self
            .dirs
            .scratch
            .join(format!("{SCRATCH_PREFIX}{}_{stem}.jpg", uuid::Uuid::new_v4().simple()));
        save_jpeg(&image, &scratch, self.options.jpeg_quality)?;

        let result = self.analyze_and_store(path, &scratch, &filename, station);

        if let Err(e) = std::fs::remove_file(&scratch) {
            tracing::warn!(path = %scratch.display(), error = %e, "failed to remove scratch file");
        }

        let record = result?;
        if self.options.delete_original {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::info!(path = %path.display(), "original deleted"),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to delete original"),
            }
        }
        Ok(record)
    }

    fn analyze_and_store(
        &self,
        original: &Path,
        scratch: &Path,
        filename: &str,
        station: &str,
    ) -> Result<FeatureRecord, PipelineError> {
        let image = decode(scratch)?;

        let analysis = {
            let mut analyzer = self.analyzer.lock().map_err(|_| PipelineError::Poisoned)?;
            let clothing = match self.settings.get(station, "clothing") {
                Some(overrides) => analyzer.config().clothing.with_overrides(&overrides),
                None => analyzer.config().clothing.clone(),
            };
            analyzer.analyze(&image, &clothing)?
        };

        // Named after the record id: intake files may share a stem.
        let now = Utc::now();
        let id = record_id(filename, now);

        let annotated = self.dirs.processed.join(format!("annotated_{id}.jpg"));
        let annotated_path = match save_jpeg(&self.annotator.render(&image, &analysis), &annotated, self.options.jpeg_quality) {
            Ok(()) => Some(annotated),
            Err(e) => {
                tracing::warn!(error = %e, "annotation skipped");
                None
            }
        };

        let output_path = self.dirs.output.join(format!("{id}.jpg"));
        if let Err(e) = save_jpeg(&image, &output_path, self.options.jpeg_quality) {
            remove_outputs(annotated_path.iter().chain([&output_path]));
            return Err(e);
        }

        let timestamp = std::fs::metadata(original)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or(now);

        let record = FeatureRecord {
            id,
            filename: filename.to_string(),
            original_path: original.to_path_buf(),
            annotated_path,
            output_path,
            timestamp,
            width: analysis.width,
            height: analysis.height,
            faces: analysis.faces,
            persons: analysis.persons,
            clothing_color_sets: analysis.clothing_color_sets,
            created_at: now,
        };
        if let Err(e) = self.store.add(record.clone()) {
            remove_outputs(record.annotated_path.iter().chain([&record.output_path]));
            return Err(e.into());
        }
        Ok(record)
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

fn io_error(path: &Path, source: std::io::Error) -> PipelineError {
    PipelineError::Io { path: path.display().to_string(), source }
}

fn decode(path: &Path) -> Result<RgbImage, PipelineError> {
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|source| PipelineError::Input { path: path.display().to_string(), source })
}

fn save_jpeg(image: &RgbImage, path: &Path, quality: u8) -> Result<(), PipelineError> {
    let file = File::create(path).map_err(|source| io_error(path, source))?;
    let encoder = JpegEncoder::new_with_quality(BufWriter::new(file), quality.clamp(1, 100));
    image
        .write_with_encoder(encoder)
        .map_err(|source| PipelineError::Encode { path: path.display().to_string(), source })
}

/// Best-effort removal of files written for a record that was not stored.
fn remove_outputs<'a>(paths: impl IntoIterator<Item = &'a PathBuf>) {
    for path in paths {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove orphaned output");
            }
        }
    }
}

fn count_images(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| entries.flatten().filter(|e| is_supported(&e.path())).count())
        .unwrap_or(0)
}
