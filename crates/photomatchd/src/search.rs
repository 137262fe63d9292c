//! Station-aware search over the feature store.

use crate::pipeline::{Pipeline, PipelineError};
use image::RgbImage;
use photomatch_core::color::parse_hex_color;
use photomatch_core::{Embedding, MatchResult, Matcher, Query, SearchConfig, SearchStats};
use photomatch_store::SettingsSource;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("invalid color: {0}")]
    InvalidColor(String),
    #[error("query has neither a face image nor colors")]
    EmptyQuery,
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Search request as received over the bus.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SearchRequest {
    pub station: Option<String>,
    /// Photo whose most confident face is the face query.
    pub face_image: Option<PathBuf>,
    /// `#rrggbb` or `rrggbb`.
    pub colors: Vec<String>,
    pub face_weight: Option<f64>,
    pub color_weight: Option<f64>,
    pub max_results: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<MatchResult>,
    pub total: usize,
    /// False when a face image was given but no face was found in it.
    pub face_found: bool,
    pub stats: SearchStats,
}

/// Runs queries with the daemon's search config plus station overrides.
pub struct SearchService {
    base: SearchConfig,
}

impl SearchService {
    pub fn new(base: SearchConfig) -> Self {
        Self { base }
    }

    /// Effective config for `station`: the `search` settings blob over the base.
    pub fn config_for(&self, settings: &dyn SettingsSource, station: &str) -> SearchConfig {
        match settings.get(station, "search") {
            Some(overrides) => self.base.with_overrides(&overrides),
            None => self.base.clone(),
        }
    }

    /// Resolve a request into a query and score the store snapshot.
    pub fn search(
        &self,
        pipeline: &Pipeline,
        settings: &dyn SettingsSource,
        default_station: &str,
        request: &SearchRequest,
    ) -> Result<SearchResponse, SearchError> {
        let colors = parse_colors(&request.colors)?;
        let face = match &request.face_image {
            Some(path) => Some(pipeline.embed_query_face(path)?),
            None => None,
        };
        self.run(pipeline, settings, default_station, request, face, colors)
    }

    /// Search with a face taken from an already decoded image, e.g. a camera frame.
    pub fn search_image(
        &self,
        pipeline: &Pipeline,
        settings: &dyn SettingsSource,
        default_station: &str,
        request: &SearchRequest,
        image: &RgbImage,
    ) -> Result<SearchResponse, SearchError> {
        let colors = parse_colors(&request.colors)?;
        let face = Some(pipeline.embed_query_image(image)?);
        self.run(pipeline, settings, default_station, request, face, colors)
    }

    fn run(
        &self,
        pipeline: &Pipeline,
        settings: &dyn SettingsSource,
        default_station: &str,
        request: &SearchRequest,
        face: Option<Option<Embedding>>,
        colors: Vec<photomatch_core::Rgb>,
    ) -> Result<SearchResponse, SearchError> {
        if face.is_none() && colors.is_empty() {
            return Err(SearchError::EmptyQuery);
        }
        let face_found = !matches!(face, Some(None));

        let station = request.station.as_deref().unwrap_or(default_station);
        let mut config = self.config_for(settings, station);
        if let Some(limit) = request.max_results {
            config.max_results = limit;
        }

        let query = Query {
            face: face.flatten(),
            colors,
            face_weight: request.face_weight,
            color_weight: request.color_weight,
        };

        let records = pipeline.store().snapshot();
        let matcher = Matcher::new(config);
        let results = matcher.score(&query, records.iter());
        tracing::info!(
            station,
            face = query.face.is_some(),
            colors = query.colors.len(),
            results = results.len(),
            "search finished"
        );

        Ok(SearchResponse {
            total: results.len(),
            results,
            face_found,
            stats: matcher.stats(records.iter()),
        })
    }
}

fn parse_colors(colors: &[String]) -> Result<Vec<photomatch_core::Rgb>, SearchError> {
    colors
        .iter()
        .map(|c| parse_hex_color(c).ok_or_else(|| SearchError::InvalidColor(c.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessingConfig;
    use crate::pipeline::tests::{pipeline, pipeline_with, write_photo, MapSettings};
    use photomatch_core::MatchType;
    use photomatch_store::NoSettings;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_color_search_finds_processed_photo() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        write_photo(&pipeline.dirs().input, "shirt.jpg");
        pipeline.process_all_pending("default");

        // The body region below the fixed face starts in the light half of the photo.
        let service = SearchService::new(SearchConfig::default());
        let request = SearchRequest { colors: vec!["#dcdcdc".into()], ..Default::default() };
        let response = service.search(&pipeline, &NoSettings, "default", &request).unwrap();
        assert_eq!(response.total, 1);
        assert_eq!(response.results[0].filename, "shirt.jpg");
        assert_eq!(response.results[0].match_type, MatchType::Color);
        assert!(response.results[0].score > 50.0);
        assert_eq!(response.stats.total_records, 1);
    }

    #[test]
    fn test_deleted_record_leaves_search_results() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let record = pipeline.process(&write_photo(&pipeline.dirs().input, "shirt.jpg"), "default").unwrap();

        let service = SearchService::new(SearchConfig::default());
        let request = SearchRequest { colors: vec!["#dcdcdc".into()], ..Default::default() };
        let before = service.search(&pipeline, &NoSettings, "default", &request).unwrap();
        assert_eq!(before.results.len(), 1);
        assert_eq!(before.results[0].record_id, record.id);

        assert!(pipeline.store().delete(&record.id).unwrap());
        let after = service.search(&pipeline, &NoSettings, "default", &request).unwrap();
        assert!(after.results.is_empty());
        assert_eq!(after.total, 0);
        assert_eq!(after.stats.total_records, 0);
    }

    #[test]
    fn test_face_image_search() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        write_photo(&pipeline.dirs().input, "guest.jpg");
        pipeline.process_all_pending("default");
        let query = write_photo(dir.path(), "query.png");

        let service = SearchService::new(SearchConfig::default());
        let request = SearchRequest { face_image: Some(query), ..Default::default() };
        let response = service.search(&pipeline, &NoSettings, "default", &request).unwrap();
        assert!(response.face_found);
        assert_eq!(response.results.len(), 1);
        assert!((response.results[0].score - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_and_empty_queries() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let service = SearchService::new(SearchConfig::default());

        let bad = SearchRequest { colors: vec!["#zz0000".into()], ..Default::default() };
        assert!(matches!(
            service.search(&pipeline, &NoSettings, "default", &bad),
            Err(SearchError::InvalidColor(_))
        ));
        assert!(matches!(
            service.search(&pipeline, &NoSettings, "default", &SearchRequest::default()),
            Err(SearchError::EmptyQuery)
        ));
    }

    #[test]
    fn test_no_match_is_empty_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        write_photo(&pipeline.dirs().input, "shirt.jpg");
        pipeline.process_all_pending("default");

        let service = SearchService::new(SearchConfig::default());
        let request = SearchRequest { colors: vec!["00ff00".into()], ..Default::default() };
        let response = service.search(&pipeline, &NoSettings, "default", &request).unwrap();
        assert!(response.results.is_empty());
    }

    #[test]
    fn test_station_overrides_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = MapSettings::default();
        settings.0.insert(("booth".into(), "search".into()), json!({"min_score": 99.5}));
        let settings = Arc::new(settings);
        let pipeline = pipeline_with(dir.path(), ProcessingConfig::default(), settings.clone(), false);
        write_photo(&pipeline.dirs().input, "a.jpg");
        write_photo(&pipeline.dirs().input, "b.jpg");
        pipeline.process_all_pending("default");

        let service = SearchService::new(SearchConfig::default());
        assert!((service.config_for(settings.as_ref(), "booth").min_score - 99.5).abs() < 1e-9);

        let request = SearchRequest {
            station: Some("booth".into()),
            colors: vec!["#dcdcdc".into()],
            ..Default::default()
        };
        let strict = service.search(&pipeline, settings.as_ref(), "default", &request).unwrap();
        assert!(strict.results.is_empty());

        let request = SearchRequest { colors: vec!["#dcdcdc".into()], max_results: Some(1), ..Default::default() };
        let limited = service.search(&pipeline, settings.as_ref(), "default", &request).unwrap();
        assert_eq!(limited.results.len(), 1);
        assert_eq!(limited.stats.total_records, 2);
    }
}
