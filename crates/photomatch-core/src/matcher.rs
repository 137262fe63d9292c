//! Similarity scoring of stored feature records against a query.
//!
//! Each modality maps a best-match distance to a 0–100 score with a
//! piecewise-linear curve: 100 at distance 0, 50 at the threshold, then
//! falling to 0 over `span` beyond it.

use crate::color::rgb_distance;
use crate::config::apply_overrides;
use crate::types::{ColorSwatch, Embedding, FeatureRecord, Rgb};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Euclidean embedding distance scoring exactly 50.
    pub face_threshold: f64,
    /// RGB distance scoring exactly 50.
    pub color_threshold: f64,
    pub max_results: usize,
    /// Results below this combined score are dropped.
    pub min_score: f64,
    pub face_weight: f64,
    pub color_weight: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            face_threshold: 0.6,
            color_threshold: 50.0,
            max_results: 20,
            min_score: 20.0,
            face_weight: 0.7,
            color_weight: 0.3,
        }
    }
}

impl SearchConfig {
    /// Overlay a per-station JSON object. Unknown keys are ignored; a
    /// malformed override leaves the base config untouched.
    pub fn with_overrides(&self, overrides: &serde_json::Value) -> SearchConfig {
        apply_overrides(self, overrides)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub face: Option<Embedding>,
    #[serde(default)]
    pub colors: Vec<Rgb>,
    pub face_weight: Option<f64>,
    pub color_weight: Option<f64>,
}

impl Query {
    /// Effective (face, color) weights. A single supplied weight implies
    /// the other as its complement.
    pub fn weights(&self, config: &SearchConfig) -> (f64, f64) {
        let clamp = |w: f64| w.clamp(0.0, 1.0);
        match (self.face_weight, self.color_weight) {
            (Some(f), Some(c)) => (clamp(f), clamp(c)),
            (Some(f), None) => (clamp(f), 1.0 - clamp(f)),
            (None, Some(c)) => (1.0 - clamp(c), clamp(c)),
            (None, None) => (config.face_weight, config.color_weight),
        }
    }

    fn wants_face(&self) -> bool {
        self.face.as_ref().is_some_and(|e| !e.values.is_empty())
    }

    fn wants_color(&self) -> bool {
        !self.colors.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Face,
    Color,
    Combined,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMatchDetail {
    /// Smallest distance to any comparable face; `None` when the record has none.
    pub distance: Option<f64>,
    pub threshold: f64,
    pub matched: bool,
    pub face_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorMatchDetail {
    pub query: Rgb,
    pub distance: Option<f64>,
    pub score: f64,
    pub matched: bool,
    pub swatch: Option<ColorSwatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchDetails {
    pub face: Option<FaceMatchDetail>,
    pub color: Vec<ColorMatchDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub record_id: String,
    pub filename: String,
    pub score: f64,
    pub face_score: Option<f64>,
    pub color_score: Option<f64>,
    pub match_type: MatchType,
    pub details: MatchDetails,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchStats {
    pub total_records: usize,
    pub records_with_faces: usize,
    pub records_with_colors: usize,
    pub total_faces: usize,
}

/// Piecewise score: linear 100→50 on `[0, threshold]`, then 50→0 over `span`.
pub fn threshold_score(distance: f64, threshold: f64, span: f64) -> f64 {
    if threshold <= 0.0 {
        return if distance <= 0.0 { 100.0 } else { 0.0 };
    }
    if distance <= threshold {
        (100.0 - distance / threshold * 50.0).max(0.0)
    } else if span <= 0.0 {
        0.0
    } else {
        (50.0 - (distance - threshold) / span * 50.0).max(0.0)
    }
}

/// Face curve: the tail spans `1 - threshold`.
pub fn face_score(distance: f64, threshold: f64) -> f64 {
    threshold_score(distance, threshold, 1.0 - threshold)
}

/// Color curve: the tail spans one more `threshold`.
pub fn color_score(distance: f64, threshold: f64) -> f64 {
    threshold_score(distance, threshold, threshold)
}

pub struct Matcher {
    config: SearchConfig,
}

impl Matcher {
    pub fn new(config: SearchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Score every record, drop those under the floor, rank descending.
    /// Equal scores keep the order of `records`.
    pub fn score<'a>(&self, query: &Query, records: impl IntoIterator<Item = &'a FeatureRecord>) -> Vec<MatchResult> {
        let (wants_face, wants_color) = (query.wants_face(), query.wants_color());
        if !wants_face && !wants_color {
            return Vec::new();
        }
        let (face_weight, color_weight) = query.weights(&self.config);

        let results = records
            .into_iter()
            .map(|record| {
                let face = query
                    .face
                    .as_ref()
                    .filter(|_| wants_face)
                    .map(|embedding| self.face_modality(embedding, record));
                let color = wants_color.then(|| self.color_modality(&query.colors, record));

                let (score, match_type) = match (&face, &color) {
                    (Some((f, _)), Some((c, _))) => (f * face_weight + c * color_weight, MatchType::Combined),
                    (Some((f, _)), None) => (*f, MatchType::Face),
                    (None, Some((c, _))) => (*c, MatchType::Color),
                    (None, None) => (0.0, MatchType::Combined),
                };

                MatchResult {
                    record_id: record.id.clone(),
                    filename: record.filename.clone(),
                    score,
                    face_score: face.as_ref().map(|(s, _)| *s),
                    color_score: color.as_ref().map(|(s, _)| *s),
                    match_type,
                    details: MatchDetails {
                        face: face.map(|(_, d)| d),
                        color: color.map(|(_, d)| d).unwrap_or_default(),
                    },
                }
            })
            .collect();

        rank(results, self.config.min_score, self.config.max_results)
    }

    fn face_modality(&self, query: &Embedding, record: &FeatureRecord) -> (f64, FaceMatchDetail) {
        let threshold = self.config.face_threshold;
        let best = record
            .faces
            .iter()
            .enumerate()
            .filter_map(|(i, f)| query.distance(&f.embedding).map(|d| (i, d as f64)))
            .min_by(|a, b| a.1.total_cmp(&b.1));

        match best {
            Some((index, distance)) => (
                face_score(distance, threshold),
                FaceMatchDetail { distance: Some(distance), threshold, matched: distance <= threshold, face_index: Some(index) },
            ),
            None => (0.0, FaceMatchDetail { distance: None, threshold, matched: false, face_index: None }),
        }
    }

    fn color_modality(&self, colors: &[Rgb], record: &FeatureRecord) -> (f64, Vec<ColorMatchDetail>) {
        let threshold = self.config.color_threshold;
        let details: Vec<ColorMatchDetail> = colors
            .iter()
            .map(|&query| {
                let best = record
                    .swatches()
                    .map(|s| (s, rgb_distance(query, s.rgb)))
                    .min_by(|a, b| a.1.total_cmp(&b.1));
                match best {
                    Some((swatch, distance)) => ColorMatchDetail {
                        query,
                        distance: Some(distance),
                        score: color_score(distance, threshold),
                        matched: distance <= threshold,
                        swatch: Some(swatch.clone()),
                    },
                    None => ColorMatchDetail { query, distance: None, score: 0.0, matched: false, swatch: None },
                }
            })
            .collect();

        let mean = if details.is_empty() {
            0.0
        } else {
            details.iter().map(|d| d.score).sum::<f64>() / details.len() as f64
        };
        (mean, details)
    }

    pub fn stats<'a>(&self, records: impl IntoIterator<Item = &'a FeatureRecord>) -> SearchStats {
        records.into_iter().fold(SearchStats::default(), |mut stats, r| {
            stats.total_records += 1;
            stats.total_faces += r.faces.len();
            if !r.faces.is_empty() {
                stats.records_with_faces += 1;
            }
            if r.swatches().next().is_some() {
                stats.records_with_colors += 1;
            }
            stats
        })
    }
}

/// Apply the score floor, stable-sort descending and truncate.
pub fn rank(mut results: Vec<MatchResult>, min_score: f64, limit: usize) -> Vec<MatchResult> {
    results.retain(|r| r.score >= min_score);
    results.sort_by(|a, b| b.score.total_cmp(&a.score));
    results.truncate(limit);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Brightness, ColorSet, FaceBox, Region, RegionSource};
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;

    fn record(id: &str, faces: Vec<Vec<f32>>, colors: Vec<Rgb>) -> FeatureRecord {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        FeatureRecord {
            id: id.into(),
            filename: format!("{id}.jpg"),
            original_path: PathBuf::from(format!("/in/{id}.jpg")),
            annotated_path: None,
            output_path: PathBuf::from(format!("/out/{id}.jpg")),
            timestamp: ts,
            width: 640,
            height: 480,
            faces: faces
                .into_iter()
                .map(|v| FaceBox { top: 0, right: 10, bottom: 10, left: 0, embedding: Embedding::new(v) })
                .collect(),
            persons: vec![],
            clothing_color_sets: if colors.is_empty() {
                vec![]
            } else {
                vec![ColorSet {
                    source: RegionSource::Face,
                    index: 0,
                    region: Region { x: 0, y: 10, width: 10, height: 10 },
                    colors: colors
                        .into_iter()
                        .map(|rgb| ColorSwatch { rgb, percentage: 50.0, name: "x".into(), brightness: Brightness::Dark })
                        .collect(),
                }]
            },
            created_at: ts,
        }
    }

    fn result(id: &str, score: f64) -> MatchResult {
        MatchResult {
            record_id: id.into(),
            filename: id.into(),
            score,
            face_score: None,
            color_score: Some(score),
            match_type: MatchType::Color,
            details: MatchDetails::default(),
        }
    }

    #[test]
    fn test_face_score_curve() {
        assert!((face_score(0.0, 0.6) - 100.0).abs() < 1e-9);
        assert!((face_score(0.6, 0.6) - 50.0).abs() < 1e-9);
        assert!((face_score(0.3, 0.6) - 75.0).abs() < 1e-9);
        assert!((face_score(0.8, 0.6) - 25.0).abs() < 1e-9);
        assert_eq!(face_score(1.0, 0.6), 0.0);
        assert_eq!(face_score(1.7, 0.6), 0.0);
    }

    #[test]
    fn test_face_score_monotonic() {
        let mut prev = f64::INFINITY;
        for i in 0..=100 {
            let s = face_score(i as f64 / 100.0, 0.6);
            assert!(s <= prev, "score rose at d={}", i as f64 / 100.0);
            prev = s;
        }
    }

    #[test]
    fn test_color_score_curve() {
        assert!((color_score(0.0, 50.0) - 100.0).abs() < 1e-9);
        assert!((color_score(50.0, 50.0) - 50.0).abs() < 1e-9);
        assert!((color_score(75.0, 50.0) - 25.0).abs() < 1e-9);
        assert_eq!(color_score(200.0, 50.0), 0.0);
    }

    #[test]
    fn test_combined_weighting() {
        // Face distance 0.24 scores 80; color distances 60 and 20 score 40 and 80.
        let records = vec![record("a", vec![vec![0.24, 0.0]], vec![[100, 0, 0]])];
        let query = Query {
            face: Some(Embedding::new(vec![0.0, 0.0])),
            colors: vec![[100, 60, 0], [100, 20, 0]],
            face_weight: Some(0.7),
            color_weight: Some(0.3),
        };
        let results = Matcher::new(SearchConfig::default()).score(&query, &records);
        assert_eq!(results.len(), 1);
        let r = &results[0];
        assert!((r.face_score.unwrap() - 80.0).abs() < 1e-6);
        assert!((r.color_score.unwrap() - 60.0).abs() < 1e-6);
        assert!((r.score - 74.0).abs() < 1e-6);
        assert_eq!(r.match_type, MatchType::Combined);
    }

    #[test]
    fn test_single_modality_labels() {
        let records = vec![record("a", vec![vec![0.0, 0.0]], vec![[0, 0, 255]])];
        let matcher = Matcher::new(SearchConfig::default());

        let face_only = Query { face: Some(Embedding::new(vec![0.0, 0.0])), ..Query::default() };
        let r = &matcher.score(&face_only, &records)[0];
        assert_eq!(r.match_type, MatchType::Face);
        assert!((r.score - 100.0).abs() < 1e-9);
        assert!(r.color_score.is_none());

        let color_only = Query { colors: vec![[0, 0, 255]], ..Query::default() };
        let r = &matcher.score(&color_only, &records)[0];
        assert_eq!(r.match_type, MatchType::Color);
        assert!(r.details.color[0].matched);
    }

    #[test]
    fn test_empty_query_returns_nothing() {
        let records = vec![record("a", vec![vec![0.0]], vec![[0, 0, 0]])];
        assert!(Matcher::new(SearchConfig::default()).score(&Query::default(), &records).is_empty());
    }

    #[test]
    fn test_record_without_faces_scores_zero() {
        let records = vec![record("a", vec![], vec![[0, 0, 0]])];
        let query = Query { face: Some(Embedding::new(vec![0.0, 0.0])), ..Query::default() };
        let matcher = Matcher::new(SearchConfig { min_score: 0.0, ..SearchConfig::default() });
        let r = &matcher.score(&query, &records)[0];
        assert_eq!(r.score, 0.0);
        let detail = r.details.face.as_ref().unwrap();
        assert!(!detail.matched);
        assert!(detail.distance.is_none());
    }

    #[test]
    fn test_mismatched_embedding_dimension_ignored() {
        let records = vec![record("a", vec![vec![0.0, 0.0, 0.0], vec![0.5, 0.0]], vec![])];
        let query = Query { face: Some(Embedding::new(vec![0.0, 0.0])), ..Query::default() };
        let r = &Matcher::new(SearchConfig::default()).score(&query, &records)[0];
        assert_eq!(r.details.face.as_ref().unwrap().face_index, Some(1));
    }

    #[test]
    fn test_best_face_wins() {
        let records = vec![record("a", vec![vec![0.9, 0.0], vec![0.1, 0.0]], vec![])];
        let query = Query { face: Some(Embedding::new(vec![0.0, 0.0])), ..Query::default() };
        let r = &Matcher::new(SearchConfig::default()).score(&query, &records)[0];
        let detail = r.details.face.as_ref().unwrap();
        assert_eq!(detail.face_index, Some(1));
        assert!(detail.matched);
    }

    #[test]
    fn test_no_colors_scores_zero() {
        let records = vec![record("a", vec![], vec![])];
        let query = Query { colors: vec![[1, 2, 3]], ..Query::default() };
        let matcher = Matcher::new(SearchConfig { min_score: 0.0, ..SearchConfig::default() });
        assert_eq!(matcher.score(&query, &records)[0].score, 0.0);
    }

    #[test]
    fn test_rank_floor_boundary() {
        let ranked = rank(vec![result("low", 19.9), result("edge", 20.0)], 20.0, 20);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].record_id, "edge");
    }

    #[test]
    fn test_rank_stable_and_limited() {
        let ranked = rank(
            vec![result("a", 50.0), result("b", 90.0), result("c", 50.0), result("d", 70.0)],
            20.0,
            3,
        );
        let ids: Vec<&str> = ranked.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "d", "a"]);
    }

    #[test]
    fn test_weights() {
        let cfg = SearchConfig::default();
        assert_eq!(Query::default().weights(&cfg), (0.7, 0.3));
        let q = Query { face_weight: Some(0.4), ..Query::default() };
        let (f, c) = q.weights(&cfg);
        assert!((f - 0.4).abs() < 1e-12 && (c - 0.6).abs() < 1e-12);
        let q = Query { color_weight: Some(1.5), ..Query::default() };
        assert_eq!(q.weights(&cfg), (0.0, 1.0));
    }

    #[test]
    fn test_config_overrides() {
        let cfg = SearchConfig::default()
            .with_overrides(&serde_json::json!({"face_threshold": 0.9, "max_results": 5, "unknown": 1}));
        assert_eq!(cfg.face_threshold, 0.9);
        assert_eq!(cfg.max_results, 5);
        assert_eq!(cfg.min_score, 20.0);

        let untouched = SearchConfig::default().with_overrides(&serde_json::json!({"max_results": "many"}));
        assert_eq!(untouched, SearchConfig::default());
    }

    #[test]
    fn test_stats() {
        let records = vec![
            record("a", vec![vec![0.0], vec![1.0]], vec![[0, 0, 0]]),
            record("b", vec![], vec![[1, 1, 1]]),
            record("c", vec![], vec![]),
        ];
        let stats = Matcher::new(SearchConfig::default()).stats(&records);
        assert_eq!(
            stats,
            SearchStats { total_records: 3, records_with_faces: 1, records_with_colors: 2, total_faces: 2 }
        );
    }
}
