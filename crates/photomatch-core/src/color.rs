//! Dominant-color extraction and color naming.
//!
//! Two [`ColorClusterer`] strategies: seeded k-means (`kmeans_colors`)
//! over a 100×100 downsample, and a uniform-palette histogram over a 50×50 downsample.
//! K-means hands off to the palette strategy when the region has fewer
//! distinct pixels than requested clusters.

use crate::backend::{ColorClusterer, WeightedColor};
use crate::types::{Brightness, ColorSwatch, Rgb};
use image::imageops::{self, FilterType};
use image::RgbImage;
use kmeans_colors::get_kmeans;
use palette::Srgb;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Fixed named-color table. Order matters: the first entry wins distance ties.
pub const NAMED_COLORS: [(&str, Rgb); 18] = [
    ("red", [255, 0, 0]),
    ("green", [0, 255, 0]),
    ("blue", [0, 0, 255]),
    ("yellow", [255, 255, 0]),
    ("orange", [255, 165, 0]),
    ("purple", [128, 0, 128]),
    ("pink", [255, 192, 203]),
    ("brown", [139, 69, 19]),
    ("black", [0, 0, 0]),
    ("white", [255, 255, 255]),
    ("gray", [128, 128, 128]),
    ("cyan", [0, 255, 255]),
    ("magenta", [255, 0, 255]),
    ("navy", [0, 0, 128]),
    ("teal", [0, 128, 128]),
    ("olive", [128, 128, 0]),
    ("maroon", [128, 0, 0]),
    ("beige", [245, 245, 220]),
];

const KMEANS_SAMPLE_SIZE: u32 = 100;
const KMEANS_SEED: u64 = 42;
const KMEANS_RESTARTS: u64 = 10;
const KMEANS_MAX_ITER: usize = 300;
/// Centroid movement (squared, 0..1 channel scale) below which a run stops.
const KMEANS_CONVERGE: f32 = 0.0025;
const PALETTE_SAMPLE_SIZE: u32 = 50;
const PALETTE_LEVELS: u32 = 4;

/// Euclidean distance in RGB space (0 to ~441.67).
pub fn rgb_distance(a: Rgb, b: Rgb) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// Name of the closest entry in [`NAMED_COLORS`].
pub fn nearest_color_name(rgb: Rgb) -> &'static str {
    let mut best = NAMED_COLORS[0].0;
    let mut best_distance = f64::INFINITY;
    for (name, reference) in NAMED_COLORS {
        let d = rgb_distance(rgb, reference);
        if d < best_distance {
            best_distance = d;
            best = name;
        }
    }
    best
}

/// Parse `#rrggbb` or `rrggbb`.
pub fn parse_hex_color(s: &str) -> Option<Rgb> {
    let hex = s.trim();
    let hex = hex.strip_prefix('#').unwrap_or(hex);
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    Some([channel(0)?, channel(2)?, channel(4)?])
}

/// Build the stored swatch for a clustered color.
pub fn swatch(color: WeightedColor) -> ColorSwatch {
    ColorSwatch {
        rgb: color.rgb,
        percentage: color.percentage,
        name: nearest_color_name(color.rgb).to_string(),
        brightness: Brightness::of(color.rgb),
    }
}

/// Truncate to one decimal so a set of shares never sums above 100.
fn truncate_tenth(percentage: f64) -> f32 {
    ((percentage * 10.0).floor() / 10.0) as f32
}

fn downsample(region: &RgbImage, size: u32) -> Option<RgbImage> {
    if region.width() == 0 || region.height() == 0 {
        return None;
    }
    Some(imageops::resize(region, size, size, FilterType::Triangle))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClustererKind {
    #[default]
    Kmeans,
    Palette,
}

pub fn build_clusterer(kind: ClustererKind) -> Box<dyn ColorClusterer> {
    match kind {
        ClustererKind::Kmeans => Box::new(KMeansClusterer::default()),
        ClustererKind::Palette => Box::new(PaletteClusterer),
    }
}

/// Seeded k-means over sRGB pixels, best of several restarts.
#[derive(Debug, Clone)]
pub struct KMeansClusterer {
    seed: u64,
    restarts: u64,
}

impl Default for KMeansClusterer {
    fn default() -> Self {
        Self { seed: KMEANS_SEED, restarts: KMEANS_RESTARTS }
    }
}

impl ColorClusterer for KMeansClusterer {
    fn dominant_colors(&self, region: &RgbImage, count: usize) -> Vec<WeightedColor> {
        // Cluster labels are stored as u8.
        let count = count.min(u8::MAX as usize);
        if count == 0 {
            return Vec::new();
        }
        let Some(sample) = downsample(region, KMEANS_SAMPLE_SIZE) else {
            return Vec::new();
        };

        let distinct: HashSet<Rgb> = sample.pixels().map(|p| p.0).collect();
        if distinct.len() < count {
            tracing::debug!(distinct = distinct.len(), count, "too few distinct pixels, using palette");
            return PaletteClusterer.dominant_colors(region, count);
        }

        let pixels: Vec<Srgb> = sample
            .pixels()
            .map(|p| Srgb::<u8>::new(p.0[0], p.0[1], p.0[2]).into_format::<f32>())
            .collect();

        let best = (0..self.restarts.max(1))
            .map(|run| get_kmeans(count, KMEANS_MAX_ITER, KMEANS_CONVERGE, false, &pixels, self.seed + run))
            .min_by(|a, b| a.score.total_cmp(&b.score));
        let Some(best) = best else {
            return Vec::new();
        };

        let mut counts = vec![0usize; best.centroids.len()];
        for &label in &best.indices {
            if let Some(n) = counts.get_mut(label as usize) {
                *n += 1;
            }
        }

        let total = pixels.len() as f64;
        let mut order: Vec<usize> = (0..counts.len()).filter(|&i| counts[i] > 0).collect();
        order.sort_by(|&a, &b| counts[b].cmp(&counts[a]));

        order
            .into_iter()
            .map(|i| {
                let c = best.centroids[i].into_format::<u8>();
                WeightedColor {
                    rgb: [c.red, c.green, c.blue],
                    percentage: truncate_tenth(counts[i] as f64 / total * 100.0),
                }
            })
            .collect()
    }
}

/// Uniform palette histogram: each channel snapped to one of four levels.
#[derive(Debug, Clone, Copy, Default)]
pub struct PaletteClusterer;

impl PaletteClusterer {
    fn level(value: u8) -> u8 {
        let step = 255 / (PALETTE_LEVELS - 1);
        let bucket = (value as u32 * PALETTE_LEVELS / 256).min(PALETTE_LEVELS - 1);
        (bucket * step) as u8
    }
}

impl ColorClusterer for PaletteClusterer {
    fn dominant_colors(&self, region: &RgbImage, count: usize) -> Vec<WeightedColor> {
        if count == 0 {
            return Vec::new();
        }
        let Some(sample) = downsample(region, PALETTE_SAMPLE_SIZE) else {
            return Vec::new();
        };

        // Bins in first-seen order so equal counts stay deterministic.
        let mut bins: Vec<(Rgb, usize)> = Vec::new();
        let mut index: HashMap<Rgb, usize> = HashMap::new();
        for p in sample.pixels() {
            let snapped = p.0.map(Self::level);
            let slot = *index.entry(snapped).or_insert_with(|| {
                bins.push((snapped, 0));
                bins.len() - 1
            });
            bins[slot].1 += 1;
        }
        bins.sort_by(|a, b| b.1.cmp(&a.1));

        let total = (sample.width() * sample.height()) as f64;
        bins.into_iter()
            .take(count)
            .map(|(rgb, n)| WeightedColor { rgb, percentage: truncate_tenth(n as f64 / total * 100.0) })
            .collect()
    }
}
