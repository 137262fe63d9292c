//! Per-station crop rectangle, given in percent of the image size.

use image::{imageops, RgbImage};
use photomatch_core::Region;
use photomatch_store::SettingsSource;
use serde::Deserialize;

/// Crop settings as saved by the admin surface. Older entries use
/// camelCase keys; both spellings are accepted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CropSettings {
    pub enabled: bool,
    #[serde(alias = "xPercent", alias = "x_percent")]
    pub x: f64,
    #[serde(alias = "yPercent", alias = "y_percent")]
    pub y: f64,
    #[serde(alias = "widthPercent", alias = "width_percent")]
    pub width: f64,
    #[serde(alias = "heightPercent", alias = "height_percent")]
    pub height: f64,
}

impl Default for CropSettings {
    fn default() -> Self {
        Self { enabled: false, x: 0.0, y: 0.0, width: 100.0, height: 100.0 }
    }
}

impl CropSettings {
    /// Look up the station's crop. Missing or malformed settings disable cropping.
    pub fn for_station(settings: &dyn SettingsSource, station: &str) -> Self {
        let Some(value) = settings.get(station, "crop") else {
            return Self::default();
        };
        match serde_json::from_value(value) {
            Ok(crop) => crop,
            Err(e) => {
                tracing::warn!(station, error = %e, "ignoring malformed crop settings");
                Self::default()
            }
        }
    }

    /// Absolute pixel rectangle for an image of `width`×`height`, clamped to its bounds.
    pub fn to_region(&self, width: u32, height: u32) -> Region {
        let left = (self.x / 100.0 * width as f64) as i64;
        let top = (self.y / 100.0 * height as f64) as i64;
        let right = left + (self.width / 100.0 * width as f64) as i64;
        let bottom = top + (self.height / 100.0 * height as f64) as i64;
        Region::from_edges(left, top, right, bottom, (width, height))
    }
}

/// Apply the crop, or return the image untouched when disabled.
///
/// A rectangle that clamps to nothing leaves the image as it was.
pub fn apply(image: RgbImage, crop: &CropSettings) -> RgbImage {
    if !crop.enabled {
        return image;
    }
    let (width, height) = image.dimensions();
    let region = crop.to_region(width, height);
    if region.is_empty() {
        tracing::warn!(?crop, "crop rectangle is empty, keeping full image");
        return image;
    }
    let cropped = imageops::crop_imm(&image, region.x, region.y, region.width, region.height).to_image();
    tracing::info!(
        left = region.x,
        top = region.y,
        width = region.width,
        height = region.height,
        "image cropped"
    );
    cropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use photomatch_store::NoSettings;
    use serde_json::{json, Value};

    struct OneStation(Value);

    impl SettingsSource for OneStation {
        fn get(&self, station: &str, category: &str) -> Option<Value> {
            (station == "kiosk1" && category == "crop").then(|| self.0.clone())
        }
    }

    #[test]
    fn test_camel_case_keys() {
        let source = OneStation(json!({
            "enabled": true,
            "xPercent": 10,
            "yPercent": 20,
            "widthPercent": 50,
            "heightPercent": 50,
            "updated_at": "2024-01-01T00:00:00Z"
        }));
        let crop = CropSettings::for_station(&source, "kiosk1");
        assert!(crop.enabled);
        assert_eq!(crop.to_region(1000, 500), Region { x: 100, y: 100, width: 500, height: 250 });
    }

    #[test]
    fn test_snake_case_and_plain_keys() {
        let crop: CropSettings = serde_json::from_value(json!({"enabled": true, "x_percent": 5, "width": 90})).unwrap();
        assert_eq!(crop.x, 5.0);
        assert_eq!(crop.width, 90.0);
        assert_eq!(crop.height, 100.0);
    }

    #[test]
    fn test_defaults_when_missing_or_malformed() {
        assert_eq!(CropSettings::for_station(&NoSettings, "kiosk1"), CropSettings::default());
        let bad = OneStation(json!({"enabled": "yes"}));
        assert!(!CropSettings::for_station(&bad, "kiosk1").enabled);
        assert!(!CropSettings::for_station(&OneStation(json!({"enabled": true})), "other").enabled);
    }

    #[test]
    fn test_region_clamped_to_bounds() {
        let crop = CropSettings { enabled: true, x: 80.0, y: 50.0, width: 50.0, height: 80.0 };
        assert_eq!(crop.to_region(200, 100), Region { x: 160, y: 50, width: 40, height: 50 });
    }

    #[test]
    fn test_apply() {
        let image = RgbImage::from_fn(100, 50, |x, _| image::Rgb([x as u8, 0, 0]));
        let disabled = apply(image.clone(), &CropSettings::default());
        assert_eq!(disabled.dimensions(), (100, 50));

        let crop = CropSettings { enabled: true, x: 50.0, y: 0.0, width: 50.0, height: 50.0 };
        let cropped = apply(image, &crop);
        assert_eq!(cropped.dimensions(), (50, 25));
        assert_eq!(cropped.get_pixel(0, 0).0, [50, 0, 0]);
    }

    #[test]
    fn test_empty_rectangle_keeps_image() {
        let crop = CropSettings { enabled: true, x: 100.0, y: 0.0, width: 10.0, height: 100.0 };
        let image = RgbImage::new(40, 30);
        assert_eq!(apply(image, &crop).dimensions(), (40, 30));
    }
}
