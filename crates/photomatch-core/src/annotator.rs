//! Operator-review overlay of the detected regions.

use crate::types::{Analysis, Rgb as RgbTriple};
use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;
use thiserror::Error;

const FACE_COLOR: Rgb<u8> = Rgb([0x00, 0xff, 0x00]);
const FACE_THICKNESS: u32 = 3;
const PERSON_COLOR: Rgb<u8> = Rgb([0x00, 0x88, 0xff]);
const PERSON_THICKNESS: u32 = 2;
const SWATCH_SIZE: u32 = 20;
const SWATCH_GAP: u32 = 2;
const SWATCH_OFFSET: u32 = 5;
const MAX_SWATCHES: usize = 3;
const HEADER_SIZE: (u32, u32) = (300, 30);
const LABEL_OFFSET: i32 = 20;

#[derive(Error, Debug)]
pub enum AnnotatorError {
    #[error("font: {0}")]
    Font(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Annotator {
    font: Option<FontArc>,
    scale: PxScale,
}

impl Default for Annotator {
    fn default() -> Self {
        Self::new()
    }
}

impl Annotator {
    /// Boxes and swatches only; labels need a font.
    pub fn new() -> Self {
        Self { font: None, scale: PxScale::from(16.0) }
    }

    pub fn with_font_file(path: &Path) -> Result<Self, AnnotatorError> {
        let bytes = std::fs::read(path)?;
        let font = FontArc::try_from_vec(bytes).map_err(|e| AnnotatorError::Font(e.to_string()))?;
        Ok(Self { font: Some(font), ..Self::new() })
    }

    pub fn render(&self, source: &RgbImage, analysis: &Analysis) -> RgbImage {
        let mut image = source.clone();

        for (i, face) in analysis.faces.iter().enumerate() {
            draw_thick_rect(&mut image, face.left, face.top, face.width(), face.height(), FACE_COLOR, FACE_THICKNESS);
            self.label(&mut image, face.left, face.top, FACE_COLOR, &format!("Face {}", i + 1));
        }

        for (i, person) in analysis.persons.iter().enumerate() {
            draw_thick_rect(&mut image, person.x, person.y, person.width, person.height, PERSON_COLOR, PERSON_THICKNESS);
            let text = format!("Person {} ({:.0}%)", i + 1, person.confidence * 100.0);
            self.label(&mut image, person.x, person.y, PERSON_COLOR, &text);
        }

        for set in analysis.clothing_color_sets.iter().filter(|s| !s.colors.is_empty()) {
            let y = set.region.bottom() + SWATCH_OFFSET;
            for (j, swatch) in set.colors.iter().take(MAX_SWATCHES).enumerate() {
                let x = set.region.x + j as u32 * (SWATCH_SIZE + SWATCH_GAP);
                draw_swatch(&mut image, x, y, swatch.rgb);
            }
        }

        self.header(&mut image, analysis);
        image
    }

    fn label(&self, image: &mut RgbImage, x: u32, y: u32, color: Rgb<u8>, text: &str) {
        if let Some(font) = &self.font {
            let ty = (y as i32 - LABEL_OFFSET).max(0);
            draw_text_mut(image, color, x as i32, ty, self.scale, font, text);
        }
    }

    fn header(&self, image: &mut RgbImage, analysis: &Analysis) {
        let w = HEADER_SIZE.0.min(image.width());
        let h = HEADER_SIZE.1.min(image.height());
        for y in 0..h {
            for x in 0..w {
                let p = image.get_pixel_mut(x, y);
                p.0 = p.0.map(|c| c / 2);
            }
        }
        if let Some(font) = &self.font {
            let text = format!("{} faces | {} persons", analysis.faces.len(), analysis.persons.len());
            draw_text_mut(image, Rgb([255, 255, 255]), 10, 5, self.scale, font, &text);
        }
    }
}

/// Clip a rectangle to the image, or `None` when nothing is visible.
fn clipped(image: &RgbImage, x: u32, y: u32, w: u32, h: u32) -> Option<Rect> {
    let w = w.min(image.width().saturating_sub(x));
    let h = h.min(image.height().saturating_sub(y));
    (w > 0 && h > 0).then(|| Rect::at(x as i32, y as i32).of_size(w, h))
}

fn draw_thick_rect(image: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, color: Rgb<u8>, thickness: u32) {
    for t in 0..thickness {
        let inset = 2 * t;
        if w <= inset || h <= inset {
            break;
        }
        if let Some(rect) = clipped(image, x + t, y + t, w - inset, h - inset) {
            draw_hollow_rect_mut(image, rect, color);
        }
    }
}

fn draw_swatch(image: &mut RgbImage, x: u32, y: u32, rgb: RgbTriple) {
    if let Some(rect) = clipped(image, x, y, SWATCH_SIZE, SWATCH_SIZE) {
        draw_filled_rect_mut(image, rect, Rgb(rgb));
        draw_hollow_rect_mut(image, rect, Rgb([255, 255, 255]));
    }
}
