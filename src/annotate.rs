// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 结果标注 (Annotator)
///
/// Burns detection boxes and `"{class} {conf:.2}"` labels into a frame.
/// Pure: no I/O, no interior mutability, identical input gives identical
/// pixels. Labels use a built-in 5x7 bitmap font unless a TrueType font is
/// configured.
use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::fs;

use crate::config::PipelineSettings;
use crate::error::ConfigError;
use crate::frame::{AnnotatedFrame, Detection, DetectionSet, Frame};

/// Gap between the top edge of a box and the baseline of its label.
pub const LABEL_OFFSET: i32 = 10;

const GLYPH_WIDTH: i32 = 5;
const GLYPH_HEIGHT: i32 = 7;
const GLYPH_ADVANCE: i32 = GLYPH_WIDTH + 1;

const MAX_THICKNESS: u32 = 64;
const MAX_SCALE: u32 = 16;

/// Drawing parameters. Built once per pipeline, shared read-only.
#[derive(Clone)]
pub struct LabelStyle {
    pub color: Rgb<u8>,
    pub thickness: u32,
    pub scale: u32,
    pub font: Option<FontArc>,
    pub font_size: f32,
}

impl Default for LabelStyle {
    fn default() -> Self {
        Self {
            color: Rgb([0, 255, 0]),
            thickness: 2,
            scale: 2,
            font: None,
            font_size: 24.0,
        }
    }
}

impl std::fmt::Debug for LabelStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabelStyle")
            .field("color", &self.color)
            .field("thickness", &self.thickness)
            .field("scale", &self.scale)
            .field("font", &self.font.is_some())
            .field("font_size", &self.font_size)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Annotator {
    style: LabelStyle,
}

impl Annotator {
    /// Thickness and label scale are clamped to `1..=64` and `1..=16`.
    pub fn new(mut style: LabelStyle) -> Self {
        style.thickness = style.thickness.clamp(1, MAX_THICKNESS);
        style.scale = style.scale.clamp(1, MAX_SCALE);
        Self { style }
    }

    /// Builds the style from settings, loading the TrueType font if one is set.
    pub fn from_settings(settings: &PipelineSettings) -> Result<Self, ConfigError> {
        let font = match &settings.label_font {
            Some(path) => {
                let data = fs::read(path).map_err(|e| ConfigError::Settings {
                    path: path.clone(),
                    reason: format!("cannot read label font: {}", e),
                })?;
                let font = FontArc::try_from_vec(data).map_err(|e| ConfigError::Settings {
                    path: path.clone(),
                    reason: format!("invalid label font: {}", e),
                })?;
                Some(font)
            }
            None => None,
        };

        Ok(Self::new(LabelStyle {
            color: Rgb(settings.box_color),
            thickness: settings.box_thickness,
            scale: settings.label_scale,
            font,
            font_size: settings.label_font_size,
        }))
    }

    pub fn style(&self) -> &LabelStyle {
        &self.style
    }

    /// Draws every detection onto the frame. An empty set returns the
    /// pixels untouched.
    pub fn apply(&self, frame: Frame, detections: &DetectionSet) -> AnnotatedFrame {
        let index = frame.index();
        let mut image = frame.into_image();
        for det in detections {
            self.draw_box(&mut image, det);
            self.draw_label(&mut image, det);
        }
        AnnotatedFrame::new(index, image)
    }

    fn draw_box(&self, image: &mut RgbImage, det: &Detection) {
        let t = self.style.thickness as i32;
        // edges further out than the thickest ring are never visible
        let (min_x, max_x) = (-t, image.width() as i32 + t);
        let (min_y, max_y) = (-t, image.height() as i32 + t);
        let left = det.left.min(det.right).clamp(min_x, max_x);
        let right = det.left.max(det.right).clamp(min_x, max_x);
        let top = det.top.min(det.bottom).clamp(min_y, max_y);
        let bottom = det.top.max(det.bottom).clamp(min_y, max_y);
        let width = left.abs_diff(right).max(1);
        let height = top.abs_diff(bottom).max(1);

        // Grow outward one pixel per thickness step; out-of-frame pixels are clipped.
        for offset in 0..t {
            let rect = Rect::at(left - offset, top - offset)
                .of_size(width + 2 * offset as u32, height + 2 * offset as u32);
            draw_hollow_rect_mut(image, rect, self.style.color);
        }
    }

    fn draw_label(&self, image: &mut RgbImage, det: &Detection) {
        let text = det.label();
        let x = det.left.min(det.right).clamp(0, image.width() as i32);
        let baseline = det.top.min(det.bottom).saturating_sub(LABEL_OFFSET);

        match &self.style.font {
            Some(font) => {
                let y = baseline.saturating_sub(self.style.font_size.round() as i32).max(0);
                draw_text_mut(
                    image,
                    self.style.color,
                    x,
                    y,
                    PxScale::from(self.style.font_size),
                    font,
                    &text,
                );
            }
            None => {
                let scale = self.style.scale as i32;
                let y = baseline.saturating_sub(GLYPH_HEIGHT * scale).max(0);
                draw_bitmap_text(image, &text, x, y, scale, self.style.color);
            }
        }
    }
}

/// Draws `text` with the 5x7 bitmap font; `(x, y)` is the top-left corner.
pub fn draw_bitmap_text(image: &mut RgbImage, text: &str, x: i32, y: i32, scale: i32, color: Rgb<u8>) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    for (i, ch) in text.chars().enumerate() {
        let origin_x = x + i as i32 * GLYPH_ADVANCE * scale;
        for (row, bits) in glyph(ch).iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if (bits >> (GLYPH_WIDTH - 1 - col)) & 1 == 0 {
                    continue;
                }
                for dy in 0..scale {
                    for dx in 0..scale {
                        let px = origin_x + col * scale + dx;
                        let py = y + row as i32 * scale + dy;
                        if px >= 0 && py >= 0 && px < w && py < h {
                            image.put_pixel(px as u32, py as u32, color);
                        }
                    }
                }
            }
        }
    }
}

/// Rendered width in pixels of `text` in the bitmap font.
pub fn bitmap_text_width(text: &str, scale: i32) -> i32 {
    let n = text.chars().count() as i32;
    if n == 0 {
        return 0;
    }
    (n * GLYPH_ADVANCE - 1) * scale
}

fn glyph(ch: char) -> [u8; 7] {
    match ch {
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11111, 0b00010, 0b00100, 0b00010, 0b00001, 0b10001, 0b01110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '.' => [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b01100, 0b01100],
        '-' => [0b00000, 0b00000, 0b00000, 0b11111, 0b00000, 0b00000, 0b00000],
        ' ' => [0; 7],
        // unknown characters render as a hollow box
        _ => [0b11111, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11111],
    }
}
