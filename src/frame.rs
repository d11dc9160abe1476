// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 帧与检测结果数据结构
/// Frame and detection data structures shared by every pipeline stage.
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A decoded RGB8 raster plus its position in the source stream.
///
/// Owned by exactly one stage at a time: capture hands it to inference,
/// inference to annotation, annotation turns it into an [`AnnotatedFrame`].
#[derive(Clone, PartialEq)]
pub struct Frame {
    index: u64,
    image: RgbImage,
}

impl Frame {
    pub fn new(index: u64, image: RgbImage) -> Self {
        Self { index, image }
    }

    /// Builds a frame from a packed `rgb24` buffer. Returns `None` when the
    /// buffer length does not match `width * height * 3`.
    pub fn from_rgb(index: u64, width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        RgbImage::from_raw(width, height, data).map(|image| Self { index, image })
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("index", &self.index)
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

/// A frame with its detections burned in. Never mutated after creation;
/// clones share the pixel buffer so the sink and the UI channel can both
/// hold it read-only.
#[derive(Clone, PartialEq)]
pub struct AnnotatedFrame {
    index: u64,
    image: Arc<RgbImage>,
}

impl AnnotatedFrame {
    pub fn new(index: u64, image: RgbImage) -> Self {
        Self {
            index,
            image: Arc::new(image),
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Packed `rgb24` bytes, row-major.
    pub fn as_raw(&self) -> &[u8] {
        self.image.as_raw()
    }
}

impl fmt::Debug for AnnotatedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnnotatedFrame")
            .field("index", &self.index)
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

/// 检测框 (one predicted object instance, pixel coordinates)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub class_id: u32,
    pub confidence: f32,
}

impl Detection {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32, class_id: u32, confidence: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
            class_id,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn width(&self) -> i32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> i32 {
        self.bottom.saturating_sub(self.top)
    }

    /// Text drawn above the box, e.g. `"2 0.87"`.
    pub fn label(&self) -> String {
        format!("{} {:.2}", self.class_id, self.confidence)
    }
}

/// Ordered detections for a single frame. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionSet {
    detections: Vec<Detection>,
}

impl DetectionSet {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self { detections }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Detection> {
        self.detections.iter()
    }
}

impl From<Vec<Detection>> for DetectionSet {
    fn from(detections: Vec<Detection>) -> Self {
        Self::new(detections)
    }
}

impl<'a> IntoIterator for &'a DetectionSet {
    type Item = &'a Detection;
    type IntoIter = std::slice::Iter<'a, Detection>;

    fn into_iter(self) -> Self::IntoIter {
        self.detections.iter()
    }
}

/// Exact frame rate as reported by the container (`r_frame_rate`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    pub fn new(num: u32, den: u32) -> Self {
        Self {
            num,
            den: den.max(1),
        }
    }

    /// Parses `"30000/1001"` or `"25"`. Zero or malformed rates yield `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let (num, den) = match text.split_once('/') {
            Some((n, d)) => (n.trim().parse::<u32>().ok()?, d.trim().parse::<u32>().ok()?),
            None => (text.parse::<u32>().ok()?, 1),
        };
        if num == 0 || den == 0 {
            return None;
        }
        Some(Self { num, den })
    }

    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Source geometry. `frame_rate` is only known for video sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub width: u32,
    pub height: u32,
    pub frame_rate: Option<FrameRate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_format() {
        let det = Detection::new(10, 20, 30, 40, 2, 0.87);
        assert_eq!(det.label(), "2 0.87");
        assert_eq!(Detection::new(0, 0, 1, 1, 0, 1.0).label(), "0 1.00");
    }

    #[test]
    fn test_confidence_clamped() {
        assert_eq!(Detection::new(0, 0, 1, 1, 0, 1.7).confidence, 1.0);
        assert_eq!(Detection::new(0, 0, 1, 1, 0, -0.2).confidence, 0.0);
    }

    #[test]
    fn test_frame_rate_parse() {
        assert_eq!(FrameRate::parse("30000/1001"), Some(FrameRate::new(30000, 1001)));
        assert_eq!(FrameRate::parse("25"), Some(FrameRate::new(25, 1)));
        assert_eq!(FrameRate::parse("0/0"), None);
        assert_eq!(FrameRate::parse("abc"), None);
        assert!((FrameRate::new(30000, 1001).as_f64() - 29.97).abs() < 0.01);
    }

    #[test]
    fn test_from_rgb_rejects_short_buffer() {
        assert!(Frame::from_rgb(0, 4, 4, vec![0; 47]).is_none());
        let frame = Frame::from_rgb(3, 4, 4, vec![0; 48]).unwrap();
        assert_eq!(frame.index(), 3);
        assert_eq!((frame.width(), frame.height()), (4, 4));
    }
}
