// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

use image::RgbImage;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::FrameSource;
use crate::error::SourceError;
use crate::frame::{Frame, SourceMetadata};

/// 单张图片输入: the first pull yields the image, the second ends the stream.
pub struct ImageSource {
    path: PathBuf,
    image: Option<RgbImage>,
    width: u32,
    height: u32,
    closed: bool,
}

impl ImageSource {
    /// Decodes the whole file up front (png/jpeg/bmp and anything else the
    /// `image` crate can read) and converts to RGB8.
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let image = image::open(path)
            .map_err(|e| SourceError::unavailable(path, e.to_string()))?
            .to_rgb8();
        let (width, height) = image.dimensions();
        info!("🖼️  image source opened: {} ({}x{})", path.display(), width, height);

        Ok(Self {
            path: path.to_path_buf(),
            image: Some(image),
            width,
            height,
            closed: false,
        })
    }
}

impl FrameSource for ImageSource {
    fn next_frame(&mut self) -> Option<Frame> {
        self.image.take().map(|image| Frame::new(0, image))
    }

    fn metadata(&self) -> SourceMetadata {
        SourceMetadata {
            width: self.width,
            height: self.height,
            frame_rate: None,
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.image = None;
        debug!("image source closed: {}", self.path.display());
    }
}
