// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::ResultSink;
use crate::error::WriteError;
use crate::frame::AnnotatedFrame;

/// 图片输出: accepts exactly one frame.
pub struct ImageSink {
    path: PathBuf,
    written: bool,
    closed: bool,
}

impl ImageSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            written: false,
            closed: false,
        }
    }
}

impl ResultSink for ImageSink {
    fn write(&mut self, frame: &AnnotatedFrame) -> Result<(), WriteError> {
        if self.closed {
            return Err(WriteError::Closed);
        }
        if self.written {
            return Err(WriteError::AlreadyWritten);
        }
        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        // format follows the extension
        frame.image().save(&self.path)?;
        self.written = true;
        info!("💾 result saved to {}", self.path.display());
        Ok(())
    }

    fn close(&mut self) -> Result<(), WriteError> {
        self.closed = true;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.written as u64
    }

    fn output_path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::tempdir;

    fn frame() -> AnnotatedFrame {
        AnnotatedFrame::new(0, RgbImage::from_pixel(4, 4, Rgb([200, 10, 10])))
    }

    #[test]
    fn test_creates_directory_and_writes_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("result.png");
        let mut sink = ImageSink::new(&path);

        sink.write(&frame()).unwrap();
        assert!(path.exists());
        assert_eq!(sink.frames_written(), 1);
        assert!(matches!(
            sink.write(&frame()),
            Err(WriteError::AlreadyWritten)
        ));

        let back = image::open(&path).unwrap().to_rgb8();
        assert_eq!(*back.get_pixel(1, 1), Rgb([200, 10, 10]));

        sink.close().unwrap();
        sink.close().unwrap();
    }

    #[test]
    fn test_write_after_close_fails() {
        let dir = tempdir().unwrap();
        let mut sink = ImageSink::new(dir.path().join("result.jpg"));
        sink.close().unwrap();
        assert!(matches!(sink.write(&frame()), Err(WriteError::Closed)));
    }
}
