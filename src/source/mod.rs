// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 帧输入 (Frame sources)
///
/// One pull-based interface over a still image and a decoded video stream:
/// - ImageSource: yields the image once, then end of stream
/// - VideoSource: ffmpeg decoder process piping `rgb24` frames
pub mod still;
pub mod video;

pub use still::ImageSource;
pub use video::{probe_video, VideoSource};

use crate::config::{PipelineConfig, PipelineSettings};
use crate::error::SourceError;
use crate::frame::{Frame, SourceMetadata};

/// Pulls frames in order. `None` means end of stream.
pub trait FrameSource: Send {
    /// Next frame, with indices strictly increasing from 0. Blocks on I/O.
    fn next_frame(&mut self) -> Option<Frame>;

    fn metadata(&self) -> SourceMetadata;

    /// Releases the decoder/file handle. Safe to call repeatedly.
    fn close(&mut self);

    /// True when the stream ended early because of a decode failure.
    fn partial_failure(&self) -> bool {
        false
    }
}

/// Opens the source described by `config`.
pub fn open_source(
    config: &PipelineConfig,
    settings: &PipelineSettings,
) -> Result<Box<dyn FrameSource>, SourceError> {
    if config.is_video() {
        let source = VideoSource::open(
            config.source_path(),
            &settings.ffmpeg_bin,
            &settings.ffprobe_bin,
        )?;
        Ok(Box::new(source))
    } else {
        Ok(Box::new(ImageSource::open(config.source_path())?))
    }
}
