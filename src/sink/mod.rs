// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 结果输出 (Result sinks)
///
/// - ImageSink: one annotated image per run (`result.jpg`)
/// - VideoSink: ffmpeg encoder process fed raw `rgb24` frames (`output.avi`)
///
/// Neither touches the filesystem until the first `write`.
pub mod still;
pub mod video;

pub use still::ImageSink;
pub use video::VideoSink;

use std::path::Path;

use crate::config::{PipelineConfig, PipelineSettings};
use crate::error::WriteError;
use crate::frame::{AnnotatedFrame, SourceMetadata};

/// Persists annotated frames and owns the output file handle.
pub trait ResultSink: Send {
    fn write(&mut self, frame: &AnnotatedFrame) -> Result<(), WriteError>;

    /// Flushes and releases the output. Safe to call repeatedly; only the
    /// first call does any work.
    fn close(&mut self) -> Result<(), WriteError>;

    fn frames_written(&self) -> u64;

    /// Deterministic output location inside the output directory.
    fn output_path(&self) -> &Path;
}

/// Builds the sink for a run. `metadata` fixes the video container geometry.
pub fn open_sink(
    config: &PipelineConfig,
    settings: &PipelineSettings,
    metadata: SourceMetadata,
) -> Box<dyn ResultSink> {
    if config.is_video() {
        Box::new(VideoSink::new(
            settings.video_output_path(config.output_dir()),
            metadata,
            settings.video_codec,
            settings.ffmpeg_bin.clone(),
        ))
    } else {
        Box::new(ImageSink::new(
            settings.image_output_path(config.output_dir()),
        ))
    }
}
