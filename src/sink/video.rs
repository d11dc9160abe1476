// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 视频输出 (ffmpeg encoder process)
///
/// The container is opened on the first `write`, sized to the source
/// geometry and frame rate. Frames are piped in arrival order; nothing is
/// dropped or reordered. `close` ends the pipe so ffmpeg finalises the file.
/// Whatever was written before a failure stays on disk.
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use tracing::{debug, info, warn};

use super::ResultSink;
use crate::config::VideoCodec;
use crate::error::WriteError;
use crate::frame::{AnnotatedFrame, FrameRate, SourceMetadata};

const DEFAULT_FRAME_RATE: FrameRate = FrameRate { num: 25, den: 1 };

/// 视频写入器
pub struct VideoSink {
    path: PathBuf,
    metadata: SourceMetadata,
    codec: VideoCodec,
    ffmpeg_bin: String,
    encoder: Option<Child>,
    stdin: Option<ChildStdin>,
    written: u64,
    closed: bool,
}

impl VideoSink {
    pub fn new(
        path: impl Into<PathBuf>,
        metadata: SourceMetadata,
        codec: VideoCodec,
        ffmpeg_bin: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            metadata,
            codec,
            ffmpeg_bin: ffmpeg_bin.into(),
            encoder: None,
            stdin: None,
            written: 0,
            closed: false,
        }
    }

    fn expected_size(&self) -> (u32, u32) {
        (self.metadata.width, self.metadata.height)
    }

    fn spawn_encoder(&mut self) -> Result<(), WriteError> {
        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let (w, h) = self.expected_size();
        let rate = self.metadata.frame_rate.unwrap_or(DEFAULT_FRAME_RATE);

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-s")
            .arg(format!("{}x{}", w, h))
            .arg("-framerate")
            .arg(rate.to_string())
            .arg("-i")
            .arg("-")
            .arg("-an")
            .args(self.codec.encoder_args())
            .arg("-r")
            .arg(rate.to_string())
            .arg(&self.path);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .map_err(|e| WriteError::Encoder(format!("cannot run {}: {}", self.ffmpeg_bin, e)))?;
        let stdin = match child.stdin.take() {
            Some(stdin) => stdin,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(WriteError::Encoder("failed to capture ffmpeg stdin".to_string()));
            }
        };

        info!(
            "📼 video output opened: {} ({}x{} @ {}, {:?})",
            self.path.display(),
            w,
            h,
            rate,
            self.codec
        );
        self.encoder = Some(child);
        self.stdin = Some(stdin);
        Ok(())
    }
}

impl ResultSink for VideoSink {
    fn write(&mut self, frame: &AnnotatedFrame) -> Result<(), WriteError> {
        if self.closed {
            return Err(WriteError::Closed);
        }

        let actual = (frame.width(), frame.height());
        if actual != self.expected_size() {
            return Err(WriteError::DimensionMismatch {
                expected: self.expected_size(),
                actual,
            });
        }

        if self.encoder.is_none() {
            self.spawn_encoder()?;
        }

        let stdin = self.stdin.as_mut().ok_or(WriteError::Closed)?;
        stdin.write_all(frame.as_raw()).map_err(|e| {
            if e.kind() == io::ErrorKind::BrokenPipe {
                WriteError::Encoder(format!("encoder exited before frame {}", frame.index()))
            } else {
                WriteError::Io(e)
            }
        })?;
        self.written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), WriteError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = stdin.flush() {
                warn!("⚠️  flushing encoder input failed: {}", e);
            }
            // dropping stdin signals end of input
        }

        let Some(mut child) = self.encoder.take() else {
            debug!("video sink closed without frames");
            return Ok(());
        };

        let status = child.wait()?;
        if !status.success() {
            return Err(WriteError::Encoder(format!(
                "encoder exited with {} after {} frames",
                status, self.written
            )));
        }
        info!(
            "✅ video output finalised: {} ({} frames)",
            self.path.display(),
            self.written
        );
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.written
    }

    fn output_path(&self) -> &Path {
        &self.path
    }
}

impl Drop for VideoSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("⚠️  video sink close on drop failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use tempfile::tempdir;

    fn meta(w: u32, h: u32) -> SourceMetadata {
        SourceMetadata {
            width: w,
            height: h,
            frame_rate: Some(FrameRate::new(10, 1)),
        }
    }

    #[test]
    fn test_dimension_mismatch_rejected_before_spawn() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out").join("output.avi");
        let mut sink = VideoSink::new(&path, meta(16, 16), VideoCodec::Xvid, "ffmpeg");

        let err = sink
            .write(&AnnotatedFrame::new(0, RgbImage::new(8, 16)))
            .unwrap_err();
        assert!(matches!(
            err,
            WriteError::DimensionMismatch {
                expected: (16, 16),
                actual: (8, 16)
            }
        ));
        assert_eq!(sink.frames_written(), 0);
        // nothing opened yet
        assert!(!path.exists());
        sink.close().unwrap();
    }

    #[test]
    fn test_missing_encoder_is_write_error() {
        let dir = tempdir().unwrap();
        let mut sink = VideoSink::new(
            dir.path().join("output.avi"),
            meta(4, 4),
            VideoCodec::Xvid,
            "definitely-not-ffmpeg-xyz",
        );
        assert!(matches!(
            sink.write(&AnnotatedFrame::new(0, RgbImage::new(4, 4))),
            Err(WriteError::Encoder(_))
        ));
    }

    #[test]
    fn test_close_idempotent_and_final() {
        let dir = tempdir().unwrap();
        let mut sink = VideoSink::new(dir.path().join("output.avi"), meta(4, 4), VideoCodec::Xvid, "ffmpeg");
        sink.close().unwrap();
        sink.close().unwrap();
        assert!(matches!(
            sink.write(&AnnotatedFrame::new(0, RgbImage::new(4, 4))),
            Err(WriteError::Closed)
        ));
    }
}
