// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 视频解码输入 (ffmpeg decoder process)
///
/// ffprobe reads the stream geometry, then ffmpeg decodes the first video
/// stream to raw `rgb24` on stdout. Each pull reads exactly one frame.
///
/// Decode-error policy: there is no retry. A truncated last frame, a read
/// error, or a non-zero decoder exit ends the stream and sets
/// `partial_failure`. Frames read in full before that are delivered as-is.
use serde::Deserialize;
use std::ffi::OsString;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use tracing::{debug, info, warn};

use super::FrameSource;
use crate::error::SourceError;
use crate::frame::{Frame, FrameRate, SourceMetadata};

const FALLBACK_FRAME_RATE: FrameRate = FrameRate { num: 25, den: 1 };

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
}

/// Reads width, height and frame rate of the first video stream.
pub fn probe_video(path: &Path, ffprobe_bin: &str) -> Result<SourceMetadata, SourceError> {
    let output = Command::new(ffprobe_bin)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,r_frame_rate,avg_frame_rate",
            "-of",
            "json",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| SourceError::unavailable(path, format!("cannot run {}: {}", ffprobe_bin, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SourceError::unavailable(path, stderr.trim().to_string()));
    }

    parse_probe(path, &output.stdout)
}

fn parse_probe(path: &Path, json: &[u8]) -> Result<SourceMetadata, SourceError> {
    let probe: ProbeOutput = serde_json::from_slice(json).map_err(|e| SourceError::Probe {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let stream = probe
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| SourceError::unavailable(path, "no video stream"))?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => {
            return Err(SourceError::Probe {
                path: path.to_path_buf(),
                reason: "video stream has no frame size".to_string(),
            })
        }
    };

    let frame_rate = stream
        .r_frame_rate
        .as_deref()
        .and_then(FrameRate::parse)
        .or_else(|| stream.avg_frame_rate.as_deref().and_then(FrameRate::parse))
        .unwrap_or_else(|| {
            warn!(
                "⚠️  {}: no frame rate in container, assuming {}",
                path.display(),
                FALLBACK_FRAME_RATE
            );
            FALLBACK_FRAME_RATE
        });

    Ok(SourceMetadata {
        width,
        height,
        frame_rate: Some(frame_rate),
    })
}

/// 视频源
pub struct VideoSource {
    path: PathBuf,
    metadata: SourceMetadata,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    frame_size: usize,
    next_index: u64,
    ended: bool,
    partial_failure: bool,
}

impl VideoSource {
    pub fn open(path: &Path, ffmpeg_bin: &str, ffprobe_bin: &str) -> Result<Self, SourceError> {
        let metadata = probe_video(path, ffprobe_bin)?;

        let mut cmd = Command::new(ffmpeg_bin);
        cmd.args(decoder_args(path));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .map_err(|e| SourceError::unavailable(path, format!("cannot run {}: {}", ffmpeg_bin, e)))?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SourceError::unavailable(path, "failed to capture ffmpeg stdout"));
            }
        };

        info!(
            "🎬 video source opened: {} ({}x{} @ {})",
            path.display(),
            metadata.width,
            metadata.height,
            metadata.frame_rate.unwrap_or(FALLBACK_FRAME_RATE)
        );

        Ok(Self {
            path: path.to_path_buf(),
            frame_size: metadata.width as usize * metadata.height as usize * 3,
            metadata,
            child: Some(child),
            stdout: Some(stdout),
            next_index: 0,
            ended: false,
            partial_failure: false,
        })
    }

    fn finish(&mut self, partial: bool) {
        self.ended = true;
        self.stdout = None;
        if partial {
            self.partial_failure = true;
        }
        if let Some(child) = self.child.as_mut() {
            match child.wait() {
                Ok(status) if !status.success() => {
                    warn!("⚠️  decoder exited with {} after {} frames", status, self.next_index);
                    self.partial_failure = true;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("⚠️  failed to reap decoder: {}", e);
                    self.partial_failure = true;
                }
            }
        }
        self.child = None;
    }
}

/// Decoder command line. Rotation metadata is ignored so the raw frames
/// keep the coded width and height that ffprobe reports.
fn decoder_args(path: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "error", "-nostdin", "-noautorotate", "-i"]
        .iter()
        .map(OsString::from)
        .collect();
    args.push(path.as_os_str().to_os_string());
    args.extend(
        ["-map", "0:v:0", "-an", "-pix_fmt", "rgb24", "-f", "rawvideo", "-"]
            .iter()
            .map(OsString::from),
    );
    args
}

/// Fills `buf` unless the stream ends first; returns the bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl FrameSource for VideoSource {
    fn next_frame(&mut self) -> Option<Frame> {
        if self.ended {
            return None;
        }
        let stdout = self.stdout.as_mut()?;

        let mut buf = vec![0u8; self.frame_size];
        match read_full(stdout, &mut buf) {
            Ok(n) if n == self.frame_size => {
                let index = self.next_index;
                self.next_index += 1;
                Frame::from_rgb(index, self.metadata.width, self.metadata.height, buf)
            }
            Ok(0) => {
                debug!("video source reached end of stream after {} frames", self.next_index);
                self.finish(false);
                None
            }
            Ok(n) => {
                warn!(
                    "⚠️  truncated frame #{}: {} of {} bytes, ending stream",
                    self.next_index, n, self.frame_size
                );
                self.finish(true);
                None
            }
            Err(e) => {
                warn!("⚠️  decoder read failed at frame #{}: {}", self.next_index, e);
                self.finish(true);
                None
            }
        }
    }

    fn metadata(&self) -> SourceMetadata {
        self.metadata
    }

    fn close(&mut self) {
        self.ended = true;
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            // still decoding (stopped early): the process is no longer wanted
            if let Ok(None) = child.try_wait() {
                let _ = child.kill();
            }
            let _ = child.wait();
            debug!("video source closed: {}", self.path.display());
        }
    }

    fn partial_failure(&self) -> bool {
        self.partial_failure
    }
}

impl Drop for VideoSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe() {
        let json = br#"{"programs":[],"streams":[{"width":640,"height":360,"r_frame_rate":"30000/1001","avg_frame_rate":"0/0"}]}"#;
        let meta = parse_probe(Path::new("a.mp4"), json).unwrap();
        assert_eq!(meta.width, 640);
        assert_eq!(meta.height, 360);
        assert_eq!(meta.frame_rate, Some(FrameRate::new(30000, 1001)));
    }

    #[test]
    fn test_parse_probe_falls_back_to_avg_rate() {
        let json = br#"{"streams":[{"width":4,"height":2,"r_frame_rate":"0/0","avg_frame_rate":"24/1"}]}"#;
        let meta = parse_probe(Path::new("a.mkv"), json).unwrap();
        assert_eq!(meta.frame_rate, Some(FrameRate::new(24, 1)));
    }

    #[test]
    fn test_parse_probe_without_stream() {
        assert!(matches!(
            parse_probe(Path::new("a.mp4"), br#"{"streams":[]}"#),
            Err(SourceError::Unavailable { .. })
        ));
        assert!(matches!(
            parse_probe(Path::new("a.mp4"), b"garbage"),
            Err(SourceError::Probe { .. })
        ));
    }

    #[test]
    fn test_parse_probe_keeps_coded_size_when_rotated() {
        let json = br#"{"streams":[{"width":1920,"height":1080,"r_frame_rate":"30/1","side_data_list":[{"side_data_type":"Display Matrix","rotation":-90}]}]}"#;
        let meta = parse_probe(Path::new("phone.mov"), json).unwrap();
        assert_eq!((meta.width, meta.height), (1920, 1080));
    }

    #[test]
    fn test_decoder_disables_autorotate() {
        let args = decoder_args(Path::new("phone.mov"));
        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert!(pos("-noautorotate") < pos("-i"));
        assert_eq!(args[pos("-i") + 1], OsString::from("phone.mov"));
        assert_eq!(args.last().unwrap(), "-");
    }

    #[test]
    fn test_read_full_reports_short_read() {
        let data = [1u8; 10];
        let mut buf = [0u8; 16];
        assert_eq!(read_full(&mut &data[..], &mut buf).unwrap(), 10);
        let mut exact = [0u8; 4];
        assert_eq!(read_full(&mut &data[..], &mut exact).unwrap(), 4);
    }

    #[test]
    fn test_missing_probe_binary() {
        let err = probe_video(Path::new("clip.mp4"), "definitely-not-ffprobe-xyz").unwrap_err();
        assert!(matches!(err, SourceError::Unavailable { .. }));
    }
}
