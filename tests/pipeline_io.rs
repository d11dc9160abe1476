// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! End-to-end runs against real files: still images always, videos when
//! ffmpeg/ffprobe are on PATH.

use image::{Rgb, RgbImage};
use std::path::Path;
use std::process::{Command, Stdio};
use tempfile::tempdir;

use yolov8_annotate::source::{probe_video, VideoSource};
use yolov8_annotate::{
    Detection, DetectionPipeline, DetectionSet, Detector, Frame, FrameRate, FrameSource,
    InferenceError, PipelineConfig, PipelineError, PipelineSettings, RunState, VideoCodec,
};

/// Reports one box in the middle of every frame.
struct CenterBox;

impl Detector for CenterBox {
    fn infer(&mut self, frame: &Frame, _conf: f32) -> Result<DetectionSet, InferenceError> {
        let (w, h) = (frame.width() as i32, frame.height() as i32);
        Ok(vec![Detection::new(w / 4, h / 4, 3 * w / 4, 3 * h / 4, 7, 0.88)].into())
    }
}

fn ffmpeg_available() -> bool {
    ["ffmpeg", "ffprobe"].iter().all(|bin| {
        Command::new(bin)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    })
}

fn make_clip(path: &Path, frames: u32) {
    let status = Command::new("ffmpeg")
        .args(["-hide_banner", "-loglevel", "error", "-y", "-f", "lavfi", "-i"])
        .arg("testsrc=size=64x48:rate=10")
        .args(["-frames:v", &frames.to_string(), "-c:v", "ffv1"])
        .arg(path)
        .status()
        .unwrap();
    assert!(status.success());
}

fn count_frames(path: &Path) -> u64 {
    let mut source = VideoSource::open(path, "ffmpeg", "ffprobe").unwrap();
    let mut n = 0;
    while source.next_frame().is_some() {
        n += 1;
    }
    assert!(!source.partial_failure());
    n
}

#[test]
fn image_run_writes_exactly_one_file() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("street.png");
    RgbImage::from_pixel(64, 48, Rgb([90, 90, 90])).save(&src).unwrap();
    let out = dir.path().join("results");

    let config = PipelineConfig::for_path(&src, 0.25, &out).unwrap();
    let pipeline = DetectionPipeline::new(PipelineSettings::default()).unwrap();
    pipeline.start(&config, Box::new(CenterBox)).unwrap();
    assert_eq!(pipeline.wait(), RunState::Stopped);

    let entries: Vec<_> = std::fs::read_dir(&out).unwrap().collect();
    assert_eq!(entries.len(), 1);
    let written = image::open(out.join("result.jpg")).unwrap().to_rgb8();
    assert_eq!(written.dimensions(), (64, 48));

    let stats = pipeline.stats();
    assert_eq!(stats.frames_read, 1);
    assert_eq!(stats.frames_written, 1);
    assert_eq!(pipeline.report().output_path, Some(out.join("result.jpg")));
}

#[test]
fn unreadable_image_fails_before_any_output() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("broken.png");
    std::fs::write(&src, b"not a png").unwrap();
    let out = dir.path().join("results");

    let config = PipelineConfig::for_path(&src, 0.5, &out).unwrap();
    let pipeline = DetectionPipeline::new(PipelineSettings::default()).unwrap();
    let err = pipeline.start(&config, Box::new(CenterBox)).unwrap_err();
    assert!(matches!(err, PipelineError::SourceUnavailable(_)));
    assert_eq!(pipeline.state(), RunState::Failed);
    assert!(pipeline.last_error().is_some());
    assert!(!out.exists());

    // the model is not lost with the failed start
    assert!(pipeline.take_model().unwrap().is_some());
}

#[test]
fn video_run_keeps_every_frame_and_geometry() {
    if !ffmpeg_available() {
        eprintln!("ffmpeg not found, skipping");
        return;
    }
    let dir = tempdir().unwrap();
    let src = dir.path().join("clip.mkv");
    make_clip(&src, 12);
    let out = dir.path().join("results");

    let settings = PipelineSettings {
        video_codec: VideoCodec::Ffv1,
        ..PipelineSettings::default()
    };
    let config = PipelineConfig::for_path(&src, 0.25, &out).unwrap();
    let pipeline = DetectionPipeline::new(settings).unwrap();
    pipeline.start(&config, Box::new(CenterBox)).unwrap();
    assert_eq!(pipeline.wait(), RunState::Stopped);

    let output = out.join("output.mkv");
    let meta = probe_video(&output, "ffprobe").unwrap();
    assert_eq!((meta.width, meta.height), (64, 48));
    assert_eq!(meta.frame_rate, Some(FrameRate::new(10, 1)));
    assert_eq!(count_frames(&output), 12);

    let stats = pipeline.stats();
    assert_eq!(stats.frames_read, 12);
    assert_eq!(stats.frames_written, 12);
    assert!(!stats.source_partial_failure);
}

#[test]
fn video_run_default_codec_writes_avi() {
    if !ffmpeg_available() {
        eprintln!("ffmpeg not found, skipping");
        return;
    }
    let dir = tempdir().unwrap();
    let src = dir.path().join("clip.mkv");
    make_clip(&src, 5);
    let out = dir.path().join("results");

    let config = PipelineConfig::for_path(&src, 0.25, &out).unwrap();
    let pipeline = DetectionPipeline::new(PipelineSettings::default()).unwrap();
    pipeline.start(&config, Box::new(CenterBox)).unwrap();
    assert_eq!(pipeline.wait(), RunState::Stopped);

    let output = out.join("output.avi");
    let meta = probe_video(&output, "ffprobe").unwrap();
    assert_eq!((meta.width, meta.height), (64, 48));
    assert_eq!(count_frames(&output), 5);
}

#[test]
fn missing_source_rejected_at_configuration() {
    let dir = tempdir().unwrap();
    let err = PipelineConfig::for_path(dir.path().join("nope.mp4"), 0.25, dir.path()).unwrap_err();
    assert!(matches!(err, yolov8_annotate::ConfigError::MissingSource(_)));
}

#[cfg(unix)]
fn fake_tool(dir: &Path, name: &str, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

#[cfg(unix)]
#[test]
fn undecodable_video_fails_without_output() {
    let dir = tempdir().unwrap();
    let ffprobe = fake_tool(
        dir.path(),
        "ffprobe",
        r#"echo '{"streams":[{"width":4,"height":4,"r_frame_rate":"10/1"}]}'"#,
    );
    let ffmpeg = fake_tool(dir.path(), "ffmpeg", "exit 1");
    let src = dir.path().join("clip.mp4");
    std::fs::write(&src, b"not really a video").unwrap();
    let out = dir.path().join("results");

    let settings = PipelineSettings {
        ffmpeg_bin: ffmpeg,
        ffprobe_bin: ffprobe,
        ..PipelineSettings::default()
    };
    let config = PipelineConfig::for_path(&src, 0.25, &out).unwrap();
    let pipeline = DetectionPipeline::new(settings).unwrap();
    pipeline.start(&config, Box::new(CenterBox)).unwrap();
    assert_eq!(pipeline.wait(), RunState::Failed);

    let report = pipeline.report();
    assert!(report.last_error.unwrap().contains("decoder failed"));
    assert!(report.stats.source_partial_failure);
    assert_eq!(report.stats.frames_written, 0);
    assert_eq!(report.output_path, None);
    assert!(!out.join("output.avi").exists());
}
