// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 检测配置 - run parameters, JSON settings file and command line arguments

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::ConfigError;

pub const DEFAULT_OUTPUT_DIR: &str = "detection_results";
pub const SETTINGS_FILE_NAME: &str = "settings.json";

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];
const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "avi", "mov", "mkv"];

/// Whether a run processes a single still image or a video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Infers the kind from the file extension (case-insensitive).
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Image)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Video)
        } else {
            None
        }
    }
}

/// Checks that a confidence threshold lies in `(0, 1]`.
pub fn validate_threshold(value: f32) -> Result<f32, ConfigError> {
    if value.is_nan() || value <= 0.0 || value > 1.0 {
        return Err(ConfigError::InvalidThreshold(value));
    }
    Ok(value)
}

/// Parses threshold text as typed into the UI, e.g. `"0.25"`.
pub fn parse_threshold(text: &str) -> Result<f32, ConfigError> {
    let value = text
        .trim()
        .parse::<f32>()
        .map_err(|_| ConfigError::UnparseableThreshold(text.to_string()))?;
    validate_threshold(value)
}

/// Parameters of one run. Validated on construction and immutable after.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    source_path: PathBuf,
    is_video: bool,
    confidence_threshold: f32,
    output_dir: PathBuf,
}

impl PipelineConfig {
    pub fn new(
        source_path: impl Into<PathBuf>,
        is_video: bool,
        confidence_threshold: f32,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let source_path = source_path.into();
        let output_dir = output_dir.into();
        let confidence_threshold = validate_threshold(confidence_threshold)?;

        if !source_path.is_file() {
            return Err(ConfigError::MissingSource(source_path));
        }
        if output_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidOutputDirectory(
                output_dir,
                "empty path".to_string(),
            ));
        }
        if output_dir.exists() && !output_dir.is_dir() {
            return Err(ConfigError::InvalidOutputDirectory(
                output_dir,
                "exists and is not a directory".to_string(),
            ));
        }

        Ok(Self {
            source_path,
            is_video,
            confidence_threshold,
            output_dir,
        })
    }

    /// Same as [`PipelineConfig::new`] but takes the threshold as text.
    pub fn parse(
        source_path: impl Into<PathBuf>,
        is_video: bool,
        threshold_text: &str,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let threshold = parse_threshold(threshold_text)?;
        Self::new(source_path, is_video, threshold, output_dir)
    }

    /// Infers image/video from the source extension.
    pub fn for_path(
        source_path: impl Into<PathBuf>,
        confidence_threshold: f32,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let source_path = source_path.into();
        let kind = MediaKind::from_path(&source_path)
            .ok_or_else(|| ConfigError::UnknownMediaKind(source_path.clone()))?;
        Self::new(
            source_path,
            kind == MediaKind::Video,
            confidence_threshold,
            output_dir,
        )
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn is_video(&self) -> bool {
        self.is_video
    }

    pub fn media_kind(&self) -> MediaKind {
        if self.is_video {
            MediaKind::Video
        } else {
            MediaKind::Image
        }
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

/// 视频编码格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// MPEG-4 Part 2 tagged `XVID`, written to `output.avi`
    Xvid,
    /// Lossless FFV1, written to `output.mkv`
    Ffv1,
}

impl VideoCodec {
    pub fn file_name(&self) -> &'static str {
        match self {
            VideoCodec::Xvid => "output.avi",
            VideoCodec::Ffv1 => "output.mkv",
        }
    }

    /// Encoder arguments placed after the raw input.
    pub fn encoder_args(&self) -> &'static [&'static str] {
        match self {
            VideoCodec::Xvid => &["-c:v", "mpeg4", "-vtag", "xvid", "-q:v", "3"],
            VideoCodec::Ffv1 => &["-c:v", "ffv1", "-pix_fmt", "bgr0"],
        }
    }
}

/// Pipeline settings persisted as JSON next to the binary (or in the user
/// config directory). Fixed for the lifetime of a [`crate::DetectionPipeline`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    // === 输出 ===
    pub output_dir: PathBuf,
    pub image_file_name: String,
    pub video_codec: VideoCodec,

    // === 推理 ===
    pub inference_retries: u32, // per-frame retries before skip

    // === 标注样式 ===
    pub box_color: [u8; 3],
    pub box_thickness: u32,
    pub label_scale: u32,             // bitmap font pixel size multiplier
    pub label_font: Option<PathBuf>,  // optional TrueType font
    pub label_font_size: f32,

    // === 外部工具 ===
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            image_file_name: "result.jpg".to_string(),
            video_codec: VideoCodec::Xvid,

            inference_retries: 0,

            box_color: [0, 255, 0],
            box_thickness: 2,
            label_scale: 2,
            label_font: None,
            label_font_size: 24.0,

            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
        }
    }
}

impl PipelineSettings {
    /// Default location: `<config dir>/yolov8-annotate/settings.json`,
    /// falling back to the working directory.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join("yolov8-annotate").join(SETTINGS_FILE_NAME))
            .unwrap_or_else(|| PathBuf::from(SETTINGS_FILE_NAME))
    }

    /// 从JSON文件加载配置; a missing file is created with defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(json) => {
                let settings: Self =
                    serde_json::from_str(&json).map_err(|e| ConfigError::Settings {
                        path: path.to_path_buf(),
                        reason: e.to_string(),
                    })?;
                info!("✅ settings loaded from {}", path.display());
                Ok(settings)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("📝 settings file missing, writing defaults to {}", path.display());
                let settings = Self::default();
                if let Err(e) = settings.save(path) {
                    warn!("⚠️  could not write default settings: {}", e);
                }
                Ok(settings)
            }
            Err(e) => Err(ConfigError::Settings {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let to_err = |reason: String| ConfigError::Settings {
            path: path.to_path_buf(),
            reason,
        };
        let json = serde_json::to_string_pretty(self).map_err(|e| to_err(e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| to_err(e.to_string()))?;
        }
        fs::write(path, json).map_err(|e| to_err(e.to_string()))?;
        info!("💾 settings saved to {}", path.display());
        Ok(())
    }

    pub fn video_output_path(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(self.video_codec.file_name())
    }

    pub fn image_output_path(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(&self.image_file_name)
    }

    pub fn print_summary(&self) {
        info!("🎛️  output dir: {}", self.output_dir.display());
        info!(
            "   video codec: {:?} ({}), image file: {}",
            self.video_codec,
            self.video_codec.file_name(),
            self.image_file_name
        );
        info!("   inference retries per frame: {}", self.inference_retries);
        info!(
            "   box color: {:?}, thickness: {}",
            self.box_color, self.box_thickness
        );
    }
}

/// 命令行参数
#[derive(Parser, Clone, Debug)]
#[command(author, version, about = "YOLOv8 image/video detection with annotated output", long_about = None)]
pub struct Args {
    /// Image (png/jpg/bmp) or video (mp4/avi/mov/mkv) to process
    #[arg(short, long)]
    pub source: PathBuf,

    /// Confidence threshold in (0, 1]
    #[arg(short, long, default_value = "0.25")]
    pub conf: String,

    /// Output directory (overrides the settings file)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Settings JSON file
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Treat the source as a video regardless of extension
    #[arg(long, conflicts_with = "image")]
    pub video: bool,

    /// Treat the source as a still image regardless of extension
    #[arg(long)]
    pub image: bool,

    /// ONNX model path
    #[arg(short, long, default_value = "models/yolov8m.onnx")]
    pub model: String,

    /// Run the model with the CUDA execution provider
    #[arg(long)]
    pub cuda: bool,

    /// Device id for GPU execution providers
    #[arg(long, default_value_t = 0)]
    pub device_id: i32,

    /// Model input size (square)
    #[arg(long, default_value_t = 640)]
    pub imgsz: u32,

    /// NMS IoU threshold
    #[arg(long, default_value_t = 0.45)]
    pub iou: f32,

    /// Write a JSON run report next to the output
    #[arg(long)]
    pub report: bool,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn settings_path(&self) -> PathBuf {
        self.settings
            .clone()
            .unwrap_or_else(PipelineSettings::default_path)
    }

    /// Builds the validated run configuration; nothing is opened yet.
    pub fn pipeline_config(&self, settings: &PipelineSettings) -> Result<PipelineConfig, ConfigError> {
        let threshold = parse_threshold(&self.conf)?;
        let output_dir = self
            .output
            .clone()
            .unwrap_or_else(|| settings.output_dir.clone());

        let is_video = if self.video {
            true
        } else if self.image {
            false
        } else {
            MediaKind::from_path(&self.source)
                .ok_or_else(|| ConfigError::UnknownMediaKind(self.source.clone()))?
                == MediaKind::Video
        };

        PipelineConfig::new(self.source.clone(), is_video, threshold, output_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_threshold_bounds() {
        assert!(validate_threshold(0.0).is_err());
        assert!(validate_threshold(-0.1).is_err());
        assert!(validate_threshold(1.01).is_err());
        assert!(validate_threshold(f32::NAN).is_err());
        assert_eq!(validate_threshold(1.0).unwrap(), 1.0);
        assert_eq!(validate_threshold(0.25).unwrap(), 0.25);
    }

    #[test]
    fn test_threshold_text() {
        assert_eq!(parse_threshold(" 0.5 ").unwrap(), 0.5);
        assert!(matches!(
            parse_threshold("abc"),
            Err(ConfigError::UnparseableThreshold(_))
        ));
        assert!(matches!(
            parse_threshold("0"),
            Err(ConfigError::InvalidThreshold(_))
        ));
    }

    #[test]
    fn test_media_kind_from_extension() {
        assert_eq!(MediaKind::from_path(Path::new("a/b.JPG")), Some(MediaKind::Image));
        assert_eq!(MediaKind::from_path(Path::new("clip.mkv")), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_path(Path::new("notes.txt")), None);
        assert_eq!(MediaKind::from_path(Path::new("noext")), None);
    }

    #[test]
    fn test_config_requires_existing_source() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.png");
        assert!(matches!(
            PipelineConfig::new(&missing, false, 0.5, dir.path().join("out")),
            Err(ConfigError::MissingSource(_))
        ));

        let present = dir.path().join("present.png");
        fs::write(&present, b"x").unwrap();
        let config = PipelineConfig::new(&present, false, 1.0, dir.path().join("out")).unwrap();
        assert_eq!(config.confidence_threshold(), 1.0);
        assert_eq!(config.media_kind(), MediaKind::Image);
    }

    #[test]
    fn test_config_rejects_file_as_output_dir() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("in.png");
        fs::write(&src, b"x").unwrap();
        assert!(matches!(
            PipelineConfig::new(&src, false, 0.5, &src),
            Err(ConfigError::InvalidOutputDirectory(..))
        ));
    }

    #[test]
    fn test_settings_load_creates_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);
        let settings = PipelineSettings::load(&path).unwrap();
        assert_eq!(settings, PipelineSettings::default());
        assert!(path.exists());

        let mut changed = settings.clone();
        changed.inference_retries = 2;
        changed.video_codec = VideoCodec::Ffv1;
        changed.save(&path).unwrap();
        assert_eq!(PipelineSettings::load(&path).unwrap(), changed);
    }

    #[test]
    fn test_settings_partial_json_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        fs::write(&path, r#"{ "video_codec": "ffv1" }"#).unwrap();
        let settings = PipelineSettings::load(&path).unwrap();
        assert_eq!(settings.video_codec, VideoCodec::Ffv1);
        assert_eq!(settings.image_file_name, "result.jpg");

        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            PipelineSettings::load(&path),
            Err(ConfigError::Settings { .. })
        ));
    }

    #[test]
    fn test_args_infer_kind() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("clip.mp4");
        fs::write(&src, b"x").unwrap();
        let args = Args::parse_from([
            "yolov8",
            "--source",
            src.to_str().unwrap(),
            "--conf",
            "0.4",
        ]);
        let config = args.pipeline_config(&PipelineSettings::default()).unwrap();
        assert!(config.is_video());
        assert_eq!(config.output_dir(), Path::new(DEFAULT_OUTPUT_DIR));

        let args = Args::parse_from(["yolov8", "-s", src.to_str().unwrap(), "--image"]);
        assert!(!args.pipeline_config(&PipelineSettings::default()).unwrap().is_video());
    }
}
