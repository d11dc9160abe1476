// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! Error types for the detection pipeline

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Rejected before a run starts; the run never begins.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("confidence threshold {0} must lie in (0, 1]")]
    InvalidThreshold(f32),

    #[error("confidence threshold {0:?} is not a number")]
    UnparseableThreshold(String),

    #[error("source file {0:?} does not exist")]
    MissingSource(PathBuf),

    #[error("cannot tell whether {0:?} is an image or a video")]
    UnknownMediaKind(PathBuf),

    #[error("output directory {0:?} is not usable: {1}")]
    InvalidOutputDirectory(PathBuf, String),

    #[error("settings file {path:?}: {reason}")]
    Settings { path: PathBuf, reason: String },
}

/// The source could not be opened or probed. Fatal to the run.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source {path:?} unavailable: {reason}")]
    Unavailable { path: PathBuf, reason: String },

    #[error("failed to probe {path:?}: {reason}")]
    Probe { path: PathBuf, reason: String },

    #[error("decoder failure: {0}")]
    Decode(String),
}

impl SourceError {
    pub fn unavailable<S: Into<String>>(path: impl Into<PathBuf>, reason: S) -> Self {
        Self::Unavailable {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Per-frame failure raised by a detector. Recoverable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("inference backend failed: {0}")]
    Backend(String),
}

impl InferenceError {
    pub fn backend<S: Into<String>>(msg: S) -> Self {
        Self::Backend(msg.into())
    }
}

/// The sink could not persist a frame. Fatal to the run.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("frame is {actual:?} but the output was opened at {expected:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("image sink accepts exactly one frame per run")]
    AlreadyWritten,

    #[error("sink already closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image encoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error("encoder failure: {0}")]
    Encoder(String),
}

/// Top-level error surfaced to the control layer.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("source unavailable: {0}")]
    SourceUnavailable(#[from] SourceError),

    #[error("write error: {0}")]
    Write(#[from] WriteError),

    #[error("a run is already in progress")]
    AlreadyRunning,

    #[error("worker thread failure: {0}")]
    Worker(String),
}
