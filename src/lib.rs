// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod annotate; // 检测框与标签绘制
pub mod config; // 运行参数与配置文件
pub mod delivery; // 最新画面投递通道
pub mod detector; // 检测器接口
pub mod error;
pub mod frame; // 帧与检测结果
#[cfg(feature = "onnx")]
pub mod models; // ONNX Runtime 模型实现
pub mod pipeline; // 检测流水线
pub mod sink; // 结果输出
pub mod source; // 图片/视频输入
pub mod telemetry;

pub use crate::annotate::{Annotator, LabelStyle};
pub use crate::config::{Args, MediaKind, PipelineConfig, PipelineSettings, VideoCodec};
pub use crate::delivery::{Delivery, DeliveryChannel, DeliveryReceiver};
pub use crate::detector::{Detector, ModelHandle};
pub use crate::error::{ConfigError, InferenceError, PipelineError, SourceError, WriteError};
pub use crate::frame::{AnnotatedFrame, Detection, DetectionSet, Frame, FrameRate, SourceMetadata};
pub use crate::pipeline::{DetectionPipeline, RunReport, RunState, RunStats, RunStatus};
pub use crate::sink::ResultSink;
pub use crate::source::FrameSource;

/// Timestamp for log lines and report names, e.g. `2024-05-01_12-30-00`.
pub fn gen_time_string(delimiter: &str) -> String {
    let fmt = format!(
        "%Y{d}%m{d}%d_%H{d}%M{d}%S",
        d = delimiter
    );
    chrono::Local::now().format(&fmt).to_string()
}
