// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 模型实现 (ONNX Runtime backends for [`crate::Detector`])
pub mod yolov8;

pub use yolov8::{ModelOptions, YOLOv8};
