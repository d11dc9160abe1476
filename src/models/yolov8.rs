// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLOv8 检测模型
// 包含: 模型加载、预处理、推理、后处理

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use ndarray::{Array, ArrayViewD, Ix4};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;
use tracing::{debug, info};

use crate::detector::{check_input, non_max_suppression, Detector};
use crate::error::InferenceError;
use crate::frame::{Detection, DetectionSet, Frame};

const CXYWH_OFFSET: usize = 4;

/// Load-time options for [`YOLOv8`].
#[derive(Debug, Clone)]
pub struct ModelOptions {
    pub model: String,
    pub cuda: bool,
    pub device_id: i32,
    /// Square network input size.
    pub imgsz: u32,
    pub iou: f32,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            model: "models/yolov8m.onnx".to_string(),
            cuda: false,
            device_id: 0,
            imgsz: 640,
            iou: 0.45,
        }
    }
}

/// YOLOv8 检测模型 (ONNX Runtime)
pub struct YOLOv8 {
    session: Session,
    width: u32,
    height: u32,
    iou: f32,
}

impl YOLOv8 {
    pub fn new(opts: &ModelOptions) -> Result<Self> {
        let builder = Session::builder()
            .map_err(|e| anyhow!("failed to create ONNX Runtime session builder: {}", e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| anyhow!("failed to set optimization level: {}", e))?;

        let builder = if opts.cuda {
            use ort::execution_providers::CUDAExecutionProvider;
            info!("🚀 using CUDA execution provider (device {})", opts.device_id);
            builder
                .with_execution_providers([CUDAExecutionProvider::default()
                    .with_device_id(opts.device_id)
                    .build()])
                .map_err(|e| anyhow!("CUDA provider failed: {}", e))?
        } else {
            builder
        };

        let session = builder
            .commit_from_file(&opts.model)
            .map_err(|e| anyhow!("failed to load model {}: {}", opts.model, e))?;
        info!("✅ model loaded: {} (input {}x{})", opts.model, opts.imgsz, opts.imgsz);

        Ok(Self {
            session,
            width: opts.imgsz,
            height: opts.imgsz,
            iou: opts.iou,
        })
    }

    /// Stretch-resize to the network input, NCHW, scaled to [0, 1].
    pub fn preprocess(&self, frame: &Frame) -> Array<f32, Ix4> {
        let resized = imageops::resize(frame.image(), self.width, self.height, FilterType::Triangle);
        let mut ys = Array::zeros((1, 3, self.height as usize, self.width as usize));
        for (x, y, rgb) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            let [r, g, b] = rgb.0;
            ys[[0, 0, y, x]] = r as f32 / 255.0;
            ys[[0, 1, y, x]] = g as f32 / 255.0;
            ys[[0, 2, y, x]] = b as f32 / 255.0;
        }
        ys
    }

    fn run(&mut self, input: &Array<f32, Ix4>) -> std::result::Result<ndarray::ArrayD<f32>, InferenceError> {
        let tensor = TensorRef::from_array_view(input).map_err(|e| InferenceError::backend(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(|e| InferenceError::backend(e.to_string()))?;
        let preds = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e| InferenceError::backend(e.to_string()))?
            .into_owned();
        Ok(preds)
    }
}

/// Decodes raw `[1, 4 + nc, anchors]` predictions into frame-space boxes
/// above `confidence_threshold`, after NMS.
pub fn decode_predictions(
    preds: ArrayViewD<'_, f32>,
    input_size: (u32, u32),
    frame_size: (u32, u32),
    confidence_threshold: f32,
    iou_threshold: f32,
) -> std::result::Result<Vec<Detection>, InferenceError> {
    let shape = preds.shape().to_vec();
    if shape.len() != 3 || shape[1] <= CXYWH_OFFSET {
        return Err(InferenceError::backend(format!("unexpected output shape {:?}", shape)));
    }
    let (rows, anchors) = (shape[1], shape[2]);
    let (frame_width, frame_height) = (frame_size.0 as f32, frame_size.1 as f32);
    let sx = frame_width / input_size.0 as f32;
    let sy = frame_height / input_size.1 as f32;

    let mut xs = Vec::new();
    for j in 0..anchors {
        let (mut class_id, mut conf) = (0usize, 0.0f32);
        for c in CXYWH_OFFSET..rows {
            let score = preds[[0, c, j]];
            if score > conf {
                conf = score;
                class_id = c - CXYWH_OFFSET;
            }
        }
        if conf < confidence_threshold {
            continue;
        }

        let cx = preds[[0, 0, j]] * sx;
        let cy = preds[[0, 1, j]] * sy;
        let w = preds[[0, 2, j]] * sx;
        let h = preds[[0, 3, j]] * sy;
        let left = (cx - w / 2.0).max(0.0);
        let top = (cy - h / 2.0).max(0.0);
        let right = (cx + w / 2.0).min(frame_width);
        let bottom = (cy + h / 2.0).min(frame_height);

        xs.push(Detection::new(
            left.round() as i32,
            top.round() as i32,
            right.round() as i32,
            bottom.round() as i32,
            class_id as u32,
            conf,
        ));
    }

    non_max_suppression(&mut xs, iou_threshold);
    Ok(xs)
}

impl Detector for YOLOv8 {
    fn infer(
        &mut self,
        frame: &Frame,
        confidence_threshold: f32,
    ) -> std::result::Result<DetectionSet, InferenceError> {
        check_input(frame)?;
        let input = self.preprocess(frame);
        let preds = self.run(&input)?;
        let ys = decode_predictions(
            preds.view(),
            (self.width, self.height),
            (frame.width(), frame.height()),
            confidence_threshold,
            self.iou,
        )?;
        debug!("frame #{}: {} detections", frame.index(), ys.len());
        Ok(ys.into())
    }

    fn name(&self) -> &str {
        "yolov8"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    // two classes, three anchors on a 100x100 input
    fn preds() -> Array3<f32> {
        let mut a = Array3::zeros((1, 6, 3));
        for (j, (cx, cy, w, h, c0, c1)) in [
            (50.0, 50.0, 20.0, 20.0, 0.9, 0.1),
            (51.0, 50.0, 20.0, 20.0, 0.7, 0.0),
            (10.0, 10.0, 10.0, 10.0, 0.05, 0.3),
        ]
        .into_iter()
        .enumerate()
        {
            for (r, v) in [cx, cy, w, h, c0, c1].into_iter().enumerate() {
                a[[0, r, j]] = v;
            }
        }
        a
    }

    #[test]
    fn test_decode_rescales_and_suppresses() {
        let p = preds().into_dyn();
        let ys = decode_predictions(p.view(), (100, 100), (200, 100), 0.25, 0.45).unwrap();
        assert_eq!(ys.len(), 2);
        assert_eq!((ys[0].left, ys[0].top, ys[0].right, ys[0].bottom), (80, 40, 120, 60));
        assert_eq!(ys[0].class_id, 0);
        assert_eq!(ys[1].class_id, 1);
        assert_eq!((ys[1].left, ys[1].top), (10, 5));
    }

    #[test]
    fn test_decode_threshold_and_shape() {
        let p = preds().into_dyn();
        let ys = decode_predictions(p.view(), (100, 100), (100, 100), 0.8, 0.45).unwrap();
        assert_eq!(ys.len(), 1);

        let bad = Array3::<f32>::zeros((1, 4, 3)).into_dyn();
        assert!(decode_predictions(bad.view(), (100, 100), (100, 100), 0.25, 0.45).is_err());
    }
}
