// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 检测器接口 (Detector capability)
///
/// The pipeline only knows this trait. Which model backs it is decided by
/// whoever builds the [`ModelHandle`] and passes it to `start`.
use crate::error::InferenceError;
use crate::frame::{Detection, DetectionSet, Frame};

/// Runs object detection on one frame.
///
/// Calls are synchronous and may block for as long as the model needs.
/// Implementations must not carry per-frame state across calls: the returned
/// set describes only the given frame.
pub trait Detector: Send {
    /// Detect objects whose confidence is at least `confidence_threshold`.
    fn infer(
        &mut self,
        frame: &Frame,
        confidence_threshold: f32,
    ) -> Result<DetectionSet, InferenceError>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "detector"
    }
}

/// Opaque handle to a loaded model, moved into the worker for one run.
pub type ModelHandle = Box<dyn Detector>;

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn infer(
        &mut self,
        frame: &Frame,
        confidence_threshold: f32,
    ) -> Result<DetectionSet, InferenceError> {
        (**self).infer(frame, confidence_threshold)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Rejects frames a detector cannot consume (empty raster).
pub fn check_input(frame: &Frame) -> Result<(), InferenceError> {
    if frame.width() == 0 || frame.height() == 0 {
        return Err(InferenceError::MalformedInput(format!(
            "frame {} has zero size {}x{}",
            frame.index(),
            frame.width(),
            frame.height()
        )));
    }
    Ok(())
}

fn area(d: &Detection) -> f32 {
    (d.width().max(0) as f32) * (d.height().max(0) as f32)
}

/// Intersection over union of two pixel boxes.
pub fn iou(a: &Detection, b: &Detection) -> f32 {
    let l = a.left.max(b.left);
    let r = a.right.min(b.right);
    let t = a.top.max(b.top);
    let btm = a.bottom.min(b.bottom);
    let inter = (r.saturating_sub(l).max(0) as f32) * (btm.saturating_sub(t).max(0) as f32);
    let union = area(a) + area(b) - inter;
    if union <= 0.0 {
        return 0.0;
    }
    inter / union
}

/// Greedy NMS: keeps the highest-confidence box and drops any later box
/// overlapping a kept one by more than `iou_threshold`. Output is sorted by
/// descending confidence.
pub fn non_max_suppression(xs: &mut Vec<Detection>, iou_threshold: f32) {
    xs.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            if iou(&xs[prev_index], &xs[index]) > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}
