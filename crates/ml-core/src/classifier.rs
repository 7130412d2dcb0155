//! Boundary to the opaque object classifier.

use anyhow::Result;
use video_ingest::Frame;

/// Parameters forwarded to every classifier invocation.
#[derive(Clone, Debug)]
pub struct InferenceParams {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Square input size the model expects, in pixels.
    pub image_size: u32,
    /// Only these class ids are of interest. Empty means no filtering.
    pub class_filter: Vec<u32>,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            iou_threshold: 0.45,
            image_size: 640,
            class_filter: Vec::new(),
        }
    }
}

/// Raw model output: corner coordinates in source-frame pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub class_id: u32,
    pub confidence: f32,
    pub bbox_xyxy: [f32; 4],
}

/// An object detector treated as a pure function of its input frame.
pub trait Classifier: Send {
    fn infer(&mut self, frame: &Frame, params: &InferenceParams) -> Result<Vec<RawDetection>>;
}

impl<C: Classifier + ?Sized> Classifier for Box<C> {
    fn infer(&mut self, frame: &Frame, params: &InferenceParams) -> Result<Vec<RawDetection>> {
        (**self).infer(frame, params)
    }
}

/// Intersection over union of two `[x1, y1, x2, y2]` boxes.
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix1 = a[0].max(b[0]);
    let iy1 = a[1].max(b[1]);
    let ix2 = a[2].min(b[2]);
    let iy2 = a[3].min(b[3]);
    let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

/// Greedy per-class non-maximum suppression.
///
/// Detections are visited by descending confidence; a box is dropped when it
/// overlaps an already kept box of the same class by more than `iou_threshold`.
pub fn non_max_suppression(mut detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<RawDetection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && iou(&k.bbox_xyxy, &candidate.bbox_xyxy) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}
