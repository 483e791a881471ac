//! Inference dispatch
//!
//! `Predictor::predict` is the single entry point: behavior is entirely
//! determined by the loaded artifact's kind. Each path runs its own
//! preprocessing and execution, then normalizes the backend's raw output
//! into the canonical `(label, probability, bbox?)` result.

use std::sync::Arc;

use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;
use openvino::{ElementType, Shape, Tensor};
use ort::session::Session;
use ort::value::Value;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::artifact::{Backend, BundleTask, ModelArtifact, SafeCompiledModel};
use crate::engine::labels;
use crate::engine::locator::{BoundingBox, FaceLocator};
use crate::engine::preprocess::{self, InputSpec, ResizeInfo};
use crate::error::PredictError;
use crate::utils::math::{argmax, softmax};

/// Fallback input edges for bundle exports that omit their training size.
const BUNDLE_CLASSIFY_SIZE: u32 = 224;
const BUNDLE_DETECT_SIZE: u32 = 640;

/// Minimum class score for a decoded detection to be kept.
const DETECT_CONF_THRESHOLD: f32 = 0.25;
/// IoU above which overlapping detections are suppressed.
const NMS_IOU_THRESHOLD: f32 = 0.45;

/// Canonical inference result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResult {
    pub label: String,
    pub probability: f32,
    pub bbox: Option<BoundingBox>,
}

/// One decoded detection from a bundle's detect head, in original-image
/// two-corner coordinates.
#[derive(Debug, Clone, Copy)]
struct Detection {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    class_index: usize,
    confidence: f32,
}

/// What a bundle export produced, as a closed variant the dispatcher matches
/// exhaustively.
enum BundleOutput {
    Probs(Vec<f32>),
    Detections(Vec<Detection>),
}

/// Prediction front end: holds the locator and the loaded artifact.
pub struct Predictor {
    locator: FaceLocator,
    artifact: Option<Arc<ModelArtifact>>,
}

impl Predictor {
    pub fn new(locator: FaceLocator, artifact: Option<Arc<ModelArtifact>>) -> Self {
        Self { locator, artifact }
    }

    /// Run one prediction over a decoded image.
    pub fn predict(&self, image: &DynamicImage) -> Result<PredictionResult, PredictError> {
        let artifact = self
            .artifact
            .as_deref()
            .ok_or(PredictError::ModelUnavailable)?;

        match &artifact.backend {
            Backend::SavedGraph { model, spec } => self.predict_saved_graph(image, model, *spec),
            Backend::Bundle {
                session,
                task,
                names,
                image_size,
            } => self.predict_bundle(image, session, task, names.as_deref(), *image_size),
            Backend::Traced { session } => self.predict_traced(image, session),
        }
    }

    /// Saved-graph path: crop to a located face when one is found, feed the
    /// declared input geometry, and report the top class.
    fn predict_saved_graph(
        &self,
        image: &DynamicImage,
        model: &SafeCompiledModel,
        spec: InputSpec,
    ) -> Result<PredictionResult, PredictError> {
        let bbox = self.locator.locate(image);
        let roi = match &bbox {
            Some(found) => preprocess::crop_box(image, found),
            None => image.clone(),
        };

        let input = preprocess::prepare_declared(&roi, spec)?;
        let (values, dims) = run_saved_graph(model, &input)?;
        let scores = flatten_to_rank1(values, &dims)?;

        let index = argmax(&scores);
        // The artifact's final layer already emits a normalized distribution;
        // its value is reported as-is.
        let probability = scores[index];
        let label = labels::resolve(index, None);

        Ok(PredictionResult {
            label,
            probability,
            bbox,
        })
    }

    /// Bundle path: the export declares its own task; preprocessing is the
    /// runner's responsibility, not the shared preprocessor's.
    fn predict_bundle(
        &self,
        image: &DynamicImage,
        session: &Mutex<Session>,
        task: &BundleTask,
        names: Option<&[String]>,
        image_size: Option<u32>,
    ) -> Result<PredictionResult, PredictError> {
        let output = match task {
            BundleTask::Classify => {
                let size = image_size.unwrap_or(BUNDLE_CLASSIFY_SIZE);
                let input = bundle_classify_input(image, size);
                let (values, dims) = run_onnx(session, input)?;
                BundleOutput::Probs(flatten_to_rank1(values, &dims)?)
            }
            BundleTask::Detect => {
                let size = image_size.unwrap_or(BUNDLE_DETECT_SIZE);
                let (input, info) = bundle_detect_input(image, size);
                let (values, dims) = run_onnx(session, input)?;
                let decoded = decode_detections(&values, &dims, &info)?;
                BundleOutput::Detections(nms(decoded))
            }
            BundleTask::Other(task) => {
                return Err(PredictError::UnsupportedArtifactKind { task: task.clone() })
            }
        };

        match output {
            BundleOutput::Probs(probs) => {
                let index = argmax(&probs);
                let probability = probs[index];
                let label = labels::resolve(index, names);
                // Classification has no box of its own; the locator only
                // annotates the result.
                let bbox = self.locator.locate(image);
                Ok(PredictionResult {
                    label,
                    probability,
                    bbox,
                })
            }
            BundleOutput::Detections(detections) => {
                let best =
                    select_best_detection(&detections).ok_or(PredictError::NoUsableOutput)?;
                debug!(
                    "best of {} detections: class {} at {:.3}",
                    detections.len(),
                    best.class_index,
                    best.confidence
                );
                Ok(PredictionResult {
                    label: labels::resolve(best.class_index, names),
                    probability: best.confidence,
                    bbox: Some(to_bounding_box(&best)),
                })
            }
        }
    }

    /// Traced-graph path: fixed 224x224 channel-first input, raw logits out,
    /// normalized through a stable softmax before reading a probability.
    fn predict_traced(
        &self,
        image: &DynamicImage,
        session: &Mutex<Session>,
    ) -> Result<PredictionResult, PredictError> {
        let bbox = self.locator.locate(image);
        let roi = match &bbox {
            Some(found) => preprocess::crop_box(image, found),
            None => image.clone(),
        };

        let input = preprocess::prepare_traced(&roi);
        let (values, dims) = run_onnx(session, input)?;
        let logits = flatten_to_rank1(values, &dims)?;

        let probs = softmax(&logits);
        let index = argmax(&probs);

        Ok(PredictionResult {
            label: labels::resolve(index, None),
            probability: probs[index],
            bbox,
        })
    }
}

/// Execute an ONNX session and return the first output tensor flattened to
/// values plus its shape.
fn run_onnx(
    session: &Mutex<Session>,
    input: Array4<f32>,
) -> Result<(Vec<f32>, Vec<i64>), PredictError> {
    let value = Value::from_array(input).map_err(PredictError::backend)?;

    let mut session = session.lock();
    let outputs = session
        .run(ort::inputs![value])
        .map_err(PredictError::backend)?;

    let Some((_, output)) = outputs.iter().next() else {
        return Err(PredictError::EmptyResults);
    };
    let (shape, data) = output
        .try_extract_tensor::<f32>()
        .map_err(PredictError::backend)?;

    Ok((data.to_vec(), shape.iter().copied().collect()))
}

/// Execute the saved graph over an NHWC tensor and return the first output's
/// values plus shape.
fn run_saved_graph(
    model: &SafeCompiledModel,
    input: &Array4<f32>,
) -> Result<(Vec<f32>, Vec<i64>), PredictError> {
    let mut request = model.create_infer_request().map_err(PredictError::backend)?;

    let dims: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
    let shape = Shape::new(&dims).map_err(PredictError::backend)?;
    let mut tensor = Tensor::new(ElementType::F32, &shape).map_err(PredictError::backend)?;

    let data = input.as_slice().ok_or(PredictError::ShapeMismatch {
        shape: dims.clone(),
    })?;
    unsafe {
        let dst = tensor
            .get_raw_data_mut()
            .map_err(PredictError::backend)?
            .as_mut_ptr() as *mut f32;
        std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
    }

    request.set_input_tensor(&tensor).map_err(PredictError::backend)?;
    request.infer().map_err(PredictError::backend)?;

    let output = request.get_output_tensor().map_err(PredictError::backend)?;
    let out_shape = output.get_shape().map_err(PredictError::backend)?;
    let out_dims = out_shape.get_dimensions().to_vec();
    let len: i64 = out_dims.iter().product();

    let values: Vec<f32> = unsafe {
        let ptr = output
            .get_raw_data()
            .map_err(PredictError::backend)?
            .as_ptr() as *const f32;
        std::slice::from_raw_parts(ptr, len.max(0) as usize).to_vec()
    };

    Ok((values, out_dims))
}

/// Squeeze size-1 axes; the result must be a non-empty rank-1 vector.
fn flatten_to_rank1(values: Vec<f32>, dims: &[i64]) -> Result<Vec<f32>, PredictError> {
    let significant = dims.iter().filter(|&&d| d != 1).count();
    if significant > 1 || values.is_empty() {
        return Err(PredictError::ShapeMismatch {
            shape: dims.to_vec(),
        });
    }
    Ok(values)
}

/// Resize to the bundle's training size and pack channel-first.
fn bundle_classify_input(image: &DynamicImage, size: u32) -> Array4<f32> {
    let rgb = image.to_rgb8();
    let resized = image::imageops::resize(&rgb, size, size, FilterType::Lanczos3);
    preprocess::rgb_to_chw(&resized)
}

/// Letterbox onto the bundle's training canvas and pack channel-first.
fn bundle_detect_input(image: &DynamicImage, size: u32) -> (Array4<f32>, ResizeInfo) {
    let (canvas, info) = preprocess::letterbox(image, size);
    (preprocess::rgb_to_chw(&canvas), info)
}

/// Decode a `[1, 4 + classes, anchors]` detect head into original-image
/// detections. Rows are `cx, cy, w, h` followed by per-class scores.
fn decode_detections(
    values: &[f32],
    dims: &[i64],
    info: &ResizeInfo,
) -> Result<Vec<Detection>, PredictError> {
    if dims.len() != 3 || dims[0] != 1 || dims[1] < 5 || dims[2] < 1 {
        return Err(PredictError::NoUsableOutput);
    }
    let attrs = dims[1] as usize;
    let anchors = dims[2] as usize;
    if values.len() < attrs * anchors {
        return Err(PredictError::NoUsableOutput);
    }
    let classes = attrs - 4;

    let mut detections = Vec::new();
    for anchor in 0..anchors {
        let at = |attr: usize| values[attr * anchors + anchor];

        let mut class_index = 0usize;
        let mut confidence = f32::NEG_INFINITY;
        for class in 0..classes {
            let score = at(4 + class);
            if score > confidence {
                class_index = class;
                confidence = score;
            }
        }
        if confidence < DETECT_CONF_THRESHOLD {
            continue;
        }

        let (cx, cy, w, h) = (at(0), at(1), at(2), at(3));
        let (x1, y1) = info.to_original(cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = info.to_original(cx + w / 2.0, cy + h / 2.0);

        detections.push(Detection {
            x1,
            y1,
            x2,
            y2,
            class_index,
            confidence,
        });
    }

    Ok(detections)
}

/// Non-maximum suppression, highest confidence first.
fn nms(mut detections: Vec<Detection>) -> Vec<Detection> {
    if detections.is_empty() {
        return detections;
    }

    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i]);

        for j in (i + 1)..detections.len() {
            if suppressed[j] {
                continue;
            }
            if compute_iou(&detections[i], &detections[j]) > NMS_IOU_THRESHOLD {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Intersection over union of two detections.
fn compute_iou(a: &Detection, b: &Detection) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);

    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);

    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Highest-confidence detection; ties keep the earlier one (detector order).
fn select_best_detection(detections: &[Detection]) -> Option<Detection> {
    detections.iter().copied().reduce(|best, candidate| {
        if candidate.confidence > best.confidence {
            candidate
        } else {
            best
        }
    })
}

/// Two-corner coordinates to `(x, y, width, height)`, clamped to
/// non-negative integers.
fn to_bounding_box(detection: &Detection) -> BoundingBox {
    BoundingBox {
        x: detection.x1.round().max(0.0) as u32,
        y: detection.y1.round().max(0.0) as u32,
        width: (detection.x2 - detection.x1).round().max(0.0) as u32,
        height: (detection.y2 - detection.y1).round().max(0.0) as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(x1: f32, y1: f32, x2: f32, y2: f32, class_index: usize, confidence: f32) -> Detection {
        Detection {
            x1,
            y1,
            x2,
            y2,
            class_index,
            confidence,
        }
    }

    #[test]
    fn test_flatten_accepts_batched_vector() {
        let scores = flatten_to_rank1(vec![0.1, 0.9], &[1, 2]).unwrap();
        assert_eq!(scores.len(), 2);

        assert!(flatten_to_rank1(vec![0.5; 7], &[7]).is_ok());
        assert!(flatten_to_rank1(vec![0.5; 7], &[1, 7, 1]).is_ok());
    }

    #[test]
    fn test_flatten_rejects_higher_rank() {
        match flatten_to_rank1(vec![0.0; 21], &[1, 3, 7]) {
            Err(PredictError::ShapeMismatch { shape }) => assert_eq!(shape, vec![1, 3, 7]),
            other => panic!("expected ShapeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_flatten_rejects_empty_output() {
        assert!(matches!(
            flatten_to_rank1(Vec::new(), &[1, 0]),
            Err(PredictError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_best_detection_picks_highest_confidence() {
        // Two boxes at 0.9 and 0.4: the result must carry the 0.9 box's
        // class and coordinates in (x, y, w, h) form.
        let detections = vec![
            detection(10.0, 20.0, 110.0, 140.0, 2, 0.9),
            detection(200.0, 200.0, 260.0, 260.0, 5, 0.4),
        ];
        let best = select_best_detection(&detections).unwrap();
        assert_eq!(best.class_index, 2);
        assert!((best.confidence - 0.9).abs() < 1e-6);

        let bbox = to_bounding_box(&best);
        assert_eq!(
            bbox,
            BoundingBox {
                x: 10,
                y: 20,
                width: 100,
                height: 120
            }
        );
    }

    #[test]
    fn test_best_detection_tie_keeps_detector_order() {
        let detections = vec![
            detection(0.0, 0.0, 10.0, 10.0, 1, 0.7),
            detection(50.0, 50.0, 60.0, 60.0, 2, 0.7),
        ];
        assert_eq!(select_best_detection(&detections).unwrap().class_index, 1);
    }

    #[test]
    fn test_bounding_box_clamps_negative_corners() {
        let bbox = to_bounding_box(&detection(-12.3, -4.0, 50.5, 40.0, 0, 0.8));
        assert_eq!(bbox.x, 0);
        assert_eq!(bbox.y, 0);
        assert_eq!(bbox.width, 63);
        assert_eq!(bbox.height, 44);
    }

    #[test]
    fn test_decode_detections_reads_head_layout() {
        // One anchor, two classes: cx=100, cy=80, w=40, h=20, scores .1/.8.
        let values = vec![100.0, 80.0, 40.0, 20.0, 0.1, 0.8];
        let info = ResizeInfo::new((640, 640), (640, 640));
        let decoded = decode_detections(&values, &[1, 6, 1], &info).unwrap();
        assert_eq!(decoded.len(), 1);
        let d = &decoded[0];
        assert_eq!(d.class_index, 1);
        assert!((d.confidence - 0.8).abs() < 1e-6);
        assert!((d.x1 - 80.0).abs() < 1e-4);
        assert!((d.y1 - 70.0).abs() < 1e-4);
        assert!((d.x2 - 120.0).abs() < 1e-4);
        assert!((d.y2 - 90.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_detections_drops_low_confidence() {
        let values = vec![100.0, 80.0, 40.0, 20.0, 0.1, 0.2];
        let info = ResizeInfo::new((640, 640), (640, 640));
        let decoded = decode_detections(&values, &[1, 6, 1], &info).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_decode_detections_rejects_unusable_head() {
        let info = ResizeInfo::new((640, 640), (640, 640));
        assert!(matches!(
            decode_detections(&[0.0; 4], &[1, 4, 1], &info),
            Err(PredictError::NoUsableOutput)
        ));
        assert!(matches!(
            decode_detections(&[0.0; 6], &[6], &info),
            Err(PredictError::NoUsableOutput)
        ));
    }

    #[test]
    fn test_nms_suppresses_overlapping_boxes() {
        let detections = vec![
            detection(0.0, 0.0, 100.0, 100.0, 0, 0.9),
            detection(5.0, 5.0, 105.0, 105.0, 0, 0.6),
            detection(300.0, 300.0, 400.0, 400.0, 1, 0.8),
        ];
        let kept = nms(detections);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
        assert!((kept[1].confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_iou_calculation() {
        let a = detection(0.0, 0.0, 10.0, 10.0, 0, 0.9);
        let b = detection(5.0, 5.0, 15.0, 15.0, 0, 0.8);

        // Intersection: 5x5 = 25; union: 100 + 100 - 25 = 175.
        let iou = compute_iou(&a, &b);
        assert!((iou - 25.0 / 175.0).abs() < 1e-4);
    }

    #[test]
    fn test_predict_without_artifact_is_model_unavailable() {
        let predictor = Predictor::new(FaceLocator::disabled(), None);
        let image = DynamicImage::new_rgb8(32, 32);
        assert!(matches!(
            predictor.predict(&image),
            Err(PredictError::ModelUnavailable)
        ));
    }
}
