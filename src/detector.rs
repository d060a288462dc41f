//! Detection backends. `OnnxDetector` wraps a YOLO-family ONNX export
//! behind the `Detect` seam; the model is loaded once at startup and the
//! runnable plan is shared read-only across HTTP workers.

use std::cmp::Ordering;
use std::path::Path;

use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use ndarray::{Array4, ArrayViewD};
use thiserror::Error;
use tracing::debug;
use tract_onnx::prelude::*;

use crate::models::Detection;

/// Fill value for the letterbox padding, the conventional YOLO gray.
const PAD_COLOR: Rgb<u8> = Rgb([114, 114, 114]);

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("failed to load ONNX model: {0}")]
    ModelLoad(TractError),
    #[error("model inference failed: {0}")]
    Inference(TractError),
    #[error("unexpected model output shape {0:?}")]
    OutputShape(Vec<usize>),
}

/// Inference seam. Implementations take a decoded image and return boxes
/// in original-image pixel coordinates.
pub trait Detect: Send + Sync {
    fn detect(&self, img: &RgbImage) -> Result<Vec<Detection>, DetectError>;
}

type OnnxModel = RunnableModel<TypedFact, Box<dyn TypedOp>, TypedModel>;

/// tract-onnx backed detector for YOLO-style models with a single
/// `[1, 4+nc, P]` output head.
pub struct OnnxDetector {
    model: OnnxModel,
    input_size: u32,
    conf_threshold: f32,
    iou_threshold: f32,
}

impl OnnxDetector {
    pub fn load(
        path: &Path,
        input_size: u32,
        conf_threshold: f32,
        iou_threshold: f32,
    ) -> Result<Self, DetectError> {
        let size = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(path)
            .map_err(DetectError::ModelLoad)?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .map_err(DetectError::ModelLoad)?
            .into_optimized()
            .map_err(DetectError::ModelLoad)?
            .into_runnable()
            .map_err(DetectError::ModelLoad)?;

        Ok(Self {
            model,
            input_size,
            conf_threshold,
            iou_threshold,
        })
    }
}

impl Detect for OnnxDetector {
    fn detect(&self, img: &RgbImage) -> Result<Vec<Detection>, DetectError> {
        let (orig_w, orig_h) = img.dimensions();

        let (canvas, lb) = letterbox_image(img, self.input_size);
        let tensor = to_input_tensor(&canvas);

        let result = self
            .model
            .run(tvec!(tensor.into()))
            .map_err(DetectError::Inference)?;
        let output = result[0]
            .to_array_view::<f32>()
            .map_err(DetectError::Inference)?;

        let candidates =
            decode_detections(&output, &lb, orig_w, orig_h, self.conf_threshold)?;
        debug!(candidates = candidates.len(), "proposals above threshold");

        Ok(nms(candidates, self.iou_threshold))
    }
}

/// How an image was mapped into the square model input.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Letterbox {
    pub(crate) scale: f32,
    pub(crate) pad_x: u32,
    pub(crate) pad_y: u32,
}

pub(crate) fn letterbox_params(width: u32, height: u32, size: u32) -> Letterbox {
    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
    let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);
    Letterbox {
        scale,
        pad_x: (size - new_w) / 2,
        pad_y: (size - new_h) / 2,
    }
}

/// Aspect-preserving resize into a `size`×`size` canvas, centred, with
/// gray padding.
pub(crate) fn letterbox_image(img: &RgbImage, size: u32) -> (RgbImage, Letterbox) {
    let (width, height) = img.dimensions();
    let lb = letterbox_params(width, height, size);

    let new_w = ((width as f32 * lb.scale).round() as u32).clamp(1, size);
    let new_h = ((height as f32 * lb.scale).round() as u32).clamp(1, size);
    let resized = image::imageops::resize(img, new_w, new_h, FilterType::Triangle);

    let mut canvas = RgbImage::from_pixel(size, size, PAD_COLOR);
    image::imageops::replace(&mut canvas, &resized, lb.pad_x as i64, lb.pad_y as i64);

    (canvas, lb)
}

/// NCHW float tensor, pixels scaled to [0, 1].
fn to_input_tensor(canvas: &RgbImage) -> Tensor {
    let size = canvas.width() as usize;
    let mut input = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in canvas.enumerate_pixels() {
        for c in 0..3 {
            input[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }
    input.into_tensor()
}

/// Decode a YOLO `[1, 4+nc, P]` output: rows are cx, cy, w, h followed by
/// one score row per class, column-major over proposals. Boxes are mapped
/// back through the letterbox into original pixel space and clamped.
pub(crate) fn decode_detections(
    output: &ArrayViewD<f32>,
    lb: &Letterbox,
    orig_w: u32,
    orig_h: u32,
    conf_threshold: f32,
) -> Result<Vec<Detection>, DetectError> {
    let shape = output.shape();
    if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
        return Err(DetectError::OutputShape(shape.to_vec()));
    }
    let num_classes = shape[1] - 4;
    let num_proposals = shape[2];

    let mut detections = Vec::new();
    for i in 0..num_proposals {
        let mut class_id = 0usize;
        let mut conf = 0f32;
        for c in 0..num_classes {
            let score = output[[0, 4 + c, i]];
            if score > conf {
                conf = score;
                class_id = c;
            }
        }
        if conf < conf_threshold {
            continue;
        }

        let cx = output[[0, 0, i]];
        let cy = output[[0, 1, i]];
        let w = output[[0, 2, i]];
        let h = output[[0, 3, i]];

        // model-input space -> original pixel space
        let x1 = (cx - w / 2.0 - lb.pad_x as f32) / lb.scale;
        let y1 = (cy - h / 2.0 - lb.pad_y as f32) / lb.scale;
        let x2 = (cx + w / 2.0 - lb.pad_x as f32) / lb.scale;
        let y2 = (cy + h / 2.0 - lb.pad_y as f32) / lb.scale;

        detections.push(Detection {
            x1: x1.clamp(0.0, orig_w as f32),
            y1: y1.clamp(0.0, orig_h as f32),
            x2: x2.clamp(0.0, orig_w as f32),
            y2: y2.clamp(0.0, orig_h as f32),
            conf,
            class_id: class_id as i64,
        });
    }

    Ok(detections)
}

fn iou(a: &Detection, b: &Detection) -> f32 {
    let ix1 = a.x1.max(b.x1);
    let iy1 = a.y1.max(b.y1);
    let ix2 = a.x2.min(b.x2);
    let iy2 = a.y2.min(b.y2);
    let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    if inter == 0.0 {
        return 0.0;
    }
    let union = a.width() * a.height() + b.width() * b.height() - inter;
    inter / union
}

/// Greedy NMS: confidence-descending, suppress overlapping boxes of the
/// same class.
pub(crate) fn nms(mut boxes: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    boxes.sort_unstable_by(|a, b| b.conf.partial_cmp(&a.conf).unwrap_or(Ordering::Equal));

    let mut kept: Vec<Detection> = Vec::new();
    let mut suppressed = vec![false; boxes.len()];

    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }
        kept.push(boxes[i]);
        for j in (i + 1)..boxes.len() {
            if boxes[j].class_id == boxes[i].class_id && iou(&boxes[i], &boxes[j]) > iou_threshold
            {
                suppressed[j] = true;
            }
        }
    }

    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, conf: f32, class_id: i64) -> Detection {
        Detection {
            x1,
            y1,
            x2,
            y2,
            conf,
            class_id,
        }
    }

    #[test]
    fn letterbox_params_for_landscape_image() {
        let lb = letterbox_params(1280, 720, 640);
        assert!((lb.scale - 0.5).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0);
        assert_eq!(lb.pad_y, 140);
    }

    #[test]
    fn letterbox_image_pads_with_gray() {
        let src = RgbImage::from_pixel(4, 2, Rgb([255, 255, 255]));
        let (canvas, lb) = letterbox_image(&src, 8);
        assert_eq!(canvas.dimensions(), (8, 8));
        assert_eq!(lb.pad_x, 0);
        assert_eq!(lb.pad_y, 2);
        // padding rows above and below, content in between
        assert_eq!(*canvas.get_pixel(0, 0), PAD_COLOR);
        assert_eq!(*canvas.get_pixel(0, 7), PAD_COLOR);
        assert_eq!(*canvas.get_pixel(0, 4), Rgb([255, 255, 255]));
    }

    #[test]
    fn decode_maps_boxes_back_to_original_pixels() {
        let lb = letterbox_params(1280, 720, 640);
        // single class, three proposals; only the first clears the threshold
        let mut out = Array3::<f32>::zeros((1, 5, 3));
        out[[0, 0, 0]] = 320.0; // cx
        out[[0, 1, 0]] = 320.0; // cy
        out[[0, 2, 0]] = 100.0; // w
        out[[0, 3, 0]] = 60.0; // h
        out[[0, 4, 0]] = 0.9;
        out[[0, 4, 1]] = 0.1;
        out[[0, 4, 2]] = 0.2;

        let view = out.view().into_dyn();
        let dets = decode_detections(&view, &lb, 1280, 720, 0.25).unwrap();
        assert_eq!(dets.len(), 1);
        let d = dets[0];
        assert!((d.x1 - 540.0).abs() < 1e-3);
        assert!((d.y1 - 300.0).abs() < 1e-3);
        assert!((d.x2 - 740.0).abs() < 1e-3);
        assert!((d.y2 - 420.0).abs() < 1e-3);
        assert!((d.conf - 0.9).abs() < 1e-6);
        assert_eq!(d.class_id, 0);
    }

    #[test]
    fn decode_clamps_to_image_bounds() {
        let lb = letterbox_params(640, 640, 640);
        let mut out = Array3::<f32>::zeros((1, 5, 1));
        out[[0, 0, 0]] = 10.0;
        out[[0, 1, 0]] = 10.0;
        out[[0, 2, 0]] = 100.0; // spills past the left/top edge
        out[[0, 3, 0]] = 100.0;
        out[[0, 4, 0]] = 0.8;

        let view = out.view().into_dyn();
        let dets = decode_detections(&view, &lb, 640, 640, 0.25).unwrap();
        assert_eq!(dets[0].x1, 0.0);
        assert_eq!(dets[0].y1, 0.0);
    }

    #[test]
    fn decode_picks_best_class() {
        let lb = letterbox_params(640, 640, 640);
        let mut out = Array3::<f32>::zeros((1, 7, 1));
        out[[0, 0, 0]] = 320.0;
        out[[0, 1, 0]] = 320.0;
        out[[0, 2, 0]] = 50.0;
        out[[0, 3, 0]] = 50.0;
        out[[0, 4, 0]] = 0.3;
        out[[0, 5, 0]] = 0.7;
        out[[0, 6, 0]] = 0.1;

        let view = out.view().into_dyn();
        let dets = decode_detections(&view, &lb, 640, 640, 0.25).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_id, 1);
        assert!((dets[0].conf - 0.7).abs() < 1e-6);
    }

    #[test]
    fn decode_rejects_malformed_output() {
        let lb = letterbox_params(640, 640, 640);
        let out = Array3::<f32>::zeros((1, 3, 10));
        let view = out.view().into_dyn();
        let err = decode_detections(&view, &lb, 640, 640, 0.25).unwrap_err();
        assert!(matches!(err, DetectError::OutputShape(_)));
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = det(0.0, 0.0, 10.0, 10.0, 0.9, 0);
        let b = det(20.0, 20.0, 30.0, 30.0, 0.9, 0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn nms_keeps_highest_confidence_of_overlapping_same_class() {
        let boxes = vec![
            det(0.0, 0.0, 10.0, 10.0, 0.8, 0),
            det(1.0, 1.0, 11.0, 11.0, 0.9, 0),
            det(100.0, 100.0, 110.0, 110.0, 0.5, 0),
        ];
        let kept = nms(boxes, 0.45);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].conf - 0.9).abs() < 1e-6);
        assert!((kept[1].conf - 0.5).abs() < 1e-6);
    }

    #[test]
    fn nms_does_not_suppress_across_classes() {
        let boxes = vec![
            det(0.0, 0.0, 10.0, 10.0, 0.9, 0),
            det(0.0, 0.0, 10.0, 10.0, 0.8, 1),
        ];
        let kept = nms(boxes, 0.45);
        assert_eq!(kept.len(), 2);
    }
}
