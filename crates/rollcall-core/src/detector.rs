//! Face detection.
//!
//! [`Detector`] is the seam the frame pipeline and enrollment use; the
//! shipped implementation runs an SCRFD model through ONNX Runtime with
//! anchor-free 3-stride decoding and NMS post-processing.

use crate::types::FaceRegion;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds face boxes in a grayscale raster.
///
/// Regions are returned strongest first, in the coordinates of `image`.
pub trait Detector: Send {
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<FaceRegion>, DetectorError>;
}

/// A scored box in floating-point frame coordinates, before rounding.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn to_region(self, width: u32, height: u32) -> Option<FaceRegion> {
        let x1 = self.x1.max(0.0).round() as u32;
        let y1 = self.y1.max(0.0).round() as u32;
        let x2 = (self.x2.round().max(0.0) as u32).min(width);
        let y2 = (self.y2.round().max(0.0) as u32).min(height);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(FaceRegion::new(x1, y1, x2 - x1, y2 - y1))
    }
}

/// Scale and padding applied when letterboxing into the square model input.
struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    /// Per-stride output indices for strides [8, 16, 32], discovered by name
    /// at load time with a positional fallback.
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(path = model_path, outputs = ?output_names, "loaded SCRFD model");

        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires score and bbox outputs for 3 strides, got {} outputs",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            stride_indices,
        })
    }

    fn run(&mut self, image: &GrayImage) -> Result<Vec<Candidate>, DetectorError> {
        let (input, letterbox) = preprocess(image);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[pos];
            let (_, scores) = outputs[score_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("scores stride {stride}: {e}"))
            })?;
            let (_, bboxes) = outputs[bbox_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}"))
            })?;
            candidates.extend(decode_stride(scores, bboxes, stride, &letterbox));
        }
        Ok(candidates)
    }
}

impl Detector for ScrfdDetector {
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<FaceRegion>, DetectorError> {
        let candidates = self.run(image)?;
        Ok(nms(candidates, SCRFD_NMS_THRESHOLD)
            .into_iter()
            .filter_map(|c| c.to_region(image.width(), image.height()))
            .collect())
    }
}

/// Letterbox the frame into a normalized 1x3x640x640 tensor (gray replicated
/// across channels, padding at the mean so it normalizes to zero).
fn preprocess(image: &GrayImage) -> (Array4<f32>, Letterbox) {
    let size = SCRFD_INPUT_SIZE;
    let (w, h) = image.dimensions();
    let scale = (size as f32 / w.max(1) as f32).min(size as f32 / h.max(1) as f32);
    let new_w = ((w as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((h as f32 * scale).round() as u32).clamp(1, size);
    let letterbox = Letterbox {
        scale,
        pad_x: (size - new_w) / 2,
        pad_y: (size - new_h) / 2,
    };

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);
    let n = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, n, n));

    for (x, y, pixel) in resized.enumerate_pixels() {
        let normalized = (pixel.0[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
        let (tx, ty) = ((x + letterbox.pad_x) as usize, (y + letterbox.pad_y) as usize);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = normalized;
        }
    }

    (tensor, letterbox)
}

/// Map tensors to stride slots by name ("score_8", "bbox_16", ...), falling
/// back to the standard positional layout [0-2]=scores, [3-5]=bboxes.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?)))
        .collect();

    match named {
        Some(found) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [found[0], found[1], found[2]]
        }
        None => {
            tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

/// Decode candidates above the confidence threshold for one stride level,
/// mapped back from letterbox space to frame space.
fn decode_stride(scores: &[f32], bboxes: &[f32], stride: usize, letterbox: &Letterbox) -> Vec<Candidate> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;
    let unmap_x = |v: f32| (v - letterbox.pad_x as f32) / letterbox.scale;
    let unmap_y = |v: f32| (v - letterbox.pad_y as f32) / letterbox.scale;

    (0..num_anchors)
        .filter_map(|idx| {
            let score = scores.get(idx).copied()?;
            if score <= SCRFD_CONFIDENCE_THRESHOLD {
                return None;
            }
            let off = idx * 4;
            let d = bboxes.get(off..off + 4)?;
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % grid) as f32 * s;
            let ay = (cell / grid) as f32 * s;
            Some(Candidate {
                x1: unmap_x(ax - d[0] * s),
                y1: unmap_y(ay - d[1] * s),
                x2: unmap_x(ax + d[2] * s),
                y2: unmap_y(ay + d[3] * s),
                score,
            })
        })
        .collect()
}

/// Non-maximum suppression, strongest first.
fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    let mut keep: Vec<Candidate> = Vec::new();
    for c in candidates {
        if keep.iter().all(|k| iou(k, &c) <= iou_threshold) {
            keep.push(c);
        }
    }
    keep
}

fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let inter = Candidate {
        x1: a.x1.max(b.x1),
        y1: a.y1.max(b.y1),
        x2: a.x2.min(b.x2),
        y2: a.y2.min(b.y2),
        score: 0.0,
    }
    .area();
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(x: f32, y: f32, w: f32, h: f32, score: f32) -> Candidate {
        Candidate { x1: x, y1: y, x2: x + w, y2: y + h, score }
    }

    #[test]
    fn test_iou_partial() {
        let a = cand(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = cand(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
        assert!(iou(&a, &cand(20.0, 20.0, 5.0, 5.0, 1.0)).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_strongest() {
        let kept = nms(
            vec![
                cand(5.0, 5.0, 100.0, 100.0, 0.8),
                cand(0.0, 0.0, 100.0, 100.0, 0.9),
                cand(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.4,
        );
        assert_eq!(kept.len(), 2);
        assert!((kept[0].score - 0.9).abs() < 1e-6);
        assert!((kept[1].score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_candidate_to_region_clips() {
        let r = cand(-10.0, 5.0, 50.0, 400.0, 0.9).to_region(320, 240).unwrap();
        assert_eq!(r, FaceRegion::new(0, 5, 40, 235));
        assert!(cand(400.0, 0.0, 10.0, 10.0, 0.9).to_region(320, 240).is_none());
    }

    #[test]
    fn test_preprocess_letterbox() {
        let img = GrayImage::from_pixel(320, 240, image::Luma([128]));
        let (tensor, lb) = preprocess(&img);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert_eq!((lb.pad_x, lb.pad_y), (0, 80));
        // Padding rows stay at zero, image rows carry the normalized pixel.
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let expected = (128.0 - SCRFD_MEAN) / SCRFD_STD;
        assert!((tensor[[0, 2, 100, 100]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_decode_stride_maps_back() {
        let lb = Letterbox { scale: 2.0, pad_x: 0, pad_y: 80 };
        let grid = 640 / 32;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let mut bboxes = vec![0.0f32; anchors * 4];
        // Anchor in cell (x=5, y=5): centre (160, 160) in letterbox space.
        let idx = (5 * grid + 5) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.9;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let found = decode_stride(&scores, &bboxes, 32, &lb);
        assert_eq!(found.len(), 1);
        let c = found[0];
        assert!((c.x1 - 64.0).abs() < 1e-4);
        assert!((c.y1 - 24.0).abs() < 1e-4);
        assert!((c.x2 - 96.0).abs() < 1e-4);
        assert!((c.y2 - 56.0).abs() < 1e-4);
    }

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = [
            "bbox_8", "score_8", "kps_8", "bbox_16", "score_16", "kps_16", "bbox_32",
            "score_32", "kps_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(discover_output_indices(&names), [(1, 0), (4, 3), (7, 6)]);
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3), (1, 4), (2, 5)]);
    }
}
