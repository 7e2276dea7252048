//! SCRFD face detector via ONNX Runtime.
//!
//! Three-stride anchor decoding over a letterboxed RGB canvas, followed by
//! greedy non-maximum suppression. Boxes and landmarks are reported in
//! source-image pixels.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use attest_core::{BoundingBox, CapabilityError};
use image::RgbImage;
use ort::session::Session;
use ort::value::TensorRef;
use thiserror::Error;

use crate::tensor::{self, Letterbox};

pub const DEFAULT_DETECTION_SIZE: u32 = 416;

const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_SCORE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_IOU: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
/// Grey that normalizes to roughly zero.
const PAD_FILL: u8 = 128;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<DetectorError> for CapabilityError {
    fn from(err: DetectorError) -> Self {
        CapabilityError::Backend(format!("face detector: {err}"))
    }
}

/// A detected face with its five landmarks: eyes, nose tip, mouth corners.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub landmarks: [(f32, f32); 5],
}

/// Output tensor positions for one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeadIndices {
    score: usize,
    bbox: usize,
    kps: usize,
}

pub struct ScrfdDetector {
    session: Mutex<Session>,
    input_size: u32,
    heads: [HeadIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD model, running it on a square canvas of `input_size` pixels.
    pub fn load(model_path: &Path, input_size: u32) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }
        if input_size == 0 || input_size as usize % SCRFD_STRIDES[2] != 0 {
            return Err(DetectorError::InferenceFailed(format!(
                "detection size {input_size} must be a positive multiple of {}",
                SCRFD_STRIDES[2]
            )));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps per stride), model has {}",
                output_names.len()
            )));
        }
        let heads = resolve_heads(&output_names);
        tracing::info!(
            path = %model_path.display(),
            input_size,
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_size,
            heads,
        })
    }

    /// Faces sorted by descending confidence.
    pub fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        let (canvas, letterbox) = tensor::letterbox(image, self.input_size, PAD_FILL);
        let input = tensor::to_nchw(&canvas, SCRFD_MEAN, SCRFD_STD);

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut detections = Vec::new();
        for (head, &stride) in self.heads.iter().zip(SCRFD_STRIDES.iter()) {
            let (_, scores) = outputs[head.score]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[head.bbox]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("boxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[head.kps]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("kps stride {stride}: {e}")))?;

            detections.extend(decode_head(
                scores,
                boxes,
                kps,
                stride,
                self.input_size as usize,
                &letterbox,
            ));
        }

        let kept = suppress_overlaps(detections, SCRFD_NMS_IOU);
        tracing::debug!(faces = kept.len(), "SCRFD detection");
        Ok(kept)
    }
}

/// Map `score_8`/`bbox_8`/`kps_8`-style names to positions, else assume the
/// usual export order: three score heads, three box heads, three landmark heads.
fn resolve_heads(names: &[String]) -> [HeadIndices; 3] {
    let position = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };
    let named: Option<Vec<HeadIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some(HeadIndices {
                score: position("score", stride)?,
                bbox: position("bbox", stride)?,
                kps: position("kps", stride)?,
            })
        })
        .collect();

    match named {
        Some(heads) => [heads[0], heads[1], heads[2]],
        None => std::array::from_fn(|i| HeadIndices {
            score: i,
            bbox: i + 3,
            kps: i + 6,
        }),
    }
}

fn decode_head(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &Letterbox,
) -> Vec<Detection> {
    let cells_per_row = input_size / stride;
    let s = stride as f32;

    scores
        .iter()
        .enumerate()
        .filter(|(_, score)| **score > SCRFD_SCORE_THRESHOLD)
        .filter_map(|(idx, &score)| {
            let cell = idx / ANCHORS_PER_CELL;
            let ax = ((cell % cells_per_row) * stride) as f32;
            let ay = ((cell / cells_per_row) * stride) as f32;

            let d = boxes.get(idx * 4..idx * 4 + 4)?;
            let (x1, y1) = letterbox.to_source(ax - d[0] * s, ay - d[1] * s);
            let (x2, y2) = letterbox.to_source(ax + d[2] * s, ay + d[3] * s);

            let k = kps.get(idx * 10..idx * 10 + 10)?;
            let landmarks =
                std::array::from_fn(|i| letterbox.to_source(ax + k[2 * i] * s, ay + k[2 * i + 1] * s));

            Some(Detection {
                bbox: BoundingBox {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                    confidence: score,
                },
                landmarks,
            })
        })
        .collect()
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let ix = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let iy = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = ix * iy;
    let union = a.area() + b.area() - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Greedy NMS; the result is ordered by descending confidence.
fn suppress_overlaps(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.bbox.confidence.total_cmp(&a.bbox.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        if kept.iter().all(|k| iou(&k.bbox, &det.bbox) <= iou_threshold) {
            kept.push(det);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32, side: f32, confidence: f32) -> Detection {
        Detection {
            bbox: BoundingBox {
                x,
                y,
                width: side,
                height: side,
                confidence,
            },
            landmarks: [(0.0, 0.0); 5],
        }
    }

    const IDENTITY: Letterbox = Letterbox {
        scale: 1.0,
        pad_x: 0.0,
        pad_y: 0.0,
    };

    #[test]
    fn test_resolve_heads_by_name() {
        let names: Vec<String> = [
            "kps_8", "kps_16", "kps_32", "bbox_8", "bbox_16", "bbox_32", "score_8", "score_16",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let heads = resolve_heads(&names);
        assert_eq!(heads[0], HeadIndices { score: 6, bbox: 3, kps: 0 });
        assert_eq!(heads[2], HeadIndices { score: 8, bbox: 5, kps: 2 });
    }

    #[test]
    fn test_resolve_heads_positional_fallback() {
        let names: Vec<String> = (428..437).map(|n| n.to_string()).collect();
        let heads = resolve_heads(&names);
        assert_eq!(heads[1], HeadIndices { score: 1, bbox: 4, kps: 7 });
    }

    #[test]
    fn test_decode_head_anchor_geometry() {
        // 32px canvas at stride 8: 4×4 cells, 2 anchors each.
        let mut scores = vec![0.0f32; 32];
        let mut boxes = vec![0.0f32; 32 * 4];
        let kps = vec![0.0f32; 32 * 10];
        // Second anchor of cell (col 1, row 2).
        let idx = (2 * 4 + 1) * 2 + 1;
        scores[idx] = 0.9;
        boxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 2.0]);

        let dets = decode_head(&scores, &boxes, &kps, 8, 32, &IDENTITY);
        assert_eq!(dets.len(), 1);
        let b = dets[0].bbox;
        assert_eq!((b.x, b.y, b.width, b.height), (0.0, 8.0, 16.0, 24.0));
        assert_eq!(dets[0].landmarks[0], (8.0, 16.0));
    }

    #[test]
    fn test_decode_head_skips_low_scores() {
        let scores = vec![0.5f32; 8];
        let dets = decode_head(&scores, &[0.0; 32], &[0.0; 80], 16, 32, &IDENTITY);
        assert!(dets.is_empty());
    }

    #[test]
    fn test_suppress_overlaps_keeps_best_of_cluster() {
        let dets = vec![
            det(0.0, 0.0, 10.0, 0.7),
            det(1.0, 1.0, 10.0, 0.9),
            det(50.0, 50.0, 10.0, 0.8),
        ];
        let kept = suppress_overlaps(dets, SCRFD_NMS_IOU);
        let confidences: Vec<f32> = kept.iter().map(|d| d.bbox.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.8]);
    }

    #[test]
    fn test_iou_disjoint_and_identical() {
        let a = det(0.0, 0.0, 10.0, 1.0).bbox;
        let b = det(20.0, 20.0, 10.0, 1.0).bbox;
        assert_eq!(iou(&a, &b), 0.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_load_missing_model() {
        let err = ScrfdDetector::load(Path::new("/nonexistent/det.onnx"), 416)
            .err()
            .unwrap();
        assert!(matches!(err, DetectorError::ModelNotFound(_)));
    }
}
