//! MiniFASNet anti-spoofing via ONNX Runtime.
//!
//! The largest detected face is cropped (or the centre square when no face
//! is found), resized to the model's square input, scaled to `[0, 1]` and
//! classified. The softmax probability of the "real" class is the score.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use attest_core::{BoundingBox, CapabilityError, Liveness, LivenessScorer};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ort::session::Session;
use ort::value::TensorRef;
use thiserror::Error;

use crate::detector::ScrfdDetector;
use crate::tensor;

pub const DEFAULT_LIVENESS_THRESHOLD: f32 = 0.80;
pub const DEFAULT_LIVENESS_INPUT_SIZE: u32 = 80;
pub const DEFAULT_REAL_CLASS: usize = 2;

#[derive(Error, Debug)]
pub enum LivenessError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<LivenessError> for CapabilityError {
    fn from(err: LivenessError) -> Self {
        CapabilityError::Backend(format!("liveness: {err}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivenessConfig {
    pub input_size: u32,
    pub threshold: f32,
    /// Output class holding the "real face" probability.
    pub real_class: usize,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_LIVENESS_INPUT_SIZE,
            threshold: DEFAULT_LIVENESS_THRESHOLD,
            real_class: DEFAULT_REAL_CLASS,
        }
    }
}

pub struct OnnxLivenessScorer {
    session: Mutex<Session>,
    locator: Arc<ScrfdDetector>,
    config: LivenessConfig,
}

impl OnnxLivenessScorer {
    /// `locator` finds the face to crop; usually the detector shared with the face analyzer.
    pub fn load(
        model_path: &Path,
        locator: Arc<ScrfdDetector>,
        config: LivenessConfig,
    ) -> Result<Self, LivenessError> {
        if !model_path.exists() {
            return Err(LivenessError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            input_size = config.input_size,
            threshold = config.threshold,
            "loaded liveness model"
        );

        Ok(Self {
            session: Mutex::new(session),
            locator,
            config,
        })
    }

    fn classify(&self, crop: &RgbImage) -> Result<Vec<f32>, LivenessError> {
        let n = self.config.input_size;
        let resized = imageops::resize(crop, n, n, FilterType::Triangle);
        let input = tensor::to_nchw(&resized, 0.0, 255.0);

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, logits) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| LivenessError::InferenceFailed(format!("logits: {e}")))?;
        if logits.is_empty() {
            return Err(LivenessError::InferenceFailed("empty logits".into()));
        }
        Ok(softmax(logits))
    }
}

impl LivenessScorer for OnnxLivenessScorer {
    fn score_liveness(&self, image: &RgbImage) -> Result<Liveness, CapabilityError> {
        let largest = self
            .locator
            .detect(image)?
            .into_iter()
            .map(|d| d.bbox)
            .reduce(|best, b| if b.area() > best.area() { b } else { best });

        let crop = crop_subject(image, largest.as_ref());
        let probs = self.classify(&crop)?;
        let score = real_probability(&probs, self.config.real_class);
        tracing::debug!(score, face_found = largest.is_some(), "liveness scored");

        Ok(Liveness {
            is_live: score >= self.config.threshold,
            score,
        })
    }
}

/// Crop to `face` clamped to the image, or to the centre square when there
/// is no face or the clamped box is empty.
fn crop_subject(image: &RgbImage, face: Option<&BoundingBox>) -> RgbImage {
    let (w, h) = image.dimensions();
    if let Some(b) = face {
        let x1 = (b.x.max(0.0) as u32).min(w);
        let y1 = (b.y.max(0.0) as u32).min(h);
        let x2 = ((b.x + b.width).max(0.0) as u32).min(w);
        let y2 = ((b.y + b.height).max(0.0) as u32).min(h);
        if x2 > x1 && y2 > y1 {
            return imageops::crop_imm(image, x1, y1, x2 - x1, y2 - y1).to_image();
        }
    }
    let side = w.min(h);
    imageops::crop_imm(image, (w - side) / 2, (h - side) / 2, side, side).to_image()
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Probability at `real_class`, or at the most likely class when the model
/// has fewer outputs than expected.
fn real_probability(probs: &[f32], real_class: usize) -> f32 {
    match probs.get(real_class) {
        Some(&p) => p,
        None => probs.iter().copied().fold(0.0, f32::max),
    }
}
