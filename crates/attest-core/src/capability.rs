//! Contracts for the three inference capabilities consumed by the core.
//!
//! Implementations are stateful model objects created once at startup and
//! shared across worker threads, so every method takes `&self`. An `Err`
//! from any of them is a fault (backend crash, malformed output), never an
//! expected verification outcome.

use image::RgbImage;
use thiserror::Error;

use crate::types::Face;

#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("inference backend failed: {0}")]
    Backend(String),
    #[error("malformed capability output: {0}")]
    Malformed(String),
}

/// Face detection plus embedding extraction.
pub trait FaceAnalyzer: Send + Sync {
    /// Every face in the image, in detector order. May be empty.
    fn detect_faces(&self, image: &RgbImage) -> Result<Vec<Face>, CapabilityError>;
}

/// Liveness verdict for one image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Liveness {
    pub is_live: bool,
    /// Probability of a live subject, in [0, 1].
    pub score: f32,
}

impl Liveness {
    pub const FAILED: Liveness = Liveness { is_live: false, score: 0.0 };
    pub const ASSUMED_LIVE: Liveness = Liveness { is_live: true, score: 1.0 };
}

pub trait LivenessScorer: Send + Sync {
    fn score_liveness(&self, image: &RgbImage) -> Result<Liveness, CapabilityError>;
}

/// Checks whether an image depicts the claimed task.
pub trait TaskDetector: Send + Sync {
    fn detect_task(&self, image: &RgbImage, task: &str) -> Result<bool, CapabilityError>;
}

/// Liveness scorer used when liveness checking is switched off.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledLiveness;

impl LivenessScorer for DisabledLiveness {
    fn score_liveness(&self, _image: &RgbImage) -> Result<Liveness, CapabilityError> {
        Ok(Liveness::ASSUMED_LIVE)
    }
}
