use std::path::Path;
use std::sync::Arc;

use attest_core::{CapabilityError, Face, FaceAnalyzer};
use image::RgbImage;

use crate::detector::{DetectorError, ScrfdDetector};
use crate::recognizer::{ArcFaceRecognizer, RecognizerError};

/// SCRFD detection followed by ArcFace embedding of every detected face.
pub struct OnnxFaceAnalyzer {
    detector: Arc<ScrfdDetector>,
    recognizer: ArcFaceRecognizer,
}

#[derive(Debug, thiserror::Error)]
pub enum AnalyzerLoadError {
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Recognizer(#[from] RecognizerError),
}

impl OnnxFaceAnalyzer {
    /// The detector is shared so the liveness scorer can reuse it for cropping.
    pub fn new(detector: Arc<ScrfdDetector>, recognizer: ArcFaceRecognizer) -> Self {
        Self { detector, recognizer }
    }

    pub fn load(
        scrfd_path: &Path,
        arcface_path: &Path,
        detection_size: u32,
    ) -> Result<Self, AnalyzerLoadError> {
        let detector = Arc::new(ScrfdDetector::load(scrfd_path, detection_size)?);
        let recognizer = ArcFaceRecognizer::load(arcface_path)?;
        Ok(Self::new(detector, recognizer))
    }

    pub fn detector(&self) -> Arc<ScrfdDetector> {
        Arc::clone(&self.detector)
    }
}

impl FaceAnalyzer for OnnxFaceAnalyzer {
    fn detect_faces(&self, image: &RgbImage) -> Result<Vec<Face>, CapabilityError> {
        let detections = self.detector.detect(image)?;
        detections
            .into_iter()
            .map(|det| {
                let embedding = self.recognizer.embed(image, &det.landmarks)?;
                Ok(Face {
                    bbox: det.bbox,
                    embedding,
                })
            })
            .collect()
    }
}
