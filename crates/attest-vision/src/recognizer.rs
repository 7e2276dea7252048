//! ArcFace recognizer via ONNX Runtime.
//!
//! Embeds 112×112 aligned crops with the w600k_r50 model. Embeddings are
//! returned raw; the core normalizes before storing or comparing.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use attest_core::{CapabilityError, Embedding};
use image::RgbImage;
use ort::session::Session;
use ort::value::TensorRef;
use thiserror::Error;

use crate::alignment;
use crate::tensor;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
pub const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("expected {expected}-dim embedding, got {found}")]
    UnexpectedDimension { expected: usize, found: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<RecognizerError> for CapabilityError {
    fn from(err: RecognizerError) -> Self {
        match err {
            RecognizerError::UnexpectedDimension { .. } => {
                CapabilityError::Malformed(format!("face recognizer: {err}"))
            }
            other => CapabilityError::Backend(format!("face recognizer: {other}")),
        }
    }
}

pub struct ArcFaceRecognizer {
    session: Mutex<Session>,
}

impl ArcFaceRecognizer {
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self {
            session: Mutex::new(session),
        })
    }

    /// Align the face at `landmarks` and embed it.
    pub fn embed(
        &self,
        image: &RgbImage,
        landmarks: &[(f32, f32); 5],
    ) -> Result<Embedding, RecognizerError> {
        let aligned = alignment::align_face(image, landmarks);
        let input = tensor::to_nchw(&aligned, ARCFACE_MEAN, ARCFACE_STD);

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        check_dimension(raw.len())?;
        Ok(Embedding::new(raw.to_vec()))
    }
}

fn check_dimension(found: usize) -> Result<(), RecognizerError> {
    if found == ARCFACE_EMBEDDING_DIM {
        Ok(())
    } else {
        Err(RecognizerError::UnexpectedDimension {
            expected: ARCFACE_EMBEDDING_DIM,
            found,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_check_maps_to_malformed() {
        assert!(check_dimension(512).is_ok());
        let err: CapabilityError = check_dimension(128).unwrap_err().into();
        assert!(matches!(err, CapabilityError::Malformed(ref m) if m.contains("128")));
    }

    #[test]
    fn test_load_missing_model() {
        let err = ArcFaceRecognizer::load(Path::new("/nonexistent/w600k_r50.onnx"))
            .err()
            .unwrap();
        assert!(matches!(err, RecognizerError::ModelNotFound(_)));
        assert!(matches!(CapabilityError::from(err), CapabilityError::Backend(_)));
    }
}
