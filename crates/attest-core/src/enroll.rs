use std::sync::Arc;

use thiserror::Error;

use crate::capability::{CapabilityError, FaceAnalyzer};
use crate::decision::RejectionReason;
use crate::proof::ProofImage;
use crate::store::{EmbeddingStore, IdentityRecord, StoreError};
use crate::types::{Embedding, Face};

/// Shots kept per identity; older ones are evicted first.
pub const MAX_SHOTS: usize = 5;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("face analysis failed: {0}")]
    Capability(#[from] CapabilityError),
    #[error("embedding store error: {0}")]
    Store(#[from] StoreError),
    #[error("embedding for '{username}' has {found} dimensions, stored shots have {expected}")]
    DimensionMismatch {
        username: String,
        expected: usize,
        found: usize,
    },
}

/// Result of enrolling one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollOutcome {
    /// The shot was stored; `shots` is the identity's shot count afterwards.
    Enrolled { shots: usize },
    Rejected(RejectionReason),
}

impl EnrollOutcome {
    pub fn ok(&self) -> bool {
        matches!(self, EnrollOutcome::Enrolled { .. })
    }

    pub fn message(&self) -> String {
        match self {
            EnrollOutcome::Enrolled { shots } => format!("User enrolled. shots={shots}"),
            EnrollOutcome::Rejected(reason) => reason.message().to_string(),
        }
    }
}

/// Turns enrollment images into a bounded shot history plus centroid.
///
/// Callers submit one image per call and drop byte-identical duplicates
/// beforehand; nothing here deduplicates.
pub struct EnrollmentAggregator {
    store: Arc<EmbeddingStore>,
    faces: Arc<dyn FaceAnalyzer>,
}

impl EnrollmentAggregator {
    pub fn new(store: Arc<EmbeddingStore>, faces: Arc<dyn FaceAnalyzer>) -> Self {
        Self { store, faces }
    }

    /// Add the most prominent face in `image` to `username`'s shots.
    pub fn enroll(&self, username: &str, image: &ProofImage) -> Result<EnrollOutcome, EnrollError> {
        let Some(rgb) = image.decoded() else {
            return Ok(EnrollOutcome::Rejected(RejectionReason::ImageUnreadable));
        };

        let faces = self.faces.detect_faces(rgb)?;
        let Some(face) = most_prominent(&faces) else {
            tracing::info!(user = username, "enroll: no face detected");
            return Ok(EnrollOutcome::Rejected(RejectionReason::NoFaceDetected));
        };
        tracing::debug!(
            user = username,
            detected = faces.len(),
            area = face.bbox.area(),
            confidence = face.bbox.confidence,
            "enroll: most prominent face selected"
        );

        let shot = face.embedding.normalized();
        let result = self.store.update(|snapshot| {
            let record = snapshot.identities.entry(username.to_string()).or_default();
            if let Some(expected) = record.dim() {
                if expected != shot.dim() {
                    return Err(EnrollError::DimensionMismatch {
                        username: username.to_string(),
                        expected,
                        found: shot.dim(),
                    });
                }
            }
            append_shot(record, shot);
            Ok(record.shots.len())
        });

        match result {
            Ok(shots) => {
                tracing::info!(user = username, shots, "enrolled shot");
                Ok(EnrollOutcome::Enrolled { shots })
            }
            Err(EnrollError::Store(StoreError::Unavailable { message, .. })) => {
                tracing::warn!(user = username, error = %message, "enroll: embedding store unavailable");
                Ok(EnrollOutcome::Rejected(RejectionReason::StoreUnavailable))
            }
            Err(err) => Err(err),
        }
    }
}

/// Largest bounding box wins; the earliest face wins a tie.
fn most_prominent(faces: &[Face]) -> Option<&Face> {
    faces.iter().fold(None, |best, face| match best {
        Some(b) if b.bbox.area() >= face.bbox.area() => Some(b),
        _ => Some(face),
    })
}

/// Append a unit-norm shot, evict down to [`MAX_SHOTS`], and recompute the centroid.
fn append_shot(record: &mut IdentityRecord, shot: Embedding) {
    record.shots.push(shot);
    if record.shots.len() > MAX_SHOTS {
        let excess = record.shots.len() - MAX_SHOTS;
        record.shots.drain(..excess);
    }
    record.centroid = Embedding::mean_normalized(&record.shots);
}
