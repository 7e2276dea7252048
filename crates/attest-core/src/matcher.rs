use std::sync::Arc;

use thiserror::Error;

use crate::capability::{CapabilityError, FaceAnalyzer};
use crate::decision::RejectionReason;
use crate::proof::ProofImage;
use crate::store::{EmbeddingStore, IdentityRecord, StoreError};
use crate::types::Embedding;

/// Default cosine similarity needed for a positive match.
pub const DEFAULT_EMBEDDING_THRESHOLD: f32 = 0.55;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("face analysis failed: {0}")]
    Capability(#[from] CapabilityError),
    #[error("embedding store error: {0}")]
    Store(#[from] StoreError),
    #[error("probe embedding has {found} dimensions, '{username}' is enrolled with {expected}")]
    DimensionMismatch {
        username: String,
        expected: usize,
        found: usize,
    },
}

/// Result of comparing a probe image against one identity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchOutcome {
    pub matched: bool,
    /// Best cosine similarity in [-1, 1]; 0.0 when nothing was compared.
    pub score: f32,
    /// Why the face stage failed; `None` when matched.
    pub reason: Option<RejectionReason>,
}

impl MatchOutcome {
    fn rejected(reason: RejectionReason) -> Self {
        Self {
            matched: false,
            score: 0.0,
            reason: Some(reason),
        }
    }
}

/// Scores a probe image against a stored identity.
pub struct MatchScorer {
    store: Arc<EmbeddingStore>,
    faces: Arc<dyn FaceAnalyzer>,
    threshold: f32,
}

impl MatchScorer {
    pub fn new(store: Arc<EmbeddingStore>, faces: Arc<dyn FaceAnalyzer>, threshold: f32) -> Self {
        Self {
            store,
            faces,
            threshold,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Does the best face in `probe` belong to `username`?
    ///
    /// Unknown identities and unusable images come back as a non-match with
    /// score 0.0 and the matching [`RejectionReason`].
    pub fn verify(&self, username: &str, probe: &ProofImage) -> Result<MatchOutcome, MatchError> {
        let mut snapshot = match self.store.load() {
            Ok(snapshot) => snapshot,
            Err(StoreError::Unavailable { message, .. }) => {
                tracing::warn!(user = username, error = %message, "verify: embedding store unavailable");
                return Ok(MatchOutcome::rejected(RejectionReason::StoreUnavailable));
            }
            Err(err) => return Err(err.into()),
        };
        let Some(record) = snapshot
            .identities
            .remove(username)
            .filter(|r| !r.is_empty())
        else {
            return Ok(MatchOutcome::rejected(RejectionReason::UnknownIdentity));
        };

        let Some(rgb) = probe.decoded() else {
            return Ok(MatchOutcome::rejected(RejectionReason::ImageUnreadable));
        };
        let faces = self.faces.detect_faces(rgb)?;
        if faces.is_empty() {
            return Ok(MatchOutcome::rejected(RejectionReason::NoFaceDetected));
        }

        let expected = record.dim().unwrap_or_default();
        let candidates: Vec<Embedding> = faces.iter().map(|f| f.embedding.normalized()).collect();
        if let Some(bad) = candidates.iter().find(|c| c.dim() != expected) {
            return Err(MatchError::DimensionMismatch {
                username: username.to_string(),
                expected,
                found: bad.dim(),
            });
        }

        let Some(query) = select_query(&candidates, record.centroid.as_ref()) else {
            return Ok(MatchOutcome::rejected(RejectionReason::NoFaceDetected));
        };
        let score = reference_score(query, &record);
        let matched = score >= self.threshold;

        tracing::debug!(
            user = username,
            faces = candidates.len(),
            shots = record.shots.len(),
            score,
            threshold = self.threshold,
            matched,
            "verify: face scored"
        );

        Ok(MatchOutcome {
            matched,
            score,
            reason: (!matched).then_some(RejectionReason::FaceMismatch),
        })
    }
}

/// Pick the probe face closest to the claimed identity's centroid.
///
/// Bystanders in a proof photo must not shadow the claimant, so this is
/// best-match rather than largest-box. Without a centroid the first face is
/// used. Ties keep the earliest face.
fn select_query<'a>(candidates: &'a [Embedding], centroid: Option<&Embedding>) -> Option<&'a Embedding> {
    let first = candidates.first()?;
    let Some(centroid) = centroid else {
        return Some(first);
    };

    let mut best = first;
    let mut best_sim = first.dot(centroid);
    for candidate in &candidates[1..] {
        let sim = candidate.dot(centroid);
        if sim > best_sim {
            best_sim = sim;
            best = candidate;
        }
    }
    Some(best)
}

/// Maximum similarity between `query` and the centroid or any single shot.
fn reference_score(query: &Embedding, record: &IdentityRecord) -> f32 {
    record
        .centroid
        .iter()
        .chain(record.shots.iter())
        .map(|reference| query.dot(reference))
        .fold(f32::NEG_INFINITY, f32::max)
}
