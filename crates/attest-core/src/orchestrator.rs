//! Three-signal proof verification.
//!
//! Order is fixed: the face stage runs alone and a failure there is final,
//! so liveness and task detection never run for the wrong person. Only after
//! a match are liveness and task detection started, as two blocking tasks
//! joined before fusion. Fusion reports liveness before task regardless of
//! which finished first.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::task::JoinError;

use crate::capability::{CapabilityError, Liveness, LivenessScorer, TaskDetector};
use crate::decision::{DecisionRecord, RejectionReason};
use crate::matcher::{MatchError, MatchScorer};
use crate::proof::ProofImage;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("face stage failed: {0}")]
    Match(#[from] MatchError),
    #[error("capability failed: {0}")]
    Capability(#[from] CapabilityError),
    #[error("verification task aborted: {0}")]
    Join(#[from] JoinError),
}

/// One claimed identity + task + proof image.
#[derive(Debug, Clone)]
pub struct VerificationRequest {
    pub username: String,
    pub task: String,
    pub image: Arc<ProofImage>,
}

/// Sequences face match, liveness and task detection for one proof.
pub struct VerificationOrchestrator {
    scorer: Arc<MatchScorer>,
    liveness: Arc<dyn LivenessScorer>,
    tasks: Arc<dyn TaskDetector>,
}

impl VerificationOrchestrator {
    pub fn new(
        scorer: Arc<MatchScorer>,
        liveness: Arc<dyn LivenessScorer>,
        tasks: Arc<dyn TaskDetector>,
    ) -> Self {
        Self {
            scorer,
            liveness,
            tasks,
        }
    }

    /// Run every stage for `request` and return the single decision.
    ///
    /// There is no retry and no timeout here; the caller bounds the request.
    pub async fn verify(&self, request: VerificationRequest) -> Result<DecisionRecord, OrchestratorError> {
        let started = Instant::now();

        let face = {
            let scorer = Arc::clone(&self.scorer);
            let username = request.username.clone();
            let image = Arc::clone(&request.image);
            tokio::task::spawn_blocking(move || scorer.verify(&username, &image)).await??
        };
        let face_secs = started.elapsed().as_secs_f32();

        if !face.matched {
            let reason = face.reason.unwrap_or(RejectionReason::FaceMismatch);
            tracing::info!(
                user = %request.username,
                %reason,
                sim = face.score,
                face_secs,
                "verify: rejected at face stage"
            );
            return Ok(DecisionRecord::rejected(
                &request.username,
                &request.task,
                reason,
                face.score,
                None,
            ));
        }

        let (liveness, task_ok) = self.liveness_and_task(&request).await?;

        tracing::info!(
            user = %request.username,
            task = %request.task,
            face_secs,
            parallel_secs = started.elapsed().as_secs_f32() - face_secs,
            total_secs = started.elapsed().as_secs_f32(),
            sim = face.score,
            live = liveness.score,
            task_ok,
            "verify: all stages complete"
        );

        Ok(fuse(&request.username, &request.task, face.score, liveness, task_ok))
    }

    /// Both capabilities run concurrently; both results are awaited before returning.
    async fn liveness_and_task(
        &self,
        request: &VerificationRequest,
    ) -> Result<(Liveness, bool), OrchestratorError> {
        let liveness = {
            let scorer = Arc::clone(&self.liveness);
            let image = Arc::clone(&request.image);
            tokio::task::spawn_blocking(move || match image.decoded() {
                Some(rgb) => scorer.score_liveness(rgb),
                None => Ok(Liveness::FAILED),
            })
        };
        let task = {
            let detector = Arc::clone(&self.tasks);
            let image = Arc::clone(&request.image);
            let claimed = request.task.clone();
            tokio::task::spawn_blocking(move || match image.decoded() {
                Some(rgb) => detector.detect_task(rgb, &claimed),
                None => Ok(false),
            })
        };

        let (liveness, task) = tokio::join!(liveness, task);
        Ok((liveness??, task??))
    }
}

/// Combine the post-match signals. Liveness failure outranks task failure.
fn fuse(username: &str, task: &str, similarity: f32, liveness: Liveness, task_ok: bool) -> DecisionRecord {
    if !liveness.is_live {
        DecisionRecord::rejected(
            username,
            task,
            RejectionReason::LivenessFailed,
            similarity,
            Some(liveness.score),
        )
    } else if !task_ok {
        DecisionRecord::rejected(
            username,
            task,
            RejectionReason::TaskNotVerified,
            similarity,
            Some(liveness.score),
        )
    } else {
        DecisionRecord::approved(username, task, similarity, liveness.score)
    }
}
