use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

/// Every expected way a request can fail. These are values handed back to
/// the caller, never errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectionReason {
    ImageUnreadable,
    NoFaceDetected,
    UnknownIdentity,
    FaceMismatch,
    LivenessFailed,
    TaskNotVerified,
    StoreUnavailable,
}

impl RejectionReason {
    pub fn message(self) -> &'static str {
        match self {
            RejectionReason::ImageUnreadable => "Could not read image",
            RejectionReason::NoFaceDetected => "No face detected",
            RejectionReason::UnknownIdentity => "Unknown identity",
            RejectionReason::FaceMismatch => "Face mismatch",
            RejectionReason::LivenessFailed => "Liveness failed",
            RejectionReason::TaskNotVerified => "Task not verified",
            RejectionReason::StoreUnavailable => "Embedding store unavailable",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Approved,
    Rejected,
}

/// Final answer for one verification request. Never persisted by the core.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionRecord {
    pub outcome: Outcome,
    pub reason: Option<RejectionReason>,
    pub username: String,
    pub task: String,
    /// Best similarity from the face stage (0.0 when no score was computed).
    pub similarity: f32,
    /// `None` when the request never reached the liveness stage.
    pub liveness_score: Option<f32>,
    pub timestamp: DateTime<Utc>,
}

impl DecisionRecord {
    pub fn approved(username: &str, task: &str, similarity: f32, liveness_score: f32) -> Self {
        Self {
            outcome: Outcome::Approved,
            reason: None,
            username: username.to_string(),
            task: task.to_string(),
            similarity,
            liveness_score: Some(liveness_score),
            timestamp: Utc::now(),
        }
    }

    pub fn rejected(
        username: &str,
        task: &str,
        reason: RejectionReason,
        similarity: f32,
        liveness_score: Option<f32>,
    ) -> Self {
        Self {
            outcome: Outcome::Rejected,
            reason: Some(reason),
            username: username.to_string(),
            task: task.to_string(),
            similarity,
            liveness_score,
            timestamp: Utc::now(),
        }
    }

    pub fn is_approved(&self) -> bool {
        self.outcome == Outcome::Approved
    }
}

#[derive(Serialize)]
struct DecisionWire<'a> {
    status: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    task: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    similarity: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    liveness_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
}

/// Approved records carry the full claim; rejections carry only the reason
/// and the score of the stage that rejected.
impl Serialize for DecisionRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut wire = DecisionWire {
            status: self.outcome,
            reason: self.reason.map(RejectionReason::message),
            user: None,
            task: None,
            similarity: None,
            liveness_score: None,
            timestamp: None,
        };
        match self.reason {
            None => {
                wire.user = Some(&self.username);
                wire.task = Some(&self.task);
                wire.similarity = Some(self.similarity);
                wire.liveness_score = self.liveness_score;
                wire.timestamp = Some(self.timestamp.to_rfc3339());
            }
            Some(RejectionReason::LivenessFailed) => wire.liveness_score = self.liveness_score,
            Some(RejectionReason::TaskNotVerified) => {}
            Some(_) => wire.similarity = Some(self.similarity),
        }
        wire.serialize(serializer)
    }
}
