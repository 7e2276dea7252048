//! attest-core: identity verification decision engine.
//!
//! Fuses three signals from one proof photo: does the face match an enrolled
//! identity, is it live, and does the image show the claimed task. The
//! inference capabilities are traits; ONNX implementations live in
//! `attest-vision`.

pub mod capability;
pub mod decision;
pub mod enroll;
pub mod matcher;
pub mod orchestrator;
pub mod proof;
pub mod store;
pub mod types;

pub use capability::{
    CapabilityError, DisabledLiveness, FaceAnalyzer, Liveness, LivenessScorer, TaskDetector,
};
pub use decision::{DecisionRecord, Outcome, RejectionReason};
pub use enroll::{EnrollError, EnrollOutcome, EnrollmentAggregator, MAX_SHOTS};
pub use matcher::{MatchError, MatchOutcome, MatchScorer, DEFAULT_EMBEDDING_THRESHOLD};
pub use orchestrator::{OrchestratorError, VerificationOrchestrator, VerificationRequest};
pub use proof::ProofImage;
pub use store::{
    EmbeddingStore, IdentityRecord, ReadFailurePolicy, StoreError, StoreOptions, StoreSnapshot,
};
pub use types::{BoundingBox, Embedding, Face, NORM_EPSILON};
