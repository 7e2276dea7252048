use std::sync::Arc;
use std::time::Duration;

use attest_core::{
    DecisionRecord, DisabledLiveness, EmbeddingStore, EnrollError, EnrollOutcome,
    EnrollmentAggregator, FaceAnalyzer, LivenessScorer, MatchScorer, OrchestratorError,
    ProofImage, StoreError, StoreOptions, TaskDetector, VerificationOrchestrator,
    VerificationRequest,
};
use attest_vision::{
    OnnxFaceAnalyzer, OnnxLivenessScorer, YoloTaskDetector, ARCFACE_MODEL_FILE,
    LIVENESS_MODEL_FILE, SCRFD_MODEL_FILE, TASK_LABELS_FILE, TASK_MODEL_FILE,
};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinError;

use crate::audit::{AuditKind, AuditLog};
use crate::config::Config;
use crate::uploads::{self, Upload, UploadError};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0}")]
    InvalidInput(String),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error("enrollment failed: {0}")]
    Enroll(#[from] EnrollError),
    #[error("verification failed: {0}")]
    Verify(#[from] OrchestratorError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("audit copy failed: {0}")]
    Audit(#[source] std::io::Error),
    #[error("worker task aborted: {0}")]
    Join(#[from] JoinError),
    #[error("verification did not finish within {}s", .0.as_secs_f32())]
    TimedOut(Duration),
}

impl EngineError {
    /// Caller mistakes, as opposed to faults inside the daemon.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, EngineError::InvalidInput(_) | EngineError::Upload(_))
    }
}

/// Reply to a multi-shot enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrollReply {
    pub status: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserSummary {
    pub user: String,
    pub shots: usize,
}

/// Settings the engine needs beyond its components.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub embedding_threshold: f32,
    pub max_upload_bytes: usize,
    pub liveness_enabled: bool,
    /// Upper bound on one verification, face stage included.
    pub verify_timeout: Duration,
    pub audit: Option<AuditLog>,
}

/// Everything a D-Bus call needs, built once at startup.
pub struct Engine {
    store: Arc<EmbeddingStore>,
    enroller: Arc<EnrollmentAggregator>,
    orchestrator: VerificationOrchestrator,
    settings: EngineSettings,
}

impl Engine {
    /// Load every model named by `config`. Fails on the first missing or broken one.
    pub fn load(config: &Config) -> anyhow::Result<Self> {
        let store = Arc::new(EmbeddingStore::open(
            &config.db_path,
            StoreOptions {
                read_failure: config.store_read_failure,
                ..StoreOptions::default()
            },
        ));

        let analyzer = OnnxFaceAnalyzer::load(
            &config.model_path(SCRFD_MODEL_FILE),
            &config.model_path(ARCFACE_MODEL_FILE),
            config.detection_size,
        )?;
        let liveness: Arc<dyn LivenessScorer> = if config.liveness_enabled {
            Arc::new(OnnxLivenessScorer::load(
                &config.model_path(LIVENESS_MODEL_FILE),
                analyzer.detector(),
                config.liveness,
            )?)
        } else {
            tracing::warn!("liveness checking disabled; every proof is treated as live");
            Arc::new(DisabledLiveness)
        };
        let tasks = Arc::new(YoloTaskDetector::load(
            &config.model_path(TASK_MODEL_FILE),
            &config.model_path(TASK_LABELS_FILE),
            config.task,
        )?);

        Ok(Self::new(
            store,
            Arc::new(analyzer),
            liveness,
            tasks,
            EngineSettings {
                embedding_threshold: config.embedding_threshold,
                max_upload_bytes: config.max_upload_bytes,
                liveness_enabled: config.liveness_enabled,
                verify_timeout: config.verify_timeout,
                audit: config.audit_dir.as_ref().map(AuditLog::new),
            },
        ))
    }

    pub fn new(
        store: Arc<EmbeddingStore>,
        faces: Arc<dyn FaceAnalyzer>,
        liveness: Arc<dyn LivenessScorer>,
        tasks: Arc<dyn TaskDetector>,
        settings: EngineSettings,
    ) -> Self {
        let enroller = Arc::new(EnrollmentAggregator::new(Arc::clone(&store), Arc::clone(&faces)));
        let scorer = Arc::new(MatchScorer::new(
            Arc::clone(&store),
            faces,
            settings.embedding_threshold,
        ));
        Self {
            store,
            enroller,
            orchestrator: VerificationOrchestrator::new(scorer, liveness, tasks),
            settings,
        }
    }

    /// Enroll each unique image in order, stopping at the first rejection.
    pub async fn enroll(&self, username: &str, images: Vec<Vec<u8>>) -> Result<EnrollReply, EngineError> {
        let username = required("username", username)?;
        if images.is_empty() {
            return Err(EngineError::InvalidInput("at least one image is required".into()));
        }
        let submitted = images.len();
        let unique = uploads::validate_unique(images, self.settings.max_upload_bytes)?;
        let unique_count = unique.len();

        let enroller = Arc::clone(&self.enroller);
        let audit = self.settings.audit.clone();
        let user = username.clone();

        let (outcome, saved) = tokio::task::spawn_blocking(move || {
            archive(audit.as_ref(), AuditKind::Enroll, &user, &unique)?;
            let images: Vec<ProofImage> = unique.into_iter().map(|u| ProofImage::new(u.bytes)).collect();
            // `validate_unique` keeps the first of any repeats, so a non-empty batch stays non-empty.
            let (last, earlier) = images
                .split_last()
                .ok_or_else(|| EngineError::InvalidInput("at least one image is required".into()))?;
            for (saved, image) in earlier.iter().enumerate() {
                let outcome = enroller.enroll(&user, image)?;
                if !outcome.ok() {
                    return Ok::<_, EngineError>((outcome, saved));
                }
            }
            let outcome = enroller.enroll(&user, last)?;
            let saved = earlier.len() + usize::from(outcome.ok());
            Ok((outcome, saved))
        })
        .await??;

        tracing::info!(
            user = %username,
            submitted,
            unique = unique_count,
            saved,
            "enrollment finished"
        );
        Ok(EnrollReply {
            status: outcome.ok(),
            message: outcome.message(),
        })
    }

    pub async fn verify(&self, username: &str, task: &str, image: Vec<u8>) -> Result<DecisionRecord, EngineError> {
        let username = required("username", username)?;
        let task = required("task", task)?;
        let upload = uploads::validate(0, image, self.settings.max_upload_bytes)?;

        let audit = self.settings.audit.clone();
        let user = username.clone();
        let upload = tokio::task::spawn_blocking(move || {
            archive(audit.as_ref(), AuditKind::Proof, &user, std::slice::from_ref(&upload)).map(|()| upload)
        })
        .await??;

        let limit = self.settings.verify_timeout;
        let request = VerificationRequest {
            username,
            task,
            image: Arc::new(ProofImage::new(upload.bytes)),
        };
        match tokio::time::timeout(limit, self.orchestrator.verify(request)).await {
            Ok(record) => Ok(record?),
            Err(_) => {
                // Blocking stages already started keep running; their results are dropped.
                tracing::warn!(timeout_secs = limit.as_secs_f32(), "verification timed out");
                Err(EngineError::TimedOut(limit))
            }
        }
    }

    pub async fn list_users(&self) -> Result<Vec<UserSummary>, EngineError> {
        let store = Arc::clone(&self.store);
        let snapshot = tokio::task::spawn_blocking(move || store.load()).await??;
        Ok(snapshot
            .identities
            .iter()
            .map(|(user, record)| UserSummary {
                user: user.clone(),
                shots: record.shots.len(),
            })
            .collect())
    }

    pub async fn forget(&self, username: &str) -> Result<bool, EngineError> {
        let username = required("username", username)?;
        let store = Arc::clone(&self.store);
        let user = username.clone();
        let removed = tokio::task::spawn_blocking(move || store.remove(&user)).await??;
        tracing::info!(user = %username, removed, "forget requested");
        Ok(removed)
    }

    pub fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "store": self.store.path().display().to_string(),
            "embedding_threshold": self.settings.embedding_threshold,
            "liveness_enabled": self.settings.liveness_enabled,
            "verify_timeout_secs": self.settings.verify_timeout.as_secs_f32(),
            "audit_dir": self.settings.audit.as_ref().map(|a| a.root().display().to_string()),
        })
    }
}

/// Write audit copies of `uploads`. Blocking; call from a worker thread.
fn archive(audit: Option<&AuditLog>, kind: AuditKind, username: &str, uploads: &[Upload]) -> Result<(), EngineError> {
    let Some(audit) = audit else {
        return Ok(());
    };
    for upload in uploads {
        let path = audit.record(kind, username, upload).map_err(EngineError::Audit)?;
        tracing::debug!(path = %path.display(), "audit copy written");
    }
    Ok(())
}

fn required(field: &str, value: &str) -> Result<String, EngineError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(EngineError::InvalidInput(format!("{field} is required")))
    } else {
        Ok(trimmed.to_string())
    }
}
