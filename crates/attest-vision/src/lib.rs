//! attest-vision: ONNX Runtime backends for the attest capabilities.
//!
//! SCRFD detects faces and landmarks, ArcFace embeds aligned crops,
//! MiniFASNet scores liveness, and a YOLO export detects task objects.
//! Each backend owns its sessions and is safe to share across threads.

pub mod alignment;
pub mod analyzer;
pub mod detector;
pub mod liveness;
pub mod recognizer;
pub mod task;
mod tensor;

pub use analyzer::{AnalyzerLoadError, OnnxFaceAnalyzer};
pub use detector::{Detection, DetectorError, ScrfdDetector};
pub use liveness::{LivenessConfig, LivenessError, OnnxLivenessScorer};
pub use recognizer::{ArcFaceRecognizer, RecognizerError};
pub use task::{TaskConfig, TaskError, YoloTaskDetector};

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";
pub const LIVENESS_MODEL_FILE: &str = "minifasnet_v2.onnx";
pub const TASK_MODEL_FILE: &str = "task_yolo.onnx";
pub const TASK_LABELS_FILE: &str = "task_labels.txt";

