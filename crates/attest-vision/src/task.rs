//! Task-evidence detection with a YOLO export via ONNX Runtime.
//!
//! The image is letterboxed onto a grey canvas and scaled to `[0, 1]`. For
//! each class the peak confidence over all candidate boxes is kept; a task
//! is verified when any of its alias labels peaks at or above the minimum
//! confidence. Boxes are never reported, so no NMS is needed.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use attest_core::{CapabilityError, TaskDetector};
use image::RgbImage;
use ort::session::Session;
use ort::value::TensorRef;
use thiserror::Error;

use crate::tensor;

pub const DEFAULT_TASK_INPUT_SIZE: u32 = 512;
pub const DEFAULT_TASK_MIN_CONFIDENCE: f32 = 0.25;
const LETTERBOX_FILL: u8 = 114;
/// Box coordinates precede the class scores in each candidate row.
const BOX_FIELDS: usize = 4;

/// Free-text task names and the model labels that evidence them.
const TASK_ALIASES: &[(&str, &[&str])] = &[
    ("waste", &["person-collecting-waste", "person_collecting_waste", "waste_collection"]),
    ("waste collection", &["person-collecting-waste", "person_collecting_waste", "waste_collection"]),
    ("plantation", &["person_planting", "people_planting", "planting"]),
    ("planting", &["person_planting", "people_planting", "planting"]),
    ("feeding", &["person_feeding_animal", "feeding_animal", "animal_feeding"]),
    ("feeding animal", &["person_feeding_animal", "feeding_animal", "animal_feeding"]),
];

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("cannot read labels from {path}: {source}")]
    Labels {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("labels file {0} lists no classes")]
    NoLabels(PathBuf),
    #[error("model output has shape {shape:?}, expected {classes} classes plus 4 box fields")]
    ShapeMismatch { shape: Vec<i64>, classes: usize },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<TaskError> for CapabilityError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::ShapeMismatch { .. } => CapabilityError::Malformed(format!("task detector: {err}")),
            other => CapabilityError::Backend(format!("task detector: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskConfig {
    pub input_size: u32,
    pub min_confidence: f32,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_TASK_INPUT_SIZE,
            min_confidence: DEFAULT_TASK_MIN_CONFIDENCE,
        }
    }
}

pub struct YoloTaskDetector {
    session: Mutex<Session>,
    labels: Vec<String>,
    config: TaskConfig,
}

impl YoloTaskDetector {
    pub fn load(model_path: &Path, labels_path: &Path, config: TaskConfig) -> Result<Self, TaskError> {
        if !model_path.exists() {
            return Err(TaskError::ModelNotFound(model_path.display().to_string()));
        }
        let labels = read_labels(labels_path)?;

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            classes = labels.len(),
            labels = ?labels,
            "loaded task model"
        );

        Ok(Self {
            session: Mutex::new(session),
            labels,
            config,
        })
    }

    /// Peak confidence per label, in label order.
    pub fn class_peaks(&self, image: &RgbImage) -> Result<Vec<(String, f32)>, TaskError> {
        let (canvas, _) = tensor::letterbox(image, self.config.input_size, LETTERBOX_FILL);
        let input = tensor::to_nchw(&canvas, 0.0, 255.0);

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| TaskError::InferenceFailed(format!("detections: {e}")))?;
        let dims: Vec<i64> = shape.iter().copied().collect();

        let peaks = peak_scores(data, &dims, self.labels.len())?;
        Ok(self.labels.iter().cloned().zip(peaks).collect())
    }
}

impl TaskDetector for YoloTaskDetector {
    fn detect_task(&self, image: &RgbImage, task: &str) -> Result<bool, CapabilityError> {
        let peaks = self.class_peaks(image)?;
        let verified = matches_task(task, &peaks, self.config.min_confidence);
        tracing::debug!(task, verified, "task detection");
        Ok(verified)
    }
}

/// One label per non-empty line, surrounding whitespace ignored.
pub fn read_labels(path: &Path) -> Result<Vec<String>, TaskError> {
    let text = fs::read_to_string(path).map_err(|source| TaskError::Labels {
        path: path.to_path_buf(),
        source,
    })?;
    let labels: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if labels.is_empty() {
        return Err(TaskError::NoLabels(path.to_path_buf()));
    }
    Ok(labels)
}

/// Labels accepted as evidence of `task`. Unknown tasks are their own alias.
pub fn task_aliases(task: &str) -> Vec<String> {
    let key = task.trim().to_lowercase();
    match TASK_ALIASES.iter().find(|(name, _)| *name == key) {
        Some((_, aliases)) => aliases.iter().map(|a| a.to_string()).collect(),
        None => vec![key],
    }
}

/// Whether any alias of `task` was detected at or above `min_confidence`.
pub fn matches_task(task: &str, detections: &[(String, f32)], min_confidence: f32) -> bool {
    let aliases = task_aliases(task);
    detections.iter().any(|(label, confidence)| {
        *confidence >= min_confidence
            && aliases.iter().any(|a| *a == label.trim().to_lowercase())
    })
}

/// Per-class maximum over a `[1, 4+C, N]` or `[1, N, 4+C]` output.
fn peak_scores(data: &[f32], dims: &[i64], classes: usize) -> Result<Vec<f32>, TaskError> {
    let mismatch = || TaskError::ShapeMismatch {
        shape: dims.to_vec(),
        classes,
    };
    let [_, rows, cols] = dims else {
        return Err(mismatch());
    };
    let (rows, cols) = (*rows as usize, *cols as usize);
    if data.len() != rows * cols {
        return Err(mismatch());
    }
    let fields = BOX_FIELDS + classes;

    let peaks = if rows == fields {
        // Channel-major: one row per field, one column per candidate.
        (0..classes)
            .map(|c| {
                let start = (BOX_FIELDS + c) * cols;
                data[start..start + cols].iter().copied().fold(0.0, f32::max)
            })
            .collect()
    } else if cols == fields {
        (0..classes)
            .map(|c| {
                data.chunks_exact(cols)
                    .map(|row| row[BOX_FIELDS + c])
                    .fold(0.0, f32::max)
            })
            .collect()
    } else {
        return Err(mismatch());
    };
    Ok(peaks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn dets(pairs: &[(&str, f32)]) -> Vec<(String, f32)> {
        pairs.iter().map(|(l, c)| (l.to_string(), *c)).collect()
    }

    #[test]
    fn test_aliases_are_case_and_whitespace_insensitive() {
        assert_eq!(task_aliases("  Plantation "), task_aliases("planting"));
        assert!(task_aliases("WASTE").contains(&"person-collecting-waste".to_string()));
        assert_eq!(task_aliases("Beach_Cleanup"), vec!["beach_cleanup".to_string()]);
    }

    #[test]
    fn test_matches_task_respects_min_confidence() {
        let found = dets(&[("person_planting", 0.31), ("person_feeding_animal", 0.2)]);
        assert!(matches_task("planting", &found, 0.25));
        assert!(!matches_task("feeding", &found, 0.25));
        assert!(!matches_task("waste", &found, 0.25));
    }

    #[test]
    fn test_matches_task_threshold_is_inclusive() {
        let found = dets(&[("Waste_Collection", 0.25)]);
        assert!(matches_task("waste collection", &found, 0.25));
    }

    #[test]
    fn test_matches_unknown_task_by_its_own_label() {
        let found = dets(&[("beach_cleanup", 0.9)]);
        assert!(matches_task("Beach_Cleanup", &found, 0.25));
    }

    #[test]
    fn test_peak_scores_channel_major() {
        // 2 classes, 3 candidates: rows = x, y, w, h, c0, c1.
        let mut data = vec![0.0f32; 6 * 3];
        data[4 * 3..5 * 3].copy_from_slice(&[0.1, 0.6, 0.2]);
        data[5 * 3..6 * 3].copy_from_slice(&[0.05, 0.0, 0.3]);
        let peaks = peak_scores(&data, &[1, 6, 3], 2).unwrap();
        assert_eq!(peaks, vec![0.6, 0.3]);
    }

    #[test]
    fn test_peak_scores_anchor_major() {
        let data = vec![
            0.0, 0.0, 0.0, 0.0, 0.7, 0.1, //
            0.0, 0.0, 0.0, 0.0, 0.2, 0.4,
        ];
        let peaks = peak_scores(&data, &[1, 2, 6], 2).unwrap();
        assert_eq!(peaks, vec![0.7, 0.4]);
    }

    #[test]
    fn test_peak_scores_rejects_wrong_class_count() {
        let data = vec![0.0f32; 7 * 4];
        let err = peak_scores(&data, &[1, 7, 4], 2).unwrap_err();
        assert!(matches!(err, TaskError::ShapeMismatch { classes: 2, .. }));
        assert!(matches!(CapabilityError::from(err), CapabilityError::Malformed(_)));
    }

    #[test]
    fn test_read_labels_skips_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "person_planting\n\n  person_feeding_animal  \n").unwrap();
        let labels = read_labels(file.path()).unwrap();
        assert_eq!(labels, vec!["person_planting", "person_feeding_animal"]);
    }

    #[test]
    fn test_read_labels_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(read_labels(file.path()), Err(TaskError::NoLabels(_))));
    }

    #[test]
    fn test_load_missing_model() {
        let err = YoloTaskDetector::load(
            Path::new("/nonexistent/task.onnx"),
            Path::new("/nonexistent/labels.txt"),
            TaskConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, TaskError::ModelNotFound(_)));
    }
}
