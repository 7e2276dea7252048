//! Stub capabilities driven by the pixels of tiny generated PNGs.
//!
//! Each column of row 0 describes one face: red = identity (0 = no face),
//! green = pose variant, blue = box side length.

#![allow(dead_code)]

use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use attest_core::{
    BoundingBox, CapabilityError, EmbeddingStore, Embedding, Face, FaceAnalyzer, Liveness,
    LivenessScorer, ProofImage, ReadFailurePolicy, StoreOptions, TaskDetector,
};
use image::{ImageFormat, Rgb, RgbImage};

pub const DIM: usize = 8;
/// Identity whose embeddings have the wrong dimensionality.
pub const ODD_DIM_IDENTITY: u8 = 9;

pub const ALICE: u8 = 1;
pub const BOB: u8 = 2;

/// A face in a generated photo.
#[derive(Clone, Copy)]
pub struct Pose {
    pub identity: u8,
    pub variant: u8,
    pub size: u8,
}

pub fn pose(identity: u8, variant: u8) -> Pose {
    Pose { identity, variant, size: 40 }
}

pub fn photo_bytes(faces: &[Pose]) -> Vec<u8> {
    let width = faces.len().max(1) as u32;
    let mut img = RgbImage::new(width, 1);
    for (x, face) in faces.iter().enumerate() {
        img.put_pixel(x as u32, 0, Rgb([face.identity, face.variant, face.size]));
    }
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("encode png");
    bytes
}

pub fn photo(faces: &[Pose]) -> ProofImage {
    ProofImage::new(photo_bytes(faces))
}

/// The raw embedding the stub reports for an identity/variant pair.
pub fn raw_embedding(identity: u8, variant: u8) -> Embedding {
    if identity == ODD_DIM_IDENTITY {
        return Embedding::new(vec![1.0; 4]);
    }
    let k = identity as usize % DIM;
    let mut values = vec![0.1f32; DIM];
    values[k] = 1.0;
    values[(k + 1 + variant as usize) % DIM] += 0.15;
    // Unnormalized on purpose; the core must normalize.
    Embedding::new(values.into_iter().map(|v| v * 3.0).collect())
}

#[derive(Default)]
pub struct StubFaces {
    pub calls: AtomicUsize,
}

impl FaceAnalyzer for StubFaces {
    fn detect_faces(&self, image: &RgbImage) -> Result<Vec<Face>, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(image
            .enumerate_pixels()
            .filter(|(_, y, p)| *y == 0 && p.0[0] != 0)
            .map(|(x, _, p)| {
                let [identity, variant, size] = p.0;
                Face {
                    bbox: BoundingBox {
                        x: x as f32 * 100.0,
                        y: 0.0,
                        width: size as f32,
                        height: size as f32,
                        confidence: 0.99,
                    },
                    embedding: raw_embedding(identity, variant),
                }
            })
            .collect())
    }
}

pub struct CountingLiveness {
    pub verdict: Liveness,
    pub calls: AtomicUsize,
}

impl CountingLiveness {
    pub fn new(is_live: bool, score: f32) -> Self {
        Self {
            verdict: Liveness { is_live, score },
            calls: AtomicUsize::new(0),
        }
    }
}

impl LivenessScorer for CountingLiveness {
    fn score_liveness(&self, _image: &RgbImage) -> Result<Liveness, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Finish after the task detector so completion order differs from policy order.
        std::thread::sleep(Duration::from_millis(20));
        Ok(self.verdict)
    }
}

pub struct CountingTask {
    pub detected: bool,
    pub calls: AtomicUsize,
    pub last_task: std::sync::Mutex<Option<String>>,
}

impl CountingTask {
    pub fn new(detected: bool) -> Self {
        Self {
            detected,
            calls: AtomicUsize::new(0),
            last_task: std::sync::Mutex::new(None),
        }
    }
}

impl TaskDetector for CountingTask {
    fn detect_task(&self, _image: &RgbImage, task: &str) -> Result<bool, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_task.lock().unwrap() = Some(task.to_string());
        Ok(self.detected)
    }
}

pub struct BrokenLiveness;

impl LivenessScorer for BrokenLiveness {
    fn score_liveness(&self, _image: &RgbImage) -> Result<Liveness, CapabilityError> {
        Err(CapabilityError::Backend("liveness session crashed".into()))
    }
}

pub fn store_at(path: &Path, read_failure: ReadFailurePolicy) -> Arc<EmbeddingStore> {
    Arc::new(EmbeddingStore::open(
        path,
        StoreOptions {
            retries: 2,
            retry_delay: Duration::from_millis(1),
            read_failure,
        },
    ))
}

pub fn calls(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}
