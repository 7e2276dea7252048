use serde::{Deserialize, Serialize};

/// Added to every L2 norm before dividing so a zero vector normalizes to zero.
pub const NORM_EPSILON: f64 = 1e-10;

/// Axis-aligned face box in source image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// One face reported by the face-analysis capability.
#[derive(Debug, Clone)]
pub struct Face {
    pub bbox: BoundingBox,
    /// Raw embedding as produced by the model; not necessarily unit length.
    pub embedding: Embedding,
}

/// Face embedding vector (512-dimensional for ArcFace).
///
/// Vectors persisted in the store are always unit length, so cosine
/// similarity between stored vectors reduces to [`dot`](Self::dot).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn l2_norm(&self) -> f64 {
        self.values
            .iter()
            .map(|&v| f64::from(v) * f64::from(v))
            .sum::<f64>()
            .sqrt()
    }

    /// Scale to unit length: `v / (‖v‖ + ε)`.
    pub fn normalized(&self) -> Embedding {
        let denom = self.l2_norm() + NORM_EPSILON;
        Embedding {
            values: self
                .values
                .iter()
                .map(|&v| (f64::from(v) / denom) as f32)
                .collect(),
        }
    }

    /// Dot product. For two unit vectors this is the cosine similarity in [-1, 1].
    pub fn dot(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(&a, &b)| f64::from(a) * f64::from(b))
            .sum::<f64>() as f32
    }

    /// Normalized mean of a set of embeddings, or `None` when the set is empty.
    ///
    /// All inputs must share one dimensionality; callers check this first.
    pub fn mean_normalized(set: &[Embedding]) -> Option<Embedding> {
        let first = set.first()?;
        let mut sum = vec![0.0f64; first.dim()];
        for e in set {
            for (acc, &v) in sum.iter_mut().zip(e.values.iter()) {
                *acc += f64::from(v);
            }
        }
        let n = set.len() as f64;
        let mean = Embedding {
            values: sum.into_iter().map(|s| (s / n) as f32).collect(),
        };
        Some(mean.normalized())
    }
}
