use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Descriptor length of the default face model.
pub const DEFAULT_EMBEDDING_DIM: usize = 128;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding is empty")]
    Empty,
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding component {index} is not finite ({value})")]
    NonFinite { index: usize, value: f32 },
    #[error("identity key must not be empty")]
    EmptyIdentityKey,
    #[error("embedding has zero norm and cannot be normalized")]
    ZeroNorm,
}

/// Face embedding vector produced by the recognition model.
///
/// Components are finite and never change after construction. Cloning is
/// cheap: the values are shared.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    values: Arc<[f32]>,
}

impl Embedding {
    /// Validate raw model output. Rejects empty vectors and NaN/∞ components.
    pub fn new(values: Vec<f32>) -> Result<Self, EmbeddingError> {
        if values.is_empty() {
            return Err(EmbeddingError::Empty);
        }
        if let Some((index, &value)) = values.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(EmbeddingError::NonFinite { index, value });
        }
        Ok(Self {
            values: values.into(),
        })
    }

    /// Like [`new`](Self::new), but also requires exactly `dim` components.
    pub fn with_dim(values: Vec<f32>, dim: usize) -> Result<Self, EmbeddingError> {
        let embedding = Self::new(values)?;
        embedding.ensure_dim(dim)?;
        Ok(embedding)
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn ensure_dim(&self, dim: usize) -> Result<(), EmbeddingError> {
        if self.values.len() != dim {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dim,
                actual: self.values.len(),
            });
        }
        Ok(())
    }

    /// Euclidean distance to `other`. See [`distance`].
    pub fn distance(&self, other: &Embedding) -> Result<f32, EmbeddingError> {
        distance(self, other)
    }

    /// L2 norm. Descriptors from the default model come out close to 1.0.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Scale to unit L2 norm.
    pub fn normalized(&self) -> Result<Embedding, EmbeddingError> {
        let norm = self
            .values
            .iter()
            .map(|&x| x as f64 * x as f64)
            .sum::<f64>()
            .sqrt();
        if norm == 0.0 {
            return Err(EmbeddingError::ZeroNorm);
        }
        Embedding::new(self.values.iter().map(|&x| (x as f64 / norm) as f32).collect())
    }
}

impl Serialize for Embedding {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_seq(self.values.iter())
    }
}

impl<'de> Deserialize<'de> for Embedding {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let values = Vec::<f32>::deserialize(deserializer)?;
        Embedding::new(values).map_err(serde::de::Error::custom)
    }
}

/// Euclidean (L2) distance between two embeddings.
///
/// This is the quantity every public threshold is expressed in. Symmetric
/// bit-for-bit, and exactly 0.0 when both vectors are equal component-wise.
pub fn distance(a: &Embedding, b: &Embedding) -> Result<f32, EmbeddingError> {
    squared_distance(a, b).map(f32::sqrt)
}

/// Squared Euclidean distance. Used for ranking only, never compared against
/// a threshold.
pub fn squared_distance(a: &Embedding, b: &Embedding) -> Result<f32, EmbeddingError> {
    if a.dim() != b.dim() {
        return Err(EmbeddingError::DimensionMismatch {
            expected: a.dim(),
            actual: b.dim(),
        });
    }
    Ok(squared_l2(a.values(), b.values()))
}

pub(crate) fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Opaque, stable identifier of an enrolled person (e.g. an employee id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Surrounding whitespace is trimmed; an empty key is rejected.
    pub fn new(key: impl Into<String>) -> Result<Self, EmbeddingError> {
        let key = key.into();
        let trimmed = key.trim();
        if trimmed.is_empty() {
            return Err(EmbeddingError::EmptyIdentityKey);
        }
        if trimmed.len() == key.len() {
            Ok(Self(key))
        } else {
            Ok(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for IdentityKey {
    type Error = EmbeddingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<IdentityKey> for String {
    fn from(key: IdentityKey) -> Self {
        key.0
    }
}

impl std::str::FromStr for IdentityKey {
    type Err = EmbeddingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}
