//! Enrollment fusion — several captures of one person become one canonical
//! embedding.
//!
//! Low-quality captures are dropped first, then the componentwise mean is
//! taken. Captures that sit far from that mean relative to the spread of the
//! whole set (another face in frame, a misdetection) are dropped and the mean
//! is recomputed once.

use crate::types::{squared_l2, Embedding, EmbeddingError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_MIN_SAMPLES: usize = 2;
const DEFAULT_QUALITY_FLOOR: f32 = 0.5;
const DEFAULT_OUTLIER_FACTOR: f32 = 1.25;
/// Outlier rejection needs at least this many survivors to tell who is off.
const MIN_SAMPLES_FOR_OUTLIER_CHECK: usize = 3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FusionError {
    #[error("insufficient samples: need at least {required}, got {actual}")]
    InsufficientSamples { required: usize, actual: usize },
    #[error("samples disagree on dimensionality: expected {expected}, got {actual} at sample {index}")]
    InconsistentDimensionality {
        expected: usize,
        actual: usize,
        index: usize,
    },
    #[error("no viable samples: all {rejected} fell below quality floor {floor}")]
    NoViableSamples { rejected: usize, floor: f32 },
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

/// Fusion policy knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Fewer samples than this is an error.
    pub min_samples: usize,
    /// Samples with a quality score below this are discarded. Samples
    /// without a score always pass.
    pub quality_floor: f32,
    /// A sample further from the mean than `outlier_factor` times the mean
    /// pairwise distance is treated as an outlier.
    pub outlier_factor: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            min_samples: DEFAULT_MIN_SAMPLES,
            quality_floor: DEFAULT_QUALITY_FLOOR,
            outlier_factor: DEFAULT_OUTLIER_FACTOR,
        }
    }
}

/// One capture collected during enrollment.
#[derive(Debug, Clone)]
pub struct EnrollmentSample {
    pub embedding: Embedding,
    pub captured_at: DateTime<Utc>,
    /// Optional capture quality, e.g. detector confidence in [0, 1].
    pub quality: Option<f32>,
}

impl EnrollmentSample {
    pub fn new(embedding: Embedding) -> Self {
        Self {
            embedding,
            captured_at: Utc::now(),
            quality: None,
        }
    }

    pub fn with_quality(mut self, quality: f32) -> Self {
        self.quality = Some(quality);
        self
    }
}

/// Outcome of a successful fusion.
#[derive(Debug, Clone)]
pub struct Fusion {
    pub embedding: Embedding,
    /// Samples that contributed to the final mean.
    pub used: usize,
    pub rejected_quality: usize,
    pub rejected_outliers: usize,
}

/// Fuse enrollment samples into a canonical embedding.
pub fn fuse(samples: &[EnrollmentSample], config: &FusionConfig) -> Result<Fusion, FusionError> {
    let required = config.min_samples.max(1);
    if samples.len() < required {
        return Err(FusionError::InsufficientSamples {
            required,
            actual: samples.len(),
        });
    }

    let dim = samples[0].embedding.dim();
    for (index, sample) in samples.iter().enumerate() {
        if sample.embedding.dim() != dim {
            return Err(FusionError::InconsistentDimensionality {
                expected: dim,
                actual: sample.embedding.dim(),
                index,
            });
        }
    }

    let viable: Vec<&Embedding> = samples
        .iter()
        .filter(|s| s.quality.map_or(true, |q| q >= config.quality_floor))
        .map(|s| &s.embedding)
        .collect();
    let rejected_quality = samples.len() - viable.len();

    if viable.is_empty() {
        return Err(FusionError::NoViableSamples {
            rejected: rejected_quality,
            floor: config.quality_floor,
        });
    }

    let candidate = mean(&viable, dim);

    let outliers = find_outliers(&viable, dim, config.outlier_factor);
    let (values, used, rejected_outliers) = if outliers.is_empty() || outliers.len() == viable.len() {
        (candidate, viable.len(), 0)
    } else {
        let kept: Vec<&Embedding> = viable
            .iter()
            .enumerate()
            .filter(|(i, _)| !outliers.contains(i))
            .map(|(_, e)| *e)
            .collect();
        tracing::debug!(
            dropped = outliers.len(),
            kept = kept.len(),
            "fusion: dropped outlier samples"
        );
        (mean(&kept, dim), kept.len(), outliers.len())
    };

    Ok(Fusion {
        embedding: Embedding::new(values)?,
        used,
        rejected_quality,
        rejected_outliers,
    })
}

/// Componentwise mean, accumulated in f64 so identical inputs reproduce
/// themselves exactly.
fn mean(embeddings: &[&Embedding], dim: usize) -> Vec<f32> {
    let mut sum = vec![0.0f64; dim];
    for embedding in embeddings {
        for (acc, &v) in sum.iter_mut().zip(embedding.values()) {
            *acc += v as f64;
        }
    }
    let n = embeddings.len() as f64;
    sum.into_iter().map(|s| (s / n) as f32).collect()
}

/// Indices of samples whose distance to the mean of the *other* samples
/// exceeds `factor` times the mean pairwise distance of the set.
///
/// Each sample is held out of its own reference mean, so a single bad
/// capture among three is still caught.
fn find_outliers(embeddings: &[&Embedding], dim: usize, factor: f32) -> Vec<usize> {
    let n = embeddings.len();
    if n < MIN_SAMPLES_FOR_OUTLIER_CHECK {
        return Vec::new();
    }

    let mut pairwise_sum = 0.0f64;
    for i in 0..n {
        for j in (i + 1)..n {
            pairwise_sum += squared_l2(embeddings[i].values(), embeddings[j].values()).sqrt() as f64;
        }
    }
    let mean_pairwise = pairwise_sum / (n * (n - 1) / 2) as f64;
    let limit = factor as f64 * mean_pairwise;

    let mut sum = vec![0.0f64; dim];
    for embedding in embeddings {
        for (acc, &v) in sum.iter_mut().zip(embedding.values()) {
            *acc += v as f64;
        }
    }
    let others = (n - 1) as f64;

    embeddings
        .iter()
        .enumerate()
        .filter(|(_, e)| {
            let squared: f64 = e
                .values()
                .iter()
                .zip(&sum)
                .map(|(&v, &total)| {
                    let v = v as f64;
                    let held_out = (total - v) / others;
                    (v - held_out) * (v - held_out)
                })
                .sum();
            squared.sqrt() > limit
        })
        .map(|(i, _)| i)
        .collect()
}
