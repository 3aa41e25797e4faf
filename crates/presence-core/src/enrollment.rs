//! Multi-capture enrollment as an explicit builder:
//! `begin → add_sample × N → finalize`.

use crate::fuser::{fuse, EnrollmentSample, Fusion, FusionConfig, FusionError};
use crate::types::{Embedding, EmbeddingError, IdentityKey};

/// Pending enrollment for one identity.
#[derive(Debug)]
pub struct EnrollmentSession {
    identity: IdentityKey,
    dim: usize,
    config: FusionConfig,
    samples: Vec<EnrollmentSample>,
}

/// A finalized enrollment, ready to be published to the gallery.
#[derive(Debug, Clone)]
pub struct FusedEnrollment {
    pub identity: IdentityKey,
    pub fusion: Fusion,
}

impl EnrollmentSession {
    pub fn begin(identity: IdentityKey, dim: usize, config: FusionConfig) -> Self {
        Self {
            identity,
            dim,
            config,
            samples: Vec::new(),
        }
    }

    pub fn identity(&self) -> &IdentityKey {
        &self.identity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Add one capture. Dimensionality is checked here so a bad sample is
    /// reported at the call that supplied it.
    pub fn add_sample(&mut self, sample: EnrollmentSample) -> Result<(), EmbeddingError> {
        sample.embedding.ensure_dim(self.dim)?;
        self.samples.push(sample);
        Ok(())
    }

    /// Shorthand for a capture without a quality score, timestamped now.
    pub fn add_embedding(&mut self, embedding: Embedding) -> Result<(), EmbeddingError> {
        self.add_sample(EnrollmentSample::new(embedding))
    }

    /// Fuse the collected samples. The session is consumed either way.
    pub fn finalize(self) -> Result<FusedEnrollment, FusionError> {
        let fusion = fuse(&self.samples, &self.config)?;
        tracing::debug!(
            identity = %self.identity,
            used = fusion.used,
            rejected_quality = fusion.rejected_quality,
            rejected_outliers = fusion.rejected_outliers,
            "enrollment: samples fused"
        );
        Ok(FusedEnrollment {
            identity: self.identity,
            fusion,
        })
    }
}
