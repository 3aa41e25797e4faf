use crate::fuser::FusionConfig;
use crate::matcher::{TiePolicy, DEFAULT_THRESHOLD, DEFAULT_TIE_TOLERANCE};
use crate::types::DEFAULT_EMBEDDING_DIM;
use serde::{Deserialize, Serialize};

/// Engine tuning. Every field has a default, so partial TOML/JSON works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Embedding dimensionality shared by the whole gallery.
    pub dimension: usize,
    /// Maximum Euclidean (not squared) distance accepted as a match.
    pub threshold: f32,
    /// Distances within this of the best are considered tied.
    pub tie_tolerance: f32,
    pub tie_policy: TiePolicy,
    /// Fewer images than this in a registration request is refused outright.
    pub min_enroll_images: usize,
    /// More images than this in a registration request is a validation error.
    pub max_enroll_images: usize,
    /// Scale every enrollment sample, canonical embedding and probe to unit
    /// length before use. For models whose output is not already normalized.
    pub l2_normalize: bool,
    pub fusion: FusionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dimension: DEFAULT_EMBEDDING_DIM,
            threshold: DEFAULT_THRESHOLD,
            tie_tolerance: DEFAULT_TIE_TOLERANCE,
            tie_policy: TiePolicy::default(),
            min_enroll_images: 3,
            max_enroll_images: 10,
            l2_normalize: false,
            fusion: FusionConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"threshold": 0.5, "tie_policy": "reject"}"#).unwrap();
        assert_eq!(cfg.threshold, 0.5);
        assert_eq!(cfg.tie_policy, TiePolicy::Reject);
        assert_eq!(cfg.dimension, 128);
        assert!(!cfg.l2_normalize);
        assert_eq!(cfg.fusion, FusionConfig::default());
    }
}
