use crate::gallery::{Gallery, Neighbor};
use crate::types::{Embedding, EmbeddingError, IdentityKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default acceptance threshold, in plain Euclidean distance.
///
/// 0.6 is the customary cut-off for 128-d face descriptors. The
/// squared-distance equivalent would be 0.36; never mix the two.
pub const DEFAULT_THRESHOLD: f32 = 0.6;

/// Distances closer than this are treated as equal.
pub const DEFAULT_TIE_TOLERANCE: f32 = 1e-6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("invalid threshold {0}: must be finite and non-negative")]
    InvalidThreshold(f32),
    #[error("ambiguous match at distance {distance}: {candidates:?}")]
    Ambiguous {
        candidates: Vec<IdentityKey>,
        distance: f32,
    },
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

/// Why a probe was not matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedReason {
    NoEnrolledIdentities,
    /// Best candidate was further than the threshold.
    BelowConfidenceThreshold,
}

/// Result of matching a probe embedding against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchResult {
    Matched {
        identity: IdentityKey,
        /// Euclidean distance to the matched canonical embedding.
        distance: f32,
        /// `1 - distance / threshold`, clamped to [0, 1].
        confidence: f32,
        /// Other identities that tied with the winner. Non-empty means the
        /// caller should log it or ask for another capture.
        ambiguous_with: Vec<IdentityKey>,
    },
    Unmatched {
        best_distance: Option<f32>,
        reason: UnmatchedReason,
    },
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchResult::Matched { .. })
    }

    pub fn identity(&self) -> Option<&IdentityKey> {
        match self {
            MatchResult::Matched { identity, .. } => Some(identity),
            MatchResult::Unmatched { .. } => None,
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self, MatchResult::Matched { ambiguous_with, .. } if !ambiguous_with.is_empty())
    }
}

/// What to do when several identities are equally close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TiePolicy {
    /// Pick the most recently updated record and report the others.
    #[default]
    PreferMostRecent,
    /// Refuse to decide; return [`MatchError::Ambiguous`].
    Reject,
}

/// Strategy for deciding which enrolled identity a probe belongs to.
pub trait Matcher: Send + Sync {
    fn recognize(
        &self,
        gallery: &Gallery,
        probe: &Embedding,
        threshold: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// Nearest-neighbor matcher over Euclidean distance.
#[derive(Debug, Clone)]
pub struct EuclideanMatcher {
    pub tie_tolerance: f32,
    pub tie_policy: TiePolicy,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            tie_tolerance: DEFAULT_TIE_TOLERANCE,
            tie_policy: TiePolicy::default(),
        }
    }
}

impl Matcher for EuclideanMatcher {
    fn recognize(
        &self,
        gallery: &Gallery,
        probe: &Embedding,
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(MatchError::InvalidThreshold(threshold));
        }
        probe.ensure_dim(gallery.dimension())?;

        let snapshot = gallery.snapshot();
        if snapshot.is_empty() {
            return Ok(MatchResult::Unmatched {
                best_distance: None,
                reason: UnmatchedReason::NoEnrolledIdentities,
            });
        }

        // Full ranking so every candidate within tolerance of the best is
        // seen, however many there are.
        let ranked = snapshot.rank(probe, snapshot.len());
        let best_distance = ranked[0].distance;

        tracing::debug!(
            gallery_size = snapshot.len(),
            best = %ranked[0].key(),
            distance = best_distance,
            threshold,
            "matcher: gallery queried"
        );

        // Accept or reject on the nearest record alone.
        if best_distance > threshold {
            return Ok(MatchResult::Unmatched {
                best_distance: Some(best_distance),
                reason: UnmatchedReason::BelowConfidenceThreshold,
            });
        }

        // Only candidates that would match on their own can tie.
        let tied: Vec<&Neighbor> = ranked
            .iter()
            .take_while(|n| n.distance - best_distance <= self.tie_tolerance && n.distance <= threshold)
            .collect();

        // Among the tied, the most recently written wins.
        let winner = tied
            .iter()
            .copied()
            .reduce(|best, n| if n.record.is_newer_than(&best.record) { n } else { best })
            .unwrap_or(&ranked[0]);
        let distance = winner.distance;

        let ambiguous_with: Vec<IdentityKey> = tied
            .iter()
            .filter(|n| n.key() != winner.key())
            .map(|n| n.key().clone())
            .collect();

        if !ambiguous_with.is_empty() {
            tracing::warn!(
                winner = %winner.key(),
                others = ?ambiguous_with,
                distance,
                "matcher: ambiguous match"
            );
            if self.tie_policy == TiePolicy::Reject {
                let mut candidates = vec![winner.key().clone()];
                candidates.extend(ambiguous_with);
                return Err(MatchError::Ambiguous {
                    candidates,
                    distance,
                });
            }
        }

        Ok(MatchResult::Matched {
            identity: winner.key().clone(),
            distance,
            confidence: confidence(distance, threshold),
            ambiguous_with,
        })
    }
}

/// Monotonically decreasing in `distance`: 1 at distance 0, 0 at the threshold.
pub fn confidence(distance: f32, threshold: f32) -> f32 {
    if threshold <= 0.0 {
        return if distance <= 0.0 { 1.0 } else { 0.0 };
    }
    (1.0 - distance / threshold).clamp(0.0, 1.0)
}
