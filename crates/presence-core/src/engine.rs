//! Enrollment and recognition orchestration.
//!
//! The engine sequences model boundary → fuser → gallery (enroll) and
//! model boundary → matcher (recognize), and turns the results into the
//! outcomes the API layer maps onto responses. It performs no I/O of its
//! own besides the optional [`IdentityStore`].

use crate::codec::CodecError;
use crate::config::EngineConfig;
use crate::enrollment::EnrollmentSession;
use crate::fuser::{EnrollmentSample, FusionError};
use crate::gallery::{Gallery, GalleryError, IdentityRecord};
use crate::matcher::{confidence, EuclideanMatcher, MatchError, MatchResult, Matcher};
use crate::model::{ModelBoundary, ModelError};
use crate::store::{IdentityStore, StoreError};
use crate::types::{distance, Embedding, EmbeddingError, IdentityKey};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),
    #[error("identity not found: {0}")]
    NotFound(IdentityKey),
    #[error("too many images: at most {max}, got {actual}")]
    TooManyImages { max: usize, actual: usize },
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Fusion(#[from] FusionError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Coarse error classes for the orchestration layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input: dimensionality, non-finite values, empty sets, bad config.
    Validation,
    NotFound,
    AmbiguousMatch,
    /// A stored record failed validation on read.
    CorruptedRecord,
    /// The face model rejected the image or is unavailable.
    Model,
    Storage,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(_) | EngineError::Gallery(GalleryError::NotFound(_)) => {
                ErrorKind::NotFound
            }
            EngineError::Match(MatchError::Ambiguous { .. }) => ErrorKind::AmbiguousMatch,
            EngineError::Model(ModelError::InvalidOutput(_)) => ErrorKind::Validation,
            EngineError::Model(_) => ErrorKind::Model,
            EngineError::Store(StoreError::Codec(CodecError::Serialize(_))) => ErrorKind::Storage,
            EngineError::Store(StoreError::Codec(_)) => ErrorKind::CorruptedRecord,
            EngineError::Store(StoreError::Backend(_)) => ErrorKind::Storage,
            EngineError::InvalidConfig(_)
            | EngineError::TooManyImages { .. }
            | EngineError::Embedding(_)
            | EngineError::Fusion(_)
            | EngineError::Gallery(_)
            | EngineError::Match(_) => ErrorKind::Validation,
        }
    }
}

/// Whether an enrollment may create, or must replace, a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Refuse if the identity is already enrolled.
    CreateOnly,
    /// Replace an existing enrollment; the identity must exist.
    Replace,
}

/// Details of a successful enrollment.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollSummary {
    pub identity: IdentityKey,
    pub version: u64,
    pub images_received: usize,
    pub images_used: usize,
    /// Images the model rejected (no face, several faces, undecodable).
    pub images_invalid: usize,
    pub low_quality: usize,
    pub outliers: usize,
}

/// Outcome of a registration request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RegisterOutcome {
    Created(EnrollSummary),
    IdentityAlreadyExists { identity: IdentityKey },
    InsufficientValidImages {
        identity: IdentityKey,
        valid: usize,
        required: usize,
    },
}

/// Outcome of a 1:1 check against one enrolled identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VerifyOutcome {
    Verified { distance: f32, confidence: f32 },
    Rejected { distance: f32 },
}

/// One line of the enrolled-identity listing.
#[derive(Debug, Clone, Serialize)]
pub struct IdentitySummary {
    pub identity: IdentityKey,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&IdentityRecord> for IdentitySummary {
    fn from(record: &IdentityRecord) -> Self {
        Self {
            identity: record.key.clone(),
            version: record.version,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub version: &'static str,
    pub identities: usize,
    pub dimension: usize,
    pub threshold: f32,
    pub persistent: bool,
}

/// Result of hydrating the gallery from storage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadSummary {
    pub loaded: usize,
    /// Keys of rows skipped because their descriptor failed validation.
    pub corrupted: Vec<String>,
}

/// Face enrollment and recognition engine for one gallery.
pub struct Engine {
    config: EngineConfig,
    gallery: Arc<Gallery>,
    matcher: Box<dyn Matcher>,
    store: Option<Box<dyn IdentityStore>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        validate_config(&config)?;
        let matcher = EuclideanMatcher {
            tie_tolerance: config.tie_tolerance,
            tie_policy: config.tie_policy,
        };
        Ok(Self {
            gallery: Arc::new(Gallery::new(config.dimension)),
            config,
            matcher: Box::new(matcher),
            store: None,
        })
    }

    /// Persist every write through `store`.
    pub fn with_store(mut self, store: Box<dyn IdentityStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the default [`EuclideanMatcher`].
    pub fn with_matcher(mut self, matcher: Box<dyn Matcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn gallery(&self) -> &Arc<Gallery> {
        &self.gallery
    }

    /// Fill the gallery from storage. Corrupted rows are logged and skipped.
    pub fn load_from_store(&self) -> Result<LoadSummary, EngineError> {
        let Some(store) = &self.store else {
            return Ok(LoadSummary::default());
        };

        let report = store.load_all(self.config.dimension)?;
        let mut summary = LoadSummary::default();

        for row in report.corrupted {
            tracing::warn!(identity = %row.key, error = %row.error, "skipping corrupted record");
            summary.corrupted.push(row.key);
        }
        // Restore oldest first so the gallery's write order matches the
        // order the rows were last written.
        let mut records = report.records;
        records.sort_by(|a, b| (a.updated_at, a.version).cmp(&(b.updated_at, b.version)));
        for record in records {
            if self.gallery.restore(record)? {
                summary.loaded += 1;
            }
        }

        tracing::info!(
            loaded = summary.loaded,
            corrupted = summary.corrupted.len(),
            "gallery loaded from store"
        );
        Ok(summary)
    }

    /// Register a new identity from several photos.
    pub fn register(
        &self,
        key: IdentityKey,
        images: &[&[u8]],
        model: ModelBoundary<'_>,
    ) -> Result<RegisterOutcome, EngineError> {
        self.enroll_images(key, images, model, WriteMode::CreateOnly)
    }

    /// Replace an existing identity's canonical embedding from new photos.
    pub fn reenroll(
        &self,
        key: IdentityKey,
        images: &[&[u8]],
        model: ModelBoundary<'_>,
    ) -> Result<RegisterOutcome, EngineError> {
        self.enroll_images(key, images, model, WriteMode::Replace)
    }

    /// Enroll from captures whose embeddings were computed elsewhere, e.g.
    /// by an on-device model.
    pub fn register_samples(
        &self,
        key: IdentityKey,
        samples: Vec<EnrollmentSample>,
        mode: WriteMode,
    ) -> Result<RegisterOutcome, EngineError> {
        if let Some(outcome) = self.precheck(&key, samples.len(), mode)? {
            return Ok(outcome);
        }
        let received = samples.len();
        self.enroll(key, samples, received, 0, mode)
    }

    /// Store a single, already canonical embedding without fusion.
    pub fn register_embedding(
        &self,
        key: IdentityKey,
        embedding: Embedding,
        mode: WriteMode,
    ) -> Result<RegisterOutcome, EngineError> {
        embedding.ensure_dim(self.config.dimension)?;
        let embedding = self.prepare(embedding)?;
        let summary = EnrollSummary {
            identity: key.clone(),
            version: 0,
            images_received: 1,
            images_used: 1,
            images_invalid: 0,
            low_quality: 0,
            outliers: 0,
        };
        self.publish(key, embedding, mode, summary)
    }

    /// Identify the person in `image` with the configured threshold.
    pub fn recognize(
        &self,
        image: &[u8],
        model: ModelBoundary<'_>,
    ) -> Result<MatchResult, EngineError> {
        let face = model.embed(image, self.config.dimension)?;
        self.recognize_embedding(&face.embedding)
    }

    pub fn recognize_embedding(&self, probe: &Embedding) -> Result<MatchResult, EngineError> {
        self.recognize_with_threshold(probe, self.config.threshold)
    }

    /// Identify `probe` with a per-call threshold (Euclidean distance).
    pub fn recognize_with_threshold(
        &self,
        probe: &Embedding,
        threshold: f32,
    ) -> Result<MatchResult, EngineError> {
        let probe = self.prepare(probe.clone())?;
        let result = self.matcher.recognize(&self.gallery, &probe, threshold)?;
        match &result {
            MatchResult::Matched { identity, distance, confidence, .. } => {
                tracing::info!(identity = %identity, distance, confidence, "recognized");
            }
            MatchResult::Unmatched { best_distance, reason } => {
                tracing::info!(?best_distance, ?reason, "no match");
            }
        }
        Ok(result)
    }

    /// Check whether `image` shows the person enrolled as `key`.
    pub fn verify(
        &self,
        key: &IdentityKey,
        image: &[u8],
        model: ModelBoundary<'_>,
    ) -> Result<VerifyOutcome, EngineError> {
        let face = model.embed(image, self.config.dimension)?;
        self.verify_embedding(key, &face.embedding)
    }

    pub fn verify_embedding(
        &self,
        key: &IdentityKey,
        probe: &Embedding,
    ) -> Result<VerifyOutcome, EngineError> {
        probe.ensure_dim(self.config.dimension)?;
        let probe = self.prepare(probe.clone())?;
        let record = self
            .gallery
            .get(key)
            .ok_or_else(|| EngineError::NotFound(key.clone()))?;

        let d = distance(&probe, &record.embedding)?;
        let threshold = self.config.threshold;
        let outcome = if d <= threshold {
            VerifyOutcome::Verified {
                distance: d,
                confidence: confidence(d, threshold),
            }
        } else {
            VerifyOutcome::Rejected { distance: d }
        };
        tracing::info!(identity = %key, distance = d, threshold, ?outcome, "verify");
        Ok(outcome)
    }

    /// Remove an identity, e.g. on employee deactivation.
    pub fn remove(&self, key: &IdentityKey) -> Result<(), EngineError> {
        let removed = self.gallery.remove_with(key, |key| -> Result<(), EngineError> {
            if let Some(store) = &self.store {
                store.delete(key)?;
            }
            Ok(())
        })?;
        if !removed {
            return Err(EngineError::NotFound(key.clone()));
        }
        tracing::info!(identity = %key, "identity removed");
        Ok(())
    }

    pub fn list(&self) -> Vec<IdentitySummary> {
        self.gallery
            .records()
            .iter()
            .map(|r| IdentitySummary::from(r.as_ref()))
            .collect()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            version: env!("CARGO_PKG_VERSION"),
            identities: self.gallery.len(),
            dimension: self.config.dimension,
            threshold: self.config.threshold,
            persistent: self.store.is_some(),
        }
    }

    fn enroll_images(
        &self,
        key: IdentityKey,
        images: &[&[u8]],
        model: ModelBoundary<'_>,
        mode: WriteMode,
    ) -> Result<RegisterOutcome, EngineError> {
        if let Some(outcome) = self.precheck(&key, images.len(), mode)? {
            return Ok(outcome);
        }

        let mut samples = Vec::with_capacity(images.len());
        let mut invalid = 0;
        for (index, bytes) in images.iter().enumerate() {
            match model.embed(bytes, self.config.dimension) {
                Ok(face) => samples.push(EnrollmentSample {
                    embedding: face.embedding,
                    captured_at: Utc::now(),
                    quality: face.quality,
                }),
                Err(e) if e.is_per_image() => {
                    tracing::warn!(identity = %key, index, error = %e, "enroll: image rejected");
                    invalid += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.enroll(key, samples, images.len(), invalid, mode)
    }

    /// Checks that need no model work: request size and identity existence.
    fn precheck(
        &self,
        key: &IdentityKey,
        received: usize,
        mode: WriteMode,
    ) -> Result<Option<RegisterOutcome>, EngineError> {
        if received > self.config.max_enroll_images {
            return Err(EngineError::TooManyImages {
                max: self.config.max_enroll_images,
                actual: received,
            });
        }
        let exists = self.gallery.contains(key);
        match mode {
            WriteMode::CreateOnly if exists => Ok(Some(RegisterOutcome::IdentityAlreadyExists {
                identity: key.clone(),
            })),
            WriteMode::Replace if !exists => Err(EngineError::NotFound(key.clone())),
            _ if received < self.config.min_enroll_images => {
                Ok(Some(RegisterOutcome::InsufficientValidImages {
                    identity: key.clone(),
                    valid: received,
                    required: self.config.min_enroll_images,
                }))
            }
            _ => Ok(None),
        }
    }

    fn enroll(
        &self,
        key: IdentityKey,
        samples: Vec<EnrollmentSample>,
        received: usize,
        invalid: usize,
        mode: WriteMode,
    ) -> Result<RegisterOutcome, EngineError> {
        let required = self.config.fusion.min_samples.max(1);
        let mut session =
            EnrollmentSession::begin(key.clone(), self.config.dimension, self.config.fusion.clone());
        for mut sample in samples {
            sample.embedding.ensure_dim(self.config.dimension)?;
            sample.embedding = self.prepare(sample.embedding)?;
            session.add_sample(sample)?;
        }
        let valid = session.len();

        let fused = match session.finalize() {
            Ok(fused) => fused,
            Err(FusionError::InsufficientSamples { .. }) => {
                return Ok(RegisterOutcome::InsufficientValidImages {
                    identity: key,
                    valid,
                    required,
                });
            }
            Err(FusionError::NoViableSamples { .. }) => {
                return Ok(RegisterOutcome::InsufficientValidImages {
                    identity: key,
                    valid: 0,
                    required,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let fusion = fused.fusion;
        let summary = EnrollSummary {
            identity: fused.identity.clone(),
            version: 0,
            images_received: received,
            images_used: fusion.used,
            images_invalid: invalid,
            low_quality: fusion.rejected_quality,
            outliers: fusion.rejected_outliers,
        };
        let canonical = self.prepare(fusion.embedding)?;
        self.publish(fused.identity, canonical, mode, summary)
    }

    /// Apply the configured normalization to an embedding entering the engine.
    fn prepare(&self, embedding: Embedding) -> Result<Embedding, EngineError> {
        if self.config.l2_normalize {
            Ok(embedding.normalized()?)
        } else {
            Ok(embedding)
        }
    }

    /// Save `record` to the store, if any. Runs under the gallery's writer
    /// lock; an error leaves the gallery unchanged.
    fn persist(&self, record: &IdentityRecord) -> Result<(), EngineError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store.save(record).map_err(|e| {
            tracing::error!(identity = %record.key, error = %e, "failed to persist enrollment");
            EngineError::from(e)
        })
    }

    /// Persist and publish in one serialized step.
    fn publish(
        &self,
        key: IdentityKey,
        embedding: Embedding,
        mode: WriteMode,
        mut summary: EnrollSummary,
    ) -> Result<RegisterOutcome, EngineError> {
        let record = match mode {
            WriteMode::CreateOnly => {
                match self
                    .gallery
                    .insert_new_with(key.clone(), embedding, |r| self.persist(r))?
                {
                    Some(record) => record,
                    None => return Ok(RegisterOutcome::IdentityAlreadyExists { identity: key }),
                }
            }
            WriteMode::Replace => self.gallery.replace_with(&key, embedding, |r| self.persist(r))?,
        };

        summary.version = record.version;
        tracing::info!(
            identity = %record.key,
            version = record.version,
            used = summary.images_used,
            invalid = summary.images_invalid,
            outliers = summary.outliers,
            "identity enrolled"
        );
        Ok(RegisterOutcome::Created(summary))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("gallery", &self.gallery)
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

fn validate_config(config: &EngineConfig) -> Result<(), EngineError> {
    if config.dimension == 0 {
        return Err(EngineError::InvalidConfig("dimension must be positive".into()));
    }
    if !config.threshold.is_finite() || config.threshold < 0.0 {
        return Err(EngineError::InvalidConfig(format!(
            "threshold must be a finite, non-negative distance (got {})",
            config.threshold
        )));
    }
    if !config.tie_tolerance.is_finite() || config.tie_tolerance < 0.0 {
        return Err(EngineError::InvalidConfig(format!(
            "tie_tolerance must be finite and non-negative (got {})",
            config.tie_tolerance
        )));
    }
    if config.min_enroll_images > config.max_enroll_images {
        return Err(EngineError::InvalidConfig(format!(
            "min_enroll_images ({}) exceeds max_enroll_images ({})",
            config.min_enroll_images, config.max_enroll_images
        )));
    }
    if !config.fusion.outlier_factor.is_finite() || config.fusion.outlier_factor <= 0.0 {
        return Err(EngineError::InvalidConfig(format!(
            "fusion.outlier_factor must be positive (got {})",
            config.fusion.outlier_factor
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{TiePolicy, UnmatchedReason};
    use crate::model::testing::{png, PixelEncoder};
    use crate::model::ImageCrateDecoder;
    use crate::store::{LoadReport, MemoryStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Mutex};
    use std::thread;
    use std::time::Duration;

    const DIM: usize = 32;

    fn key(s: &str) -> IdentityKey {
        IdentityKey::new(s).unwrap()
    }

    fn engine() -> Engine {
        Engine::new(EngineConfig {
            dimension: DIM,
            ..Default::default()
        })
        .unwrap()
    }

    /// Hands every call to a shared [`MemoryStore`].
    struct Shared(Arc<MemoryStore>);

    impl IdentityStore for Shared {
        fn save(&self, record: &IdentityRecord) -> Result<(), StoreError> {
            self.0.save(record)
        }
        fn delete(&self, key: &IdentityKey) -> Result<bool, StoreError> {
            self.0.delete(key)
        }
        fn load_all(&self, dim: usize) -> Result<LoadReport, StoreError> {
            self.0.load_all(dim)
        }
    }

    /// Fails the next `failures` saves and deletes.
    struct Flaky {
        inner: Arc<MemoryStore>,
        failures: Arc<AtomicUsize>,
    }

    impl Flaky {
        fn take_failure(&self) -> Result<(), StoreError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Backend("disk full".into()));
            }
            Ok(())
        }
    }

    impl IdentityStore for Flaky {
        fn save(&self, record: &IdentityRecord) -> Result<(), StoreError> {
            self.take_failure()?;
            self.inner.save(record)
        }
        fn delete(&self, key: &IdentityKey) -> Result<bool, StoreError> {
            self.take_failure()?;
            self.inner.delete(key)
        }
        fn load_all(&self, dim: usize) -> Result<LoadReport, StoreError> {
            self.inner.load_all(dim)
        }
    }

    /// Holds every save until the test releases it.
    struct Gated {
        inner: Arc<MemoryStore>,
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl IdentityStore for Gated {
        fn save(&self, record: &IdentityRecord) -> Result<(), StoreError> {
            self.entered.lock().unwrap().send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
            self.inner.save(record)
        }
        fn delete(&self, key: &IdentityKey) -> Result<bool, StoreError> {
            self.inner.delete(key)
        }
        fn load_all(&self, dim: usize) -> Result<LoadReport, StoreError> {
            self.inner.load_all(dim)
        }
    }

    /// Three clear captures of person `red`, slightly different each time.
    fn captures(red: u8) -> Vec<Vec<u8>> {
        (0..3).map(|i| png(red, 1, i)).collect()
    }

    fn refs(images: &[Vec<u8>]) -> Vec<&[u8]> {
        images.iter().map(Vec::as_slice).collect()
    }

    #[test]
    fn test_register_then_recognize() {
        let engine = engine();
        let encoder = PixelEncoder::new(DIM);
        let model = ModelBoundary::new(&ImageCrateDecoder, &encoder);

        let images = captures(10);
        let outcome = engine.register(key("E1"), &refs(&images), model).unwrap();
        match outcome {
            RegisterOutcome::Created(summary) => {
                assert_eq!(summary.version, 1);
                assert_eq!(summary.images_used, 3);
                assert_eq!(summary.images_invalid, 0);
            }
            other => panic!("expected created, got {other:?}"),
        }

        let result = engine.recognize(&png(10, 1, 1), model).unwrap();
        assert_eq!(result.identity(), Some(&key("E1")));

        let stranger = engine.recognize(&png(200, 1, 0), model).unwrap();
        assert!(matches!(
            stranger,
            MatchResult::Unmatched { reason: UnmatchedReason::BelowConfidenceThreshold, .. }
        ));
    }

    #[test]
    fn test_register_existing_identity() {
        let engine = engine();
        let encoder = PixelEncoder::new(DIM);
        let model = ModelBoundary::new(&ImageCrateDecoder, &encoder);
        let images = captures(10);

        engine.register(key("E1"), &refs(&images), model).unwrap();
        let again = engine.register(key("E1"), &refs(&images), model).unwrap();
        assert!(matches!(again, RegisterOutcome::IdentityAlreadyExists { .. }));
    }

    #[test]
    fn test_register_insufficient_valid_images() {
        let engine = engine();
        let encoder = PixelEncoder::new(DIM);
        let model = ModelBoundary::new(&ImageCrateDecoder, &encoder);

        // Two faceless shots, one with two people, one clear.
        let images = vec![png(10, 0, 0), png(10, 0, 1), png(10, 2, 0), png(10, 1, 0)];
        let outcome = engine.register(key("E1"), &refs(&images), model).unwrap();
        match outcome {
            RegisterOutcome::InsufficientValidImages { valid, required, .. } => {
                assert_eq!(valid, 1);
                assert_eq!(required, 2);
            }
            other => panic!("expected insufficient, got {other:?}"),
        }
        assert!(engine.gallery().is_empty());
    }

    #[test]
    fn test_register_too_few_images_supplied() {
        let engine = engine();
        let encoder = PixelEncoder::new(DIM);
        let model = ModelBoundary::new(&ImageCrateDecoder, &encoder);
        let images = vec![png(10, 1, 0), png(10, 1, 1)];
        let outcome = engine.register(key("E1"), &refs(&images), model).unwrap();
        assert!(matches!(
            outcome,
            RegisterOutcome::InsufficientValidImages { required: 3, .. }
        ));
    }

    #[test]
    fn test_register_too_many_images() {
        let engine = engine();
        let encoder = PixelEncoder::new(DIM);
        let model = ModelBoundary::new(&ImageCrateDecoder, &encoder);
        let images: Vec<Vec<u8>> = (0..11).map(|i| png(10, 1, i)).collect();
        let err = engine.register(key("E1"), &refs(&images), model).unwrap_err();
        assert!(matches!(err, EngineError::TooManyImages { max: 10, actual: 11 }));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_register_skips_blurry_and_undecodable() {
        let engine = engine();
        let encoder = PixelEncoder::new(DIM);
        let model = ModelBoundary::new(&ImageCrateDecoder, &encoder);
        let mut images = captures(10);
        images.push(png(10, 3, 0));
        images.push(b"not an image".to_vec());

        let outcome = engine.register(key("E1"), &refs(&images), model).unwrap();
        match outcome {
            RegisterOutcome::Created(summary) => {
                assert_eq!(summary.images_received, 5);
                assert_eq!(summary.images_invalid, 1);
                assert_eq!(summary.low_quality, 1);
                assert_eq!(summary.images_used, 3);
            }
            other => panic!("expected created, got {other:?}"),
        }
    }

    #[test]
    fn test_register_model_unavailable_aborts() {
        let engine = engine();
        let encoder = PixelEncoder { dim: DIM, unavailable: true };
        let model = ModelBoundary::new(&ImageCrateDecoder, &encoder);
        let images = captures(10);
        let err = engine.register(key("E1"), &refs(&images), model).unwrap_err();
        assert!(matches!(err, EngineError::Model(ModelError::ModelUnavailable(_))));
        assert_eq!(err.kind(), ErrorKind::Model);
    }

    #[test]
    fn test_reenroll_bumps_version_and_requires_existing() {
        let engine = engine();
        let encoder = PixelEncoder::new(DIM);
        let model = ModelBoundary::new(&ImageCrateDecoder, &encoder);

        let err = engine.reenroll(key("E1"), &refs(&captures(10)), model).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        engine.register(key("E1"), &refs(&captures(10)), model).unwrap();
        let outcome = engine.reenroll(key("E1"), &refs(&captures(40)), model).unwrap();
        match outcome {
            RegisterOutcome::Created(summary) => assert_eq!(summary.version, 2),
            other => panic!("expected created, got {other:?}"),
        }
        let result = engine.recognize(&png(40, 1, 0), model).unwrap();
        assert_eq!(result.identity(), Some(&key("E1")));
    }

    #[test]
    fn test_register_samples_and_embedding() {
        let engine = engine();
        let encoder = PixelEncoder::new(DIM);
        let v = encoder.person(77);

        let samples: Vec<_> = (0..3).map(|_| EnrollmentSample::new(v.clone())).collect();
        let outcome = engine
            .register_samples(key("E1"), samples, WriteMode::CreateOnly)
            .unwrap();
        assert!(matches!(outcome, RegisterOutcome::Created(_)));
        assert_eq!(engine.gallery().get(&key("E1")).unwrap().embedding, v);

        let outcome = engine
            .register_embedding(key("E2"), encoder.person(5), WriteMode::CreateOnly)
            .unwrap();
        assert!(matches!(outcome, RegisterOutcome::Created(ref s) if s.version == 1));

        let err = engine
            .register_embedding(key("E3"), Embedding::new(vec![0.0; 5]).unwrap(), WriteMode::CreateOnly)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_verify() {
        let engine = engine();
        let encoder = PixelEncoder::new(DIM);
        let model = ModelBoundary::new(&ImageCrateDecoder, &encoder);
        engine.register(key("E1"), &refs(&captures(10)), model).unwrap();

        assert!(matches!(
            engine.verify(&key("E1"), &png(10, 1, 2), model).unwrap(),
            VerifyOutcome::Verified { .. }
        ));
        assert!(matches!(
            engine.verify(&key("E1"), &png(120, 1, 0), model).unwrap(),
            VerifyOutcome::Rejected { .. }
        ));
        let err = engine.verify(&key("E9"), &png(10, 1, 0), model).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_recognize_no_face_is_model_error() {
        let engine = engine();
        let encoder = PixelEncoder::new(DIM);
        let model = ModelBoundary::new(&ImageCrateDecoder, &encoder);
        let err = engine.recognize(&png(10, 0, 0), model).unwrap_err();
        assert!(matches!(err, EngineError::Model(ModelError::NoFaceDetected)));
    }

    #[test]
    fn test_recognize_empty_then_remove() {
        let engine = engine();
        let encoder = PixelEncoder::new(DIM);
        let v1 = encoder.person(10);

        engine
            .register_embedding(key("E1"), v1.clone(), WriteMode::CreateOnly)
            .unwrap();
        let result = engine.recognize_with_threshold(&v1, 0.6).unwrap();
        match result {
            MatchResult::Matched { identity, distance, .. } => {
                assert_eq!(identity, key("E1"));
                assert!(distance.abs() < 1e-6);
            }
            other => panic!("expected match, got {other:?}"),
        }

        engine.remove(&key("E1")).unwrap();
        assert!(matches!(
            engine.recognize_embedding(&v1).unwrap(),
            MatchResult::Unmatched { reason: UnmatchedReason::NoEnrolledIdentities, .. }
        ));
        assert_eq!(engine.remove(&key("E1")).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_ambiguous_reject_policy_kind() {
        let engine = Engine::new(EngineConfig {
            dimension: 1,
            tie_policy: TiePolicy::Reject,
            ..Default::default()
        })
        .unwrap();
        engine
            .register_embedding(key("a"), Embedding::new(vec![0.1]).unwrap(), WriteMode::CreateOnly)
            .unwrap();
        engine
            .register_embedding(key("b"), Embedding::new(vec![-0.1]).unwrap(), WriteMode::CreateOnly)
            .unwrap();
        let err = engine
            .recognize_embedding(&Embedding::new(vec![0.0]).unwrap())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AmbiguousMatch);
    }

    #[test]
    fn test_store_write_through_and_reload() {
        let store = Arc::new(MemoryStore::new());
        let encoder = PixelEncoder::new(DIM);

        let first = engine().with_store(Box::new(Shared(Arc::clone(&store))));
        first
            .register_embedding(key("E1"), encoder.person(1), WriteMode::CreateOnly)
            .unwrap();
        first
            .register_embedding(key("E2"), encoder.person(2), WriteMode::CreateOnly)
            .unwrap();
        first
            .register_embedding(key("E2"), encoder.person(3), WriteMode::Replace)
            .unwrap();
        first.remove(&key("E1")).unwrap();
        assert_eq!(store.len(), 1);

        let second = engine().with_store(Box::new(Shared(Arc::clone(&store))));
        let summary = second.load_from_store().unwrap();
        assert_eq!(summary.loaded, 1);
        assert!(summary.corrupted.is_empty());
        let record = second.gallery().get(&key("E2")).unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.embedding, encoder.person(3));
        assert!(second.status().persistent);
    }

    #[test]
    fn test_concurrent_recognize_during_enrollment() {
        let engine = engine();
        let encoder = PixelEncoder::new(DIM);
        for red in 0..20u8 {
            engine
                .register_embedding(key(&format!("E{red}")), encoder.person(red * 10), WriteMode::CreateOnly)
                .unwrap();
        }
        let probe = encoder.person(50);

        thread::scope(|s| {
            let engine = &engine;
            let encoder = &encoder;
            s.spawn(move || {
                for i in 0..100u8 {
                    let k = key(&format!("E{}", i % 20));
                    engine
                        .register_embedding(k, encoder.person((i % 20) * 10), WriteMode::Replace)
                        .unwrap();
                }
            });
            for _ in 0..4 {
                let probe = probe.clone();
                s.spawn(move || {
                    for _ in 0..100 {
                        let result = engine.recognize_embedding(&probe).unwrap();
                        assert_eq!(result.identity(), Some(&key("E5")));
                    }
                });
            }
        });
    }

    #[test]
    fn test_invalid_config() {
        let bad = EngineConfig {
            threshold: f32::NAN,
            ..Default::default()
        };
        assert!(matches!(Engine::new(bad), Err(EngineError::InvalidConfig(_))));
        let bad = EngineConfig {
            dimension: 0,
            ..Default::default()
        };
        assert!(Engine::new(bad).is_err());
    }

    #[test]
    fn test_status_and_list() {
        let engine = engine();
        let encoder = PixelEncoder::new(DIM);
        engine
            .register_embedding(key("B"), encoder.person(1), WriteMode::CreateOnly)
            .unwrap();
        engine
            .register_embedding(key("A"), encoder.person(2), WriteMode::CreateOnly)
            .unwrap();
        let status = engine.status();
        assert_eq!(status.identities, 2);
        assert_eq!(status.dimension, DIM);
        assert!(!status.persistent);
        let listed: Vec<_> = engine.list().into_iter().map(|s| s.identity).collect();
        assert_eq!(listed, vec![key("A"), key("B")]);
    }

    #[test]
    fn test_remove_waits_for_inflight_enrollment() {
        let store = Arc::new(MemoryStore::new());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let engine = engine().with_store(Box::new(Gated {
            inner: Arc::clone(&store),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        }));
        let person = PixelEncoder::new(DIM).person(1);

        let engine = &engine;
        let still_waiting = thread::scope(|s| {
            let enrolling =
                s.spawn(move || engine.register_embedding(key("E1"), person, WriteMode::CreateOnly));
            entered_rx.recv().unwrap();
            let removing = s.spawn(move || engine.remove(&key("E1")));
            thread::sleep(Duration::from_millis(50));
            let still_waiting = !removing.is_finished();
            release_tx.send(()).unwrap();

            assert!(matches!(enrolling.join().unwrap().unwrap(), RegisterOutcome::Created(_)));
            removing.join().unwrap().unwrap();
            still_waiting
        });

        assert!(still_waiting);
        assert!(!engine.gallery().contains(&key("E1")));
        assert!(store.is_empty());
    }

    #[test]
    fn test_failed_save_leaves_gallery_unchanged() {
        let store = Arc::new(MemoryStore::new());
        let failures = Arc::new(AtomicUsize::new(1));
        let engine = engine().with_store(Box::new(Flaky {
            inner: Arc::clone(&store),
            failures: Arc::clone(&failures),
        }));
        let encoder = PixelEncoder::new(DIM);

        let err = engine
            .register_embedding(key("E1"), encoder.person(1), WriteMode::CreateOnly)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(!engine.gallery().contains(&key("E1")));

        // A retry goes through and is persisted.
        let outcome = engine
            .register_embedding(key("E1"), encoder.person(1), WriteMode::CreateOnly)
            .unwrap();
        assert!(matches!(outcome, RegisterOutcome::Created(ref s) if s.version == 1));
        assert_eq!(store.len(), 1);

        failures.store(1, Ordering::SeqCst);
        let err = engine
            .register_embedding(key("E1"), encoder.person(2), WriteMode::Replace)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        let record = engine.gallery().get(&key("E1")).unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.embedding, encoder.person(1));

        failures.store(1, Ordering::SeqCst);
        assert_eq!(engine.remove(&key("E1")).unwrap_err().kind(), ErrorKind::Storage);
        assert!(engine.gallery().contains(&key("E1")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_codec_error_kinds() {
        let encode = serde_json::from_str::<u8>("x").unwrap_err();
        let err = EngineError::Store(StoreError::Codec(CodecError::Serialize(encode)));
        assert_eq!(err.kind(), ErrorKind::Storage);

        let err = EngineError::Store(StoreError::Codec(CodecError::LengthMismatch {
            expected: 128,
            actual: 3,
        }));
        assert_eq!(err.kind(), ErrorKind::CorruptedRecord);
    }

    #[test]
    fn test_load_restores_in_write_order() {
        let store = MemoryStore::new();
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::minutes(5);
        let emb = |v: f32| Embedding::new(vec![v, 0.0]).unwrap();
        store
            .save(&IdentityRecord::new(key("a"), emb(0.2), later, later, 1))
            .unwrap();
        store
            .save(&IdentityRecord::new(key("b"), emb(-0.2), earlier, earlier, 3))
            .unwrap();

        let engine = Engine::new(EngineConfig {
            dimension: 2,
            ..Default::default()
        })
        .unwrap()
        .with_store(Box::new(store));
        assert_eq!(engine.load_from_store().unwrap().loaded, 2);

        match engine.recognize_embedding(&emb(0.0)).unwrap() {
            MatchResult::Matched { identity, ambiguous_with, .. } => {
                assert_eq!(identity, key("a"));
                assert_eq!(ambiguous_with, vec![key("b")]);
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn test_l2_normalize_enroll_and_recognize() {
        let config = EngineConfig {
            dimension: 2,
            l2_normalize: true,
            ..Default::default()
        };
        let engine = Engine::new(config).unwrap();
        let emb = |a: f32, b: f32| Embedding::new(vec![a, b]).unwrap();

        engine
            .register_embedding(key("E1"), emb(3.0, 4.0), WriteMode::CreateOnly)
            .unwrap();
        let stored = engine.gallery().get(&key("E1")).unwrap();
        assert!((stored.embedding.norm() - 1.0).abs() < 1e-6);

        let result = engine.recognize_embedding(&emb(30.0, 40.0)).unwrap();
        assert_eq!(result.identity(), Some(&key("E1")));
        assert!(matches!(
            engine.verify_embedding(&key("E1"), &emb(0.3, 0.4)).unwrap(),
            VerifyOutcome::Verified { .. }
        ));

        let samples = [emb(2.0, 0.0), emb(5.0, 0.0), emb(0.5, 0.0)]
            .into_iter()
            .map(EnrollmentSample::new)
            .collect();
        engine
            .register_samples(key("E2"), samples, WriteMode::CreateOnly)
            .unwrap();
        assert_eq!(engine.gallery().get(&key("E2")).unwrap().embedding, emb(1.0, 0.0));

        let err = engine.recognize_embedding(&emb(0.0, 0.0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        // Without normalization the scaled query is far away.
        let raw = Engine::new(EngineConfig {
            dimension: 2,
            ..Default::default()
        })
        .unwrap();
        raw.register_embedding(key("E1"), emb(3.0, 4.0), WriteMode::CreateOnly)
            .unwrap();
        assert!(!raw.recognize_embedding(&emb(30.0, 40.0)).unwrap().is_match());
    }
}
