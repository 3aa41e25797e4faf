//! Model boundary — raw image bytes in, embedding out.
//!
//! Detection, landmarks and the embedding network live outside this crate.
//! The engine only sees two capabilities, both passed in explicitly:
//! an [`ImageDecoder`] that turns uploaded bytes into pixels, and a
//! [`FaceEncoder`] that turns pixels into exactly one face embedding.

use crate::types::{Embedding, EmbeddingError};
use image::DynamicImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error("{0} faces detected; exactly one is required")]
    MultipleFacesDetected(usize),
    #[error("face model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("image could not be decoded: {0}")]
    Decode(String),
    #[error("model returned an invalid embedding: {0}")]
    InvalidOutput(#[from] EmbeddingError),
}

impl ModelError {
    /// Whether the failure is specific to this one image. Anything else
    /// (the model being down) fails the whole request.
    pub fn is_per_image(&self) -> bool {
        !matches!(self, ModelError::ModelUnavailable(_))
    }
}

/// Decodes uploaded image bytes into pixels.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, ModelError>;
}

/// Decoder backed by the `image` crate; format is sniffed from the bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCrateDecoder;

impl ImageDecoder for ImageCrateDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, ModelError> {
        image::load_from_memory(bytes).map_err(|e| ModelError::Decode(e.to_string()))
    }
}

/// Raw model output for the single face in an image.
#[derive(Debug, Clone)]
pub struct RawFace {
    pub values: Vec<f32>,
    /// Detector confidence, if the model reports one.
    pub confidence: Option<f32>,
}

/// A detector + embedding network pair.
///
/// Implementations return the raw vector for the single face in `image`,
/// or one of [`ModelError::NoFaceDetected`],
/// [`ModelError::MultipleFacesDetected`], [`ModelError::ModelUnavailable`].
pub trait FaceEncoder: Send + Sync {
    fn encode(&self, image: &DynamicImage) -> Result<RawFace, ModelError>;
}

/// The two model-side capabilities, handed to each call that needs them.
#[derive(Clone, Copy)]
pub struct ModelBoundary<'a> {
    pub decoder: &'a dyn ImageDecoder,
    pub encoder: &'a dyn FaceEncoder,
}

impl<'a> ModelBoundary<'a> {
    pub fn new(decoder: &'a dyn ImageDecoder, encoder: &'a dyn FaceEncoder) -> Self {
        Self { decoder, encoder }
    }

    /// Decode and encode one image, validating the output against `dim`.
    pub fn embed(&self, bytes: &[u8], dim: usize) -> Result<EncodedFace, ModelError> {
        embed_image(self.decoder, self.encoder, bytes, dim)
    }
}

/// A face capture after it crossed the model boundary.
#[derive(Debug, Clone)]
pub struct EncodedFace {
    pub embedding: Embedding,
    /// Detector confidence, used as the enrollment quality score.
    pub quality: Option<f32>,
}

/// Decode `bytes`, run the encoder and validate its output against `dim`.
pub fn embed_image(
    decoder: &dyn ImageDecoder,
    encoder: &dyn FaceEncoder,
    bytes: &[u8],
    dim: usize,
) -> Result<EncodedFace, ModelError> {
    let image = decoder.decode(bytes)?;
    let raw = encoder.encode(&image)?;
    let embedding = Embedding::with_dim(raw.values, dim)?;
    Ok(EncodedFace {
        embedding,
        quality: raw.confidence,
    })
}
