//! Descriptor text codec for the storage boundary.
//!
//! Canonical embeddings are stored as a JSON array of decimal numbers (the
//! `face_descriptor` column). `serde_json` prints the shortest decimal that
//! parses back to the identical `f32`, so the round trip is exact.

use crate::types::{Embedding, EmbeddingError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("corrupted descriptor: {0}")]
    Corrupted(String),
    #[error("corrupted descriptor: expected {expected} values, found {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("descriptor serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Serialize a canonical embedding to descriptor text.
pub fn encode_descriptor(embedding: &Embedding) -> Result<String, CodecError> {
    Ok(serde_json::to_string(embedding)?)
}

/// Parse descriptor text, requiring exactly `dim` finite values.
///
/// A wrong length is corruption, never truncated or padded.
pub fn decode_descriptor(text: &str, dim: usize) -> Result<Embedding, CodecError> {
    let values: Vec<f32> = serde_json::from_str(text)
        .map_err(|e| CodecError::Corrupted(format!("not a numeric array: {e}")))?;
    if values.len() != dim {
        return Err(CodecError::LengthMismatch {
            expected: dim,
            actual: values.len(),
        });
    }
    Embedding::new(values).map_err(|e: EmbeddingError| CodecError::Corrupted(e.to_string()))
}
