//! presence-core — Face embedding enrollment and matching for attendance.
//!
//! Embeddings come from an external face model behind the traits in
//! [`model`]. This crate fuses several captures into one canonical
//! embedding per identity, keeps those in a copy-on-write [`Gallery`], and
//! answers "who is this?" with a Euclidean distance threshold.

pub mod codec;
pub mod config;
pub mod engine;
pub mod enrollment;
pub mod fuser;
pub mod gallery;
pub mod matcher;
pub mod model;
pub mod store;
pub mod types;

pub use config::EngineConfig;
pub use engine::{
    Engine, EngineError, EngineStatus, EnrollSummary, ErrorKind, IdentitySummary, LoadSummary,
    RegisterOutcome, VerifyOutcome, WriteMode,
};
pub use fuser::{EnrollmentSample, FusionConfig};
pub use gallery::{Gallery, IdentityRecord};
pub use matcher::{EuclideanMatcher, MatchResult, Matcher, TiePolicy, UnmatchedReason};
pub use model::{FaceEncoder, ImageCrateDecoder, ImageDecoder, ModelBoundary, ModelError, RawFace};
pub use store::{IdentityStore, LoadReport, MemoryStore, StoreError};
pub use types::{distance, Embedding, EmbeddingError, IdentityKey};
