//! Storage boundary for canonical embeddings.

use crate::codec::CodecError;
use crate::gallery::IdentityRecord;
use crate::types::IdentityKey;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A stored row that could not be turned into a record.
#[derive(Debug)]
pub struct CorruptedRow {
    pub key: String,
    pub error: CodecError,
}

/// Everything read back from storage. Corrupted rows are reported next to
/// the good ones; one bad row never hides the rest.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub records: Vec<IdentityRecord>,
    pub corrupted: Vec<CorruptedRow>,
}

/// Durable home for identity records.
pub trait IdentityStore: Send + Sync {
    /// Persist `record`. A record older than the stored version is ignored,
    /// so concurrent writers settle on the highest version.
    fn save(&self, record: &IdentityRecord) -> Result<(), StoreError>;

    /// Delete `key`. Returns true if a row existed.
    fn delete(&self, key: &IdentityKey) -> Result<bool, StoreError>;

    /// Read every record, validating descriptors against `dim`.
    fn load_all(&self, dim: usize) -> Result<LoadReport, StoreError>;
}

/// Non-durable store, for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<IdentityKey, IdentityRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &IdentityKey) -> Option<IdentityRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

impl IdentityStore for MemoryStore {
    fn save(&self, record: &IdentityRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        match records.get(&record.key) {
            Some(existing) if existing.version >= record.version => {}
            _ => {
                records.insert(record.key.clone(), record.clone());
            }
        }
        Ok(())
    }

    fn delete(&self, key: &IdentityKey) -> Result<bool, StoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.remove(key).is_some())
    }

    fn load_all(&self, dim: usize) -> Result<LoadReport, StoreError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut report = LoadReport::default();
        for record in records.values() {
            if record.embedding.dim() == dim {
                report.records.push(record.clone());
            } else {
                report.corrupted.push(CorruptedRow {
                    key: record.key.to_string(),
                    error: CodecError::LengthMismatch {
                        expected: dim,
                        actual: record.embedding.dim(),
                    },
                });
            }
        }
        Ok(report)
    }
}
