//! Identity gallery — the in-memory set of enrolled canonical embeddings.
//!
//! Copy-on-write: the published view is an immutable [`Snapshot`] behind an
//! `Arc`. Readers grab the current `Arc` and scan without holding any lock,
//! so a recognition never sees a half-replaced record and never stalls
//! enrollment traffic. Writers build the next view and swap it in; the swap
//! is serialized, which also makes the version counter exact.

use crate::types::{squared_l2, Embedding, EmbeddingError, IdentityKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GalleryError {
    #[error("gallery is empty")]
    EmptyGallery,
    #[error("identity not found: {0}")]
    NotFound(IdentityKey),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

/// A stored canonical embedding with metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub key: IdentityKey,
    pub embedding: Embedding,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Starts at 1 and increments on every wholesale replacement.
    pub version: u64,
    /// Gallery-wide write order, used to break distance ties.
    #[serde(skip)]
    write_seq: u64,
}

impl IdentityRecord {
    /// Build a record for [`Gallery::restore`], e.g. from a storage row.
    pub fn new(
        key: IdentityKey,
        embedding: Embedding,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        version: u64,
    ) -> Self {
        Self {
            key,
            embedding,
            created_at,
            updated_at,
            version,
            write_seq: 0,
        }
    }

    /// True when `self` was written after `other`.
    pub fn is_newer_than(&self, other: &IdentityRecord) -> bool {
        self.write_seq > other.write_seq
    }
}

/// A gallery entry ranked against a probe.
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub record: Arc<IdentityRecord>,
    /// Euclidean distance to the probe.
    pub distance: f32,
}

impl Neighbor {
    pub fn key(&self) -> &IdentityKey {
        &self.record.key
    }
}

/// Immutable, consistent view of the gallery at one point in time.
#[derive(Debug, Default)]
pub struct Snapshot {
    records: HashMap<IdentityKey, Arc<IdentityRecord>>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&Arc<IdentityRecord>> {
        self.records.get(key)
    }

    pub fn records(&self) -> impl Iterator<Item = &Arc<IdentityRecord>> {
        self.records.values()
    }

    /// Rank every record against `probe`: ascending distance, ties broken
    /// by most recent write, then by key for a stable order.
    ///
    /// Linear scan. Callers go through this (or [`Gallery::nearest`]) so an
    /// index can replace it without touching them.
    pub fn rank(&self, probe: &Embedding, k: usize) -> Vec<Neighbor> {
        let mut scored: Vec<(f32, &Arc<IdentityRecord>)> = self
            .records
            .values()
            .map(|r| (squared_l2(probe.values(), r.embedding.values()), r))
            .collect();

        scored.sort_by(|(da, ra), (db, rb)| {
            da.total_cmp(db)
                .then_with(|| rb.write_seq.cmp(&ra.write_seq))
                .then_with(|| ra.key.cmp(&rb.key))
        });
        scored.truncate(k);

        scored
            .into_iter()
            .map(|(sq, record)| Neighbor {
                record: Arc::clone(record),
                distance: sq.sqrt(),
            })
            .collect()
    }
}

/// Thread-safe identity → canonical embedding map.
pub struct Gallery {
    dim: usize,
    current: RwLock<Arc<Snapshot>>,
    /// Serializes publishers; also owns the write sequence.
    writer: Mutex<u64>,
}

impl Gallery {
    /// Create an empty gallery for embeddings of dimension `dim`.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            current: RwLock::new(Arc::new(Snapshot::default())),
            writer: Mutex::new(0),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    /// Current consistent view. Cheap: clones one `Arc`.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.snapshot().get(key).is_some()
    }

    pub fn get(&self, key: &IdentityKey) -> Option<Arc<IdentityRecord>> {
        self.snapshot().get(key).cloned()
    }

    /// All records, sorted by key.
    pub fn records(&self) -> Vec<Arc<IdentityRecord>> {
        let snapshot = self.snapshot();
        let mut records: Vec<_> = snapshot.records().cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    /// Insert or wholesale-replace the canonical embedding for `key`.
    pub fn upsert(
        &self,
        key: IdentityKey,
        embedding: Embedding,
    ) -> Result<Arc<IdentityRecord>, GalleryError> {
        self.upsert_with(key, embedding, |_| Ok(()))
    }

    /// [`Gallery::upsert`], running `commit` on the new record before it is
    /// published. The writer lock is held throughout, so commits land in the
    /// same order as gallery writes; a failed commit publishes nothing.
    pub fn upsert_with<E: From<GalleryError>>(
        &self,
        key: IdentityKey,
        embedding: Embedding,
        commit: impl FnOnce(&IdentityRecord) -> Result<(), E>,
    ) -> Result<Arc<IdentityRecord>, E> {
        embedding.ensure_dim(self.dim).map_err(GalleryError::from)?;
        let mut writer = self.lock_writer();
        let current = self.snapshot();
        let seq = *writer + 1;
        let now = Utc::now();
        let (created_at, version) = match current.get(&key) {
            Some(prev) => (prev.created_at, prev.version + 1),
            None => (now, 1),
        };
        let record = Arc::new(IdentityRecord {
            key,
            embedding,
            created_at,
            updated_at: now,
            version,
            write_seq: seq,
        });
        commit(&record)?;

        self.install(&current, Arc::clone(&record));
        *writer = seq;
        tracing::debug!(
            identity = %record.key,
            version = record.version,
            "gallery: record published"
        );
        Ok(record)
    }

    /// Insert only if `key` is not enrolled yet. Returns `None` when the key
    /// already exists.
    pub fn insert_new(
        &self,
        key: IdentityKey,
        embedding: Embedding,
    ) -> Result<Option<Arc<IdentityRecord>>, GalleryError> {
        self.insert_new_with(key, embedding, |_| Ok(()))
    }

    /// [`Gallery::insert_new`] with a commit hook, see [`Gallery::upsert_with`].
    pub fn insert_new_with<E: From<GalleryError>>(
        &self,
        key: IdentityKey,
        embedding: Embedding,
        commit: impl FnOnce(&IdentityRecord) -> Result<(), E>,
    ) -> Result<Option<Arc<IdentityRecord>>, E> {
        embedding.ensure_dim(self.dim).map_err(GalleryError::from)?;
        let mut writer = self.lock_writer();
        let current = self.snapshot();
        if current.get(&key).is_some() {
            return Ok(None);
        }
        let seq = *writer + 1;
        let now = Utc::now();
        let record = Arc::new(IdentityRecord {
            key,
            embedding,
            created_at: now,
            updated_at: now,
            version: 1,
            write_seq: seq,
        });
        commit(&record)?;

        self.install(&current, Arc::clone(&record));
        *writer = seq;
        tracing::debug!(identity = %record.key, "gallery: record inserted");
        Ok(Some(record))
    }

    /// Replace the canonical embedding of an enrolled identity. Fails with
    /// [`GalleryError::NotFound`] instead of creating it.
    pub fn replace(
        &self,
        key: &IdentityKey,
        embedding: Embedding,
    ) -> Result<Arc<IdentityRecord>, GalleryError> {
        self.replace_with(key, embedding, |_| Ok(()))
    }

    /// [`Gallery::replace`] with a commit hook, see [`Gallery::upsert_with`].
    pub fn replace_with<E: From<GalleryError>>(
        &self,
        key: &IdentityKey,
        embedding: Embedding,
        commit: impl FnOnce(&IdentityRecord) -> Result<(), E>,
    ) -> Result<Arc<IdentityRecord>, E> {
        embedding.ensure_dim(self.dim).map_err(GalleryError::from)?;
        let mut writer = self.lock_writer();
        let current = self.snapshot();
        let prev = current
            .get(key)
            .ok_or_else(|| GalleryError::NotFound(key.clone()))?;
        let seq = *writer + 1;
        let record = Arc::new(IdentityRecord {
            key: key.clone(),
            embedding,
            created_at: prev.created_at,
            updated_at: Utc::now(),
            version: prev.version + 1,
            write_seq: seq,
        });
        commit(&record)?;

        self.install(&current, Arc::clone(&record));
        *writer = seq;
        tracing::debug!(
            identity = %record.key,
            version = record.version,
            "gallery: record replaced"
        );
        Ok(record)
    }

    /// Load a previously persisted record as-is, keeping its version and
    /// timestamps. An existing entry is only replaced by a newer version.
    pub fn restore(&self, mut record: IdentityRecord) -> Result<bool, GalleryError> {
        record.embedding.ensure_dim(self.dim)?;
        let mut writer = self.lock_writer();
        let current = self.snapshot();
        if let Some(prev) = current.get(&record.key) {
            if prev.version >= record.version {
                return Ok(false);
            }
        }
        *writer += 1;
        record.write_seq = *writer;
        self.install(&current, Arc::new(record));
        Ok(true)
    }

    /// Remove `key`. Returns true if a record existed.
    pub fn remove(&self, key: &IdentityKey) -> bool {
        match self.remove_with(key, |_| Ok::<(), Infallible>(())) {
            Ok(removed) => removed,
            Err(never) => match never {},
        }
    }

    /// [`Gallery::remove`], running `commit` before the removal is
    /// published. `commit` only runs when the key exists.
    pub fn remove_with<E>(
        &self,
        key: &IdentityKey,
        commit: impl FnOnce(&IdentityKey) -> Result<(), E>,
    ) -> Result<bool, E> {
        let mut writer = self.lock_writer();
        let current = self.snapshot();
        if current.get(key).is_none() {
            return Ok(false);
        }
        commit(key)?;

        let mut records = current.records.clone();
        records.remove(key);
        self.swap(records);
        *writer += 1;
        tracing::debug!(identity = %key, "gallery: record removed");
        Ok(true)
    }

    /// The `k` records closest to `probe`, ascending by distance.
    pub fn nearest(&self, probe: &Embedding, k: usize) -> Result<Vec<Neighbor>, GalleryError> {
        probe.ensure_dim(self.dim)?;
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return Err(GalleryError::EmptyGallery);
        }
        Ok(snapshot.rank(probe, k))
    }

    fn lock_writer(&self) -> MutexGuard<'_, u64> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish `current` with `record` inserted. Caller holds the writer lock.
    fn install(&self, current: &Snapshot, record: Arc<IdentityRecord>) {
        let mut records = current.records.clone();
        records.insert(record.key.clone(), record);
        self.swap(records);
    }

    fn swap(&self, records: HashMap<IdentityKey, Arc<IdentityRecord>>) {
        let next = Arc::new(Snapshot { records });
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = next;
    }
}

impl std::fmt::Debug for Gallery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gallery")
            .field("dim", &self.dim)
            .field("len", &self.len())
            .finish()
    }
}
