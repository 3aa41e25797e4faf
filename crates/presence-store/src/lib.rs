//! presence-store — SQLite persistence for canonical face embeddings.
//!
//! One row per identity in `identity_faces`. Descriptors are stored as JSON
//! text and validated against the gallery dimensionality on every read.

use chrono::{DateTime, Utc};
use presence_core::codec::{decode_descriptor, encode_descriptor};
use presence_core::store::{CorruptedRow, IdentityStore, LoadReport, StoreError};
use presence_core::{IdentityKey, IdentityRecord};
use rusqlite::types::Value;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS identity_faces (
    identity_key TEXT PRIMARY KEY,
    descriptor   TEXT NOT NULL,
    dimension    INTEGER NOT NULL,
    version      INTEGER NOT NULL,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);
"#;

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// [`IdentityStore`] backed by a single SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(backend)?;
        tracing::info!(path = %path.display(), "identity store opened");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory().map_err(backend)?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of stored rows, including any that fail to decode.
    pub fn count(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM identity_faces", [], |row| row.get(0))
            .map_err(backend)?;
        Ok(n as usize)
    }
}

impl IdentityStore for SqliteStore {
    fn save(&self, record: &IdentityRecord) -> Result<(), StoreError> {
        let descriptor = encode_descriptor(&record.embedding)?;
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let changed = conn
            .execute(
                r#"
                INSERT INTO identity_faces
                    (identity_key, descriptor, dimension, version, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(identity_key) DO UPDATE SET
                    descriptor = excluded.descriptor,
                    dimension  = excluded.dimension,
                    version    = excluded.version,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at
                WHERE excluded.version > identity_faces.version
                "#,
                params![
                    record.key.as_str(),
                    descriptor,
                    record.embedding.dim() as i64,
                    record.version as i64,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .map_err(backend)?;

        if changed == 0 {
            tracing::debug!(
                identity = %record.key,
                version = record.version,
                "store: stale write ignored"
            );
        }
        Ok(())
    }

    fn delete(&self, key: &IdentityKey) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let n = conn
            .execute(
                "DELETE FROM identity_faces WHERE identity_key = ?1",
                params![key.as_str()],
            )
            .map_err(backend)?;
        Ok(n > 0)
    }

    fn load_all(&self, dim: usize) -> Result<LoadReport, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn
            .prepare(
                "SELECT identity_key, descriptor, version, created_at, updated_at
                 FROM identity_faces ORDER BY identity_key",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StoredRow {
                    key: row.get(0)?,
                    descriptor: row.get(1)?,
                    version: row.get(2)?,
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            })
            .map_err(backend)?;

        let mut report = LoadReport::default();
        for row in rows {
            let row = row.map_err(backend)?;
            match row.into_record(dim) {
                Ok(record) => report.records.push(record),
                Err(corrupted) => report.corrupted.push(corrupted),
            }
        }
        Ok(report)
    }
}

/// Raw column values. SQLite does not enforce declared types, so nothing is
/// assumed about a column until it is decoded here.
struct StoredRow {
    key: Value,
    descriptor: Value,
    version: Value,
    created_at: Value,
    updated_at: Value,
}

impl StoredRow {
    fn into_record(self, dim: usize) -> Result<IdentityRecord, CorruptedRow> {
        use presence_core::codec::CodecError;

        let key = match &self.key {
            Value::Text(key) => key.clone(),
            other => format!("{other:?}"),
        };
        let corrupted = |error: CodecError| CorruptedRow {
            key: key.clone(),
            error,
        };
        let text = |column: &str, value: &Value| match value {
            Value::Text(text) => Ok(text.clone()),
            other => Err(corrupted(CodecError::Corrupted(format!(
                "{column}: expected text, found {}",
                type_name(other)
            )))),
        };

        let identity = IdentityKey::new(text("identity_key", &self.key)?)
            .map_err(|e| corrupted(CodecError::Corrupted(e.to_string())))?;
        let embedding =
            decode_descriptor(&text("descriptor", &self.descriptor)?, dim).map_err(&corrupted)?;
        let created_at = parse_time(&text("created_at", &self.created_at)?)
            .map_err(|e| corrupted(CodecError::Corrupted(e)))?;
        let updated_at = parse_time(&text("updated_at", &self.updated_at)?)
            .map_err(|e| corrupted(CodecError::Corrupted(e)))?;
        let version = match self.version {
            Value::Integer(v) if v >= 1 => v as u64,
            other => {
                return Err(corrupted(CodecError::Corrupted(format!(
                    "invalid version {other:?}"
                ))))
            }
        };

        Ok(IdentityRecord::new(
            identity,
            embedding,
            created_at,
            updated_at,
            version,
        ))
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Integer(_) => "integer",
        Value::Real(_) => "real",
        Value::Text(_) => "text",
        Value::Blob(_) => "blob",
    }
}

fn parse_time(text: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp {text:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::codec::CodecError;
    use presence_core::{Embedding, Engine, EngineConfig, WriteMode};

    fn record(key: &str, values: &[f32], version: u64) -> IdentityRecord {
        let now = Utc::now();
        IdentityRecord::new(
            IdentityKey::new(key).unwrap(),
            Embedding::new(values.to_vec()).unwrap(),
            now,
            now,
            version,
        )
    }

    #[test]
    fn test_save_and_load_exact() {
        let store = SqliteStore::open_in_memory().unwrap();
        let values = [0.1f32, -0.333_333_34, 1.0e-7, 0.987_654_3];
        store.save(&record("E1", &values, 1)).unwrap();

        let report = store.load_all(4).unwrap();
        assert!(report.corrupted.is_empty());
        assert_eq!(report.records.len(), 1);
        let loaded = &report.records[0];
        assert_eq!(loaded.key.as_str(), "E1");
        assert_eq!(loaded.embedding.values(), &values);
        assert_eq!(loaded.version, 1);
    }

    #[test]
    fn test_save_only_newer_version() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.save(&record("E1", &[1.0], 3)).unwrap();
        store.save(&record("E1", &[2.0], 2)).unwrap();
        store.save(&record("E1", &[3.0], 3)).unwrap();

        let report = store.load_all(1).unwrap();
        assert_eq!(report.records[0].embedding.values(), &[1.0]);

        store.save(&record("E1", &[4.0], 4)).unwrap();
        let report = store.load_all(1).unwrap();
        assert_eq!(report.records[0].embedding.values(), &[4.0]);
        assert_eq!(report.records[0].version, 4);
    }

    #[test]
    fn test_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.save(&record("E1", &[1.0], 1)).unwrap();
        let key = IdentityKey::new("E1").unwrap();
        assert!(store.delete(&key).unwrap());
        assert!(!store.delete(&key).unwrap());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_corrupted_rows_are_skipped() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.save(&record("good", &[1.0, 2.0], 1)).unwrap();
        store.save(&record("short", &[1.0], 1)).unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO identity_faces VALUES ('garbage', 'not json', 2, 1, ?1, ?1)",
                params![Utc::now().to_rfc3339()],
            )
            .unwrap();
        }

        let report = store.load_all(2).unwrap();
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].key.as_str(), "good");

        let mut bad: Vec<_> = report.corrupted.iter().map(|c| c.key.as_str()).collect();
        bad.sort();
        assert_eq!(bad, vec!["garbage", "short"]);
        assert!(report
            .corrupted
            .iter()
            .any(|c| matches!(c.error, CodecError::LengthMismatch { expected: 2, actual: 1 })));
    }

    #[test]
    fn test_mistyped_columns_are_skipped() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.save(&record("good", &[1.0, 2.0], 1)).unwrap();
        {
            let conn = store.conn.lock().unwrap();
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO identity_faces VALUES ('blob', X'0001', 2, 1, ?1, ?1)",
                params![now],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO identity_faces VALUES ('textver', '[1.0,2.0]', 2, 'one', ?1, ?1)",
                params![now],
            )
            .unwrap();
        }

        let report = store.load_all(2).unwrap();
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].key.as_str(), "good");
        let mut bad: Vec<_> = report.corrupted.iter().map(|c| c.key.as_str()).collect();
        bad.sort();
        assert_eq!(bad, vec!["blob", "textver"]);
    }

    #[test]
    fn test_engine_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.db");
        let config = EngineConfig {
            dimension: 3,
            ..Default::default()
        };
        let e1 = Embedding::new(vec![0.1, 0.2, 0.3]).unwrap();
        let e2 = Embedding::new(vec![-0.4, 0.5, 0.0]).unwrap();

        {
            let engine = Engine::new(config.clone())
                .unwrap()
                .with_store(Box::new(SqliteStore::open(&path).unwrap()));
            let k1 = IdentityKey::new("E1").unwrap();
            engine
                .register_embedding(k1.clone(), e1.clone(), WriteMode::CreateOnly)
                .unwrap();
            engine
                .register_embedding(k1, e2.clone(), WriteMode::Replace)
                .unwrap();
            engine
                .register_embedding(IdentityKey::new("E2").unwrap(), e1.clone(), WriteMode::CreateOnly)
                .unwrap();
            engine.remove(&IdentityKey::new("E2").unwrap()).unwrap();
        }

        let engine = Engine::new(config)
            .unwrap()
            .with_store(Box::new(SqliteStore::open(&path).unwrap()));
        let summary = engine.load_from_store().unwrap();
        assert_eq!(summary.loaded, 1);
        let record = engine.gallery().get(&IdentityKey::new("E1").unwrap()).unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.embedding, e2);
        assert!(engine.recognize_embedding(&e2).unwrap().is_match());
    }
}
