//! Embedding catalogue: SQLite-backed identities and their embeddings.
//!
//! The catalogue is the durable source of truth. The in-memory index is a
//! disposable cache rebuilt from it; only the catalogue deletes or amends
//! embeddings.

use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity name or contact already enrolled")]
    DuplicateIdentity,
    #[error("identity {0} not found")]
    IdentityNotFound(i64),
    #[error("embedding has dimension {actual}, catalogue expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("database: {0}")]
    Db(#[from] tokio_rusqlite::Error),
}

/// An enrolled identity.
#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    pub id: i64,
    pub name: String,
    pub contact: String,
    pub created_at: String,
}

/// Async handle to the catalogue database.
pub struct Store {
    conn: Connection,
    dim: usize,
}

impl Store {
    /// Open (creating if needed) the catalogue at `path`, configured for
    /// `dim`-dimensional embeddings.
    pub async fn open(path: &Path, dim: usize) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path.to_path_buf()).await?;
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS identities (
                     id         INTEGER PRIMARY KEY,
                     name       TEXT NOT NULL UNIQUE,
                     contact    TEXT NOT NULL UNIQUE,
                     created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS embeddings (
                     id          INTEGER PRIMARY KEY,
                     identity_id INTEGER NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
                     vector      BLOB NOT NULL,
                     model       TEXT,
                     image_ref   TEXT
                 );
                 CREATE INDEX IF NOT EXISTS idx_embeddings_identity
                     ON embeddings(identity_id);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, dim })
    }

    /// Create an identity and its first embedding in a single transaction.
    ///
    /// Both rows land or neither does; an identity is never persisted
    /// without an embedding, nor an embedding without its identity. The
    /// vector is validated against the configured dimension before any
    /// write, and rejected (never truncated or padded) on mismatch.
    pub async fn create_identity_with_embedding(
        &self,
        name: &str,
        contact: &str,
        vector: &[f32],
        model: Option<&str>,
        image_ref: Option<&str>,
    ) -> Result<Identity, StoreError> {
        if vector.len() != self.dim {
            return Err(StoreError::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }

        let name_owned = name.to_string();
        let contact_owned = contact.to_string();
        let blob = vector_to_blob(vector);
        let model_owned = model.map(str::to_string);
        let image_ref_owned = image_ref.map(str::to_string);
        let created_at = chrono::Utc::now().to_rfc3339();
        let created_at_row = created_at.clone();

        let result = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO identities (name, contact, created_at) VALUES (?1, ?2, ?3)",
                    params![name_owned, contact_owned, created_at_row],
                )?;
                let id = tx.last_insert_rowid();
                tx.execute(
                    "INSERT INTO embeddings (identity_id, vector, model, image_ref)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, blob, model_owned, image_ref_owned],
                )?;
                tx.commit()?;
                Ok(id)
            })
            .await;

        match result {
            Ok(id) => Ok(Identity {
                id,
                name: name.to_string(),
                contact: contact.to_string(),
                created_at,
            }),
            Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateIdentity),
            Err(e) => Err(e.into()),
        }
    }

    /// Every `(identity_id, vector)` pair, in insertion order, for an index
    /// rebuild. Rows whose BLOB is not a whole number of f32s are skipped;
    /// the second element counts them.
    pub async fn all_embeddings(&self) -> Result<(Vec<(i64, Vec<f32>)>, usize), StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT identity_id, vector FROM embeddings ORDER BY id")?;
                let mut rows = stmt.query([])?;

                let mut out = Vec::new();
                let mut corrupt = 0usize;
                while let Some(row) = rows.next()? {
                    let identity_id: i64 = row.get(0)?;
                    let blob: Vec<u8> = row.get(1)?;
                    match blob_to_vector(&blob) {
                        Some(vector) => out.push((identity_id, vector)),
                        None => corrupt += 1,
                    }
                }
                Ok((out, corrupt))
            })
            .await?;
        Ok(rows)
    }

    pub async fn identity(&self, id: i64) -> Result<Option<Identity>, StoreError> {
        let identity = self
            .conn
            .call(move |conn| {
                let identity = conn
                    .query_row(
                        "SELECT id, name, contact, created_at FROM identities WHERE id = ?1",
                        params![id],
                        |row| {
                            Ok(Identity {
                                id: row.get(0)?,
                                name: row.get(1)?,
                                contact: row.get(2)?,
                                created_at: row.get(3)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(identity)
            })
            .await?;
        Ok(identity)
    }

    pub async fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        let identities = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT id, name, contact, created_at FROM identities ORDER BY id")?;
                let identities = stmt
                    .query_map([], |row| {
                        Ok(Identity {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            contact: row.get(2)?,
                            created_at: row.get(3)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(identities)
            })
            .await?;
        Ok(identities)
    }

    /// Delete an identity; its embeddings cascade. Index entries for the
    /// deleted embeddings remain searchable until the next rebuild.
    pub async fn delete_identity(&self, id: i64) -> Result<(), StoreError> {
        let deleted = self
            .conn
            .call(move |conn| {
                let n = conn.execute("DELETE FROM identities WHERE id = ?1", params![id])?;
                Ok(n)
            })
            .await?;
        if deleted == 0 {
            return Err(StoreError::IdentityNotFound(id));
        }
        Ok(())
    }

    pub async fn count_identities(&self) -> Result<i64, StoreError> {
        let n = self
            .conn
            .call(|conn| {
                let n = conn.query_row("SELECT COUNT(*) FROM identities", [], |r| r.get(0))?;
                Ok(n)
            })
            .await?;
        Ok(n)
    }

    pub async fn count_embeddings(&self) -> Result<i64, StoreError> {
        let n = self
            .conn
            .call(|conn| {
                let n = conn.query_row("SELECT COUNT(*) FROM embeddings", [], |r| r.get(0))?;
                Ok(n)
            })
            .await?;
        Ok(n)
    }

    /// Insert an embedding row with an arbitrary BLOB, bypassing validation.
    #[cfg(test)]
    pub async fn insert_raw_embedding(&self, identity_id: i64, blob: Vec<u8>) {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO embeddings (identity_id, vector) VALUES (?1, ?2)",
                    params![identity_id, blob],
                )?;
                Ok(())
            })
            .await
            .unwrap();
    }
}

fn is_unique_violation(err: &tokio_rusqlite::Error) -> bool {
    matches!(
        err,
        tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(e, _))
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// Little-endian f32 encoding for the vector BLOB column.
fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn blob_to_vector(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store(dim: usize) -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(&tmp.path().join("catalogue.db"), dim)
            .await
            .unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn test_create_and_fetch() {
        let (_tmp, store) = open_store(4).await;

        let identity = store
            .create_identity_with_embedding("ada", "ada@example.com", &[1.0, 0.0, 0.0, 0.0], Some("w600k_r50"), None)
            .await
            .unwrap();

        assert_eq!(identity.name, "ada");
        let fetched = store.identity(identity.id).await.unwrap().unwrap();
        assert_eq!(fetched.contact, "ada@example.com");
        assert_eq!(store.count_identities().await.unwrap(), 1);
        assert_eq!(store.count_embeddings().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let (_tmp, store) = open_store(4).await;
        store
            .create_identity_with_embedding("ada", "ada@example.com", &[0.0; 4], None, None)
            .await
            .unwrap();

        let err = store
            .create_identity_with_embedding("ada", "other@example.com", &[0.0; 4], None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateIdentity));

        // Transaction rolled back: no orphaned embedding row
        assert_eq!(store.count_identities().await.unwrap(), 1);
        assert_eq!(store.count_embeddings().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_contact_rejected() {
        let (_tmp, store) = open_store(4).await;
        store
            .create_identity_with_embedding("ada", "shared@example.com", &[0.0; 4], None, None)
            .await
            .unwrap();

        let err = store
            .create_identity_with_embedding("grace", "shared@example.com", &[0.0; 4], None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateIdentity));
    }

    #[tokio::test]
    async fn test_wrong_dimension_rejected() {
        let (_tmp, store) = open_store(4).await;

        let err = store
            .create_identity_with_embedding("ada", "ada@example.com", &[1.0, 2.0], None, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::DimensionMismatch { expected: 4, actual: 2 }
        ));
        assert_eq!(store.count_identities().await.unwrap(), 0);
        assert_eq!(store.count_embeddings().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_all_embeddings_roundtrip() {
        let (_tmp, store) = open_store(3).await;
        let a = store
            .create_identity_with_embedding("a", "a@x", &[1.0, 2.0, 3.0], None, None)
            .await
            .unwrap();
        let b = store
            .create_identity_with_embedding("b", "b@x", &[-1.5, 0.25, 8.0], None, None)
            .await
            .unwrap();

        let (rows, corrupt) = store.all_embeddings().await.unwrap();
        assert_eq!(corrupt, 0);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], (a.id, vec![1.0, 2.0, 3.0]));
        assert_eq!(rows[1], (b.id, vec![-1.5, 0.25, 8.0]));
    }

    #[tokio::test]
    async fn test_corrupt_blob_skipped() {
        let (_tmp, store) = open_store(3).await;
        let identity = store
            .create_identity_with_embedding("a", "a@x", &[1.0, 2.0, 3.0], None, None)
            .await
            .unwrap();

        // A BLOB that is not a whole number of f32s
        store.insert_raw_embedding(identity.id, vec![1, 2, 3]).await;

        let (rows, corrupt) = store.all_embeddings().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(corrupt, 1);
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let (_tmp, store) = open_store(2).await;
        let identity = store
            .create_identity_with_embedding("a", "a@x", &[1.0, 2.0], None, None)
            .await
            .unwrap();

        store.delete_identity(identity.id).await.unwrap();
        assert_eq!(store.count_identities().await.unwrap(), 0);
        assert_eq!(store.count_embeddings().await.unwrap(), 0);

        let err = store.delete_identity(identity.id).await.unwrap_err();
        assert!(matches!(err, StoreError::IdentityNotFound(_)));
    }

    #[tokio::test]
    async fn test_list_in_id_order() {
        let (_tmp, store) = open_store(2).await;
        store
            .create_identity_with_embedding("first", "1@x", &[0.0; 2], None, None)
            .await
            .unwrap();
        store
            .create_identity_with_embedding("second", "2@x", &[0.0; 2], None, None)
            .await
            .unwrap();

        let list = store.list_identities().await.unwrap();
        assert_eq!(list.len(), 2);
        assert!(list[0].id < list[1].id);
        assert_eq!(list[0].name, "first");
    }

    #[tokio::test]
    async fn test_blob_encoding() {
        let v = [1.0f32, -2.5, 0.0];
        let blob = vector_to_blob(&v);
        assert_eq!(blob.len(), 12);
        assert_eq!(blob_to_vector(&blob).unwrap(), v.to_vec());
        assert!(blob_to_vector(&blob[..5]).is_none());
    }
}
