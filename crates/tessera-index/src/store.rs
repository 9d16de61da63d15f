//! Vector store gateway and the local SQLite adapter.
//!
//! Points are stored with their embedding as a BLOB; cosine similarity is
//! computed in Rust at query time, which is plenty for a single repository.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tessera_core::{Metadata, TesseraError};
use uuid::Uuid;

/// Deterministic point id for a file identity.
///
/// The same repository-relative path always maps to the same id, so
/// re-uploading a file overwrites its point instead of duplicating it.
///
/// # Examples
///
/// ```
/// use tessera_index::store::point_id;
///
/// assert_eq!(point_id("src/lib.rs"), point_id("src/lib.rs"));
/// assert_ne!(point_id("src/lib.rs"), point_id("src/main.rs"));
/// ```
pub fn point_id(file_identity: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, file_identity.as_bytes())
}

/// Payload attached to each point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PointPayload {
    /// Repository-relative file identity.
    pub file_path: String,
    /// SHA-256 of the file content that produced the vector.
    pub content_hash: String,
    /// File size in bytes.
    pub file_size: u64,
    /// RFC 3339 timestamp of the upload.
    pub indexed_at: String,
    /// Leading excerpt of the file.
    pub preview: String,
    /// Extra schema-less fields.
    #[serde(flatten)]
    pub metadata: Metadata,
}

/// One vector-store record, corresponding to a single indexed file.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    /// Deterministic id, see [`point_id`].
    pub id: Uuid,
    /// Embedding vector.
    pub vector: Vec<f32>,
    /// Descriptive payload.
    pub payload: PointPayload,
}

/// A ranked search candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Point id.
    pub id: Uuid,
    /// Similarity score as reported by the store.
    pub score: f64,
    /// Payload stored with the point.
    pub payload: PointPayload,
}

/// Narrow contract over a vector database.
#[async_trait]
pub trait VectorStoreGateway: Send + Sync {
    /// Create `collection` if needed and check it holds `dimensions`-wide vectors.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::DimensionMismatch`] if the collection exists
    /// with another width.
    async fn ensure_collection(&self, collection: &str, dimensions: usize)
        -> Result<(), TesseraError>;

    /// Insert or overwrite `points` by id.
    async fn upsert(&self, collection: &str, points: &[Point]) -> Result<(), TesseraError>;

    /// Up to `limit` points most similar to `vector` with score at least `min_score`.
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        min_score: f64,
    ) -> Result<Vec<Candidate>, TesseraError>;

    /// Number of points in `collection`.
    async fn count(&self, collection: &str) -> Result<u64, TesseraError>;
}

/// [`VectorStoreGateway`] backed by a local SQLite file.
///
/// # Examples
///
/// ```
/// use tessera_index::store::SqliteVectorStore;
///
/// let store = SqliteVectorStore::in_memory().unwrap();
/// ```
pub struct SqliteVectorStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteVectorStore").finish_non_exhaustive()
    }
}

impl SqliteVectorStore {
    /// Open or create a store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::Database`] if the database cannot be opened.
    pub fn open(path: &Path) -> Result<Self, TesseraError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TesseraError::Database(format!("failed to create store directory: {e}"))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| TesseraError::Database(format!("failed to open database: {e}")))?;
        Self::with_connection(conn)
    }

    /// Create an in-memory store (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::Database`] if schema creation fails.
    pub fn in_memory() -> Result<Self, TesseraError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            TesseraError::Database(format!("failed to create in-memory database: {e}"))
        })?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, TesseraError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS collections (
                name TEXT PRIMARY KEY,
                dimensions INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS points (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                vector BLOB NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            );
            ",
        )
        .map_err(|e| TesseraError::Database(format!("failed to create schema: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, TesseraError> {
        self.conn
            .lock()
            .map_err(|_| TesseraError::Database("vector store connection poisoned".into()))
    }

    fn dimensions(conn: &Connection, collection: &str) -> Result<Option<usize>, TesseraError> {
        let dims: Option<i64> = conn
            .query_row(
                "SELECT dimensions FROM collections WHERE name = ?1",
                params![collection],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| {
                TesseraError::Database(format!("failed to read collection '{collection}': {e}"))
            })?;
        Ok(dims.map(|d| d as usize))
    }
}

#[async_trait]
impl VectorStoreGateway for SqliteVectorStore {
    async fn ensure_collection(
        &self,
        collection: &str,
        dimensions: usize,
    ) -> Result<(), TesseraError> {
        let conn = self.conn()?;
        match Self::dimensions(&conn, collection)? {
            Some(stored) if stored != dimensions => Err(TesseraError::DimensionMismatch {
                expected: stored,
                actual: dimensions,
            }),
            Some(_) => Ok(()),
            None => {
                conn.execute(
                    "INSERT INTO collections (name, dimensions) VALUES (?1, ?2)",
                    params![collection, dimensions as i64],
                )
                .map_err(|e| {
                    TesseraError::Database(format!(
                        "failed to create collection '{collection}': {e}"
                    ))
                })?;
                Ok(())
            }
        }
    }

    async fn upsert(&self, collection: &str, points: &[Point]) -> Result<(), TesseraError> {
        let mut conn = self.conn()?;
        let dims = Self::dimensions(&conn, collection)?.ok_or_else(|| {
            TesseraError::Config(format!("collection '{collection}' does not exist"))
        })?;

        for point in points {
            if point.vector.len() != dims {
                return Err(TesseraError::DimensionMismatch {
                    expected: dims,
                    actual: point.vector.len(),
                });
            }
        }

        let tx = conn
            .transaction()
            .map_err(|e| TesseraError::Database(format!("failed to begin transaction: {e}")))?;
        for point in points {
            let payload = serde_json::to_string(&point.payload)?;
            tx.execute(
                "INSERT OR REPLACE INTO points (collection, id, vector, payload)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    collection,
                    point.id.to_string(),
                    floats_to_bytes(&point.vector),
                    payload
                ],
            )
            .map_err(|e| TesseraError::Database(format!("failed to upsert point: {e}")))?;
        }
        tx.commit()
            .map_err(|e| TesseraError::Database(format!("failed to commit points: {e}")))?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        min_score: f64,
    ) -> Result<Vec<Candidate>, TesseraError> {
        let conn = self.conn()?;
        if Self::dimensions(&conn, collection)?.is_none() {
            return Err(TesseraError::Config(format!(
                "collection '{collection}' does not exist"
            )));
        }

        let mut stmt = conn
            .prepare("SELECT id, vector, payload FROM points WHERE collection = ?1")
            .map_err(|e| TesseraError::Database(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map(params![collection], |row| {
                let id: String = row.get(0)?;
                let bytes: Vec<u8> = row.get(1)?;
                let payload: String = row.get(2)?;
                Ok((id, cosine_similarity(vector, &bytes_to_floats(&bytes)), payload))
            })
            .map_err(|e| TesseraError::Database(format!("failed to query points: {e}")))?;

        let mut scored = Vec::new();
        for row in rows {
            let (id, score, payload) =
                row.map_err(|e| TesseraError::Database(format!("failed to read row: {e}")))?;
            if score < min_score {
                continue;
            }
            let id = Uuid::parse_str(&id)
                .map_err(|e| TesseraError::Database(format!("corrupt point id '{id}': {e}")))?;
            scored.push(Candidate {
                id,
                score,
                payload: serde_json::from_str(&payload)?,
            });
        }

        scored.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn count(&self, collection: &str) -> Result<u64, TesseraError> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM points WHERE collection = ?1",
                params![collection],
                |row| row.get(0),
            )
            .map_err(|e| TesseraError::Database(format!("failed to count points: {e}")))?;
        Ok(count as u64)
    }
}

pub(crate) fn floats_to_bytes(floats: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(floats.len() * 4);
    for f in floats {
        bytes.extend_from_slice(&f.to_le_bytes());
    }
    bytes
}

pub(crate) fn bytes_to_floats(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(path: &str, vector: Vec<f32>) -> Point {
        Point {
            id: point_id(path),
            vector,
            payload: PointPayload {
                file_path: path.into(),
                ..PointPayload::default()
            },
        }
    }

    #[tokio::test]
    async fn search_ranks_by_cosine() {
        let store = SqliteVectorStore::in_memory().unwrap();
        store.ensure_collection("code", 3).await.unwrap();
        store
            .upsert(
                "code",
                &[
                    point("src/auth.rs", vec![1.0, 0.0, 0.0]),
                    point("src/json.rs", vec![0.0, 1.0, 0.0]),
                ],
            )
            .await
            .unwrap();

        let hits = store.search("code", &[0.9, 0.1, 0.0], 5, 0.0).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].payload.file_path, "src/auth.rs");
        assert!(hits[0].score > hits[1].score);

        let filtered = store.search("code", &[0.9, 0.1, 0.0], 5, 0.5).await.unwrap();
        assert_eq!(filtered.len(), 1);
    }

    #[tokio::test]
    async fn upsert_overwrites_by_id() {
        let store = SqliteVectorStore::in_memory().unwrap();
        store.ensure_collection("code", 2).await.unwrap();
        store
            .upsert("code", &[point("a.rs", vec![1.0, 0.0])])
            .await
            .unwrap();
        store
            .upsert("code", &[point("a.rs", vec![0.0, 1.0])])
            .await
            .unwrap();

        assert_eq!(store.count("code").await.unwrap(), 1);
        let hits = store.search("code", &[0.0, 1.0], 1, 0.0).await.unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_configuration_error() {
        let store = SqliteVectorStore::in_memory().unwrap();
        store.ensure_collection("code", 3).await.unwrap();

        let err = store.ensure_collection("code", 4).await.unwrap_err();
        assert!(matches!(
            err,
            TesseraError::DimensionMismatch {
                expected: 3,
                actual: 4
            }
        ));

        let err = store
            .upsert("code", &[point("a.rs", vec![1.0])])
            .await
            .unwrap_err();
        assert!(err.kind().is_fatal());
    }

    #[tokio::test]
    async fn missing_collection_is_rejected() {
        let store = SqliteVectorStore::in_memory().unwrap();
        assert!(store.search("nope", &[1.0], 5, 0.0).await.is_err());
        assert_eq!(store.count("nope").await.unwrap(), 0);
    }

    #[test]
    fn payload_metadata_is_flattened() {
        let mut payload = PointPayload {
            file_path: "src/lib.rs".into(),
            ..PointPayload::default()
        };
        payload
            .metadata
            .insert("language".into(), serde_json::json!("rust"));

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["file_path"], "src/lib.rs");
        assert_eq!(json["language"], "rust");

        let back: PointPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn cosine_similarity_correct() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn floats_bytes_roundtrip() {
        let original = vec![1.0f32, -2.5, 0.0, 3.5];
        assert_eq!(bytes_to_floats(&floats_to_bytes(&original)), original);
    }
}
