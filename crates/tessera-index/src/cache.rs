//! Content-addressed embedding cache.
//!
//! Entries are keyed by the SHA-256 of a file's full content, so an unchanged
//! file is never re-embedded and byte-identical files share one entry. The
//! cache never fails the caller: persistence problems degrade lookups to a
//! miss and writes to a no-op.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tessera_core::{file_identity, Metadata, TesseraError};
use tracing::{debug, error, warn};

use crate::store::{bytes_to_floats, floats_to_bytes};

const HASH_BUFFER_SIZE: usize = 8192;

/// SHA-256 of a file's content, read in fixed-size chunks.
///
/// # Errors
///
/// Returns [`TesseraError::Io`] if the file cannot be read.
///
/// # Examples
///
/// ```
/// use tessera_index::cache::hash_file;
///
/// let dir = tempfile::tempdir().unwrap();
/// let path = dir.path().join("a.rs");
/// std::fs::write(&path, "fn main() {}").unwrap();
/// assert_eq!(hash_file(&path).unwrap().len(), 64);
/// ```
pub fn hash_file(path: &Path) -> Result<String, TesseraError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; HASH_BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// SHA-256 of in-memory content; equal to [`hash_file`] over the same bytes.
pub fn hash_bytes(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// A cached embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// SHA-256 of the content the embedding was computed from.
    pub content_hash: String,
    /// Path the entry was written for.
    pub source_path: String,
    /// Embedding vector.
    pub embedding: Vec<f32>,
    /// Schema-less extras.
    pub metadata: Metadata,
    /// When the entry was written.
    pub cached_at: DateTime<Utc>,
}

/// Periodic summary write gate.
///
/// Every write calls [`record_write`](Self::record_write); once `every`
/// writes have accumulated it returns `true` and starts counting again.
/// [`reset`](Self::reset) discards pending writes, used after a clear or a
/// forced flush.
///
/// # Examples
///
/// ```
/// use tessera_index::cache::SummaryCadence;
///
/// let mut cadence = SummaryCadence::new(3);
/// assert!(!cadence.record_write());
/// assert!(!cadence.record_write());
/// assert!(cadence.record_write());
/// assert_eq!(cadence.pending(), 0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryCadence {
    every: u32,
    pending: u32,
}

impl SummaryCadence {
    /// Flush every `every` writes. Zero is treated as one.
    pub fn new(every: u32) -> Self {
        Self {
            every: every.max(1),
            pending: 0,
        }
    }

    /// Count a write; `true` when a summary flush is due.
    pub fn record_write(&mut self) -> bool {
        self.pending += 1;
        if self.pending >= self.every {
            self.pending = 0;
            true
        } else {
            false
        }
    }

    /// Drop pending writes.
    pub fn reset(&mut self) {
        self.pending = 0;
    }

    /// Writes since the last flush.
    pub fn pending(&self) -> u32 {
        self.pending
    }

    /// Configured flush interval.
    pub fn every(&self) -> u32 {
        self.every
    }
}

/// Persisted aggregate of the cache contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSummary {
    /// Entries in the cache when last written.
    pub total_cached: u64,
    /// Approximate stored bytes.
    pub approx_size_bytes: u64,
    /// When the summary was last written.
    pub updated_at: Option<DateTime<Utc>>,
}

/// Counters for one cache handle plus the persisted summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Lookups that returned an entry.
    pub hits: u64,
    /// Lookups that did not.
    pub misses: u64,
    /// Successful writes.
    pub saves: u64,
    /// `hits + misses`.
    pub total_requests: u64,
    /// `hits / total_requests`, zero without requests.
    pub hit_rate: f64,
    /// Entries in the cache.
    pub total_cached: u64,
    /// Approximate stored bytes.
    pub approx_size_bytes: u64,
}

/// SQLite-backed content-addressed embedding cache.
///
/// Safe to share across worker tasks; all access goes through one
/// connection behind a mutex.
///
/// # Examples
///
/// ```
/// use tessera_index::cache::ContentAddressedCache;
///
/// let cache = ContentAddressedCache::in_memory(10).unwrap();
/// assert_eq!(cache.stats().total_cached, 0);
/// ```
pub struct ContentAddressedCache {
    conn: Mutex<Connection>,
    root: Option<PathBuf>,
    cadence: Mutex<SummaryCadence>,
    hits: AtomicU64,
    misses: AtomicU64,
    saves: AtomicU64,
}

impl std::fmt::Debug for ContentAddressedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentAddressedCache")
            .field("root", &self.root)
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .field("saves", &self.saves.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ContentAddressedCache {
    /// Open or create a cache at `path`, writing the summary every
    /// `summary_every` saves.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::Database`] if the database cannot be opened.
    pub fn open(path: &Path, summary_every: u32) -> Result<Self, TesseraError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TesseraError::Database(format!("failed to create cache directory: {e}"))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| TesseraError::Database(format!("failed to open cache: {e}")))?;
        Self::with_connection(conn, summary_every)
    }

    /// Create an in-memory cache (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::Database`] if schema creation fails.
    pub fn in_memory(summary_every: u32) -> Result<Self, TesseraError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            TesseraError::Database(format!("failed to create in-memory cache: {e}"))
        })?;
        Self::with_connection(conn, summary_every)
    }

    fn with_connection(conn: Connection, summary_every: u32) -> Result<Self, TesseraError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS cache_entries (
                content_hash TEXT PRIMARY KEY,
                source_path TEXT NOT NULL,
                embedding BLOB NOT NULL,
                metadata TEXT NOT NULL,
                cached_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cache_summary (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                total_cached INTEGER NOT NULL,
                approx_size_bytes INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| TesseraError::Database(format!("failed to create cache schema: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
            root: None,
            cadence: Mutex::new(SummaryCadence::new(summary_every)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            saves: AtomicU64::new(0),
        })
    }

    /// Record source paths relative to `root`, so a moved checkout keeps
    /// its hits.
    pub fn rooted_at(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    fn identity(&self, path: &Path) -> String {
        match &self.root {
            Some(root) => file_identity(root, path),
            None => path.to_string_lossy().to_string(),
        }
    }

    /// Look up the cached embedding for `path` by its current content.
    ///
    /// Returns `None` on a miss, including when the content matches an entry
    /// written for a different path, and when hashing or the lookup fails.
    pub fn get(&self, path: &Path) -> Option<CacheEntry> {
        let source_path = self.identity(path);
        let entry = match self.lookup(path) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %source_path, "cache lookup failed, treating as miss: {e}");
                None
            }
        };

        match entry {
            Some(entry) if entry.source_path == source_path => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(path = %source_path, hash = %entry.content_hash, "cache hit");
                Some(entry)
            }
            Some(entry) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                warn!(
                    path = %source_path,
                    cached_path = %entry.source_path,
                    hash = %entry.content_hash,
                    "content hash matches an entry for another path, treating as miss"
                );
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(path = %source_path, "cache miss");
                None
            }
        }
    }

    /// Store `embedding` for the current content of `path`.
    ///
    /// Overwrites any entry with the same content hash. Failures are logged
    /// and otherwise ignored.
    pub fn put(&self, path: &Path, embedding: &[f32], metadata: &Metadata) {
        if let Err(e) = self.store(path, embedding, metadata) {
            error!(path = %path.display(), "failed to write cache entry: {e}");
            return;
        }
        self.saves.fetch_add(1, Ordering::Relaxed);

        let flush_due = match self.cadence.lock() {
            Ok(mut cadence) => cadence.record_write(),
            Err(_) => false,
        };
        if flush_due {
            if let Err(e) = self.write_summary() {
                warn!("failed to write cache summary: {e}");
            }
        }
    }

    /// Remove every entry and reset the summary.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::Database`] if the tables cannot be cleared.
    pub fn clear(&self) -> Result<(), TesseraError> {
        let conn = self.conn()?;
        conn.execute_batch("DELETE FROM cache_entries; DELETE FROM cache_summary;")
            .map_err(|e| TesseraError::Database(format!("failed to clear cache: {e}")))?;
        drop(conn);

        if let Ok(mut cadence) = self.cadence.lock() {
            cadence.reset();
        }
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.saves.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Write the summary now regardless of the cadence.
    pub fn flush_summary(&self) {
        if let Err(e) = self.write_summary() {
            warn!("failed to write cache summary: {e}");
            return;
        }
        if let Ok(mut cadence) = self.cadence.lock() {
            cadence.reset();
        }
    }

    /// The persisted summary, if one has been written.
    pub fn summary(&self) -> Option<CacheSummary> {
        self.read_summary()
            .map_err(|e| warn!("failed to read cache summary: {e}"))
            .ok()
            .flatten()
    }

    /// Counters for this handle plus the current cache size.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total_requests = hits + misses;
        let hit_rate = if total_requests == 0 {
            0.0
        } else {
            hits as f64 / total_requests as f64
        };

        let (total_cached, approx_size_bytes) = self.measure().unwrap_or_else(|e| {
            warn!("failed to measure cache, using last summary: {e}");
            self.summary()
                .map(|s| (s.total_cached, s.approx_size_bytes))
                .unwrap_or_default()
        });

        CacheStats {
            hits,
            misses,
            saves: self.saves.load(Ordering::Relaxed),
            total_requests,
            hit_rate,
            total_cached,
            approx_size_bytes,
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, TesseraError> {
        self.conn
            .lock()
            .map_err(|_| TesseraError::Database("cache connection poisoned".into()))
    }

    fn lookup(&self, path: &Path) -> Result<Option<CacheEntry>, TesseraError> {
        let hash = hash_file(path)?;
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT source_path, embedding, metadata, cached_at
                 FROM cache_entries WHERE content_hash = ?1",
                params![hash],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| TesseraError::Database(format!("failed to read cache entry: {e}")))?;

        let Some((source_path, embedding, metadata, cached_at)) = row else {
            return Ok(None);
        };
        let cached_at = DateTime::parse_from_rfc3339(&cached_at)
            .map_err(|e| TesseraError::Database(format!("corrupt cache timestamp: {e}")))?
            .with_timezone(&Utc);

        Ok(Some(CacheEntry {
            content_hash: hash,
            source_path,
            embedding: bytes_to_floats(&embedding),
            metadata: serde_json::from_str(&metadata)?,
            cached_at,
        }))
    }

    fn store(&self, path: &Path, embedding: &[f32], metadata: &Metadata) -> Result<(), TesseraError> {
        let hash = hash_file(path)?;
        let metadata = serde_json::to_string(metadata)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO cache_entries
             (content_hash, source_path, embedding, metadata, cached_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                hash,
                self.identity(path),
                floats_to_bytes(embedding),
                metadata,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(|e| TesseraError::Database(format!("failed to write cache entry: {e}")))?;
        debug!(path = %path.display(), hash = %hash, "cached embedding");
        Ok(())
    }

    fn measure(&self) -> Result<(u64, u64), TesseraError> {
        let conn = self.conn()?;
        let (count, size): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(LENGTH(embedding) + LENGTH(metadata) + LENGTH(source_path)), 0)
                 FROM cache_entries",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| TesseraError::Database(format!("failed to measure cache: {e}")))?;
        Ok((count as u64, size as u64))
    }

    fn write_summary(&self) -> Result<(), TesseraError> {
        let (total_cached, approx_size_bytes) = self.measure()?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO cache_summary (id, total_cached, approx_size_bytes, updated_at)
             VALUES (1, ?1, ?2, ?3)",
            params![
                total_cached as i64,
                approx_size_bytes as i64,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(|e| TesseraError::Database(format!("failed to write cache summary: {e}")))?;
        debug!(total_cached, approx_size_bytes, "wrote cache summary");
        Ok(())
    }

    fn read_summary(&self) -> Result<Option<CacheSummary>, TesseraError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT total_cached, approx_size_bytes, updated_at FROM cache_summary WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| TesseraError::Database(format!("failed to read cache summary: {e}")))?;

        Ok(row.map(|(total_cached, approx_size_bytes, updated_at)| CacheSummary {
            total_cached: total_cached as u64,
            approx_size_bytes: approx_size_bytes as u64,
            updated_at: DateTime::parse_from_rfc3339(&updated_at)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn hash_is_stable_and_content_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.rs", "fn a() {}");
        let b = write(dir.path(), "b.rs", "fn a() {}");
        let c = write(dir.path(), "c.rs", "fn a() {} ");

        assert_eq!(hash_file(&a).unwrap(), hash_file(&b).unwrap());
        assert_ne!(hash_file(&a).unwrap(), hash_file(&c).unwrap());
        assert_eq!(hash_file(&a).unwrap(), hash_bytes(b"fn a() {}"));
    }

    #[test]
    fn hash_covers_content_past_one_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let body = "x".repeat(HASH_BUFFER_SIZE * 3);
        let a = write(dir.path(), "a.txt", &body);
        let b = write(dir.path(), "b.txt", &format!("{body}y"));
        assert_ne!(hash_file(&a).unwrap(), hash_file(&b).unwrap());
    }

    #[test]
    fn put_then_get_hits() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "a.rs", "fn a() {}");
        let cache = ContentAddressedCache::in_memory(10).unwrap();

        assert!(cache.get(&path).is_none());
        let mut metadata = Metadata::new();
        metadata.insert("language".into(), serde_json::json!("rust"));
        cache.put(&path, &[0.1, 0.2], &metadata);

        let entry = cache.get(&path).unwrap();
        assert_eq!(entry.embedding, vec![0.1, 0.2]);
        assert_eq!(entry.metadata["language"], "rust");

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.saves), (1, 1, 1));
        assert_eq!(stats.total_cached, 1);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn appended_byte_misses_and_keeps_old_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "a.rs", "line\n".repeat(10).as_str());
        let cache = ContentAddressedCache::in_memory(10).unwrap();
        cache.put(&path, &[1.0], &Metadata::new());
        let original = hash_file(&path).unwrap();

        fs::write(&path, format!("{}x", "line\n".repeat(10))).unwrap();
        assert!(cache.get(&path).is_none());

        let conn = cache.conn().unwrap();
        let still_there: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM cache_entries WHERE content_hash = ?1",
                params![original],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(still_there, 1);
    }

    #[test]
    fn identical_content_shares_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.rs", "same");
        let b = write(dir.path(), "b.rs", "same");
        let cache = ContentAddressedCache::in_memory(10).unwrap();

        cache.put(&a, &[1.0], &Metadata::new());
        cache.put(&b, &[1.0], &Metadata::new());
        assert_eq!(cache.stats().total_cached, 1);
    }

    #[test]
    fn same_content_under_other_path_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.rs", "same");
        let b = write(dir.path(), "b.rs", "same");
        let cache = ContentAddressedCache::in_memory(10).unwrap();

        cache.put(&a, &[1.0], &Metadata::new());
        assert!(cache.get(&b).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn unreadable_file_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.rs");
        let cache = ContentAddressedCache::in_memory(10).unwrap();

        assert!(cache.get(&missing).is_none());
        cache.put(&missing, &[1.0], &Metadata::new());
        let stats = cache.stats();
        assert_eq!(stats.saves, 0);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn summary_written_on_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentAddressedCache::in_memory(2).unwrap();

        let a = write(dir.path(), "a.rs", "a");
        cache.put(&a, &[1.0], &Metadata::new());
        assert!(cache.summary().is_none());

        let b = write(dir.path(), "b.rs", "b");
        cache.put(&b, &[1.0], &Metadata::new());
        assert_eq!(cache.summary().unwrap().total_cached, 2);

        let c = write(dir.path(), "c.rs", "c");
        cache.put(&c, &[1.0], &Metadata::new());
        assert_eq!(cache.summary().unwrap().total_cached, 2);
        cache.flush_summary();
        assert_eq!(cache.summary().unwrap().total_cached, 3);
    }

    #[test]
    fn clear_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "a.rs", "a");
        let cache = ContentAddressedCache::in_memory(1).unwrap();
        cache.put(&path, &[1.0], &Metadata::new());
        assert!(cache.summary().is_some());

        cache.clear().unwrap();
        assert!(cache.get(&path).is_none());
        assert!(cache.summary().is_none());
        assert_eq!(cache.stats().total_cached, 0);
    }

    #[test]
    fn cadence_zero_means_every_write() {
        let mut cadence = SummaryCadence::new(0);
        assert_eq!(cadence.every(), 1);
        assert!(cadence.record_write());
        assert!(cadence.record_write());
    }

    #[test]
    fn cadence_reset_discards_pending() {
        let mut cadence = SummaryCadence::new(3);
        cadence.record_write();
        cadence.record_write();
        cadence.reset();
        assert!(!cadence.record_write());
        assert_eq!(cadence.pending(), 1);
    }

    #[test]
    fn persisted_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join(".tessera/cache.db");
        let path = write(dir.path(), "a.rs", "a");
        {
            let cache = ContentAddressedCache::open(&db, 10).unwrap();
            cache.put(&path, &[0.5, 0.25], &Metadata::new());
        }
        let cache = ContentAddressedCache::open(&db, 10).unwrap();
        assert_eq!(cache.get(&path).unwrap().embedding, vec![0.5, 0.25]);
    }

    #[test]
    fn rooted_cache_records_repository_relative_paths() {
        let db_dir = tempfile::tempdir().unwrap();
        let db = db_dir.path().join("cache.db");
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        fs::create_dir_all(first.path().join("src")).unwrap();
        fs::create_dir_all(second.path().join("src")).unwrap();
        let original = write(first.path(), "src/a.rs", "fn a() {}");
        let moved = write(second.path(), "src/a.rs", "fn a() {}");
        {
            let cache = ContentAddressedCache::open(&db, 10)
                .unwrap()
                .rooted_at(first.path());
            cache.put(&original, &[0.5], &Metadata::new());
            assert_eq!(cache.get(&original).unwrap().source_path, "src/a.rs");
        }

        let cache = ContentAddressedCache::open(&db, 10)
            .unwrap()
            .rooted_at(second.path());
        assert_eq!(cache.get(&moved).unwrap().embedding, vec![0.5]);
        assert_eq!(cache.stats().hits, 1);
    }
}
