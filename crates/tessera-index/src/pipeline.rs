//! Embedding pipeline: cache lookup, embedding on miss, batched upload.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tessera_core::{file_identity, ErrorKind, Metadata, TesseraConfig, TesseraError};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cache::{hash_bytes, ContentAddressedCache};
use crate::embedding::EmbeddingProvider;
use crate::store::{point_id, Point, PointPayload, VectorStoreGateway};

const PREVIEW_CHARS: usize = 500;

/// Cooperative stop request for a running pipeline.
///
/// Checked between batches only, so an in-flight batch always completes.
///
/// # Examples
///
/// ```
/// use tessera_index::pipeline::StopSignal;
///
/// let stop = StopSignal::new();
/// let handle = stop.clone();
/// handle.stop();
/// assert!(stop.is_stopped());
/// ```
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// A signal that has not been raised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the pipeline to stop after the current batch.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Tunables for [`EmbeddingPipeline`].
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Target vector-store collection.
    pub collection: String,
    /// Files per upsert batch.
    pub batch_size: usize,
    /// Concurrent per-file workers.
    pub workers: usize,
    /// Upper bound on one embedding call.
    pub embed_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_config(&TesseraConfig::default())
    }
}

impl PipelineOptions {
    /// Options taken from the loaded configuration.
    pub fn from_config(config: &TesseraConfig) -> Self {
        Self {
            collection: config.vector_store.collection.clone(),
            batch_size: config.index.batch_size.max(1),
            workers: config.index.workers.max(1),
            embed_timeout: Duration::from_secs(config.embedding.timeout_secs.max(1)),
        }
    }
}

/// A file the pipeline could not index this run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedFile {
    /// Absolute path.
    pub path: PathBuf,
    /// Last error seen for it.
    pub error: String,
}

/// Outcome of one [`EmbeddingPipeline::index`] call.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    /// Files handed to the pipeline.
    pub requested: usize,
    /// Points upserted.
    pub uploaded: usize,
    /// Files served from the cache.
    pub cache_hits: usize,
    /// Files sent to the embedding provider.
    pub embedded: usize,
    /// Empty files, which have nothing to embed.
    pub skipped: usize,
    /// Files that failed and will be retried next run.
    pub failed: Vec<FailedFile>,
    /// Batches completed.
    pub batches: usize,
    /// Wall-clock time.
    pub elapsed: Duration,
    /// Whether a stop signal ended the run early.
    pub cancelled: bool,
}

impl PipelineReport {
    /// `true` when every requested file was handled and the run was not cut short.
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.failed.is_empty()
    }

    /// Upload throughput over the whole run.
    pub fn points_per_second(&self) -> f64 {
        rate(self.uploaded, self.elapsed)
    }
}

enum FileOutcome {
    Staged { point: Point, cache_hit: bool },
    Skipped,
}

/// Per-file work, shared by every task of a batch.
#[derive(Clone)]
struct FileWorker {
    cache: Arc<ContentAddressedCache>,
    provider: Arc<dyn EmbeddingProvider>,
    root: PathBuf,
    embed_timeout: Duration,
}

impl FileWorker {
    async fn process(&self, path: PathBuf) -> Result<FileOutcome, TesseraError> {
        let bytes = tokio::fs::read(&path).await?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        if text.trim().is_empty() {
            debug!(path = %path.display(), "skipping empty file");
            return Ok(FileOutcome::Skipped);
        }

        let identity = file_identity(&self.root, &path);
        let metadata = file_metadata(&path, &text);

        let cache = Arc::clone(&self.cache);
        let lookup_path = path.clone();
        let cached = tokio::task::spawn_blocking(move || cache.get(&lookup_path))
            .await
            .unwrap_or_else(|e| {
                warn!("cache lookup task failed: {e}");
                None
            })
            .filter(|entry| {
                let fits = entry.embedding.len() == self.provider.dimensions();
                if !fits {
                    warn!(
                        path = %path.display(),
                        cached = entry.embedding.len(),
                        expected = self.provider.dimensions(),
                        "cached embedding has the wrong width, re-embedding"
                    );
                }
                fits
            });

        let (embedding, content_hash, cache_hit) = match cached {
            Some(entry) => (entry.embedding, entry.content_hash, true),
            None => {
                let embedding = self.embed_with_retry(&path, &text).await?;
                let cache = Arc::clone(&self.cache);
                let store_path = path.clone();
                let cached_embedding = embedding.clone();
                let cached_metadata = metadata.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || {
                    cache.put(&store_path, &cached_embedding, &cached_metadata)
                })
                .await
                {
                    warn!("cache write task failed: {e}");
                }
                (embedding, hash_bytes(&bytes), false)
            }
        };

        Ok(FileOutcome::Staged {
            point: Point {
                id: point_id(&identity),
                vector: embedding,
                payload: PointPayload {
                    file_path: identity,
                    content_hash,
                    file_size: bytes.len() as u64,
                    indexed_at: Utc::now().to_rfc3339(),
                    preview: text.chars().take(PREVIEW_CHARS).collect(),
                    metadata,
                },
            },
            cache_hit,
        })
    }

    async fn embed_with_retry(&self, path: &Path, text: &str) -> Result<Vec<f32>, TesseraError> {
        match self.embed_once(text).await {
            Err(e) if e.kind().is_retryable() => {
                warn!(path = %path.display(), "embedding failed, retrying once: {e}");
                self.embed_once(text).await
            }
            other => other,
        }
    }

    async fn embed_once(&self, text: &str) -> Result<Vec<f32>, TesseraError> {
        tokio::time::timeout(self.embed_timeout, self.provider.embed(text))
            .await
            .map_err(|_| TesseraError::timeout("embedding", self.embed_timeout.as_secs()))?
    }
}

/// Indexes files into the vector store, reusing cached embeddings.
///
/// Collaborators are injected at construction; the pipeline keeps no other
/// state between runs.
pub struct EmbeddingPipeline {
    worker: FileWorker,
    store: Arc<dyn VectorStoreGateway>,
    options: PipelineOptions,
}

impl std::fmt::Debug for EmbeddingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingPipeline")
            .field("root", &self.worker.root)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl EmbeddingPipeline {
    /// Create a pipeline for files under `root`.
    pub fn new(
        cache: Arc<ContentAddressedCache>,
        provider: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStoreGateway>,
        root: PathBuf,
        options: PipelineOptions,
    ) -> Self {
        let options = PipelineOptions {
            batch_size: options.batch_size.max(1),
            workers: options.workers.max(1),
            ..options
        };
        Self {
            worker: FileWorker {
                cache,
                provider,
                root,
                embed_timeout: options.embed_timeout,
            },
            store,
            options,
        }
    }

    /// The cache this pipeline reads and fills.
    pub fn cache(&self) -> &Arc<ContentAddressedCache> {
        &self.worker.cache
    }

    /// Index `paths`, uploading one batch at a time.
    ///
    /// A file that fails to embed is recorded in the report and does not
    /// stop the run. Batches already uploaded stay uploaded if a later one
    /// fails.
    ///
    /// # Errors
    ///
    /// Returns a configuration error (such as a dimension mismatch) as soon
    /// as it is seen, and any vector-store error from creating the
    /// collection or uploading a batch.
    pub async fn index(
        &self,
        paths: &[PathBuf],
        stop: &StopSignal,
    ) -> Result<PipelineReport, TesseraError> {
        let started = Instant::now();
        let collection = &self.options.collection;
        self.store
            .ensure_collection(collection, self.worker.provider.dimensions())
            .await?;

        let mut report = PipelineReport {
            requested: paths.len(),
            ..PipelineReport::default()
        };
        let total_batches = paths.len().div_ceil(self.options.batch_size);
        info!(
            files = paths.len(),
            batches = total_batches,
            collection = %collection,
            "starting embedding pipeline"
        );

        for (batch_index, batch) in paths.chunks(self.options.batch_size).enumerate() {
            if stop.is_stopped() {
                info!(
                    completed = report.batches,
                    remaining = total_batches - report.batches,
                    "stop requested, ending run between batches"
                );
                report.cancelled = true;
                break;
            }

            let batch_started = Instant::now();
            let points = self.process_batch(batch, &mut report).await?;
            let uploaded = points.len();
            if !points.is_empty() {
                self.store.upsert(collection, &points).await?;
            }

            report.uploaded += uploaded;
            report.batches += 1;
            info!(
                batch = batch_index + 1,
                of = total_batches,
                uploaded,
                total_uploaded = report.uploaded,
                points_per_sec = %format!("{:.1}", rate(uploaded, batch_started.elapsed())),
                "uploaded batch"
            );
        }

        report.elapsed = started.elapsed();
        self.verify_count(report.uploaded).await;

        info!(
            uploaded = report.uploaded,
            failed = report.failed.len(),
            cache_hits = report.cache_hits,
            embedded = report.embedded,
            elapsed_secs = %format!("{:.2}", report.elapsed.as_secs_f64()),
            points_per_sec = %format!("{:.1}", report.points_per_second()),
            "embedding pipeline finished"
        );
        Ok(report)
    }

    async fn process_batch(
        &self,
        batch: &[PathBuf],
        report: &mut PipelineReport,
    ) -> Result<Vec<Point>, TesseraError> {
        let semaphore = Arc::new(Semaphore::new(self.options.workers));
        let mut tasks = Vec::with_capacity(batch.len());
        for path in batch {
            let worker = self.worker.clone();
            let semaphore = Arc::clone(&semaphore);
            let path = path.clone();
            let task_path = path.clone();
            tasks.push((
                path,
                tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.map_err(|e| {
                        TesseraError::ServiceUnavailable(format!("worker pool closed: {e}"))
                    })?;
                    worker.process(task_path).await
                }),
            ));
        }

        let mut points = Vec::with_capacity(batch.len());
        let mut fatal = None;
        for (path, task) in tasks {
            let outcome = task.await.unwrap_or_else(|e| {
                Err(TesseraError::ServiceUnavailable(format!(
                    "worker task failed: {e}"
                )))
            });
            match outcome {
                Ok(FileOutcome::Staged { point, cache_hit }) => {
                    if cache_hit {
                        report.cache_hits += 1;
                    } else {
                        report.embedded += 1;
                    }
                    points.push(point);
                }
                Ok(FileOutcome::Skipped) => report.skipped += 1,
                Err(e) if e.kind() == ErrorKind::Configuration => {
                    fatal.get_or_insert(e);
                }
                Err(e) => {
                    warn!(path = %path.display(), "failed to index file: {e}");
                    report.failed.push(FailedFile {
                        path,
                        error: e.to_string(),
                    });
                }
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(points),
        }
    }

    async fn verify_count(&self, uploaded: usize) {
        match self.store.count(&self.options.collection).await {
            Ok(count) if count < uploaded as u64 => warn!(
                count,
                uploaded,
                collection = %self.options.collection,
                "vector store holds fewer points than were uploaded"
            ),
            Ok(count) => debug!(count, "vector store count verified"),
            Err(e) => warn!("could not verify vector store count: {e}"),
        }
    }
}

fn file_metadata(path: &Path, text: &str) -> Metadata {
    let mut metadata = Metadata::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        metadata.insert("extension".into(), ext.to_lowercase().into());
    }
    metadata.insert("lines".into(), text.lines().count().into());
    metadata
}

fn rate(count: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}
