#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tessera_core::{GraphMetrics, GraphNeighbors, TesseraError};
use tessera_index::cache::ContentAddressedCache;
use tessera_index::embedding::EmbeddingProvider;
use tessera_index::graph::{GraphStatistics, GraphStoreGateway};
use tessera_index::pipeline::{EmbeddingPipeline, PipelineOptions, StopSignal};
use tessera_index::store::{point_id, Candidate, PointPayload, SqliteVectorStore};

pub const DIMS: usize = 8;

/// Deterministic provider: a byte histogram folded into `DIMS` buckets.
///
/// Texts containing `FAIL` always fail; texts containing `FLAKY` fail on
/// their first attempt only. Texts containing `HANG` never return.
#[derive(Default)]
pub struct FakeProvider {
    pub calls: AtomicUsize,
    pub flaky_seen: Mutex<Vec<String>>,
    pub stop_on_call: Option<StopSignal>,
}

impl FakeProvider {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn fake_vector(text: &str) -> Vec<f32> {
    let mut v = vec![1.0f32; DIMS];
    for b in text.bytes() {
        v[b as usize % DIMS] += 1.0;
    }
    v
}

#[async_trait]
impl EmbeddingProvider for FakeProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, TesseraError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(stop) = &self.stop_on_call {
            stop.stop();
        }
        if text.contains("HANG") {
            std::future::pending::<()>().await;
        }
        if text.contains("FAIL") {
            return Err(TesseraError::Embedding("provider rejected input".into()));
        }
        if text.contains("FLAKY") {
            let mut seen = self.flaky_seen.lock().unwrap();
            if !seen.iter().any(|t| t == text) {
                seen.push(text.to_string());
                return Err(TesseraError::timeout("embedding", 1));
            }
        }
        Ok(fake_vector(text))
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    fn model(&self) -> &str {
        "fake"
    }
}

/// Graph store with canned answers. `down` fails every call, `hang` never
/// answers.
#[derive(Default)]
pub struct FakeGraph {
    pub metrics: HashMap<String, GraphMetrics>,
    pub neighbors: HashMap<String, GraphNeighbors>,
    pub related: HashMap<String, Vec<String>>,
    pub statistics: GraphStatistics,
    pub down: bool,
    pub hang: bool,
}

impl FakeGraph {
    async fn reachable(&self) -> Result<(), TesseraError> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        if self.down {
            return Err(TesseraError::ServiceUnavailable("graph store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl GraphStoreGateway for FakeGraph {
    async fn metrics(&self, file_identity: &str) -> Result<GraphMetrics, TesseraError> {
        self.reachable().await?;
        Ok(self
            .metrics
            .get(file_identity)
            .copied()
            .unwrap_or_default())
    }

    async fn neighbors(
        &self,
        file_identity: &str,
        _limit: usize,
    ) -> Result<GraphNeighbors, TesseraError> {
        self.reachable().await?;
        Ok(self
            .neighbors
            .get(file_identity)
            .cloned()
            .unwrap_or_default())
    }

    async fn related(
        &self,
        file_identity: &str,
        _depth: usize,
        limit: usize,
    ) -> Result<Vec<String>, TesseraError> {
        self.reachable().await?;
        let mut files = self.related.get(file_identity).cloned().unwrap_or_default();
        files.truncate(limit);
        Ok(files)
    }

    async fn statistics(&self) -> Result<GraphStatistics, TesseraError> {
        self.reachable().await?;
        Ok(self.statistics)
    }
}

pub fn candidate(path: &str, score: f64) -> Candidate {
    Candidate {
        id: point_id(path),
        score,
        payload: PointPayload {
            file_path: path.into(),
            ..PointPayload::default()
        },
    }
}

pub struct Harness {
    pub root: PathBuf,
    pub cache: Arc<ContentAddressedCache>,
    pub provider: Arc<FakeProvider>,
    pub store: Arc<SqliteVectorStore>,
}

impl Harness {
    pub fn new(root: &Path, provider: FakeProvider) -> Self {
        Self {
            root: root.to_path_buf(),
            cache: Arc::new(ContentAddressedCache::in_memory(10).unwrap().rooted_at(root)),
            provider: Arc::new(provider),
            store: Arc::new(SqliteVectorStore::in_memory().unwrap()),
        }
    }

    pub fn pipeline(&self, batch_size: usize) -> EmbeddingPipeline {
        self.pipeline_with(PipelineOptions {
            batch_size,
            ..PipelineOptions::default()
        })
    }

    pub fn pipeline_with(&self, options: PipelineOptions) -> EmbeddingPipeline {
        EmbeddingPipeline::new(
            self.cache.clone(),
            self.provider.clone(),
            self.store.clone(),
            self.root.clone(),
            options,
        )
    }
}

pub fn write(root: &Path, name: &str, content: &str) -> PathBuf {
    let path = root.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
}

impl Harness {
    pub async fn store_count(&self) -> u64 {
        use tessera_index::store::VectorStoreGateway;
        self.store.count("code").await.unwrap()
    }
}
