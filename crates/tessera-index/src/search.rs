//! Hybrid ranking: vector similarity fused with code-graph connectivity.
//!
//! Candidates come from the vector store, oversampled so that graph signals
//! can promote files that sit just below the cut. Raw call counts are
//! squashed through `x / (x + c)` so no single hub file dominates.

use std::cmp::Ordering;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tessera_core::{
    ErrorKind, GraphMetrics, GraphNeighbors, LabelThresholds, ScoreWeights, SearchConfig,
    SearchResult, TesseraConfig, TesseraError,
};
use tracing::{debug, warn};

use crate::embedding::EmbeddingProvider;
use crate::graph::{GraphStatistics, GraphStoreGateway};
use crate::store::{Candidate, VectorStoreGateway};

/// Names kept per neighbour list on a result.
pub const NEIGHBOR_LIMIT: usize = 10;

/// Per-query knobs for [`HybridRanker::search`].
///
/// # Examples
///
/// ```
/// use tessera_index::search::SearchOptions;
///
/// let options = SearchOptions { limit: 5, ..SearchOptions::default() };
/// assert_eq!(options.limit, 5);
/// assert_eq!(options.min_semantic_score, 0.3);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    /// Results to return.
    pub limit: usize,
    /// Candidates below this similarity are dropped.
    pub min_semantic_score: f64,
    /// Fuse graph signals into the score.
    pub include_graph: bool,
    /// Fusion weights.
    pub weights: ScoreWeights,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self::from_config(&SearchConfig::default())
    }
}

impl SearchOptions {
    /// Defaults taken from the `[search]` section.
    pub fn from_config(config: &SearchConfig) -> Self {
        Self {
            limit: config.limit,
            min_semantic_score: config.min_semantic_score,
            include_graph: config.include_graph,
            weights: config.weights,
        }
    }
}

/// Squash a raw count into `[0, 1)`.
///
/// # Examples
///
/// ```
/// use tessera_index::search::saturate;
///
/// assert_eq!(saturate(0, 5.0), 0.0);
/// assert_eq!(saturate(5, 5.0), 0.5);
/// assert!(saturate(1_000_000, 5.0) < 1.0);
/// ```
pub fn saturate(count: u64, saturation: f64) -> f64 {
    let x = count as f64;
    x / (x + saturation)
}

/// Weighted fusion of a semantic score with graph metrics.
pub fn hybrid_score(
    semantic: f64,
    metrics: &GraphMetrics,
    weights: &ScoreWeights,
    saturation: f64,
) -> f64 {
    weights.semantic * semantic
        + weights.incoming * saturate(metrics.incoming_calls, saturation)
        + weights.outgoing * saturate(metrics.outgoing_calls, saturation)
        + weights.connections * saturate(metrics.related_count, saturation)
}

/// Result ordering: hybrid score, then semantic score, both descending,
/// then path ascending.
fn result_order(a: &SearchResult, b: &SearchResult) -> Ordering {
    b.hybrid_score
        .total_cmp(&a.hybrid_score)
        .then_with(|| b.semantic_score.total_cmp(&a.semantic_score))
        .then_with(|| a.source_path.cmp(&b.source_path))
}

/// Score, order, truncate, and label candidates.
///
/// `metrics` is `None` for semantic-only ranking; otherwise it is parallel
/// to `candidates`.
fn fuse(
    candidates: Vec<Candidate>,
    metrics: Option<Vec<GraphMetrics>>,
    weights: &ScoreWeights,
    saturation: f64,
    labels: &LabelThresholds,
    limit: usize,
) -> Vec<SearchResult> {
    let mut metrics = metrics.map(Vec::into_iter);
    let mut results: Vec<SearchResult> = candidates
        .into_iter()
        .map(|candidate| {
            let semantic = candidate.score;
            let (graph_metrics, hybrid) = match metrics.as_mut().and_then(|it| it.next()) {
                Some(m) => (m, hybrid_score(semantic, &m, weights, saturation)),
                None => (GraphMetrics::default(), semantic),
            };
            let payload = candidate.payload;
            SearchResult {
                source_path: payload.file_path,
                semantic_score: semantic,
                graph_metrics,
                hybrid_score: hybrid,
                relevance_label: labels.label(hybrid),
                neighbors: GraphNeighbors::default(),
                preview: Some(payload.preview).filter(|p| !p.is_empty()),
                indexed_at: Some(payload.indexed_at).filter(|t| !t.is_empty()),
            }
        })
        .collect();

    results.sort_by(result_order);
    results.truncate(limit);
    results
}

/// Combined size of the vector index and the code graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStatistics {
    /// Vector-store collection.
    pub collection: String,
    /// Points in the collection.
    pub points: u64,
    /// Graph entity counts, `None` when the graph store could not be read.
    pub graph: Option<GraphStatistics>,
}

/// Gather [`IndexStatistics`]; each store call is bounded by `timeout`.
///
/// # Errors
///
/// Returns [`TesseraError::ServiceUnavailable`] if the vector store cannot be
/// counted. A graph failure only leaves `graph` empty.
pub async fn index_statistics(
    store: &dyn VectorStoreGateway,
    graph: &dyn GraphStoreGateway,
    collection: &str,
    timeout: Duration,
) -> Result<IndexStatistics, TesseraError> {
    let points = with_timeout("vector count", timeout, store.count(collection))
        .await
        .map_err(unavailable("vector store"))?;
    let graph = match with_timeout("graph statistics", timeout, graph.statistics()).await {
        Ok(stats) => Some(stats),
        Err(e) => {
            warn!("graph statistics unavailable: {e}");
            None
        }
    };
    Ok(IndexStatistics {
        collection: collection.to_string(),
        points,
        graph,
    })
}

/// Files connected to `file_identity` through up to `depth` calls.
///
/// # Errors
///
/// Returns [`TesseraError::Config`] for a depth the graph store rejects, and
/// [`TesseraError::ServiceUnavailable`] if it cannot answer in time.
pub async fn related_files(
    graph: &dyn GraphStoreGateway,
    file_identity: &str,
    depth: usize,
    limit: usize,
    timeout: Duration,
) -> Result<Vec<String>, TesseraError> {
    with_timeout(
        "related files",
        timeout,
        graph.related(file_identity, depth, limit),
    )
    .await
    .map_err(unavailable("graph store"))
}

/// Keep configuration errors, report everything else as the store being down.
fn unavailable(store: &'static str) -> impl Fn(TesseraError) -> TesseraError {
    move |e| match e.kind() {
        ErrorKind::Configuration => e,
        _ => TesseraError::ServiceUnavailable(format!("{store} unavailable: {e}")),
    }
}

/// Ranks files for a natural-language query.
///
/// Stateless between queries and safe to share behind an `Arc`.
pub struct HybridRanker {
    provider: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStoreGateway>,
    graph: Arc<dyn GraphStoreGateway>,
    collection: String,
    oversample: usize,
    saturation: f64,
    labels: LabelThresholds,
    defaults: SearchOptions,
    store_timeout: Duration,
    graph_timeout: Duration,
    embed_timeout: Duration,
}

impl std::fmt::Debug for HybridRanker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridRanker")
            .field("collection", &self.collection)
            .field("oversample", &self.oversample)
            .field("saturation", &self.saturation)
            .finish_non_exhaustive()
    }
}

impl HybridRanker {
    /// Create a ranker over the given collaborators.
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStoreGateway>,
        graph: Arc<dyn GraphStoreGateway>,
        config: &TesseraConfig,
    ) -> Self {
        Self {
            provider,
            store,
            graph,
            collection: config.vector_store.collection.clone(),
            oversample: config.search.oversample.max(1),
            saturation: config.search.saturation,
            labels: config.search.labels,
            defaults: SearchOptions::from_config(&config.search),
            store_timeout: Duration::from_secs(config.vector_store.timeout_secs.max(1)),
            graph_timeout: Duration::from_secs(config.graph.timeout_secs.max(1)),
            embed_timeout: Duration::from_secs(config.embedding.timeout_secs.max(1)),
        }
    }

    /// Options this ranker was configured with.
    pub fn default_options(&self) -> &SearchOptions {
        &self.defaults
    }

    /// [`rank`](Self::rank) with an options struct.
    ///
    /// # Errors
    ///
    /// See [`rank`](Self::rank).
    pub async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>, TesseraError> {
        self.rank(
            query,
            options.limit,
            options.min_semantic_score,
            options.include_graph,
            &options.weights,
        )
        .await
    }

    /// Rank indexed files against `query`.
    ///
    /// Returns at most `limit` results ordered by hybrid score. No matches
    /// is an empty list, not an error. A graph store failure degrades the
    /// whole query to semantic-only ranking.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::Config`] for invalid weights,
    /// [`TesseraError::ServiceUnavailable`] if the vector store cannot be
    /// reached, or the provider's error if the query cannot be embedded.
    pub async fn rank(
        &self,
        query: &str,
        limit: usize,
        min_semantic_score: f64,
        include_graph: bool,
        weights: &ScoreWeights,
    ) -> Result<Vec<SearchResult>, TesseraError> {
        weights.validate()?;
        if limit == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let vector = with_timeout(
            "query embedding",
            self.embed_timeout,
            self.provider.embed_query(query),
        )
        .await?;

        let fetch = limit.saturating_mul(self.oversample).max(limit);
        let candidates = with_timeout(
            "vector search",
            self.store_timeout,
            self.store
                .search(&self.collection, &vector, fetch, min_semantic_score),
        )
        .await
        .map_err(unavailable("vector store"))?;

        let candidates: Vec<Candidate> = candidates
            .into_iter()
            .map(|mut c| {
                c.score = c.score.clamp(0.0, 1.0);
                c
            })
            .filter(|c| c.score >= min_semantic_score)
            .collect();
        debug!(
            query,
            fetched = fetch,
            kept = candidates.len(),
            "semantic candidates"
        );

        let metrics = if include_graph && !candidates.is_empty() {
            self.graph_metrics(&candidates).await
        } else {
            None
        };

        let with_graph = metrics.is_some();
        let mut results = fuse(
            candidates,
            metrics,
            weights,
            self.saturation,
            &self.labels,
            limit,
        );
        if with_graph {
            self.attach_neighbors(&mut results).await;
        }
        Ok(results)
    }

    /// Files connected to `file_identity` through up to `depth` calls.
    ///
    /// # Errors
    ///
    /// See [`related_files`].
    pub async fn related(
        &self,
        file_identity: &str,
        depth: usize,
        limit: usize,
    ) -> Result<Vec<String>, TesseraError> {
        related_files(
            self.graph.as_ref(),
            file_identity,
            depth,
            limit,
            self.graph_timeout,
        )
        .await
    }

    /// Vector and graph store sizes.
    ///
    /// # Errors
    ///
    /// See [`index_statistics`].
    pub async fn statistics(&self) -> Result<IndexStatistics, TesseraError> {
        index_statistics(
            self.store.as_ref(),
            self.graph.as_ref(),
            &self.collection,
            self.store_timeout,
        )
        .await
    }

    /// Names only annotate results; a failure leaves the rest unannotated.
    async fn attach_neighbors(&self, results: &mut [SearchResult]) {
        for result in results.iter_mut() {
            let path = &result.source_path;
            match with_timeout(
                "graph neighbours",
                self.graph_timeout,
                self.graph.neighbors(path, NEIGHBOR_LIMIT),
            )
            .await
            {
                Ok(mut neighbors) => {
                    neighbors.called_by.truncate(NEIGHBOR_LIMIT);
                    neighbors.calls_to.truncate(NEIGHBOR_LIMIT);
                    neighbors.related_modules.truncate(NEIGHBOR_LIMIT);
                    result.neighbors = neighbors;
                }
                Err(e) => {
                    warn!(file = %path, "graph neighbours unavailable: {e}");
                    return;
                }
            }
        }
    }

    async fn graph_metrics(&self, candidates: &[Candidate]) -> Option<Vec<GraphMetrics>> {
        let mut metrics = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let path = &candidate.payload.file_path;
            match with_timeout("graph metrics", self.graph_timeout, self.graph.metrics(path))
                .await
            {
                Ok(m) => metrics.push(m),
                Err(e) => {
                    warn!(file = %path, "graph store unavailable, ranking by similarity only: {e}");
                    return None;
                }
            }
        }
        Some(metrics)
    }
}

async fn with_timeout<T>(
    operation: &str,
    limit: Duration,
    future: impl Future<Output = Result<T, TesseraError>>,
) -> Result<T, TesseraError> {
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| TesseraError::timeout(operation, limit.as_secs()))?
}
