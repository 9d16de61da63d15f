use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::TesseraError;
use crate::types::{LabelThresholds, ScoreWeights};

/// Top-level configuration loaded from `.tessera.toml`.
///
/// Every section is optional; omitted fields fall back to defaults.
///
/// # Examples
///
/// ```
/// use tessera_core::TesseraConfig;
///
/// let config = TesseraConfig::default();
/// assert_eq!(config.index.batch_size, 100);
/// assert_eq!(config.cache.summary_every, 10);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TesseraConfig {
    /// Embedding provider settings.
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Vector store settings.
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    /// Graph store settings.
    #[serde(default)]
    pub graph: GraphConfig,
    /// Change detection and pipeline settings.
    #[serde(default)]
    pub index: IndexConfig,
    /// Embedding cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Query-time ranking settings.
    #[serde(default)]
    pub search: SearchConfig,
}

impl TesseraConfig {
    /// Load configuration from a TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::Io`] if the file cannot be read, or
    /// [`TesseraError::Toml`] if the content is not valid TOML.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use tessera_core::TesseraConfig;
    /// use std::path::Path;
    ///
    /// let config = TesseraConfig::from_file(Path::new(".tessera.toml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, TesseraError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::Toml`] if parsing fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use tessera_core::TesseraConfig;
    ///
    /// let toml = r#"
    /// [index]
    /// batch_size = 25
    /// "#;
    /// let config = TesseraConfig::from_toml(toml).unwrap();
    /// assert_eq!(config.index.batch_size, 25);
    /// ```
    pub fn from_toml(content: &str) -> Result<Self, TesseraError> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Reject values that would make a run meaningless or unsafe.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<(), TesseraError> {
        if self.embedding.dimensions == 0 {
            return Err(TesseraError::Config(
                "embedding.dimensions must be greater than zero".into(),
            ));
        }
        if self.index.batch_size == 0 {
            return Err(TesseraError::Config(
                "index.batch_size must be greater than zero".into(),
            ));
        }
        if self.index.workers == 0 {
            return Err(TesseraError::Config(
                "index.workers must be greater than zero".into(),
            ));
        }
        if self.vector_store.collection.trim().is_empty() {
            return Err(TesseraError::Config(
                "vector_store.collection must not be empty".into(),
            ));
        }
        if self.search.saturation.is_nan() || self.search.saturation <= 0.0 {
            return Err(TesseraError::Config(format!(
                "search.saturation must be positive, got {}",
                self.search.saturation
            )));
        }
        if !(0.0..=1.0).contains(&self.search.min_semantic_score) {
            return Err(TesseraError::Config(format!(
                "search.min_semantic_score must be within [0, 1], got {}",
                self.search.min_semantic_score
            )));
        }
        self.search.weights.validate()
    }
}

/// Embedding provider configuration.
///
/// # Examples
///
/// ```
/// use tessera_core::EmbeddingConfig;
///
/// let config = EmbeddingConfig::default();
/// assert_eq!(config.provider, "ollama");
/// assert_eq!(config.model, "nomic-embed-text");
/// assert_eq!(config.dimensions, 768);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Provider name: `"ollama"`, `"voyage"`, or `"openai"` (default: `"ollama"`).
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    /// API key for hosted providers.
    pub api_key: Option<String>,
    /// Model name (default: `"nomic-embed-text"`).
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Custom base URL for API requests.
    pub base_url: Option<String>,
    /// Output dimension of the model (default: 768).
    #[serde(default = "default_embedding_dimensions")]
    pub dimensions: usize,
    /// Per-request timeout in seconds (default: 90).
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
    /// File content is truncated to this many characters before embedding (default: 8000).
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

fn default_embedding_provider() -> String {
    "ollama".into()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".into()
}

fn default_embedding_dimensions() -> usize {
    768
}

fn default_embedding_timeout() -> u64 {
    90
}

fn default_max_input_chars() -> usize {
    8000
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            api_key: None,
            model: default_embedding_model(),
            base_url: None,
            dimensions: default_embedding_dimensions(),
            timeout_secs: default_embedding_timeout(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

/// Which vector store adapter to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    /// Local SQLite file under the state directory.
    #[default]
    Sqlite,
    /// Qdrant over its REST API.
    Qdrant,
}

/// Vector store configuration.
///
/// # Examples
///
/// ```
/// use tessera_core::{VectorBackend, VectorStoreConfig};
///
/// let config = VectorStoreConfig::default();
/// assert_eq!(config.backend, VectorBackend::Sqlite);
/// assert_eq!(config.collection, "code");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    /// Backend selection (default: `sqlite`).
    #[serde(default)]
    pub backend: VectorBackend,
    /// Server URL for remote backends (default: `http://localhost:6333`).
    #[serde(default = "default_vector_url")]
    pub url: String,
    /// API key for remote backends.
    pub api_key: Option<String>,
    /// Collection name (default: `"code"`).
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Per-request timeout in seconds (default: 30).
    #[serde(default = "default_vector_timeout")]
    pub timeout_secs: u64,
}

fn default_vector_url() -> String {
    "http://localhost:6333".into()
}

fn default_collection() -> String {
    "code".into()
}

fn default_vector_timeout() -> u64 {
    30
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: VectorBackend::default(),
            url: default_vector_url(),
            api_key: None,
            collection: default_collection(),
            timeout_secs: default_vector_timeout(),
        }
    }
}

/// Graph store configuration.
///
/// # Examples
///
/// ```
/// use tessera_core::GraphConfig;
///
/// let config = GraphConfig::default();
/// assert!(!config.enabled);
/// assert_eq!(config.database, "neo4j");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Query the graph store at search time (default: false).
    #[serde(default)]
    pub enabled: bool,
    /// HTTP endpoint of the graph database (default: `http://localhost:7474`).
    #[serde(default = "default_graph_url")]
    pub url: String,
    /// Username for basic auth.
    pub user: Option<String>,
    /// Password for basic auth.
    pub password: Option<String>,
    /// Database name (default: `"neo4j"`).
    #[serde(default = "default_graph_database")]
    pub database: String,
    /// Per-request timeout in seconds (default: 10).
    #[serde(default = "default_graph_timeout")]
    pub timeout_secs: u64,
}

fn default_graph_url() -> String {
    "http://localhost:7474".into()
}

fn default_graph_database() -> String {
    "neo4j".into()
}

fn default_graph_timeout() -> u64 {
    10
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_graph_url(),
            user: None,
            password: None,
            database: default_graph_database(),
            timeout_secs: default_graph_timeout(),
        }
    }
}

/// Change detection and embedding pipeline configuration.
///
/// # Examples
///
/// ```
/// use tessera_core::IndexConfig;
///
/// let config = IndexConfig::default();
/// assert_eq!(config.workers, 4);
/// assert_eq!(config.history_limit, 10);
/// assert!(config.is_indexable(std::path::Path::new("src/lib.rs")));
/// assert!(!config.is_indexable(std::path::Path::new("README.md")));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// File extensions (without dot) that are embedded.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Glob over repository-relative paths used for the bootstrap listing (default: `"*"`).
    #[serde(default = "default_tracked_pattern")]
    pub tracked_pattern: String,
    /// Points per vector-store upsert (default: 100).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Concurrent per-file workers within a batch (default: 4).
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Runs kept in the index history (default: 10).
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Directory for state, cache, and local vectors, relative to the repo root.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Timeout for version-control operations in seconds (default: 30).
    #[serde(default = "default_vcs_timeout")]
    pub vcs_timeout_secs: u64,
}

fn default_extensions() -> Vec<String> {
    ["rs", "py", "ts", "js", "go", "java", "bsl"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_tracked_pattern() -> String {
    "*".into()
}

fn default_batch_size() -> usize {
    100
}

fn default_workers() -> usize {
    4
}

fn default_history_limit() -> usize {
    10
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".tessera")
}

fn default_vcs_timeout() -> u64 {
    30
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            tracked_pattern: default_tracked_pattern(),
            batch_size: default_batch_size(),
            workers: default_workers(),
            history_limit: default_history_limit(),
            state_dir: default_state_dir(),
            vcs_timeout_secs: default_vcs_timeout(),
        }
    }
}

impl IndexConfig {
    /// Whether `path` has one of the configured extensions (case-insensitive).
    pub fn is_indexable(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        self.extensions
            .iter()
            .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }
}

/// Embedding cache configuration.
///
/// # Examples
///
/// ```
/// use tessera_core::CacheConfig;
///
/// assert_eq!(CacheConfig::default().summary_every, 10);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Rewrite the aggregate summary after this many saves (default: 10).
    #[serde(default = "default_summary_every")]
    pub summary_every: u32,
}

fn default_summary_every() -> u32 {
    10
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            summary_every: default_summary_every(),
        }
    }
}

/// Query-time ranking configuration.
///
/// # Examples
///
/// ```
/// use tessera_core::SearchConfig;
///
/// let config = SearchConfig::default();
/// assert_eq!(config.limit, 10);
/// assert_eq!(config.min_semantic_score, 0.3);
/// assert_eq!(config.oversample, 2);
/// assert_eq!(config.saturation, 5.0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Results returned by default (default: 10).
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Candidates below this similarity are dropped (default: 0.3).
    #[serde(default = "default_min_semantic_score")]
    pub min_semantic_score: f64,
    /// Fuse graph signals into the score (default: true).
    #[serde(default = "default_include_graph")]
    pub include_graph: bool,
    /// Candidate oversampling factor relative to `limit` (default: 2).
    #[serde(default = "default_oversample")]
    pub oversample: usize,
    /// Saturation constant `c` in `x / (x + c)` (default: 5.0).
    #[serde(default = "default_saturation")]
    pub saturation: f64,
    /// Fusion weights.
    #[serde(default)]
    pub weights: ScoreWeights,
    /// Relevance label bands.
    #[serde(default)]
    pub labels: LabelThresholds,
}

fn default_limit() -> usize {
    10
}

fn default_min_semantic_score() -> f64 {
    0.3
}

fn default_include_graph() -> bool {
    true
}

fn default_oversample() -> usize {
    2
}

fn default_saturation() -> f64 {
    5.0
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            min_semantic_score: default_min_semantic_score(),
            include_graph: default_include_graph(),
            oversample: default_oversample(),
            saturation: default_saturation(),
            weights: ScoreWeights::default(),
            labels: LabelThresholds::default(),
        }
    }
}
