//! Core types, configuration, and error handling for Tessera.
//!
//! This crate provides the shared foundation used by the other crates:
//! - [`TesseraError`] / [`ErrorKind`]: unified error type and its recovery class
//! - [`TesseraConfig`]: configuration loaded from `.tessera.toml`
//! - Shared records: [`SearchResult`], [`GraphMetrics`], [`ScoreWeights`],
//!   [`FileChange`], [`Metadata`]

mod config;
mod error;
mod types;

pub use config::{
    CacheConfig, EmbeddingConfig, GraphConfig, IndexConfig, SearchConfig, TesseraConfig,
    VectorBackend, VectorStoreConfig,
};
pub use error::{ErrorKind, TesseraError};
pub use types::{
    file_identity, ChangeKind, FileChange, GraphMetrics, GraphNeighbors, LabelThresholds, Metadata,
    OutputFormat, RelevanceLabel, ScoreWeights, SearchResult,
};

/// A convenience `Result` type for Tessera operations.
pub type Result<T> = std::result::Result<T, TesseraError>;
