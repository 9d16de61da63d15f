//! Incremental semantic indexing and hybrid search.
//!
//! - [`cache`]: content-addressed embedding cache
//! - [`embedding`]: embedding provider gateway and HTTP client
//! - [`store`] / [`qdrant`]: vector store gateway, local SQLite and Qdrant adapters
//! - [`graph`]: code-graph gateway for ranking signals
//! - [`pipeline`]: batched, cache-aware embedding and upload
//! - [`indexer`]: one locked index run from change set to recorded revision
//! - [`search`]: hybrid ranking of query results

pub mod cache;
pub mod embedding;
pub mod graph;
pub mod indexer;
pub mod pipeline;
pub mod qdrant;
pub mod search;
pub mod store;
