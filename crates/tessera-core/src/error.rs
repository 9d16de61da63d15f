use std::fmt;
use std::path::PathBuf;

/// Errors that can occur across the Tessera workspace.
///
/// Each variant wraps a specific failure domain. Library crates use this type
/// directly; the binary crate reports it through `miette` at the boundary.
/// Use [`TesseraError::kind`] to decide whether a failure is retried, skipped,
/// or fatal.
///
/// # Examples
///
/// ```
/// use tessera_core::{ErrorKind, TesseraError};
///
/// let err = TesseraError::Config("missing collection".into());
/// assert!(err.to_string().contains("missing collection"));
/// assert_eq!(err.kind(), ErrorKind::Configuration);
/// ```
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum TesseraError {
    /// Filesystem I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    #[diagnostic(help("check .tessera.toml or run `tessera init`"))]
    Config(String),

    /// Git operation failure.
    #[error("git error: {0}")]
    Git(String),

    /// SQLite persistence failure.
    #[error("database error: {0}")]
    Database(String),

    /// Embedding provider failure (HTTP, bad response).
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Vector store failure.
    #[error("vector store error: {0}")]
    VectorStore(String),

    /// Graph store failure.
    #[error("graph store error: {0}")]
    GraphStore(String),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML deserialization failure.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A required file was not found.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// An external call exceeded its deadline.
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        /// What was being called.
        operation: String,
        /// The deadline that was exceeded.
        seconds: u64,
    },

    /// A mandatory external service could not be reached.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// An embedding had a different length than the collection expects.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    #[diagnostic(help("re-create the collection or fix `embedding.dimensions`"))]
    DimensionMismatch {
        /// Dimension configured for the collection.
        expected: usize,
        /// Dimension returned by the provider.
        actual: usize,
    },

    /// Another index run holds the lock.
    #[error("index is locked by another run: {}", .0.display())]
    #[diagnostic(help("wait for the other run to finish"))]
    IndexLocked(PathBuf),
}

/// Coarse classification of a [`TesseraError`] that drives recovery policy.
///
/// # Examples
///
/// ```
/// use tessera_core::{ErrorKind, TesseraError};
///
/// let err = TesseraError::Timeout { operation: "embed".into(), seconds: 90 };
/// assert_eq!(err.kind(), ErrorKind::TransientIo);
/// assert!(err.kind().is_retryable());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Disk hiccup or provider timeout. Retried once, then skipped.
    TransientIo,
    /// Bad configuration. Fatal for the whole run.
    Configuration,
    /// Inconsistent data. Logged, never aborts.
    DataIntegrity,
    /// A required service is down. Aborts indexing; fails queries only when
    /// the service is mandatory.
    ServiceUnavailable,
}

impl ErrorKind {
    /// Whether the immediate caller should retry once.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::TransientIo)
    }

    /// Whether the failure ends the current run.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::Configuration | ErrorKind::ServiceUnavailable)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::TransientIo => write!(f, "transient-io"),
            ErrorKind::Configuration => write!(f, "configuration"),
            ErrorKind::DataIntegrity => write!(f, "data-integrity"),
            ErrorKind::ServiceUnavailable => write!(f, "service-unavailable"),
        }
    }
}

impl TesseraError {
    /// Classify this error for retry/abort decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TesseraError::Io(_)
            | TesseraError::Timeout { .. }
            | TesseraError::Embedding(_)
            | TesseraError::FileNotFound(_) => ErrorKind::TransientIo,
            TesseraError::Config(_)
            | TesseraError::Toml(_)
            | TesseraError::DimensionMismatch { .. } => ErrorKind::Configuration,
            TesseraError::Serialization(_) => ErrorKind::DataIntegrity,
            TesseraError::Git(_)
            | TesseraError::Database(_)
            | TesseraError::VectorStore(_)
            | TesseraError::GraphStore(_)
            | TesseraError::ServiceUnavailable(_)
            | TesseraError::IndexLocked(_) => ErrorKind::ServiceUnavailable,
        }
    }

    /// Build a [`TesseraError::Timeout`] for `operation`.
    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        TesseraError::Timeout {
            operation: operation.into(),
            seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: TesseraError = io_err.into();
        assert!(err.to_string().contains("gone"));
        assert_eq!(err.kind(), ErrorKind::TransientIo);
    }

    #[test]
    fn config_error_displays_message() {
        let err = TesseraError::Config("bad value".into());
        assert_eq!(err.to_string(), "configuration error: bad value");
        assert!(err.kind().is_fatal());
    }

    #[test]
    fn dimension_mismatch_is_configuration() {
        let err = TesseraError::DimensionMismatch {
            expected: 768,
            actual: 1024,
        };
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("768"));
        assert!(err.to_string().contains("1024"));
    }

    #[test]
    fn service_errors_are_fatal_not_retryable() {
        for err in [
            TesseraError::VectorStore("down".into()),
            TesseraError::GraphStore("down".into()),
            TesseraError::ServiceUnavailable("down".into()),
        ] {
            assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
            assert!(!err.kind().is_retryable());
            assert!(err.kind().is_fatal());
        }
    }

    #[test]
    fn timeout_shows_operation() {
        let err = TesseraError::timeout("vector search", 30);
        assert_eq!(err.to_string(), "vector search timed out after 30s");
    }

    #[test]
    fn file_not_found_shows_path() {
        let err = TesseraError::FileNotFound(PathBuf::from("/tmp/missing.rs"));
        assert!(err.to_string().contains("/tmp/missing.rs"));
    }
}
