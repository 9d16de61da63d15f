//! One index run: lock, resolve changes, embed, record.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tessera_core::TesseraError;
use tessera_history::lock::IndexLock;
use tessera_history::resolver::{ChangeMode, ChangeSetResolver};
use tracing::{info, warn};

use crate::pipeline::{EmbeddingPipeline, PipelineReport, StopSignal};

/// What an index run did.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexOutcome {
    /// Head revision the change set was resolved against.
    pub revision: String,
    /// Whether the run was a bootstrap or an incremental delta.
    pub mode: ChangeMode,
    /// Pipeline counters.
    pub report: PipelineReport,
    /// Whether the recorded revision moved to `revision`.
    pub advanced: bool,
}

/// Drives a [`ChangeSetResolver`] and an [`EmbeddingPipeline`] under an
/// [`IndexLock`].
///
/// The recorded revision only advances when every file in the change set
/// was uploaded, so an interrupted or partially failed run is simply
/// repeated next time.
#[derive(Debug)]
pub struct Indexer {
    resolver: ChangeSetResolver,
    pipeline: EmbeddingPipeline,
    lock_path: PathBuf,
}

impl Indexer {
    /// Create an indexer that serializes runs through `lock_path`.
    pub fn new(resolver: ChangeSetResolver, pipeline: EmbeddingPipeline, lock_path: PathBuf) -> Self {
        Self {
            resolver,
            pipeline,
            lock_path,
        }
    }

    /// The resolver, for status reporting.
    pub fn resolver(&self) -> &ChangeSetResolver {
        &self.resolver
    }

    /// The pipeline, for cache statistics.
    pub fn pipeline(&self) -> &EmbeddingPipeline {
        &self.pipeline
    }

    /// Run one index pass.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::IndexLocked`] if another run is in progress,
    /// and propagates resolver, configuration, and vector-store errors. None
    /// of these advance the recorded revision.
    pub async fn run(&mut self, stop: &StopSignal) -> Result<IndexOutcome, TesseraError> {
        let _lock = IndexLock::acquire(&self.lock_path)?;

        let change_set = self.resolver.changed_files().await?;
        info!(
            revision = %change_set.revision,
            mode = ?change_set.mode,
            files = change_set.files.len(),
            "resolved change set"
        );

        if change_set.is_empty() {
            let already_recorded = self.resolver.state().last_indexed_revision.as_deref()
                == Some(change_set.revision.as_str());
            if !already_recorded {
                self.resolver.mark_indexed(&[]).await?;
            }
            return Ok(IndexOutcome {
                revision: change_set.revision,
                mode: change_set.mode,
                report: PipelineReport::default(),
                advanced: !already_recorded,
            });
        }

        let result = self.pipeline.index(&change_set.files, stop).await;
        let cache = Arc::clone(self.pipeline.cache());
        if let Err(e) = tokio::task::spawn_blocking(move || cache.flush_summary()).await {
            warn!("cache summary task failed: {e}");
        }
        let report = result?;

        let advanced = if report.is_complete() {
            self.resolver.mark_indexed(&change_set.files).await?;
            true
        } else {
            warn!(
                failed = report.failed.len(),
                cancelled = report.cancelled,
                "run incomplete, keeping previous revision so the change set is retried"
            );
            false
        };

        Ok(IndexOutcome {
            revision: change_set.revision,
            mode: change_set.mode,
            report,
            advanced,
        })
    }
}
