use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tessera_core::TesseraError;

/// One completed index run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRun {
    /// Revision the run brought the index up to.
    pub revision: String,
    /// When the run was recorded.
    pub timestamp: DateTime<Utc>,
    /// Number of files the run embedded.
    pub file_count: usize,
}

/// Durable record of how far the index has been brought.
///
/// Written only after a pipeline run committed every file it was given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexState {
    /// Revision of the last successful run.
    ///
    /// `None` means no run has completed yet and the next change set is a
    /// full bootstrap.
    pub last_indexed_revision: Option<String>,

    /// When the last successful run was recorded.
    pub last_indexed_at: Option<DateTime<Utc>>,

    /// Most recent runs, oldest first.
    #[serde(default)]
    pub run_history: Vec<IndexRun>,
}

impl IndexState {
    /// Load the state from `path`.
    ///
    /// Returns `Ok(None)` if the state file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, TesseraError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            TesseraError::Config(format!(
                "failed to read index state from {}: {e}",
                path.display()
            ))
        })?;
        let state = serde_json::from_str(&content)
            .map_err(|e| TesseraError::Config(format!("failed to parse index state: {e}")))?;
        Ok(Some(state))
    }

    /// Save the state to `path`.
    ///
    /// The file is written next to its destination and renamed into place so
    /// a crash never leaves a truncated state behind.
    pub fn save(&self, path: &Path) -> Result<(), TesseraError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    TesseraError::Config(format!(
                        "failed to create state directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let content = serde_json::to_string_pretty(self)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content).map_err(|e| {
            TesseraError::Config(format!(
                "failed to write index state to {}: {e}",
                tmp_path.display()
            ))
        })?;
        std::fs::rename(&tmp_path, path).map_err(|e| {
            TesseraError::Config(format!(
                "failed to move index state into {}: {e}",
                path.display()
            ))
        })?;
        Ok(())
    }

    /// Record a completed run, keeping at most `history_limit` entries.
    pub fn record_run(
        &mut self,
        revision: String,
        timestamp: DateTime<Utc>,
        file_count: usize,
        history_limit: usize,
    ) {
        self.last_indexed_revision = Some(revision.clone());
        self.last_indexed_at = Some(timestamp);
        self.run_history.push(IndexRun {
            revision,
            timestamp,
            file_count,
        });

        let limit = history_limit.max(1);
        if self.run_history.len() > limit {
            let excess = self.run_history.len() - limit;
            self.run_history.drain(..excess);
        }
    }
}
