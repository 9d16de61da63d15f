//! Change-set resolution from source history.
//!
//! Decides which files need (re-)embedding: everything on the first run,
//! then only what changed since the last successful run.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tessera_core::{IndexConfig, TesseraError};
use tracing::{debug, info, warn};

use crate::state::IndexState;
use crate::vcs::VersionControl;

/// Lifecycle of a resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolverPhase {
    /// No revision recorded and no bootstrap handed out yet.
    Uninitialized,
    /// The full tracked set has been handed out; waiting for `mark_indexed`.
    Bootstrapped,
    /// At least one run has been recorded; change sets are diffs.
    Incremental,
}

/// How a change set was computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeMode {
    /// Every indexable tracked file.
    Bootstrap,
    /// Delta since the last indexed revision.
    Incremental,
}

/// Files to index and the revision they were resolved against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    /// Head revision observed while resolving.
    pub revision: String,
    /// Absolute paths, sorted and deduplicated.
    pub files: Vec<PathBuf>,
    /// Whether this is a full bootstrap or a delta.
    pub mode: ChangeMode,
}

impl ChangeSet {
    /// `true` when nothing needs indexing.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Summary of the resolver's persisted state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverStats {
    /// Revision of the last successful run.
    pub last_revision: Option<String>,
    /// When the last successful run was recorded.
    pub last_indexed_at: Option<DateTime<Utc>>,
    /// Runs kept in history.
    pub total_runs: usize,
    /// Indexable tracked files at the current head.
    pub tracked_files: usize,
    /// Current lifecycle phase.
    pub phase: ResolverPhase,
}

/// Computes change sets and records successful runs.
///
/// Owns the [`IndexState`]; it is the only writer of that record.
pub struct ChangeSetResolver {
    vcs: Arc<dyn VersionControl>,
    state_path: PathBuf,
    state: IndexState,
    phase: ResolverPhase,
    pending_revision: Option<String>,
    config: IndexConfig,
    timeout: Duration,
}

impl std::fmt::Debug for ChangeSetResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeSetResolver")
            .field("root", &self.vcs.root())
            .field("state_path", &self.state_path)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl ChangeSetResolver {
    /// Create a resolver persisting its state at `state_path`.
    ///
    /// An unreadable state file is not fatal: it is logged and the resolver
    /// starts uninitialized, so the next change set is a full bootstrap.
    pub fn new(vcs: Arc<dyn VersionControl>, state_path: PathBuf, config: &IndexConfig) -> Self {
        let state = match IndexState::load(&state_path) {
            Ok(Some(state)) => state,
            Ok(None) => IndexState::default(),
            Err(e) => {
                warn!("index state unavailable, falling back to full bootstrap: {e}");
                IndexState::default()
            }
        };
        let phase = if state.last_indexed_revision.is_some() {
            ResolverPhase::Incremental
        } else {
            ResolverPhase::Uninitialized
        };

        info!(
            root = %vcs.root().display(),
            last_revision = state.last_indexed_revision.as_deref().unwrap_or("none"),
            "change set resolver ready"
        );

        Self {
            vcs,
            state_path,
            state,
            phase,
            pending_revision: None,
            config: config.clone(),
            timeout: Duration::from_secs(config.vcs_timeout_secs.max(1)),
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ResolverPhase {
        self.phase
    }

    /// The persisted state as last loaded or written.
    pub fn state(&self) -> &IndexState {
        &self.state
    }

    /// Repository root.
    pub fn root(&self) -> &Path {
        self.vcs.root()
    }

    /// Files needing re-indexing since the last successful run.
    ///
    /// Without a recorded revision this is every indexable tracked file.
    /// Otherwise it is the added, modified, renamed, copied, and
    /// type-changed files between the recorded revision and head. Deleted
    /// files are never included. Paths that no longer exist on disk are
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the head revision cannot be resolved or the
    /// tracked file listing fails. A failed diff is not an error: it falls
    /// back to a bootstrap.
    pub async fn changed_files(&mut self) -> Result<ChangeSet, TesseraError> {
        let head = self
            .blocking("resolve head", |vcs| vcs.current_revision())
            .await?;

        let Some(last) = self.state.last_indexed_revision.clone() else {
            info!("no previous index run recorded, bootstrapping full file set");
            return self.bootstrap(head).await;
        };

        if last == head {
            debug!(revision = %head, "index already at head");
            self.pending_revision = Some(head.clone());
            return Ok(ChangeSet {
                revision: head,
                files: Vec::new(),
                mode: ChangeMode::Incremental,
            });
        }

        let (from, to) = (last.clone(), head.clone());
        let changes = match self
            .blocking("diff revisions", move |vcs| vcs.diff(&from, &to))
            .await
        {
            Ok(changes) => changes,
            Err(e) => {
                warn!(from = %last, to = %head, "history unavailable, falling back to full bootstrap: {e}");
                return self.bootstrap(head).await;
            }
        };

        let root = self.vcs.root().to_path_buf();
        let files: BTreeSet<PathBuf> = changes
            .into_iter()
            .filter(|change| change.kind.needs_reindex())
            .map(|change| root.join(&change.path))
            .filter(|path| self.config.is_indexable(path))
            .filter(|path| path.is_file())
            .collect();

        info!(
            from = %last,
            to = %head,
            files = files.len(),
            "resolved incremental change set"
        );

        self.pending_revision = Some(head.clone());
        Ok(ChangeSet {
            revision: head,
            files: files.into_iter().collect(),
            mode: ChangeMode::Incremental,
        })
    }

    /// Record a successful run covering `indexed_paths` and persist it.
    ///
    /// The recorded revision is the head observed by the preceding
    /// [`changed_files`](Self::changed_files) call, or the current head if
    /// none was made. Call this only after every path was durably committed
    /// to the vector store.
    ///
    /// # Errors
    ///
    /// Returns an error if the head cannot be resolved or the state cannot
    /// be written.
    pub async fn mark_indexed(&mut self, indexed_paths: &[PathBuf]) -> Result<(), TesseraError> {
        let revision = match self.pending_revision.take() {
            Some(revision) => revision,
            None => {
                self.blocking("resolve head", |vcs| vcs.current_revision())
                    .await?
            }
        };

        let mut next = self.state.clone();
        next.record_run(
            revision.clone(),
            Utc::now(),
            indexed_paths.len(),
            self.config.history_limit,
        );
        next.save(&self.state_path)?;

        self.state = next;
        self.phase = ResolverPhase::Incremental;
        info!(
            revision = %revision,
            files = indexed_paths.len(),
            "marked revision as indexed"
        );
        Ok(())
    }

    /// Summary of state plus the current tracked file count.
    ///
    /// # Errors
    ///
    /// Returns an error if the tracked file listing fails.
    pub async fn statistics(&self) -> Result<ResolverStats, TesseraError> {
        let tracked = self.tracked_indexable_files().await?;
        Ok(ResolverStats {
            last_revision: self.state.last_indexed_revision.clone(),
            last_indexed_at: self.state.last_indexed_at,
            total_runs: self.state.run_history.len(),
            tracked_files: tracked.len(),
            phase: self.phase,
        })
    }

    async fn bootstrap(&mut self, head: String) -> Result<ChangeSet, TesseraError> {
        let files = self.tracked_indexable_files().await?;
        info!(files = files.len(), revision = %head, "resolved bootstrap change set");

        self.pending_revision = Some(head.clone());
        if self.phase == ResolverPhase::Uninitialized {
            self.phase = ResolverPhase::Bootstrapped;
        }
        Ok(ChangeSet {
            revision: head,
            files,
            mode: ChangeMode::Bootstrap,
        })
    }

    async fn tracked_indexable_files(&self) -> Result<Vec<PathBuf>, TesseraError> {
        let pattern = self.config.tracked_pattern.clone();
        let tracked = self
            .blocking("list tracked files", move |vcs| {
                vcs.list_tracked_files(&pattern)
            })
            .await?;

        let root = self.vcs.root();
        let files: BTreeSet<PathBuf> = tracked
            .into_iter()
            .map(|path| root.join(path))
            .filter(|path| self.config.is_indexable(path))
            .filter(|path| path.is_file())
            .collect();
        Ok(files.into_iter().collect())
    }

    async fn blocking<T, F>(&self, operation: &'static str, f: F) -> Result<T, TesseraError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn VersionControl) -> Result<T, TesseraError> + Send + 'static,
    {
        let vcs = Arc::clone(&self.vcs);
        let task = tokio::task::spawn_blocking(move || f(vcs.as_ref()));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(TesseraError::Git(format!("{operation} task failed: {e}"))),
            Err(_) => Err(TesseraError::ServiceUnavailable(format!(
                "{operation} timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }
}
