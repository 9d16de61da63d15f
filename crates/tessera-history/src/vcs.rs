//! Version-control gateway and its git2 adapter.
//!
//! The resolver only needs three questions answered: what is the current
//! revision, which files changed between two revisions, and which files are
//! tracked at all. [`GitRepository`] answers them from a local git checkout.

use std::path::{Path, PathBuf};

use git2::{Delta, DiffFindOptions, DiffOptions, Oid, Repository};
use glob::{MatchOptions, Pattern};
use tessera_core::{ChangeKind, FileChange, TesseraError};

/// Narrow contract over a source history.
///
/// Implementations are synchronous; callers run them on the blocking pool
/// under a timeout.
pub trait VersionControl: Send + Sync {
    /// Working-tree root. Paths returned by the other methods are relative to it.
    fn root(&self) -> &Path;

    /// Identifier of the current head revision.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::Git`] if the head cannot be resolved.
    fn current_revision(&self) -> Result<String, TesseraError>;

    /// File-level changes between two revisions, including deletions.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::Git`] if either revision is unknown.
    fn diff(&self, from: &str, to: &str) -> Result<Vec<FileChange>, TesseraError>;

    /// All tracked paths matching the glob `pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::Config`] for an invalid pattern, or
    /// [`TesseraError::Git`] if the index cannot be read.
    fn list_tracked_files(&self, pattern: &str) -> Result<Vec<String>, TesseraError>;
}

/// [`VersionControl`] backed by a git repository on disk.
///
/// The repository is reopened per call so the handle can be shared across
/// threads.
///
/// # Examples
///
/// ```no_run
/// use std::path::Path;
/// use tessera_history::vcs::{GitRepository, VersionControl};
///
/// let repo = GitRepository::open(Path::new(".")).unwrap();
/// println!("HEAD is {}", repo.current_revision().unwrap());
/// ```
#[derive(Debug, Clone)]
pub struct GitRepository {
    root: PathBuf,
}

impl GitRepository {
    /// Discover the repository containing `path`.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::Git`] if `path` is not inside a repository
    /// with a working tree.
    pub fn open(path: &Path) -> Result<Self, TesseraError> {
        let repo = Repository::discover(path)
            .map_err(|e| TesseraError::Git(format!("failed to open repository: {e}")))?;
        let root = repo
            .workdir()
            .ok_or_else(|| TesseraError::Git("repository has no working tree".into()))?
            .to_path_buf();
        Ok(Self { root })
    }

    fn repo(&self) -> Result<Repository, TesseraError> {
        Repository::open(&self.root)
            .map_err(|e| TesseraError::Git(format!("failed to open repository: {e}")))
    }
}

impl VersionControl for GitRepository {
    fn root(&self) -> &Path {
        &self.root
    }

    fn current_revision(&self) -> Result<String, TesseraError> {
        let repo = self.repo()?;
        let head = repo
            .head()
            .map_err(|e| TesseraError::Git(format!("failed to resolve HEAD: {e}")))?;
        let commit = head
            .peel_to_commit()
            .map_err(|e| TesseraError::Git(format!("HEAD is not a commit: {e}")))?;
        Ok(commit.id().to_string())
    }

    fn diff(&self, from: &str, to: &str) -> Result<Vec<FileChange>, TesseraError> {
        let repo = self.repo()?;
        let old_tree = commit_tree(&repo, from)?;
        let new_tree = commit_tree(&repo, to)?;

        let mut diff_opts = DiffOptions::new();
        diff_opts.include_typechange(true);
        let mut diff = repo
            .diff_tree_to_tree(Some(&old_tree), Some(&new_tree), Some(&mut diff_opts))
            .map_err(|e| TesseraError::Git(format!("failed to compute diff: {e}")))?;

        let mut find_opts = DiffFindOptions::new();
        find_opts.renames(true).copies(true);
        diff.find_similar(Some(&mut find_opts))
            .map_err(|e| TesseraError::Git(format!("failed to find renames: {e}")))?;

        let mut changes = Vec::with_capacity(diff.deltas().len());
        for delta in diff.deltas() {
            let new_path = path_string(delta.new_file().path());
            let old_path = path_string(delta.old_file().path());

            let (path, kind) = match delta.status() {
                Delta::Added | Delta::Untracked => (new_path, ChangeKind::Added),
                Delta::Modified => (new_path, ChangeKind::Modified),
                Delta::Deleted => (old_path, ChangeKind::Deleted),
                Delta::Renamed => (new_path, ChangeKind::Renamed { from: old_path }),
                Delta::Copied => (new_path, ChangeKind::Copied),
                Delta::Typechange => (new_path, ChangeKind::TypeChanged),
                _ => continue,
            };

            if path.is_empty() {
                continue;
            }
            changes.push(FileChange { path, kind });
        }

        Ok(changes)
    }

    fn list_tracked_files(&self, pattern: &str) -> Result<Vec<String>, TesseraError> {
        let pattern = Pattern::new(pattern).map_err(|e| {
            TesseraError::Config(format!("invalid tracked file pattern '{pattern}': {e}"))
        })?;
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };

        let repo = self.repo()?;
        let index = repo
            .index()
            .map_err(|e| TesseraError::Git(format!("failed to read index: {e}")))?;

        let mut files = Vec::with_capacity(index.len());
        for entry in index.iter() {
            let path = String::from_utf8_lossy(&entry.path).to_string();
            if pattern.matches_with(&path, options) {
                files.push(path);
            }
        }
        Ok(files)
    }
}

fn commit_tree<'r>(repo: &'r Repository, revision: &str) -> Result<git2::Tree<'r>, TesseraError> {
    let oid = Oid::from_str(revision)
        .or_else(|_| repo.revparse_single(revision).map(|obj| obj.id()))
        .map_err(|e| TesseraError::Git(format!("unknown revision '{revision}': {e}")))?;
    let commit = repo
        .find_commit(oid)
        .map_err(|e| TesseraError::Git(format!("unknown revision '{revision}': {e}")))?;
    commit
        .tree()
        .map_err(|e| TesseraError::Git(format!("failed to get commit tree: {e}")))
}

fn path_string(path: Option<&Path>) -> String {
    path.map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn commit_all(repo: &Repository, message: &str) -> Oid {
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.update_all(["*"].iter(), None).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("test", "test@example.com").unwrap();
        let parents: Vec<git2::Commit> = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .into_iter()
            .collect();
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
            .unwrap()
    }

    #[test]
    fn diff_classifies_changes() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        fs::write(dir.path().join("keep.rs"), "fn keep() {}\n").unwrap();
        fs::write(dir.path().join("gone.rs"), "fn gone() {}\n").unwrap();
        let first = commit_all(&repo, "first");

        fs::write(dir.path().join("keep.rs"), "fn keep() { changed(); }\n").unwrap();
        fs::remove_file(dir.path().join("gone.rs")).unwrap();
        fs::write(
            dir.path().join("new.rs"),
            "struct Unrelated;\nimpl Default for Unrelated {\n    fn default() -> Self { Unrelated }\n}\n",
        )
        .unwrap();
        let second = commit_all(&repo, "second");

        let git = GitRepository::open(dir.path()).unwrap();
        let changes = git
            .diff(&first.to_string(), &second.to_string())
            .unwrap();

        let find = |p: &str| changes.iter().find(|c| c.path == p).map(|c| c.kind.clone());
        assert_eq!(find("keep.rs"), Some(ChangeKind::Modified));
        assert_eq!(find("gone.rs"), Some(ChangeKind::Deleted));
        assert_eq!(find("new.rs"), Some(ChangeKind::Added));
    }

    #[test]
    fn tracked_files_respect_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/a.bsl"), "A").unwrap();
        fs::write(dir.path().join("b.txt"), "B").unwrap();
        commit_all(&repo, "init");

        let git = GitRepository::open(dir.path()).unwrap();
        let mut all = git.list_tracked_files("*").unwrap();
        all.sort();
        assert_eq!(all, vec!["b.txt", "src/a.bsl"]);

        let bsl = git.list_tracked_files("*.bsl").unwrap();
        assert_eq!(bsl, vec!["src/a.bsl"]);
    }

    #[test]
    fn invalid_pattern_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        fs::write(dir.path().join("a.rs"), "A").unwrap();
        commit_all(&repo, "init");

        let git = GitRepository::open(dir.path()).unwrap();
        let err = git.list_tracked_files("[").unwrap_err();
        assert!(matches!(err, TesseraError::Config(_)));
    }

    #[test]
    fn unknown_revision_is_git_error() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        fs::write(dir.path().join("a.rs"), "A").unwrap();
        let head = commit_all(&repo, "init");

        let git = GitRepository::open(dir.path()).unwrap();
        let missing = "0123456789abcdef0123456789abcdef01234567";
        assert!(git.diff(missing, &head.to_string()).is_err());
    }
}
