//! Single-writer guard for index runs.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tessera_core::TesseraError;
use tracing::{debug, warn};

/// Exclusive lock on the index state, held for the duration of a run.
///
/// Backed by an advisory OS lock on a lock file, so a second run in this or
/// any other process is rejected instead of racing. The OS drops the lock
/// when the holding process exits, however it exits, so a crashed run never
/// wedges later ones. The file itself is left in place; only the lock on it
/// matters.
///
/// # Examples
///
/// ```
/// use tessera_history::lock::IndexLock;
///
/// let dir = tempfile::tempdir().unwrap();
/// let path = dir.path().join("index.lock");
/// let guard = IndexLock::acquire(&path).unwrap();
/// assert!(IndexLock::acquire(&path).is_err());
/// drop(guard);
/// assert!(IndexLock::acquire(&path).is_ok());
/// ```
#[derive(Debug)]
pub struct IndexLock {
    file: File,
    path: PathBuf,
}

impl IndexLock {
    /// Take the lock at `path` without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::IndexLocked`] if another run holds it, or
    /// [`TesseraError::Io`] if the lock file cannot be opened or locked.
    pub fn acquire(path: &Path) -> Result<Self, TesseraError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                return Err(TesseraError::IndexLocked(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        }

        // Holder pid, for whoever inspects a contended lock by hand.
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        debug!(path = %path.display(), "acquired index lock");

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Location of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), "failed to release index lock: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/index.lock");
        let _guard = IndexLock::acquire(&path).unwrap();

        let err = IndexLock::acquire(&path).unwrap_err();
        assert!(matches!(err, TesseraError::IndexLocked(_)));
    }

    #[test]
    fn drop_releases_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.lock");
        {
            let guard = IndexLock::acquire(&path).unwrap();
            assert!(guard.path().exists());
        }
        let _again = IndexLock::acquire(&path).unwrap();
    }

    #[test]
    fn leftover_file_from_a_dead_run_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".tessera/index.lock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        // A run killed before cleanup leaves its file, but no OS lock.
        std::fs::write(&path, "999999\n").unwrap();

        for _ in 0..3 {
            let guard = IndexLock::acquire(&path).unwrap();
            drop(guard);
        }
        let pid = std::fs::read_to_string(&path).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());
    }

    #[test]
    fn lock_held_by_another_handle_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.lock");
        let other = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .unwrap();
        other.lock_exclusive().unwrap();

        assert!(matches!(
            IndexLock::acquire(&path),
            Err(TesseraError::IndexLocked(_))
        ));
        other.unlock().unwrap();
        assert!(IndexLock::acquire(&path).is_ok());
    }
}
