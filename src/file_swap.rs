use colored::Colorize;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::atomic_write::{hash_bytes, hash_file, AtomicWriter, WriteOptions};

/// Failures that end a mutation run. `WriteFailed` and `RestoreFailed` mean
/// the working tree may no longer match what the user had.
#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to lock {path}: {reason}")]
    Lock { path: PathBuf, reason: String },
    #[error("{path} is not UTF-8 text")]
    NotText { path: PathBuf },
    #[error("failed to write mutant to {path}: {reason}")]
    WriteFailed { path: PathBuf, reason: String },
    #[error("failed to restore {path}: {reason}")]
    RestoreFailed { path: PathBuf, reason: String },
}

impl MutationError {
    pub fn may_leave_mutated(&self) -> bool {
        matches!(
            self,
            MutationError::WriteFailed { .. } | MutationError::RestoreFailed { .. }
        )
    }
}

/// Exclusive mutation access to one source file.
///
/// Holds an flock for its whole lifetime and remembers the pristine bytes.
/// Whatever is installed with [`FileSwap::install`] is undone by
/// [`FileSwap::restore`], or by `Drop` if the caller never got that far
/// (early return, panic).
pub struct FileSwap {
    path: PathBuf,
    original: String,
    original_hash: u64,
    dirty: bool,
    lock_path: PathBuf,
    _lock: File,
}

impl FileSwap {
    /// Blocks until no other process or thread holds the same file.
    pub fn acquire(path: &Path) -> Result<Self, MutationError> {
        let lock_path = lock_path_for(path);
        let lock = open_lock(&lock_path).map_err(|e| MutationError::Lock {
            path: path.to_path_buf(),
            reason: format!("{} ({e})", lock_path.display()),
        })?;
        lock.lock_exclusive().map_err(|e| MutationError::Lock {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        debug!(file = %path.display(), lock = %lock_path.display(), "file lock acquired");

        // read only once the lock is held
        let bytes = fs::read(path).map_err(|source| MutationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let original_hash = hash_bytes(&bytes);
        let original = String::from_utf8(bytes).map_err(|_| MutationError::NotText {
            path: path.to_path_buf(),
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            original,
            original_hash,
            dirty: false,
            lock_path,
            _lock: lock,
        })
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    #[cfg(test)]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Replace the file content. The swap is marked dirty before the write so
    /// a half-failed install is still restored.
    pub fn install(&mut self, content: &str) -> Result<(), MutationError> {
        self.dirty = true;
        AtomicWriter::new(WriteOptions::fast())
            .write_str(&self.path, content)
            .map(|_| ())
            .map_err(|e| MutationError::WriteFailed {
                path: self.path.clone(),
                reason: format!("{e:#}"),
            })
    }

    /// Put the pristine bytes back and check them by hash.
    pub fn restore(&mut self) -> Result<(), MutationError> {
        if !self.dirty {
            return Ok(());
        }
        let fail = |reason: String| MutationError::RestoreFailed {
            path: self.path.clone(),
            reason,
        };
        AtomicWriter::new(WriteOptions::durable())
            .write_str(&self.path, &self.original)
            .map_err(|e| fail(format!("{e:#}")))?;
        let on_disk = hash_file(&self.path).map_err(|e| fail(format!("{e:#}")))?;
        if on_disk != self.original_hash {
            return Err(fail(format!(
                "content hash {on_disk:016x} does not match original {:016x}",
                self.original_hash
            )));
        }
        self.dirty = false;
        Ok(())
    }

    /// True unless the file provably still holds the original bytes. An
    /// install that failed before its rename leaves the file untouched.
    fn differs_from_original(&self) -> bool {
        hash_file(&self.path).map_or(true, |h| h != self.original_hash)
    }
}

impl Drop for FileSwap {
    fn drop(&mut self) {
        if !self.dirty {
            return;
        }
        match self.restore() {
            Ok(()) => warn!(file = %self.path.display(), "restored original content on unwind"),
            Err(e) if self.differs_from_original() => {
                error!(error = %e, "restore on drop failed");
                report_left_mutated(&self.path);
            }
            Err(e) => {
                warn!(error = %e, file = %self.path.display(), "restore on drop failed but content is original");
            }
        }
    }
}

/// The one message a user must not miss.
pub fn report_left_mutated(path: &Path) {
    eprintln!(
        "{} FILE MAY BE LEFT MUTATED: {}",
        "FATAL:".red().bold(),
        path.display()
    );
    eprintln!("  Check it against version control before continuing.");
}

/// Lock files live in the temp dir so the working tree stays clean; the name
/// is the xxh3 of the canonical path so `a.js` and `./a.js` share one lock.
pub fn lock_path_for(target: &Path) -> PathBuf {
    let canonical = fs::canonicalize(target).unwrap_or_else(|_| target.to_path_buf());
    let hash = xxh3_64(canonical.to_string_lossy().as_bytes());
    std::env::temp_dir()
        .join("kata-locks")
        .join(format!("{hash:016x}.lock"))
}

fn open_lock(lock_path: &Path) -> std::io::Result<File> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)
}
