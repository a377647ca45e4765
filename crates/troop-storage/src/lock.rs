//! Single-writer guard: an exclusive advisory lock on `<db>.lock` for the life of a sync.
//!
//! The operating system drops the lock when the holding process exits, however
//! it exits, so a lock file left behind by a killed sync never blocks the next one.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("store {} is already being synced by another process", .store.display())]
    Held { store: PathBuf, lock: PathBuf },
    #[error("locking {}: {source}", .lock.display())]
    Io {
        lock: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Held while a sync writes to the store; dropping it releases the lock.
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
    file: File,
}

impl StoreLock {
    pub fn lock_path(db_path: &Path) -> PathBuf {
        let mut name = db_path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    pub fn acquire(db_path: &Path) -> Result<Self, LockError> {
        let path = Self::lock_path(db_path);
        let io_err = |source| LockError::Io {
            lock: path.clone(),
            source,
        };
        // No truncation before the lock is ours: the holder's annotation stays readable.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;
        if let Err(err) = file.try_lock_exclusive() {
            if err.kind() == fs2::lock_contended_error().kind() {
                return Err(LockError::Held {
                    store: db_path.to_path_buf(),
                    lock: path,
                });
            }
            return Err(io_err(err));
        }

        // Diagnostics only; the advisory lock is what excludes other writers.
        let annotated = file
            .set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)))
            .and_then(|_| {
                writeln!(
                    file,
                    "pid={} acquired_at={}",
                    std::process::id(),
                    Utc::now().to_rfc3339()
                )
            });
        if let Err(err) = annotated {
            warn!(lock = %path.display(), error = %err, "could not annotate lock file");
        }
        debug!(lock = %path.display(), "store lock acquired");
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        // The file stays; deleting it would let a waiter lock an unlinked inode.
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(lock = %self.path.display(), error = %err, "failed to release store lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_the_first_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("troop.db");

        let held = StoreLock::acquire(&db).unwrap();
        assert_eq!(held.path(), dir.path().join("troop.db.lock"));
        assert!(matches!(StoreLock::acquire(&db), Err(LockError::Held { .. })));

        drop(held);
        assert!(StoreLock::acquire(&db).is_ok());
    }

    #[test]
    fn leftover_lock_file_from_a_dead_process_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("troop.db");
        let lock = StoreLock::lock_path(&db);
        std::fs::write(&lock, "pid=4242424 acquired_at=2024-01-01T00:00:00Z\n").unwrap();

        let held = StoreLock::acquire(&db).unwrap();
        let annotation = std::fs::read_to_string(held.path()).unwrap();
        assert!(annotation.starts_with(&format!("pid={} ", std::process::id())));
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("absent").join("troop.db");
        assert!(matches!(StoreLock::acquire(&db), Err(LockError::Io { .. })));
    }
}
