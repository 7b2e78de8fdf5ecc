//! Per-file advisory locks backed by a sidecar `<file>.lock` marker.
//!
//! The lock is an exclusive OS lock on the marker, so it serializes writers
//! across threads and across processes sharing the managed tree. The marker is
//! removed when the guard drops, on every exit path.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::protocol_core::ensure_parent_exists;

pub const LOCK_SUFFIX: &str = ".lock";

/// Sidecar marker path for `target`
pub fn lock_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(LOCK_SUFFIX);
    target.with_file_name(name)
}

/// Held exclusive lock on one target file
pub struct FileLock {
    marker: PathBuf,
    file: Option<File>,
}

impl FileLock {
    /// Block until the exclusive lock for `target` is held
    pub fn acquire(target: &Path) -> Result<FileLock> {
        let marker = lock_path(target);
        ensure_parent_exists(&marker)?;

        loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&marker)
                .with_context(|| format!("open lock marker {}", marker.display()))?;
            file.lock_exclusive()
                .with_context(|| format!("lock {}", marker.display()))?;
            // The previous holder may have unlinked the marker we opened; retry
            // on the fresh one so two writers never hold different inodes.
            if still_linked(&file, &marker) {
                return Ok(FileLock {
                    marker,
                    file: Some(file),
                });
            }
        }
    }

    pub fn marker(&self) -> &Path {
        &self.marker
    }
}

impl Drop for FileLock {
    #[cfg(unix)]
    fn drop(&mut self) {
        // Unlink while still holding the lock, then release
        if let Err(e) = std::fs::remove_file(&self.marker) {
            tracing::debug!(marker = %self.marker.display(), error = %e, "lock marker already gone");
        }
        self.release();
    }

    #[cfg(not(unix))]
    fn drop(&mut self) {
        // An open file cannot be unlinked here; release first
        self.release();
        if let Err(e) = std::fs::remove_file(&self.marker) {
            tracing::debug!(marker = %self.marker.display(), error = %e, "lock marker not removed");
        }
    }
}

impl FileLock {
    fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                tracing::debug!(marker = %self.marker.display(), error = %e, "unlock failed");
            }
        }
    }
}

/// Run `f` while holding the lock for `target`. The lock is released and its
/// marker removed whether `f` succeeds or fails.
pub fn with_file_lock<T>(target: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let _guard = FileLock::acquire(target)?;
    f()
}

#[cfg(unix)]
fn still_linked(file: &File, marker: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), std::fs::metadata(marker)) {
        (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, marker: &Path) -> bool {
    marker.exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn lock_path_appends_suffix() {
        assert_eq!(
            lock_path(Path::new("/var/ossec/etc/client.keys")),
            PathBuf::from("/var/ossec/etc/client.keys.lock")
        );
    }

    #[test]
    fn marker_removed_after_release() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("etc/agent.conf");
        {
            let lock = FileLock::acquire(&target).unwrap();
            assert!(lock.marker().exists());
        }
        assert!(!lock_path(&target).exists());
    }

    #[test]
    fn failing_writer_leaves_no_marker() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("agent.conf");

        let result: Result<()> = with_file_lock(&target, || anyhow::bail!("disk full"));
        assert!(result.is_err());
        assert!(!lock_path(&target).exists());
    }

    #[test]
    fn concurrent_writers_never_overlap() {
        let tmp = TempDir::new().unwrap();
        let target = Arc::new(tmp.path().join("shared.conf"));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let target = Arc::clone(&target);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    for _ in 0..5 {
                        with_file_lock(&target, || {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(2));
                            inside.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(!lock_path(&target).exists());
    }

    #[test]
    fn waiter_proceeds_after_holder_unlinks_marker() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("client.keys");
        let held = FileLock::acquire(&target).unwrap();

        let waiter_target = target.clone();
        let waiter = thread::spawn(move || {
            let lock = FileLock::acquire(&waiter_target).unwrap();
            lock.marker().exists()
        });
        thread::sleep(Duration::from_millis(20));
        drop(held);

        assert!(waiter.join().unwrap());
        assert!(!lock_path(&target).exists());
    }

    #[test]
    fn different_paths_do_not_block_each_other() {
        let tmp = TempDir::new().unwrap();
        let a = FileLock::acquire(&tmp.path().join("a.conf")).unwrap();
        let b = FileLock::acquire(&tmp.path().join("b.conf")).unwrap();
        drop(a);
        drop(b);
    }
}
