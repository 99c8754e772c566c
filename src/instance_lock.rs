use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Exclusive per-port lock held for as long as a launched server runs.
///
/// A second launch on the same port finds the lock taken and backs off.
/// The lock is released when this value is dropped (or the process dies);
/// the lock file itself is left in place.
#[derive(Debug)]
pub struct InstanceLock {
    _file: File,
    path: PathBuf,
}

/// Path of the lock file for `port` inside `dir`.
pub fn lock_path(dir: &Path, port: u16) -> PathBuf {
    dir.join(format!("comfy-launch-{port}.lock"))
}

impl InstanceLock {
    /// Try to take the lock for `port`. Returns `Ok(None)` if another
    /// launcher already holds it.
    pub fn acquire(dir: &Path, port: u16) -> std::io::Result<Option<Self>> {
        let path = lock_path(dir, port);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "instance lock acquired");
                Ok(Some(Self { _file: file, path }))
            }
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                tracing::debug!(path = %path.display(), "instance lock held elsewhere");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
