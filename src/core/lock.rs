// Cross-process provisioning lock: exclusive, blocking, released on drop.
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::core::error::{Error, ErrorKind};

/// Exclusive advisory lock on one well-known path. Holding a `DirLock` is
/// what entitles a provisioning pass to mutate its directory; the guard
/// releases on drop on every exit path, error paths included.
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    /// Block until the lock at `path` is held. There is no timeout and no
    /// cancellation; provisioning is a one-shot startup operation.
    pub fn acquire(path: &Path) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| {
                Error::new(ErrorKind::LockAcquisition)
                    .with_message("cannot open lock file")
                    .with_path(path)
                    .with_source(err)
            })?;
        file.lock_exclusive().map_err(|err| {
            Error::new(ErrorKind::LockAcquisition)
                .with_message("cannot acquire lock")
                .with_path(path)
                .with_source(err)
        })?;
        debug!(path = %path.display(), "lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
