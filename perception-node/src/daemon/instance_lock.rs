use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process;

use tracing::{debug, warn};

use crate::error::{PerceptionError, Result};

/// Exclusive advisory lock on a well-known file, held for the life of the
/// daemon. The file holds the owner's PID and is removed on drop.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Fails with [`PerceptionError::AlreadyRunning`] when another process,
    /// or another handle in this one, holds the lock.
    pub fn acquire(path: &Path) -> Result<Self> {
        // The previous owner unlinks the file on release, so a lock won on an
        // inode that is no longer at `path` is worthless; open it again.
        let mut file = loop {
            let file = open_and_lock(path)?;
            if is_current(&file, path)? {
                break file;
            }
            debug!("Lock file {} was replaced while locking, retrying", path.display());
        };

        file.set_len(0)?;
        writeln!(file, "{}", process::id())?;
        file.sync_all()?;
        debug!("Acquired instance lock {}", path.display());

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_and_lock(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o640)
        .open(path)?;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        return Err(match err.raw_os_error() {
            Some(libc::EWOULDBLOCK) => PerceptionError::AlreadyRunning(path.to_path_buf()),
            _ => err.into(),
        });
    }
    Ok(file)
}

/// True while `path` still names the inode `file` was opened on.
fn is_current(file: &File, path: &Path) -> Result<bool> {
    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(on_disk) => Ok(held.dev() == on_disk.dev() && held.ino() == on_disk.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // Unlink while still holding the lock; `acquire` rejects the stale inode.
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove lock file {}: {}", self.path.display(), e);
        }
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
