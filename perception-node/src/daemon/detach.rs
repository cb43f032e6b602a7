use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process;

use tracing::{debug, warn};

use crate::error::Result;

/// Turns the process into a background daemon: double fork with a new
/// session in between, `umask(027)`, `chdir(working_dir)` and stdio on
/// `/dev/null`. Only the grandchild returns.
///
/// Must run before any thread is spawned.
pub fn detach_from_terminal(working_dir: &Path) -> Result<()> {
    fork_and_exit_parent()?;
    if unsafe { libc::setsid() } < 0 {
        return Err(io::Error::last_os_error().into());
    }
    fork_and_exit_parent()?;

    unsafe {
        libc::umask(0o027);
    }
    std::env::set_current_dir(working_dir)?;
    redirect_stdio()
}

fn fork_and_exit_parent() -> Result<()> {
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error().into()),
        0 => Ok(()),
        _ => unsafe { libc::_exit(0) },
    }
}

fn redirect_stdio() -> Result<()> {
    let devnull = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    let fd = devnull.as_raw_fd();
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if unsafe { libc::dup2(fd, target) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// PID file written at startup and removed when dropped.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: &Path) -> Result<Self> {
        fs::write(path, format!("{}\n", process::id()))?;
        debug!("Wrote PID file {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove PID file {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tof-daemon.pid");
        let pid_file = PidFile::create(&path).unwrap();
        assert_eq!(pid_file.path(), path);
        let pid: u32 = fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(pid, process::id());

        drop(pid_file);
        assert!(!path.exists());
    }

    #[test]
    fn test_pid_file_in_missing_directory_fails() {
        assert!(PidFile::create(Path::new("/nonexistent/dir/tof-daemon.pid")).is_err());
    }
}
