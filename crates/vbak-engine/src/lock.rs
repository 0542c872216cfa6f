use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// Process-wide advisory lock; at most one engine runs against an archive.
///
/// The lock is released when the value is dropped (the file is closed).
#[derive(Debug)]
pub struct InstanceLock {
    _file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Take the lock without waiting.
    pub fn acquire(path: &Path) -> EngineResult<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {}
            Err(Errno::EWOULDBLOCK) => {
                return Err(EngineError::Locked(path.display().to_string()))
            }
            Err(e) => return Err(std::io::Error::from(e).into()),
        }
        debug!(path = %path.display(), "instance lock acquired");
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_instance_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/vbak.lock");
        let held = InstanceLock::acquire(&path).unwrap();
        assert!(matches!(InstanceLock::acquire(&path), Err(EngineError::Locked(_))));
        drop(held);
        InstanceLock::acquire(&path).unwrap();
    }
}
