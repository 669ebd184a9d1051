use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// An advisory lock that works across all of the pool's processes, for actions that must be
/// restricted to one process at a time (the workers hold it while running init functions).
///
/// Mutual exclusion between processes comes from `flock` on a shared lock file; because `flock`
/// is tied to the open file description, threads within one process exclude each other through a
/// regular mutex layered on top.
///
/// Guards are RAII; acquiring the lock again on the same thread while a guard is alive is a
/// deadlock, not a reentrant acquisition. Do not hold a guard across an IPC send that can block
/// on a peer which may also need the lock.
#[derive(Debug)]
pub struct CrossProcessLock {
    file: File,
    path: PathBuf,
    local: Mutex<()>,
}

impl CrossProcessLock {
    /// Opens (creating if needed) the lock file shared by every process of the pool.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            local: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock(&self) -> std::io::Result<CrossProcessGuard<'_>> {
        let local = self
            .local
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        flock_exclusive(&self.file)?;
        Ok(CrossProcessGuard {
            file: &self.file,
            _local: local,
        })
    }
}

pub struct CrossProcessGuard<'a> {
    file: &'a File,
    _local: MutexGuard<'a, ()>,
}

impl Drop for CrossProcessGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = flock_unlock(self.file) {
            tracing::warn!("failed to release the cross-process lock: {err}");
        }
    }
}

#[cfg(unix)]
fn flock_exclusive(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    loop {
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(unix)]
fn flock_unlock(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

// Without flock the lock degrades to in-process mutual exclusion.
#[cfg(not(unix))]
fn flock_exclusive(_file: &File) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn flock_unlock(_file: &File) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_lock_file_is_created_on_open() {
        let path = std::env::temp_dir().join(format!("offload-lock-test-{}", std::process::id()));
        let lock = CrossProcessLock::open(&path).unwrap();
        assert!(lock.path().exists());

        {
            let _guard = lock.lock().unwrap();
        }
        // releasing and re-acquiring works
        let _guard = lock.lock().unwrap();

        let _ = std::fs::remove_file(&path);
    }
}
