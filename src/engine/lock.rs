//! Exclusive directory lock taken for the lifetime of an open [`super::Engine`].
//!
//! A lock file (`LOCK`) is created with `create_new`, so a second `open()`
//! against the same directory fails outright. If the directory was left
//! locked by a process that has since died (a crash, not a clean `close()`),
//! the lock is reclaimed: the file's recorded PID is checked for liveness
//! via `/proc/<pid>` on Unix, and a dead owner's lock is removed and
//! replaced with our own.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

const LOCK_FILE_NAME: &str = "LOCK";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("directory is already locked by a live process (pid {0})")]
    AlreadyLocked(u32),
}

pub struct DirLock {
    path: PathBuf,
}

impl DirLock {
    /// Acquire the lock for `dir`, reclaiming an orphaned lock left by a
    /// process that is no longer running.
    pub fn acquire(dir: &Path) -> Result<Self, LockError> {
        let path = dir.join(LOCK_FILE_NAME);

        match try_create(&path) {
            Ok(()) => return Ok(Self { path }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        let owner_pid = read_owner_pid(&path)?;
        if let Some(pid) = owner_pid {
            if process_is_alive(pid) {
                return Err(LockError::AlreadyLocked(pid));
            }
            warn!(pid, path = %path.display(), "reclaiming lock left by dead process");
        } else {
            warn!(path = %path.display(), "reclaiming lock file with unreadable owner pid");
        }

        fs::remove_file(&path)?;
        try_create(&path)?;
        Ok(Self { path })
    }

    pub fn release(self) -> Result<(), LockError> {
        fs::remove_file(&self.path)?;
        info!(path = %self.path.display(), "released directory lock");
        Ok(())
    }
}

fn try_create(path: &Path) -> io::Result<()> {
    let mut file = OpenOptions::new().create_new(true).write(true).open(path)?;
    write!(file, "{}", std::process::id())?;
    file.sync_all()?;
    Ok(())
}

fn read_owner_pid(path: &Path) -> io::Result<Option<u32>> {
    let mut contents = String::new();
    OpenOptions::new().read(true).open(path)?.read_to_string(&mut contents)?;
    Ok(contents.trim().parse().ok())
}

#[cfg(unix)]
fn process_is_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(unix))]
fn process_is_alive(_pid: u32) -> bool {
    // No portable liveness check off Unix; assume live so we never silently
    // steal a lock that's still held.
    true
}
