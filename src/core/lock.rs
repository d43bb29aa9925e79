//! Exclusive run lock
//!
//! A cycle, a dedupe pass and every daemon tick hold an exclusive `flock`
//! on `<state dir>/portsync.lock` for their whole duration, so two
//! processes never interleave partial updates to the same chain or list.
//! The kernel drops the lock if the holder dies; no stale-lock cleanup is
//! needed.

use crate::core::error::{Error, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const LOCK_FILE: &str = "portsync.lock";

/// Held for as long as the value lives
#[derive(Debug)]
pub struct RunLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl RunLock {
    /// Takes the lock without waiting; `Error::Busy` if another process has it.
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(LOCK_FILE);
        // Not truncated before locking: that would wipe the holder's PID
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .mode(0o600)
            .open(&path)?;

        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, Errno::EWOULDBLOCK)) => {
                debug!(
                    "Run lock {} held by {}",
                    path.display(),
                    Self::holder(&path).map_or_else(|| "unknown process".to_string(), |p| format!("pid {p}"))
                );
                return Err(Error::Busy);
            }
            Err((_, errno)) => return Err(Error::Io(errno.into())),
        };

        lock.set_len(0)?;
        writeln!(lock, "{}", std::process::id())?;
        debug!("Acquired run lock {}", path.display());
        Ok(Self { _lock: lock, path })
    }

    /// PID written by the current holder, if readable
    pub fn holder(path: &Path) -> Option<u32> {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
