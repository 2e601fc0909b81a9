//! The seal-and-advance protocol and its cross-process exclusion.
//!
//! Commit is an out-of-band operation: it may be issued by an external
//! control tool against a store another process has open. The single-writer
//! invariant therefore rests on a durable, file-level lock - a POSIX
//! `fcntl(F_SETLK)` advisory lock on `strata.lock` under the store root -
//! not on an in-memory mutex alone.
//!
//! Protocol, atomic with respect to crash:
//!
//! 1. guards: in-process non-reentrancy flag, then the file lock;
//! 2. flush every dirty page of the active version (durability barrier);
//! 3. persist a manifest in which the active version is sealed and the next
//!    version is active - the manifest rename is the commit point;
//! 4. only then flip the in-memory state machine.
//!
//! A failure at step 2 or 3 aborts the seal and leaves the prior active
//! version fully writable; the on-disk manifest is untouched.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::{AsFd, AsRawFd};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use strata_error::{Result, StrataError};
use strata_types::VersionId;

use crate::store::{snapshot_after_seal, EngineState};

/// Lock file name under the store root.
pub const LOCK_FILE: &str = "strata.lock";

/// Attempt a non-blocking POSIX advisory write lock over the whole file.
///
/// Returns `Ok(true)` if acquired, `Ok(false)` if another process holds a
/// conflicting lock, `Err` for real I/O errors.
fn posix_lock(file: &impl AsFd, lock_type: i32) -> Result<bool> {
    let lock_type = i16::try_from(lock_type).expect("fcntl lock type must fit in i16");
    let whence = i16::try_from(libc::SEEK_SET).expect("SEEK_SET must fit in i16");
    let flock = libc::flock {
        l_type: lock_type,
        l_whence: whence,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    };

    match nix::fcntl::fcntl(file.as_fd().as_raw_fd(), nix::fcntl::FcntlArg::F_SETLK(&flock)) {
        Ok(_) => Ok(true),
        Err(nix::errno::Errno::EACCES | nix::errno::Errno::EAGAIN) => Ok(false),
        Err(e) => Err(StrataError::Io(e.into())),
    }
}

/// Held exclusive lock on the store's lock file.
///
/// Guards commit and vacuum against each other across processes. Released on
/// drop; the fd close releases the fcntl lock even if the explicit unlock
/// fails.
pub struct CommitLock {
    file: File,
    path: PathBuf,
}

impl CommitLock {
    /// Acquire the lock, non-blocking. `StoreLocked` if another process holds
    /// it.
    pub fn acquire(root: &Path) -> Result<Self> {
        let path = root.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if !posix_lock(&file, libc::F_WRLCK)? {
            debug!(path = %path.display(), "commit lock held by another process");
            return Err(StrataError::StoreLocked {
                path: root.to_owned(),
            });
        }

        // Record the holder's pid; purely diagnostic.
        file.set_len(0)?;
        file.write_all(format!("{}\n", std::process::id()).as_bytes())?;

        debug!(path = %path.display(), "commit lock acquired");
        Ok(Self { file, path })
    }
}

impl Drop for CommitLock {
    fn drop(&mut self) {
        if let Err(e) = posix_lock(&self.file, libc::F_UNLCK) {
            warn!(path = %self.path.display(), error = %e, "commit lock release failed");
        }
    }
}

/// Run the seal-and-advance protocol. The caller holds both guards and the
/// engine write lock.
pub(crate) fn run_commit(state: &mut EngineState, root: &Path) -> Result<VersionId> {
    let sealing = state.versions.begin_seal();

    if let Err(e) = state.segments.flush() {
        state.versions.abort_seal();
        warn!(version = sealing.get(), error = %e, "commit aborted: page flush failed");
        return Err(e);
    }

    let manifest = snapshot_after_seal(state);
    if let Err(e) = manifest.persist(root) {
        state.versions.abort_seal();
        warn!(version = sealing.get(), error = %e, "commit aborted: manifest write failed");
        return Err(e);
    }

    let active = state.versions.complete_seal();
    info!(
        sealed = sealing.get(),
        active = active.get(),
        "commit complete"
    );
    Ok(active)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_reacquires_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = CommitLock::acquire(dir.path()).unwrap();
        drop(lock);
        // fcntl locks are per-process, so in-process reacquire always works;
        // cross-process exclusion is what the lock exists for.
        let _again = CommitLock::acquire(dir.path()).unwrap();
    }

    #[test]
    fn lock_file_records_pid() {
        let dir = tempfile::tempdir().unwrap();
        let _lock = CommitLock::acquire(dir.path()).unwrap();
        let contents = std::fs::read_to_string(dir.path().join(LOCK_FILE)).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }
}
