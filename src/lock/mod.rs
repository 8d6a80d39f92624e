//! Local critical-section lock and state-directory resolution. Generalizes
//! `secrets/key.rs::keys_dir`'s `dirs::config_dir()` lookup into a single
//! place the rest of the crate (history, canary state, local lock) can
//! share.

use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Root directory for azud's local mutable state: history records, canary
/// state files, and the local deploy lock. Root processes get
/// `/var/lib/azud`; everyone else gets `~/.local/share/azud`.
pub fn state_dir() -> Result<PathBuf> {
    let dir = if is_root() {
        PathBuf::from("/var/lib/azud")
    } else {
        dirs::data_dir()
            .context("could not determine a local data directory")?
            .join("azud")
    };
    fs::create_dir_all(&dir).with_context(|| format!("failed to create state dir {}", dir.display()))?;
    Ok(dir)
}

#[cfg(unix)]
fn is_root() -> bool {
    // SAFETY: geteuid takes no arguments and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

/// Exclusive local advisory lock on `<state_dir>/<name>.lock`, held for as
/// long as the guard lives. An OS-level `flock` is tied to the open file
/// description rather than to any Rust borrow, so the guard can be held
/// across `.await` points without the self-referential-struct problem a
/// borrowed `fd-lock` guard would run into there — dropping it just closes
/// the fd, which releases the lock.
pub struct LocalLock {
    _file: File,
}

impl LocalLock {
    /// Acquire the lock for `name`. Always acquired locally *before* any
    /// remote `flock` (see `ssh::lock::with_remote_lock`) and never
    /// re-entered — a nested `acquire` call for the same name from the same
    /// process would fail immediately, which is intentional: azud never
    /// nests deploys for one service within itself.
    pub fn acquire(name: &str) -> Result<Self> {
        let dir = state_dir()?;
        let path = dir.join(format!("{}.lock", name));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        // SAFETY: file's fd is valid for the duration of this call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("another azud process holds the lock for {}", name));
        }
        Ok(Self { _file: file })
    }
}

/// Run `body` while holding the local lock for `name`. Convenience wrapper
/// around `LocalLock::acquire` for callers that don't need the guard past
/// `body`'s return.
pub fn local_lock<T>(name: &str, body: impl FnOnce() -> Result<T>) -> Result<T> {
    let _guard = LocalLock::acquire(name)?;
    body()
}
