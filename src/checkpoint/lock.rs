//! PID lock guarding a checkpoint log against concurrent runs.

use std::collections::HashSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

use tracing::{debug, warn};

use crate::error::ConfigError;

/// Lock files held by this process, keyed by canonical path.
static HELD: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();

fn held_locks() -> MutexGuard<'static, HashSet<PathBuf>> {
    HELD.get_or_init(|| Mutex::new(HashSet::new()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Exclusive claim on a checkpoint log, held for the lifetime of a run.
///
/// The lock file sits next to the log (`<log>.lock`) and holds the owner's
/// PID. A lock whose PID no longer names a live process is stale and is
/// replaced. Locks taken by this process are also tracked in memory, so a
/// second claim from the same process is refused rather than mistaken for
/// a stale file. The file is removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Path of the lock file guarding `checkpoint_path`.
    pub fn lock_path(checkpoint_path: &Path) -> PathBuf {
        let mut name = checkpoint_path.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Acquires the lock for `checkpoint_path`.
    pub fn acquire(checkpoint_path: &Path) -> Result<Self, ConfigError> {
        let path = Self::lock_path(checkpoint_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let path = canonical_lock_path(&path);
        let pid = std::process::id();

        let mut held = held_locks();
        if held.contains(&path) {
            return Err(ConfigError::Locked {
                path: path.display().to_string(),
                pid,
            });
        }

        // Two passes: the second follows removal of a stale lock.
        for _ in 0..2 {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write!(file, "{}", pid)?;
                    file.sync_all()?;
                    debug!(path = %path.display(), pid = pid, "Acquired run lock");
                    held.insert(path.clone());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    match read_pid(&path) {
                        Some(owner) if owner != pid && process_alive(owner) => {
                            return Err(ConfigError::Locked {
                                path: path.display().to_string(),
                                pid: owner,
                            });
                        }
                        owner => {
                            warn!(path = %path.display(), stale_pid = ?owner, "Removing stale run lock");
                            match fs::remove_file(&path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == ErrorKind::NotFound => {}
                                Err(e) => return Err(e.into()),
                            }
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ConfigError::ValidationFailed(format!(
            "could not acquire run lock {}",
            path.display()
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PID recorded in the lock for `checkpoint_path`, if it is held by a
    /// live process.
    pub fn holder(checkpoint_path: &Path) -> Option<u32> {
        read_pid(&Self::lock_path(checkpoint_path)).filter(|pid| process_alive(*pid))
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // Remove the file while the path is still tracked.
        let mut held = held_locks();
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove run lock");
            }
        }
        held.remove(&self.path);
    }
}

/// Resolves the lock's directory so different spellings of one log share a key.
fn canonical_lock_path(path: &Path) -> PathBuf {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    match (fs::canonicalize(dir), path.file_name()) {
        (Ok(dir), Some(name)) => dir.join(name),
        _ => path.to_path_buf(),
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

/// Without procfs liveness cannot be checked, so any recorded PID counts.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}
