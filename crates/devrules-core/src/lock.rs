//! Cross-process file locks keyed by the paths a contract mutates.
//!
//! Each target path maps to one lock file under the locks directory. Locks
//! are `flock(LOCK_EX)` advisory locks, so they serialize every process that
//! goes through this manager and are dropped by the kernel if a process dies.
//!
//! Release unlinks the lock file while still holding the lock. To stay safe
//! against that, acquisition re-checks after locking that the path still
//! names the file it locked, and starts over if it does not.
//!
//! Targets are [`lock_key`]s, so every spelling of one file maps to the same
//! lock. Targets without `flock` fail to acquire with `Unsupported`.

use crate::config::LockWait;
use crate::contract::Step;
use crate::error::{EngineError, Result};
use crate::hasher::sha256_hex;
use crate::paths;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

const WILDCARDS: [char; 3] = ['*', '?', '['];

/// Paths a run will touch: declared `evidence` plus every internal step's
/// `file_path`, each as a [`lock_key`]. Globs are skipped since they cannot
/// name a single lock file. The set is sorted, which gives every run the
/// same acquisition order.
pub fn collect_targets(root: &Path, evidence: &[String], steps: &[Step]) -> BTreeSet<String> {
    evidence
        .iter()
        .map(String::as_str)
        .chain(steps.iter().filter_map(|s| s.kind.target_path()))
        .map(str::trim)
        .filter(|p| !p.is_empty() && !p.contains(WILDCARDS))
        .map(|p| lock_key(root, p))
        .filter(|key| !key.is_empty())
        .collect()
}

/// The key a file is locked under. `path` is resolved against `root` and
/// normalized lexically; paths inside the root become root-relative. So
/// `out.txt`, `./out.txt`, `sub/../out.txt` and `<root>/out.txt` share a key.
pub fn lock_key(root: &Path, path: impl AsRef<Path>) -> String {
    let root = paths::normalize(&paths::absolute(root));
    let full = paths::normalize(&root.join(path.as_ref()));
    let key = match full.strip_prefix(&root) {
        Ok(relative) => relative.to_path_buf(),
        Err(_) => full,
    };
    key.to_string_lossy().into_owned()
}

/// Lock file name for `path`: a readable sanitized form plus a short digest
/// of the original so `a/b` and `a_b` never share a lock.
pub fn lock_file_name(path: &str) -> String {
    let sanitized: String = path
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = sanitized.trim_start_matches('.');
    let short: String = trimmed.chars().take(80).collect();
    format!("{short}.{}.lock", &sha256_hex(path.as_bytes())[..8])
}

// ---------------------------------------------------------------------------
// FileLockManager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FileLockManager {
    dir: PathBuf,
}

impl FileLockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn lock_path(&self, target: &str) -> PathBuf {
        self.dir.join(lock_file_name(target))
    }

    /// Take the exclusive lock for `target`. With [`LockWait::Fail`] a lock
    /// held elsewhere is reported as [`EngineError::LockHeld`] at once.
    pub fn acquire(&self, target: &str, wait: LockWait) -> Result<FileLock> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.lock_path(target);
        loop {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&path)?;
            if !flock_exclusive(&file, wait == LockWait::Block)? {
                return Err(EngineError::LockHeld {
                    path: target.to_string(),
                });
            }
            if still_linked(&file, &path)? {
                tracing::debug!(path = %target, lock = %path.display(), "lock acquired");
                return Ok(FileLock {
                    target: target.to_string(),
                    path,
                    file: Some(file),
                });
            }
            // The previous holder unlinked this file after we opened it.
        }
    }

    /// Acquire every target in set order. On failure, locks already taken
    /// are released before the error is returned.
    pub fn acquire_all(&self, targets: &BTreeSet<String>, wait: LockWait) -> Result<LockSet> {
        let mut set = LockSet::default();
        for target in targets {
            set.locks.push(self.acquire(target, wait)?);
        }
        Ok(set)
    }

    /// Release a lock. Idempotent; a lock file that is already gone is not
    /// an error.
    pub fn release(&self, lock: &mut FileLock) {
        lock.release();
    }
}

// ---------------------------------------------------------------------------
// FileLock / LockSet
// ---------------------------------------------------------------------------

/// An exclusive lock on one target. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    target: String,
    path: PathBuf,
    file: Option<File>,
}

impl FileLock {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    fn release(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    lock = %self.path.display(),
                    error = %e,
                    "failed to remove lock file"
                );
            }
        }
        // Closing the descriptor drops the flock.
        drop(file);
        tracing::debug!(path = %self.target, "lock released");
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Locks held for one run, released in reverse acquisition order on drop.
#[derive(Debug, Default)]
pub struct LockSet {
    locks: Vec<FileLock>,
}

impl LockSet {
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.locks.iter().map(FileLock::target)
    }

    pub fn release_all(&mut self) {
        while let Some(mut lock) = self.locks.pop() {
            lock.release();
        }
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        self.release_all();
    }
}

// ---------------------------------------------------------------------------
// OS helpers
// ---------------------------------------------------------------------------

/// Returns `Ok(false)` only in non-blocking mode when another holder exists.
#[cfg(unix)]
fn flock_exclusive(file: &File, block: bool) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();
    let op = if block {
        libc::LOCK_EX
    } else {
        libc::LOCK_EX | libc::LOCK_NB
    };
    loop {
        // SAFETY: `fd` is a valid descriptor owned by `file` for the whole call.
        #[allow(unsafe_code)]
        let rc = unsafe { libc::flock(fd, op) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EWOULDBLOCK) if !block => return Ok(false),
            _ => return Err(err),
        }
    }
}

#[cfg(not(unix))]
fn flock_exclusive(_file: &File, _block: bool) -> io::Result<bool> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "advisory file locks require a unix target",
    ))
}

#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(on_disk) => Ok(on_disk.dev() == held.dev() && on_disk.ino() == held.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> io::Result<bool> {
    Ok(path.exists())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
