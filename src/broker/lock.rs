//! Lock files guarding a queue's scan-select-delete sequence.
//!
//! The lock file holds an owner token (`<pid>:<nonce>`). While a handle is
//! alive a heartbeat thread keeps the file's mtime fresh, so only a lock
//! whose holder died can go stale.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// Longest pause between two attempts to take a held lock.
const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// Per-process counter making owner tokens unique.
static NONCE: AtomicU64 = AtomicU64::new(0);

/// Acquire an exclusive lock file, waiting up to `timeout`.
///
/// A lock file not refreshed for twice `timeout` belongs to a dead holder
/// and is taken over.
pub fn acquire_lock(lock_path: &Path, timeout: Duration) -> Result<LockHandle> {
    let started = Instant::now();
    let mut backoff = Duration::from_millis(1);
    let token = owner_token();

    loop {
        match OpenOptions::new().write(true).create_new(true).open(lock_path) {
            Ok(mut file) => {
                writeln!(file, "{}", token)?;
                tracing::debug!("Acquired lock: {}", lock_path.display());
                return Ok(LockHandle::new(lock_path.to_path_buf(), token, timeout));
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if is_stale(lock_path, timeout) {
                    take_over_stale(lock_path, &token);
                    continue;
                }
                if started.elapsed() >= timeout {
                    return Err(Error::Lock(format!(
                        "Lock file is held: {}",
                        lock_path.display()
                    )));
                }
                thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn owner_token() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!(
        "{}:{}-{}",
        std::process::id(),
        NONCE.fetch_add(1, Ordering::Relaxed),
        nanos
    )
}

fn read_token(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn is_stale(lock_path: &Path, timeout: Duration) -> bool {
    lock_path
        .metadata()
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map_or(false, |age| age >= timeout * 2)
}

/// Move a stale lock aside. Only one waiter wins the rename; a waiter that
/// moved a lock which turned out to be fresh puts it back.
fn take_over_stale(lock_path: &Path, token: &str) {
    let observed = read_token(lock_path);
    let aside = lock_path.with_extension(format!("stale-{}", token.replace(':', "-")));

    if fs::rename(lock_path, &aside).is_err() {
        // Someone else moved it first.
        return;
    }

    let moved = read_token(&aside);
    if moved == observed {
        tracing::warn!(
            "Removed stale lock {} held by {}",
            lock_path.display(),
            moved.as_deref().unwrap_or("unknown")
        );
    } else if fs::hard_link(&aside, lock_path).is_err() {
        tracing::warn!("Could not restore live lock {}", lock_path.display());
    }
    fs::remove_file(&aside).ok();
}

/// Lock handle - refreshes the lock while alive, releases it when dropped.
#[derive(Debug)]
pub struct LockHandle {
    lock_path: PathBuf,
    token: String,
    stop: Option<Sender<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl LockHandle {
    fn new(lock_path: PathBuf, token: String, timeout: Duration) -> Self {
        let (stop, stopped) = mpsc::channel::<()>();
        let interval = (timeout / 4).max(Duration::from_millis(1));
        let path = lock_path.clone();
        let owner = token.clone();

        let heartbeat = thread::spawn(move || loop {
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if read_token(&path).as_deref() != Some(owner.as_str()) {
                        tracing::warn!("Lost lock {}", path.display());
                        return;
                    }
                    let touched = OpenOptions::new()
                        .write(true)
                        .open(&path)
                        .and_then(|f| f.set_modified(SystemTime::now()));
                    if let Err(e) = touched {
                        tracing::debug!("Could not refresh lock {}: {}", path.display(), e);
                    }
                }
                _ => return,
            }
        });

        Self {
            lock_path,
            token,
            stop: Some(stop),
            heartbeat: Some(heartbeat),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.join().ok();
        }

        if read_token(&self.lock_path).as_deref() != Some(self.token.as_str()) {
            tracing::warn!("Lock {} no longer ours, leaving it", self.lock_path.display());
            return;
        }
        if let Err(e) = fs::remove_file(&self.lock_path) {
            tracing::warn!("Failed to release lock {}: {}", self.lock_path.display(), e);
        } else {
            tracing::debug!("Released lock: {}", self.lock_path.display());
        }
    }
}

/// Acquire lock, execute function, release lock.
pub fn with_lock<T, F>(lock_path: &Path, timeout: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let _lock = acquire_lock(lock_path, timeout)?;
    f()
}
