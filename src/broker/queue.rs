//! Directory-backed queue.
//!
//! Layout under the queue directory:
//! - `<YYYY_MM_DD_HH_MM>/` : one bucket per minute of append time
//! - `<bucket>/<creation_timestamp>.json` : one file per pending message
//! - `.dequeue.lock` : present while a consumer holds the queue

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::message::{parse_timestamp, Message};
use crate::config::OrderingMode;
use crate::error::{Error, Result};

/// strftime format of bucket directory names.
pub const BUCKET_FORMAT: &str = "%Y_%m_%d_%H_%M";

/// Lock file taken by consumers during dequeue.
pub const LOCK_FILE: &str = ".dequeue.lock";

/// Bucket name for the current local minute.
pub fn current_bucket() -> String {
    Local::now().format(BUCKET_FORMAT).to_string()
}

/// Persisted form of a queue inside `exchange.json`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct QueueDescriptor {
    pub name: String,
    pub output_path: PathBuf,
}

/// A message file waiting in a queue.
#[derive(Clone, Debug)]
pub struct PendingFile {
    pub path: PathBuf,
    /// Filesystem creation time, or modification time where unsupported.
    pub created: SystemTime,
    /// Creation timestamp from the file name (unix micros).
    pub stamp: Option<i64>,
}

impl PendingFile {
    fn inspect(path: PathBuf) -> std::io::Result<Self> {
        let metadata = fs::metadata(&path)?;
        let created = metadata.created().or_else(|_| metadata.modified())?;
        let stamp = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(parse_timestamp);

        Ok(Self { path, created, stamp })
    }
}

/// A named queue rooted at `<exchange>/<name>`.
#[derive(Debug)]
pub struct Queue {
    name: String,
    storage_path: PathBuf,
}

impl Queue {
    /// Open the queue, creating its directory if missing.
    pub fn open(name: impl Into<String>, parent: &Path) -> Result<Self> {
        let name = name.into();
        let storage_path = parent.join(&name);

        if !storage_path.exists() {
            fs::create_dir_all(&storage_path)?;
            tracing::debug!("Created queue directory: {}", storage_path.display());
        }

        Ok(Self { name, storage_path })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    pub fn descriptor(&self) -> QueueDescriptor {
        QueueDescriptor {
            name: self.name.clone(),
            output_path: self.storage_path.clone(),
        }
    }

    pub(crate) fn lock_path(&self) -> PathBuf {
        self.storage_path.join(LOCK_FILE)
    }

    /// Write a message into the bucket for the current minute.
    ///
    /// The bucket comes from the append time; the file name from the
    /// message's own creation timestamp.
    pub fn append(&self, message: &Message) -> Result<PathBuf> {
        let bucket = self.storage_path.join(current_bucket());
        if !bucket.exists() {
            fs::create_dir_all(&bucket)?;
        }

        let path = bucket.join(message.file_name());
        message.write_to(&path)?;

        tracing::debug!("Appended message {} to queue {}", message.creation_timestamp(), self.name);
        Ok(path)
    }

    /// All pending message files, oldest first under `ordering`.
    pub fn pending(&self, ordering: OrderingMode) -> Result<Vec<PendingFile>> {
        let mut files: Vec<PendingFile> = self
            .message_paths()?
            .into_iter()
            .filter_map(|path| match PendingFile::inspect(path) {
                Ok(file) => Some(file),
                Err(e) => {
                    // Usually a concurrent consumer deleted it first.
                    tracing::debug!("Skipping vanished message file: {}", e);
                    None
                }
            })
            .collect();

        match ordering {
            OrderingMode::FileCreated => files.sort_by(|a, b| {
                a.created
                    .cmp(&b.created)
                    .then_with(|| a.stamp.unwrap_or(i64::MAX).cmp(&b.stamp.unwrap_or(i64::MAX)))
                    .then_with(|| a.path.cmp(&b.path))
            }),
            OrderingMode::CreationTimestamp => files.sort_by(|a, b| {
                a.stamp
                    .unwrap_or(i64::MAX)
                    .cmp(&b.stamp.unwrap_or(i64::MAX))
                    .then_with(|| a.path.cmp(&b.path))
            }),
        }

        Ok(files)
    }

    /// Number of pending messages.
    pub fn len(&self) -> Result<usize> {
        Ok(self.message_paths()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Get queue statistics.
    pub fn stats(&self) -> Result<QueueStats> {
        let buckets = self.bucket_dirs()?.len();
        Ok(QueueStats {
            name: self.name.clone(),
            pending: self.len()?,
            buckets,
        })
    }

    /// Remove bucket directories left empty by consumers.
    ///
    /// The bucket of the current minute is kept since producers may be
    /// writing into it.
    pub fn prune_empty_buckets(&self) -> Result<usize> {
        let current = current_bucket();
        let mut removed = 0;

        for dir in self.bucket_dirs()? {
            if dir.file_name().and_then(|n| n.to_str()) == Some(current.as_str()) {
                continue;
            }
            if fs::read_dir(&dir)?.next().is_some() {
                continue;
            }
            match fs::remove_dir(&dir) {
                Ok(()) => removed += 1,
                Err(e) => tracing::debug!("Could not remove bucket {}: {}", dir.display(), e),
            }
        }

        if removed > 0 {
            tracing::info!("Pruned {} empty buckets from queue {}", removed, self.name);
        }
        Ok(removed)
    }

    /// Paths matching `<queue>/*/*.json`, in listing order.
    fn message_paths(&self) -> Result<Vec<PathBuf>> {
        let base = glob::Pattern::escape(&self.storage_path.to_string_lossy());
        let pattern = format!("{}/*/*.json", base);
        let entries = glob::glob(&pattern)
            .map_err(|e| Error::Config(format!("Bad queue path {}: {}", self.storage_path.display(), e)))?;

        let mut paths = Vec::new();
        for entry in entries {
            match entry {
                Ok(path) if path.is_file() => paths.push(path),
                Ok(_) => {}
                Err(e) => tracing::debug!("Unreadable entry in queue {}: {}", self.name, e),
            }
        }
        Ok(paths)
    }

    fn bucket_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.storage_path)? {
            let path = entry?.path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
        Ok(dirs)
    }
}

/// Queue statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub name: String,
    pub pending: usize,
    pub buckets: usize,
}

impl std::fmt::Display for QueueStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Queue {}:", self.name)?;
        writeln!(f, "  Pending: {}", self.pending)?;
        write!(f, "  Buckets: {}", self.buckets)
    }
}
