//! Per-client message logs.
//!
//! Every line a client sends is appended to `<dir>/<host>.log`, where
//! `<host>` is the peer IP with separators replaced by `_`. Handles are
//! shared by all connections from the same host:
//! - a connection holds a `HostLease` for its whole lifetime
//! - the file is opened lazily on the first appended line
//! - the file is closed and evicted when the last lease for the host drops
//!
//! The registry lock only covers lookup, insert and evict. Writes go
//! through a per-host lock, so hosts never wait on each other and a
//! record is never interleaved with another writer's.

use bytes::BytesMut;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use crate::protocol::TIMESTAMP_FORMAT;

/// Log sink errors. None of these are fatal to a connection.
#[derive(Debug)]
pub enum ChatLogError {
    Open(PathBuf, std::io::Error),
    Write(PathBuf, std::io::Error),
}

impl std::fmt::Display for ChatLogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatLogError::Open(path, e) => {
                write!(f, "Failed to open log file '{}': {}", path.display(), e)
            }
            ChatLogError::Write(path, e) => {
                write!(f, "Failed to write log file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ChatLogError {}

/// An open, append-mode log file for one host
#[derive(Debug)]
pub struct HostFile {
    path: PathBuf,
    file: tokio::sync::Mutex<File>,
}

impl HostFile {
    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one `[timestamp] line` record.
    async fn write_record(&self, line: &[u8]) -> Result<(), ChatLogError> {
        let stamp = chrono::Local::now().format(TIMESTAMP_FORMAT).to_string();

        let mut record = BytesMut::with_capacity(stamp.len() + line.len() + 4);
        record.extend_from_slice(b"[");
        record.extend_from_slice(stamp.as_bytes());
        record.extend_from_slice(b"] ");
        record.extend_from_slice(line);
        record.extend_from_slice(b"\n");

        let mut file = self.file.lock().await;
        file.write_all(&record)
            .await
            .map_err(|e| ChatLogError::Write(self.path.clone(), e))?;
        file.flush()
            .await
            .map_err(|e| ChatLogError::Write(self.path.clone(), e))
    }
}

#[derive(Debug, Default)]
struct HostEntry {
    /// Live connections from this host
    leases: usize,
    file: Option<Arc<HostFile>>,
}

/// Registry of per-host log files
#[derive(Debug)]
pub struct ChatLog {
    dir: PathBuf,
    hosts: Mutex<HashMap<String, HostEntry>>,
}

impl ChatLog {
    /// Create the registry, creating `dir` if needed.
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Arc<Self>> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "Client log directory ready");

        Ok(Arc::new(Self {
            dir,
            hosts: Mutex::new(HashMap::new()),
        }))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the log file for `host`.
    pub fn path_for(&self, host: &str) -> PathBuf {
        self.dir.join(format!("{}.log", file_stem(host)))
    }

    fn hosts(&self) -> MutexGuard<'_, HashMap<String, HostEntry>> {
        // Critical sections never panic midway, so a poisoned map is intact.
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection from `host`. The handle stays available until
    /// the last lease for the host is dropped.
    pub fn acquire(self: &Arc<Self>, host: &str) -> HostLease {
        self.hosts().entry(host.to_string()).or_default().leases += 1;
        HostLease {
            log: Arc::clone(self),
            host: host.to_string(),
        }
    }

    /// Return the open handle for `host`, opening it in append mode if
    /// needed. The open itself runs without the registry lock held.
    pub async fn get_or_open(&self, host: &str) -> Result<Arc<HostFile>, ChatLogError> {
        let cached = self.hosts().get(host).and_then(|entry| entry.file.clone());
        if let Some(file) = cached {
            return Ok(file);
        }

        let path = self.path_for(host);
        let opened = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| ChatLogError::Open(path.clone(), e))?;

        let mut hosts = self.hosts();
        let entry = hosts.entry(host.to_string()).or_default();
        if let Some(file) = &entry.file {
            // Another writer opened it first; ours is dropped.
            return Ok(Arc::clone(file));
        }
        trace!(host, path = %path.display(), "Opened client log");

        let file = Arc::new(HostFile {
            path,
            file: tokio::sync::Mutex::new(opened),
        });
        entry.file = Some(Arc::clone(&file));
        Ok(file)
    }

    /// Append a timestamped record for `host`.
    pub async fn append(&self, host: &str, line: &[u8]) -> Result<(), ChatLogError> {
        let file = self.get_or_open(host).await?;
        file.write_record(line).await
    }

    /// Close and evict the handle for `host`. No-op if nothing is open.
    /// Live leases keep their entry and reopen on their next append.
    #[allow(dead_code)]
    pub fn close(&self, host: &str) {
        let mut hosts = self.hosts();
        if let Some(entry) = hosts.get_mut(host) {
            if entry.file.take().is_some() {
                trace!(host, "Closed client log");
            }
            if entry.leases == 0 {
                hosts.remove(host);
            }
        }
    }

    /// Drop one lease; the last one out closes and evicts the handle.
    fn release(&self, host: &str) {
        let mut hosts = self.hosts();
        let Some(entry) = hosts.get_mut(host) else {
            return;
        };

        entry.leases = entry.leases.saturating_sub(1);
        if entry.leases == 0 {
            if let Some(entry) = hosts.remove(host) {
                if entry.file.is_some() {
                    trace!(host, "Closed client log");
                }
            }
        }
    }

    /// Whether a handle for `host` is currently open.
    #[cfg(test)]
    pub fn is_open(&self, host: &str) -> bool {
        self.hosts()
            .get(host)
            .map(|entry| entry.file.is_some())
            .unwrap_or(false)
    }

    /// Number of hosts with a live lease or open handle.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.hosts().len()
    }
}

/// One connection's claim on its host's log. Dropping it releases the
/// claim exactly once.
#[derive(Debug)]
pub struct HostLease {
    log: Arc<ChatLog>,
    host: String,
}

impl HostLease {
    pub async fn append(&self, line: &[u8]) -> Result<(), ChatLogError> {
        self.log.append(&self.host, line).await
    }
}

impl Drop for HostLease {
    fn drop(&mut self) {
        self.log.release(&self.host);
    }
}

/// Registry key for a peer: its IP without the port.
pub fn host_key(addr: &SocketAddr) -> String {
    addr.ip().to_string()
}

/// Filesystem-safe form of a host key.
fn file_stem(host: &str) -> String {
    host.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
