//! Persistent Storage Backends
//!
//! Durable key/value stores behind the persistent tier. The tier only needs
//! "a successful `put` is visible to a subsequent `get`"; anything stronger
//! is up to the backend.
//!
//! - [`InMemoryBackend`]: `DashMap`-backed, for tests and ephemeral deployments
//! - [`FsBackend`]: one file per key under a data directory

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// File extension for records written by [`FsBackend`]
const RECORD_EXTENSION: &str = "entry";

/// Persistent storage backend trait
#[async_trait]
pub trait PersistentBackend: Send + Sync {
    /// Store a record, replacing any previous one
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Fetch a record
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Delete a record; returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Every stored key
    async fn list_keys(&self) -> Result<Vec<String>>;

    /// Get storage statistics
    fn stats(&self) -> BackendStats;
}

/// Backend statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackendStats {
    /// Read operations
    pub reads: u64,
    /// Write operations
    pub writes: u64,
    /// Delete operations
    pub deletes: u64,
}

#[derive(Debug, Default)]
struct OpCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl OpCounters {
    fn snapshot(&self) -> BackendStats {
        BackendStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// In-Memory Backend
// =============================================================================

/// In-memory backend using DashMap for concurrent access
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    storage: DashMap<String, Bytes>,
    counters: OpCounters,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }
}

#[async_trait]
impl PersistentBackend for InMemoryBackend {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.storage.insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.storage.get(key).map(|v| v.value().clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(self.storage.remove(key).is_some())
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self.storage.iter().map(|e| e.key().clone()).collect())
    }

    fn stats(&self) -> BackendStats {
        self.counters.snapshot()
    }
}

// =============================================================================
// Filesystem Backend
// =============================================================================

/// One file per key; file names are percent-encoded keys
#[derive(Debug)]
pub struct FsBackend {
    root: PathBuf,
    counters: OpCounters,
}

impl FsBackend {
    /// Open (creating if needed) a backend rooted at `root`
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "Opened filesystem cache backend");
        Ok(Self {
            root,
            counters: OpCounters::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", urlencoding::encode(key), RECORD_EXTENSION))
    }
}

#[async_trait]
impl PersistentBackend for FsBackend {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        let path = self.path_for(key);
        // Write-then-rename so readers never see a torn record
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        match tokio::fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match urlencoding::decode(stem) {
                Ok(key) => keys.push(key.into_owned()),
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Skipping undecodable record name")
                }
            }
        }
        Ok(keys)
    }

    fn stats(&self) -> BackendStats {
        self.counters.snapshot()
    }
}

/// Convert a backend failure into the crate error with context
pub(crate) fn backend_error(op: &str, key: &str, err: Error) -> Error {
    match err {
        Error::Backend(_) => err,
        other => Error::Backend(format!("{} {}: {}", op, key, other)),
    }
}

// =============================================================================
// Tests
// =============================================================================
