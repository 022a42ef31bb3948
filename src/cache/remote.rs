//! Remote Tiers (Network / CDN)
//!
//! The manager talks to remote caches through [`RemoteCache`] and never
//! implements their transport. Records use the same serialized entry format
//! as the persistent tier. A read that times out or fails is a miss; only
//! writes surface `RemoteTimeout`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, warn};

use super::entry::{CacheEntry, TierKind};
use crate::error::{Error, Result};

/// Remote cache collaborator
#[async_trait]
pub trait RemoteCache: Send + Sync {
    /// Identifier used in logs
    fn name(&self) -> &str;

    /// Fetch a record
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store a record
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;
}

/// A remote cache bound to a tier with a deadline on every call
#[derive(Clone)]
pub struct RemoteTier {
    kind: TierKind,
    cache: Arc<dyn RemoteCache>,
    timeout: Duration,
}

impl RemoteTier {
    pub fn new(kind: TierKind, cache: Arc<dyn RemoteCache>, timeout: Duration) -> Self {
        Self {
            kind,
            cache,
            timeout,
        }
    }

    pub fn kind(&self) -> TierKind {
        self.kind
    }

    /// Fetch and parse an entry; timeouts, errors and bad records are misses
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let raw = match tokio::time::timeout(self.timeout, self.cache.get(key)).await {
            Ok(Ok(raw)) => raw?,
            Ok(Err(e)) => {
                warn!(tier = %self.kind, remote = self.cache.name(), key = %key, error = %e, "Remote get failed");
                return None;
            }
            Err(_) => {
                warn!(
                    tier = %self.kind,
                    remote = self.cache.name(),
                    key = %key,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Remote get timed out"
                );
                return None;
            }
        };

        match CacheEntry::from_record(&raw) {
            Ok(entry) if entry.key == key => Some(entry),
            _ => {
                debug!(tier = %self.kind, key = %key, "Ignoring malformed remote record");
                None
            }
        }
    }

    /// Serialize and store an entry
    pub async fn put(&self, entry: &CacheEntry) -> Result<()> {
        let record = entry.to_record()?;
        match tokio::time::timeout(self.timeout, self.cache.put(&entry.key, record)).await {
            Ok(result) => result,
            Err(_) => Err(Error::RemoteTimeout {
                tier: self.kind.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

impl std::fmt::Debug for RemoteTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTier")
            .field("kind", &self.kind)
            .field("remote", &self.cache.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

// =============================================================================
// In-Memory Remote
// =============================================================================

/// Process-local stand-in for a remote cache, with optional artificial latency
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    name: String,
    storage: DashMap<String, Bytes>,
    latency: Option<Duration>,
}

impl InMemoryRemote {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Delay every call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl RemoteCache for InMemoryRemote {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.delay().await;
        Ok(self.storage.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.delay().await;
        self.storage.insert(key.to_string(), data);
        Ok(())
    }
}
