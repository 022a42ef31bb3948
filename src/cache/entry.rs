//! Cache Entry Types
//!
//! Strategy descriptors and the stored entry record. `CacheEntry::value` is
//! always the post-codec representation; the checksum covers the plaintext.

use std::collections::BTreeSet;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

// =============================================================================
// Strategy Enums
// =============================================================================

/// Storage level in the cache hierarchy, fastest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    /// In-process memory
    Memory,
    /// Local durable storage
    Persistent,
    /// Remote network cache (external collaborator)
    Network,
    /// Edge/CDN cache (external collaborator)
    Cdn,
}

impl TierKind {
    /// Every tier, fastest first
    pub const ALL: [TierKind; 4] = [
        TierKind::Memory,
        TierKind::Persistent,
        TierKind::Network,
        TierKind::Cdn,
    ];

    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            TierKind::Memory => "memory",
            TierKind::Persistent => "persistent",
            TierKind::Network => "network",
            TierKind::Cdn => "cdn",
        }
    }

    /// Tiers whose entries live in a local `TierStore`
    pub fn is_local(&self) -> bool {
        matches!(self, TierKind::Memory | TierKind::Persistent)
    }

    /// Position in [`TierKind::ALL`]
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Victim ranking used when a tier must make room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicyKind {
    /// Least recently used first
    #[default]
    Lru,
    /// Least frequently used first, oldest access breaking ties
    Lfu,
    /// Soonest to expire first
    TtlOnly,
}

/// Entry priority; `Critical` entries are evicted only as a last resort
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Pinned entries are the last eviction candidates
    pub fn is_pinned(&self) -> bool {
        *self == Priority::Critical
    }
}

// =============================================================================
// Cache Strategy
// =============================================================================

/// How an entry is stored. Immutable once attached to an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheStrategy {
    /// Target tier
    pub tier: TierKind,
    /// Time-to-live in milliseconds (0 = never expires)
    pub ttl_ms: u64,
    /// Victim ranking applied when this entry's insert needs room
    pub eviction_policy: EvictionPolicyKind,
    /// Compress before storing
    pub compression: bool,
    /// Encrypt before storing
    pub encryption: bool,
    /// Eviction priority
    pub priority: Priority,
    /// Invalidation tags
    pub tags: BTreeSet<String>,
}

impl Default for CacheStrategy {
    fn default() -> Self {
        Self {
            tier: TierKind::Memory,
            ttl_ms: 0,
            eviction_policy: EvictionPolicyKind::Lru,
            compression: false,
            encryption: false,
            priority: Priority::Medium,
            tags: BTreeSet::new(),
        }
    }
}

impl CacheStrategy {
    /// Memory tier, no expiry, LRU
    pub fn memory() -> Self {
        Self::default()
    }

    /// Persistent tier, no expiry, LRU
    pub fn persistent() -> Self {
        Self::default().on_tier(TierKind::Persistent)
    }

    pub fn on_tier(mut self, tier: TierKind) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = ttl.as_millis() as u64;
        self
    }

    pub fn with_policy(mut self, policy: EvictionPolicyKind) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn compressed(mut self) -> Self {
        self.compression = true;
        self
    }

    pub fn encrypted(mut self) -> Self {
        self.encryption = true;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

// =============================================================================
// Cache Entry
// =============================================================================

/// A stored cache record.
///
/// The serialized form (JSON via serde) is the persistent/remote record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Key, unique within a tier
    pub key: String,
    /// Post-codec bytes
    pub value: Bytes,
    /// Creation time (epoch ms)
    pub created_at: u64,
    /// Last read time (epoch ms)
    pub last_accessed_at: u64,
    /// Successful reads
    pub hit_count: u64,
    /// Length of `value`
    pub size_bytes: u64,
    /// Time-to-live in milliseconds (0 = never expires)
    pub ttl_ms: u64,
    /// Strategy the entry was stored with
    pub strategy: CacheStrategy,
    /// Invalidation tags
    pub tags: BTreeSet<String>,
    /// XXH3 checksum of the plaintext value
    pub checksum: u64,
}

impl CacheEntry {
    /// Build an entry from already-encoded bytes
    pub fn new(
        key: impl Into<String>,
        value: Bytes,
        checksum: u64,
        strategy: CacheStrategy,
        now_ms: u64,
    ) -> Self {
        Self {
            key: key.into(),
            size_bytes: value.len() as u64,
            value,
            created_at: now_ms,
            last_accessed_at: now_ms,
            hit_count: 0,
            ttl_ms: strategy.ttl_ms,
            tags: strategy.tags.clone(),
            strategy,
            checksum,
        }
    }

    /// TTL-expired at `now_ms`; checksum validity is irrelevant here
    #[inline]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.ttl_ms > 0 && now_ms.saturating_sub(self.created_at) >= self.ttl_ms
    }

    /// Absolute expiry time, if any
    #[inline]
    pub fn expires_at(&self) -> Option<u64> {
        (self.ttl_ms > 0).then(|| self.created_at.saturating_add(self.ttl_ms))
    }

    /// Milliseconds until expiry (`None` = never expires)
    pub fn remaining_ttl(&self, now_ms: u64) -> Option<u64> {
        self.expires_at().map(|at| at.saturating_sub(now_ms))
    }

    /// Milliseconds since the last read
    pub fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_accessed_at)
    }

    /// Record a read
    #[inline]
    pub fn record_access(&mut self, now_ms: u64) -> u64 {
        self.last_accessed_at = self.last_accessed_at.max(now_ms);
        self.hit_count += 1;
        self.hit_count
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.strategy.priority.is_pinned()
    }

    /// Serialize to the persistent/remote record format
    pub fn to_record(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse a persistent/remote record; `size_bytes` is re-derived from the value
    pub fn from_record(bytes: &[u8]) -> Result<Self> {
        let mut entry: CacheEntry = serde_json::from_slice(bytes)?;
        entry.size_bytes = entry.value.len() as u64;
        Ok(entry)
    }
}

// =============================================================================
// Tests
// =============================================================================
