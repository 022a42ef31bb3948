//! Eviction Tracking and Promotion Policy
//!
//! Each tier owns one [`EvictionTracker`]. It keeps the recency order (LRU)
//! and per-key access counts (LFU) and turns them into an ordered victim list
//! when the tier needs room.
//!
//! # Victim order
//!
//! ```text
//!   expired entries (soonest expiry first)
//!        │
//!        ▼
//!   non-critical entries, ranked by the incoming entry's policy
//!        │   LRU      : least recently touched first
//!        │   LFU      : lowest access count, oldest access breaks ties
//!        │   TTL-only : smallest remaining TTL first
//!        ▼
//!   critical entries, same ranking (last resort)
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};

use lru::LruCache;
use serde::{Deserialize, Serialize};

use super::entry::{CacheEntry, EvictionPolicyKind};

// =============================================================================
// Eviction Tracker
// =============================================================================

/// Recency and frequency bookkeeping for one tier
#[derive(Debug)]
pub struct EvictionTracker {
    /// Recency order, used purely as an O(1) linked hash map
    recency: LruCache<String, ()>,
    /// Access counts since insert
    frequency: HashMap<String, u64>,
}

impl Default for EvictionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionTracker {
    pub fn new() -> Self {
        Self {
            recency: LruCache::unbounded(),
            frequency: HashMap::new(),
        }
    }

    /// Register a newly stored key at the most-recently-used end.
    /// A replaced key starts over with a zero access count.
    pub fn record_insert(&mut self, key: &str) {
        self.recency.put(key.to_string(), ());
        self.frequency.insert(key.to_string(), 0);
    }

    /// Record a read: move to the MRU end and bump the access count
    pub fn touch(&mut self, key: &str) {
        if self.recency.get(key).is_some() {
            *self.frequency.entry(key.to_string()).or_insert(0) += 1;
        }
    }

    /// Forget a key
    pub fn remove(&mut self, key: &str) {
        self.recency.pop(key);
        self.frequency.remove(key);
    }

    /// Access count for a key (0 if unknown)
    pub fn frequency(&self, key: &str) -> u64 {
        self.frequency.get(key).copied().unwrap_or(0)
    }

    /// Keys from least to most recently used
    pub fn recency_order(&self) -> impl Iterator<Item = &str> {
        self.recency.iter().rev().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.recency.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recency.is_empty()
    }

    /// Drop frequency slots for keys no longer tracked and release spare
    /// capacity. Returns the number of slots reclaimed.
    pub fn compact(&mut self) -> usize {
        let before = self.frequency.len();
        let recency = &self.recency;
        self.frequency.retain(|k, _| recency.contains(k));
        let dropped = before - self.frequency.len();
        self.frequency.shrink_to_fit();
        dropped
    }

    /// Pick victims freeing at least `bytes_needed`.
    ///
    /// `exclude` is the key being written; it is never its own victim. When
    /// everything evictable is still not enough, every candidate is returned
    /// with `sufficient == false` and the caller must not evict any of them.
    pub fn select_victims(
        &self,
        policy: EvictionPolicyKind,
        bytes_needed: u64,
        entries: &BTreeMap<String, CacheEntry>,
        now_ms: u64,
        exclude: Option<&str>,
    ) -> Victims {
        let ranked = self.rank(policy, entries, exclude);

        let mut expired = Vec::new();
        let mut regular = Vec::new();
        let mut pinned = Vec::new();
        for entry in ranked {
            if entry.is_expired(now_ms) {
                expired.push(entry);
            } else if entry.is_pinned() {
                pinned.push(entry);
            } else {
                regular.push(entry);
            }
        }
        expired.sort_by_key(|e| e.expires_at().unwrap_or(u64::MAX));

        let mut victims = Victims::default();
        for entry in expired.into_iter().chain(regular).chain(pinned) {
            if victims.freed >= bytes_needed {
                break;
            }
            victims.freed += entry.size_bytes;
            victims.keys.push(entry.key.clone());
        }
        victims.sufficient = victims.freed >= bytes_needed;
        victims
    }

    /// Every candidate entry, most evictable first, by policy alone
    fn rank<'a>(
        &self,
        policy: EvictionPolicyKind,
        entries: &'a BTreeMap<String, CacheEntry>,
        exclude: Option<&str>,
    ) -> Vec<&'a CacheEntry> {
        let candidate = |e: &&CacheEntry| Some(e.key.as_str()) != exclude;

        match policy {
            EvictionPolicyKind::Lru => {
                let mut seen = HashSet::with_capacity(entries.len());
                let mut ranked: Vec<&CacheEntry> = self
                    .recency_order()
                    .filter_map(|k| entries.get(k))
                    .filter(candidate)
                    .inspect(|e| {
                        seen.insert(e.key.as_str());
                    })
                    .collect();
                // Untracked entries only appear if bookkeeping drifted; treat as coldest
                let untracked: Vec<&CacheEntry> = entries
                    .values()
                    .filter(candidate)
                    .filter(|e| !seen.contains(e.key.as_str()))
                    .collect();
                ranked.splice(0..0, untracked);
                ranked
            }
            EvictionPolicyKind::Lfu => {
                let mut ranked: Vec<&CacheEntry> = entries.values().filter(candidate).collect();
                ranked.sort_by(|a, b| {
                    self.frequency(&a.key)
                        .cmp(&self.frequency(&b.key))
                        .then(a.last_accessed_at.cmp(&b.last_accessed_at))
                        .then(a.key.cmp(&b.key))
                });
                ranked
            }
            EvictionPolicyKind::TtlOnly => {
                let mut ranked: Vec<&CacheEntry> = entries.values().filter(candidate).collect();
                ranked.sort_by(|a, b| {
                    a.expires_at()
                        .unwrap_or(u64::MAX)
                        .cmp(&b.expires_at().unwrap_or(u64::MAX))
                        .then(a.key.cmp(&b.key))
                });
                ranked
            }
        }
    }
}

/// Result of victim selection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Victims {
    /// Keys in eviction order
    pub keys: Vec<String>,
    /// Bytes released if every key is evicted
    pub freed: u64,
    /// Whether `freed` covers the requested amount
    pub sufficient: bool,
}

// =============================================================================
// Promotion Policy
// =============================================================================

/// Controls copying hits from slower tiers into memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionPolicy {
    /// Promote on hits below the memory tier
    pub enabled: bool,
    /// Skip promotion once memory utilization exceeds this fraction
    pub max_memory_utilization: f64,
    /// Keep the entry in the persistent tier after promoting it
    pub retain_source: bool,
}

impl Default for PromotionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_memory_utilization: 0.90,
            retain_source: false,
        }
    }
}

impl PromotionPolicy {
    /// Never promote
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Whether a hit may be promoted given current memory utilization
    pub fn should_promote(&self, memory_utilization: f64) -> bool {
        self.enabled && memory_utilization <= self.max_memory_utilization
    }
}

// =============================================================================
// Tests
// =============================================================================
