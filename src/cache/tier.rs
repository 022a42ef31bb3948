//! Tier Stores
//!
//! A tier holds [`CacheEntry`] records for one storage level under its own
//! byte budget. All map mutations go through [`TierCore`], which serializes
//! the check-evict-insert sequence behind one mutex per tier. Decoding happens
//! outside the lock on a cloned entry, so a reader that already holds a value
//! is unaffected by a concurrent eviction of that key.
//!
//! # Design
//!
//! ```text
//!            ┌──────────────────────────── TierStore (async) ───┐
//!            │  MemoryTier            PersistentTier            │
//!            │      │                    │         │            │
//!            │      ▼                    ▼         ▼            │
//!            │  TierCore ◄───────── TierCore   PersistentBackend│
//!            │  (BTreeMap + EvictionTracker under one Mutex)    │
//!            └──────────────────────────────────────────────────┘
//! ```
//!
//! Tiers never move entries between themselves; promotion is orchestrated by
//! the manager.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::backend::{backend_error, PersistentBackend};
use super::clock::Clock;
use super::codec::EntryCodec;
use super::entry::{CacheEntry, Priority, TierKind};
use super::policy::EvictionTracker;
use crate::error::{Error, Result};

/// Default memory tier budget (64 MiB)
pub const DEFAULT_MEMORY_CAPACITY: u64 = 64 * 1024 * 1024;

/// Default persistent tier budget (1 GiB)
pub const DEFAULT_PERSISTENT_CAPACITY: u64 = 1024 * 1024 * 1024;

// =============================================================================
// Configuration
// =============================================================================

/// Per-tier configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// Byte budget for post-codec values
    pub max_size_bytes: u64,
    /// Entries examined per maintenance batch
    pub sweep_batch_size: usize,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_MEMORY_CAPACITY,
            sweep_batch_size: 256,
        }
    }
}

impl TierConfig {
    pub fn with_capacity(max_size_bytes: u64) -> Self {
        Self {
            max_size_bytes,
            ..Self::default()
        }
    }

    /// Defaults for the persistent tier
    pub fn persistent() -> Self {
        Self::with_capacity(DEFAULT_PERSISTENT_CAPACITY)
    }
}

// =============================================================================
// Results
// =============================================================================

/// Outcome of a tier lookup
#[derive(Debug, Clone)]
pub enum Lookup {
    /// Found, decoded and verified; `entry` reflects the recorded access
    Hit { entry: CacheEntry, value: Bytes },
    /// Key not present
    Miss,
    /// Present but past its TTL; removed
    Expired,
    /// Checksum mismatch; removed
    Corrupt,
    /// Decrypt/decompress failed; removed
    CodecFailure,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit { .. })
    }

    /// Whether the lookup removed a dead entry as a side effect
    pub fn removed_entry(&self) -> bool {
        matches!(
            self,
            Lookup::Expired | Lookup::Corrupt | Lookup::CodecFailure
        )
    }
}

/// Outcome of a successful put
#[derive(Debug, Clone, Default)]
pub struct PutOutcome {
    /// Entries evicted to make room, in eviction order
    pub evicted: Vec<CacheEntry>,
    /// Previous entry for the same key, if any
    pub replaced: Option<CacheEntry>,
}

/// One batch of an expiry sweep
#[derive(Debug, Clone, Default)]
pub struct SweepBatch {
    /// Expired entries that were removed
    pub removed: Vec<CacheEntry>,
    /// Entries examined
    pub scanned: usize,
    /// Resume point for the next batch (`None` = sweep finished)
    pub next_cursor: Option<String>,
}

/// Tier statistics
#[derive(Debug, Clone, Serialize)]
pub struct TierStats {
    pub kind: TierKind,
    /// Number of entries
    pub entries: usize,
    /// Current size in bytes
    pub size_bytes: u64,
    /// Capacity in bytes
    pub max_size_bytes: u64,
    /// Utilization (0.0 - 1.0)
    pub utilization: f64,
}

// =============================================================================
// Tier Core
// =============================================================================

#[derive(Debug, Default)]
struct TierState {
    entries: BTreeMap<String, CacheEntry>,
    tracker: EvictionTracker,
    current_size: u64,
}

impl TierState {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let removed = self.entries.remove(key)?;
        self.current_size = self.current_size.saturating_sub(removed.size_bytes);
        self.tracker.remove(key);
        Some(removed)
    }

    /// Remove only if the stored entry is still the given version
    fn remove_if_same(&mut self, expected: &CacheEntry) -> Option<CacheEntry> {
        let unchanged = self
            .entries
            .get(&expected.key)
            .is_some_and(|current| same_version(current, expected));
        if unchanged {
            self.remove(&expected.key)
        } else {
            None
        }
    }
}

/// Two entries are the same stored version of a key
fn same_version(a: &CacheEntry, b: &CacheEntry) -> bool {
    a.created_at == b.created_at && a.checksum == b.checksum && a.value == b.value
}

/// Synchronous tier state shared by every [`TierStore`] implementation
pub struct TierCore {
    kind: TierKind,
    config: TierConfig,
    state: Mutex<TierState>,
    codec: Arc<EntryCodec>,
    clock: Arc<dyn Clock>,
}

impl TierCore {
    pub fn new(
        kind: TierKind,
        config: TierConfig,
        codec: Arc<EntryCodec>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            kind,
            config,
            state: Mutex::new(TierState::default()),
            codec,
            clock,
        }
    }

    /// Insert, evicting per the entry's policy if the budget requires it.
    ///
    /// Fails with `CapacityExceeded` and leaves the tier untouched when the
    /// entry cannot fit even after evicting every other entry.
    pub fn insert(&self, entry: CacheEntry) -> Result<PutOutcome> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        self.insert_locked(&mut state, entry, now)
    }

    /// Insert only when no live entry holds the key. Returns `None` and
    /// leaves the tier untouched when one does.
    pub fn insert_if_absent(&self, entry: CacheEntry) -> Result<Option<PutOutcome>> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        if state
            .entries
            .get(&entry.key)
            .is_some_and(|current| !current.is_expired(now))
        {
            return Ok(None);
        }
        self.insert_locked(&mut state, entry, now).map(Some)
    }

    fn insert_locked(&self, state: &mut TierState, entry: CacheEntry, now: u64) -> Result<PutOutcome> {
        let size = entry.size_bytes;
        let capacity = self.config.max_size_bytes;
        let capacity_error = || Error::CapacityExceeded {
            tier: self.kind.to_string(),
            requested: size,
            capacity,
        };
        if size > capacity {
            return Err(capacity_error());
        }

        let previous_size = state.entries.get(&entry.key).map_or(0, |e| e.size_bytes);
        let projected = state.current_size - previous_size + size;

        let mut outcome = PutOutcome::default();
        if projected > capacity {
            let victims = state.tracker.select_victims(
                entry.strategy.eviction_policy,
                projected - capacity,
                &state.entries,
                now,
                Some(&entry.key),
            );
            if !victims.sufficient {
                return Err(capacity_error());
            }
            for key in &victims.keys {
                if let Some(evicted) = state.remove(key) {
                    debug!(tier = %self.kind, key = %key, size = evicted.size_bytes, "Evicted entry");
                    outcome.evicted.push(evicted);
                }
            }
        }

        outcome.replaced = state.remove(&entry.key);
        state.tracker.record_insert(&entry.key);
        state.current_size += size;
        state.entries.insert(entry.key.clone(), entry);
        Ok(outcome)
    }

    /// Look up, decode and verify a key. Dead entries are removed.
    pub fn lookup(&self, key: &str) -> Lookup {
        let now = self.clock.now_ms();
        let candidate = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get(key) else {
                return Lookup::Miss;
            };
            if entry.is_expired(now) {
                state.remove(key);
                debug!(tier = %self.kind, key = %key, "Removed expired entry on read");
                return Lookup::Expired;
            }
            entry.clone()
        };

        match self.codec.open(&candidate) {
            Ok(value) => {
                let mut guard = self.state.lock();
                let TierState {
                    entries, tracker, ..
                } = &mut *guard;
                let entry = match entries.get_mut(key) {
                    Some(current) if same_version(current, &candidate) => {
                        current.record_access(now);
                        tracker.touch(key);
                        current.clone()
                    }
                    // Replaced or evicted after we cloned it; the value we
                    // decoded is still a consistent read
                    _ => {
                        let mut detached = candidate;
                        detached.record_access(now);
                        detached
                    }
                };
                Lookup::Hit { entry, value }
            }
            Err(err) => {
                self.state.lock().remove_if_same(&candidate);
                if err.is_codec_failure() {
                    warn!(tier = %self.kind, key = %key, error = %err, "Dropping undecodable entry");
                    Lookup::CodecFailure
                } else {
                    warn!(tier = %self.kind, key = %key, "Dropping corrupt entry");
                    Lookup::Corrupt
                }
            }
        }
    }

    /// Stored entry without decoding or recording an access
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.state.lock().entries.get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        self.state.lock().remove(key)
    }

    /// Remove `expected` only if it has not been replaced in the meantime
    pub fn remove_if_same(&self, expected: &CacheEntry) -> Option<CacheEntry> {
        self.state.lock().remove_if_same(expected)
    }

    /// Present and not expired
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        self.state
            .lock()
            .entries
            .get(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Snapshot of every entry, in key order
    pub fn list(&self) -> Vec<CacheEntry> {
        self.state.lock().entries.values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().entries.keys().cloned().collect()
    }

    /// Up to `limit` entries strictly after `after`, in key order
    pub fn scan(&self, after: Option<&str>, limit: usize) -> Vec<CacheEntry> {
        let state = self.state.lock();
        Self::range_after(&state.entries, after)
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Remove expired entries among the next `limit` keys after `after`
    pub fn sweep_expired(&self, after: Option<&str>, limit: usize) -> SweepBatch {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();

        let window: Vec<(String, bool)> = Self::range_after(&state.entries, after)
            .take(limit)
            .map(|(k, e)| (k.clone(), e.is_expired(now)))
            .collect();

        let mut batch = SweepBatch {
            scanned: window.len(),
            next_cursor: if window.len() == limit {
                window.last().map(|(k, _)| k.clone())
            } else {
                None
            },
            ..SweepBatch::default()
        };
        for (key, expired) in window {
            if expired {
                if let Some(entry) = state.remove(&key) {
                    batch.removed.push(entry);
                }
            }
        }
        batch
    }

    /// Swap `expected` for `updated` if `expected` is still the stored
    /// version and the new size fits without evicting anything.
    /// Recency and frequency are preserved.
    pub fn replace(&self, expected: &CacheEntry, updated: CacheEntry) -> bool {
        let mut state = self.state.lock();
        let Some(current) = state.entries.get(&expected.key) else {
            return false;
        };
        if !same_version(current, expected) || updated.key != expected.key {
            return false;
        }
        let projected = state.current_size - current.size_bytes + updated.size_bytes;
        if projected > self.config.max_size_bytes {
            return false;
        }
        state.current_size = projected;
        state.entries.insert(updated.key.clone(), updated);
        true
    }

    /// Relabel an entry's priority in place
    pub fn update_priority(&self, key: &str, priority: Priority) -> Option<CacheEntry> {
        let mut state = self.state.lock();
        let entry = state.entries.get_mut(key)?;
        entry.strategy.priority = priority;
        Some(entry.clone())
    }

    /// Rebuild the map and drop stale tracker slots; the key set is unchanged.
    /// Returns the number of reclaimed slots.
    pub fn compact(&self) -> usize {
        let mut state = self.state.lock();
        let rebuilt: BTreeMap<String, CacheEntry> = std::mem::take(&mut state.entries)
            .into_iter()
            .collect();
        let actual_size: u64 = rebuilt.values().map(|e| e.size_bytes).sum();
        if actual_size != state.current_size {
            warn!(
                tier = %self.kind,
                tracked = state.current_size,
                actual = actual_size,
                "Tier size drifted; corrected during compaction"
            );
            state.current_size = actual_size;
        }
        state.entries = rebuilt;

        let mut reclaimed = state.tracker.compact();
        let orphans: Vec<String> = state
            .tracker
            .recency_order()
            .filter(|k| !state.entries.contains_key(*k))
            .map(str::to_string)
            .collect();
        for key in &orphans {
            state.tracker.remove(key);
        }
        reclaimed += orphans.len();
        reclaimed
    }

    fn range_after<'a>(
        entries: &'a BTreeMap<String, CacheEntry>,
        after: Option<&str>,
    ) -> std::collections::btree_map::Range<'a, String, CacheEntry> {
        match after {
            Some(cursor) => {
                entries.range::<str, _>((Bound::Excluded(cursor), Bound::Unbounded))
            }
            None => entries.range::<str, _>(..),
        }
    }

    pub fn kind(&self) -> TierKind {
        self.kind
    }

    pub fn config(&self) -> &TierConfig {
        &self.config
    }

    pub fn codec(&self) -> &Arc<EntryCodec> {
        &self.codec
    }

    /// Get current size in bytes
    pub fn size_bytes(&self) -> u64 {
        self.state.lock().current_size
    }

    /// Get number of entries
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get utilization (0.0 - 1.0)
    pub fn utilization(&self) -> f64 {
        self.size_bytes() as f64 / self.config.max_size_bytes.max(1) as f64
    }

    pub fn stats(&self) -> TierStats {
        let state = self.state.lock();
        TierStats {
            kind: self.kind,
            entries: state.entries.len(),
            size_bytes: state.current_size,
            max_size_bytes: self.config.max_size_bytes,
            utilization: state.current_size as f64 / self.config.max_size_bytes.max(1) as f64,
        }
    }
}

impl std::fmt::Debug for TierCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierCore")
            .field("kind", &self.kind)
            .field("config", &self.config)
            .finish()
    }
}

// =============================================================================
// Tier Store Trait
// =============================================================================

/// Async tier interface used by the manager
#[async_trait]
pub trait TierStore: Send + Sync {
    fn kind(&self) -> TierKind {
        self.core().kind()
    }

    fn core(&self) -> &TierCore;

    /// Store an entry, evicting as needed
    async fn put(&self, entry: CacheEntry) -> Result<PutOutcome>;

    /// Look up a key
    async fn get(&self, key: &str) -> Lookup;

    /// Remove a key; returns the removed entry
    async fn delete(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Remove `expected` only if it is still the stored version of its key
    async fn delete_if_same(&self, expected: &CacheEntry) -> Result<bool>;

    async fn contains(&self, key: &str) -> bool {
        self.core().contains(key)
    }

    fn list(&self) -> Vec<CacheEntry> {
        self.core().list()
    }

    /// Expire one bounded batch
    async fn sweep_expired(&self, after: Option<&str>, limit: usize) -> Result<SweepBatch>;

    /// Compare-and-swap an entry's stored form
    async fn replace(&self, expected: &CacheEntry, updated: CacheEntry) -> Result<bool>;

    async fn update_priority(&self, key: &str, priority: Priority) -> Result<bool>;

    async fn compact(&self) -> usize {
        self.core().compact()
    }
}

// =============================================================================
// Memory Tier
// =============================================================================

/// In-process tier
#[derive(Debug)]
pub struct MemoryTier {
    core: TierCore,
}

impl MemoryTier {
    pub fn new(config: TierConfig, codec: Arc<EntryCodec>, clock: Arc<dyn Clock>) -> Self {
        Self {
            core: TierCore::new(TierKind::Memory, config, codec, clock),
        }
    }
}

#[async_trait]
impl TierStore for MemoryTier {
    fn core(&self) -> &TierCore {
        &self.core
    }

    async fn put(&self, entry: CacheEntry) -> Result<PutOutcome> {
        self.core.insert(entry)
    }

    async fn get(&self, key: &str) -> Lookup {
        self.core.lookup(key)
    }

    async fn delete(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.core.remove(key))
    }

    async fn delete_if_same(&self, expected: &CacheEntry) -> Result<bool> {
        Ok(self.core.remove_if_same(expected).is_some())
    }

    async fn sweep_expired(&self, after: Option<&str>, limit: usize) -> Result<SweepBatch> {
        Ok(self.core.sweep_expired(after, limit))
    }

    async fn replace(&self, expected: &CacheEntry, updated: CacheEntry) -> Result<bool> {
        Ok(self.core.replace(expected, updated))
    }

    async fn update_priority(&self, key: &str, priority: Priority) -> Result<bool> {
        Ok(self.core.update_priority(key, priority).is_some())
    }
}

// =============================================================================
// Persistent Tier
// =============================================================================

/// Result of rehydrating a persistent tier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Entries restored into the tier
    pub loaded: usize,
    /// Expired records that were deleted
    pub expired: usize,
    /// Malformed or oversized records that were skipped
    pub skipped: usize,
}

/// Durable tier: an in-memory index mirrored to a [`PersistentBackend`]
pub struct PersistentTier {
    core: TierCore,
    backend: Arc<dyn PersistentBackend>,
}

impl PersistentTier {
    pub fn new(
        config: TierConfig,
        backend: Arc<dyn PersistentBackend>,
        codec: Arc<EntryCodec>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            core: TierCore::new(TierKind::Persistent, config, codec, clock),
            backend,
        }
    }

    pub fn backend(&self) -> &Arc<dyn PersistentBackend> {
        &self.backend
    }

    /// Rebuild the tier from the backend's records
    pub async fn load(&self) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        let now = self.core.clock.now_ms();

        for key in self.backend.list_keys().await? {
            let Some(raw) = self.backend.get(&key).await? else {
                continue;
            };
            let entry = match CacheEntry::from_record(&raw) {
                Ok(entry) if entry.key == key => entry,
                Ok(_) | Err(_) => {
                    warn!(key = %key, "Skipping malformed persistent record");
                    report.skipped += 1;
                    continue;
                }
            };
            if entry.is_expired(now) {
                self.forget(&key).await;
                report.expired += 1;
                continue;
            }
            match self.core.insert(entry) {
                Ok(outcome) => {
                    report.loaded += 1;
                    for evicted in outcome.evicted {
                        report.loaded -= 1;
                        self.forget(&evicted.key).await;
                    }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Persistent record does not fit; dropping");
                    self.forget(&key).await;
                    report.skipped += 1;
                }
            }
        }

        debug!(
            loaded = report.loaded,
            expired = report.expired,
            skipped = report.skipped,
            "Rehydrated persistent tier"
        );
        Ok(report)
    }

    /// Best-effort backend delete for entries already gone from the index
    async fn forget(&self, key: &str) {
        if let Err(e) = self.backend.delete(key).await {
            warn!(key = %key, error = %e, "Failed to delete persistent record");
        }
    }

    async fn forget_all(&self, entries: &[CacheEntry]) {
        for entry in entries {
            self.forget(&entry.key).await;
        }
    }
}

#[async_trait]
impl TierStore for PersistentTier {
    fn core(&self) -> &TierCore {
        &self.core
    }

    async fn put(&self, entry: CacheEntry) -> Result<PutOutcome> {
        let record = entry.to_record()?;
        let key = entry.key.clone();
        let stored = entry.clone();

        let outcome = self.core.insert(entry)?;
        self.forget_all(&outcome.evicted).await;

        if let Err(e) = self.backend.put(&key, record).await {
            // Keep index and backend consistent: the key is gone from both
            self.core.remove_if_same(&stored);
            self.forget(&key).await;
            return Err(backend_error("put", &key, e));
        }
        Ok(outcome)
    }

    async fn get(&self, key: &str) -> Lookup {
        let lookup = self.core.lookup(key);
        if lookup.removed_entry() {
            self.forget(key).await;
        }
        lookup
    }

    async fn delete(&self, key: &str) -> Result<Option<CacheEntry>> {
        let removed = self.core.remove(key);
        self.backend
            .delete(key)
            .await
            .map_err(|e| backend_error("delete", key, e))?;
        Ok(removed)
    }

    async fn delete_if_same(&self, expected: &CacheEntry) -> Result<bool> {
        if self.core.remove_if_same(expected).is_none() {
            return Ok(false);
        }
        self.backend
            .delete(&expected.key)
            .await
            .map_err(|e| backend_error("delete", &expected.key, e))?;
        Ok(true)
    }

    async fn sweep_expired(&self, after: Option<&str>, limit: usize) -> Result<SweepBatch> {
        let batch = self.core.sweep_expired(after, limit);
        self.forget_all(&batch.removed).await;
        Ok(batch)
    }

    async fn replace(&self, expected: &CacheEntry, updated: CacheEntry) -> Result<bool> {
        let record = updated.to_record()?;
        let key = updated.key.clone();
        if !self.core.replace(expected, updated) {
            return Ok(false);
        }
        self.backend
            .put(&key, record)
            .await
            .map_err(|e| backend_error("put", &key, e))?;
        Ok(true)
    }

    async fn update_priority(&self, key: &str, priority: Priority) -> Result<bool> {
        let Some(updated) = self.core.update_priority(key, priority) else {
            return Ok(false);
        };
        self.backend
            .put(key, updated.to_record()?)
            .await
            .map_err(|e| backend_error("put", key, e))?;
        Ok(true)
    }
}

impl std::fmt::Debug for PersistentTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentTier")
            .field("core", &self.core)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::backend::InMemoryBackend;
    use crate::cache::clock::ManualClock;
    use crate::cache::codec::AesGcmCipher;
    use crate::cache::entry::{CacheStrategy, EvictionPolicyKind};
    use crate::error::Error;

    struct Fixture {
        clock: Arc<ManualClock>,
        codec: Arc<EntryCodec>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                clock: Arc::new(ManualClock::new(1_000)),
                codec: Arc::new(EntryCodec::new(Arc::new(AesGcmCipher::new(&[3u8; 32])))),
            }
        }

        fn memory(&self, capacity: u64) -> MemoryTier {
            MemoryTier::new(
                TierConfig::with_capacity(capacity),
                self.codec.clone(),
                self.clock.clone(),
            )
        }

        fn entry(&self, key: &str, data: &[u8], strategy: CacheStrategy) -> CacheEntry {
            let stored = self.codec.encode(data, &strategy).unwrap();
            CacheEntry::new(
                key,
                stored,
                EntryCodec::checksum(data),
                strategy,
                self.clock.now_ms(),
            )
        }
    }

    #[tokio::test]
    async fn test_put_get() {
        let fx = Fixture::new();
        let tier = fx.memory(1000);

        tier.put(fx.entry("a", b"alpha", CacheStrategy::memory()))
            .await
            .unwrap();

        match tier.get("a").await {
            Lookup::Hit { entry, value } => {
                assert_eq!(value.as_ref(), b"alpha");
                assert_eq!(entry.hit_count, 1);
            }
            other => panic!("expected hit, got {:?}", other),
        }
        assert!(matches!(tier.get("missing").await, Lookup::Miss));
        assert_eq!(tier.core().size_bytes(), 5);
    }

    #[test]
    fn test_insert_if_absent_keeps_live_entry() {
        let fx = Fixture::new();
        let tier = fx.memory(1000);

        tier.core()
            .insert(fx.entry("k", b"newer", CacheStrategy::memory()))
            .unwrap();
        let outcome = tier
            .core()
            .insert_if_absent(fx.entry("k", b"stale value", CacheStrategy::memory()))
            .unwrap();

        assert!(outcome.is_none());
        assert_eq!(tier.core().peek("k").unwrap().checksum, EntryCodec::checksum(b"newer"));
        assert_eq!(tier.core().size_bytes(), 5);
    }

    #[test]
    fn test_insert_if_absent_replaces_expired_entry() {
        let fx = Fixture::new();
        let tier = fx.memory(1000);

        let short = CacheStrategy::memory().with_ttl(Duration::from_millis(10));
        tier.core().insert(fx.entry("k", b"old", short)).unwrap();
        fx.clock.advance(Duration::from_millis(10));

        let outcome = tier
            .core()
            .insert_if_absent(fx.entry("k", b"fresh", CacheStrategy::memory()))
            .unwrap()
            .expect("expired entry should not block the insert");
        assert!(outcome.replaced.is_some());
        assert_eq!(tier.core().size_bytes(), 5);
    }

    #[tokio::test]
    async fn test_replace_same_key_adjusts_size() {
        let fx = Fixture::new();
        let tier = fx.memory(1000);

        tier.put(fx.entry("k", b"original", CacheStrategy::memory()))
            .await
            .unwrap();
        let outcome = tier
            .put(fx.entry("k", b"replaced content", CacheStrategy::memory()))
            .await
            .unwrap();

        assert!(outcome.replaced.is_some());
        assert!(outcome.evicted.is_empty());
        assert_eq!(tier.core().len(), 1);
        assert_eq!(tier.core().size_bytes(), 16);
    }

    #[tokio::test]
    async fn test_replacing_large_entry_does_not_evict_itself() {
        let fx = Fixture::new();
        let tier = fx.memory(100);

        tier.put(fx.entry("k", &[1u8; 80], CacheStrategy::memory()))
            .await
            .unwrap();
        let outcome = tier
            .put(fx.entry("k", &[2u8; 90], CacheStrategy::memory()))
            .await
            .unwrap();
        assert!(outcome.evicted.is_empty());
        assert_eq!(tier.core().size_bytes(), 90);
    }

    #[tokio::test]
    async fn test_eviction_keeps_budget() {
        let fx = Fixture::new();
        let tier = fx.memory(1000);

        for i in 0..5 {
            tier.put(fx.entry(&format!("k{}", i), &[i as u8; 200], CacheStrategy::memory()))
                .await
                .unwrap();
        }
        assert_eq!(tier.core().size_bytes(), 1000);

        tier.get("k0").await;
        let outcome = tier
            .put(fx.entry("k5", &[9u8; 200], CacheStrategy::memory()))
            .await
            .unwrap();

        let evicted: Vec<_> = outcome.evicted.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(evicted, vec!["k1"]);
        assert_eq!(tier.core().size_bytes(), 1000);
        assert!(tier.contains("k0").await);
    }

    #[tokio::test]
    async fn test_oversized_entry_rejected() {
        let fx = Fixture::new();
        let tier = fx.memory(100);
        tier.put(fx.entry("small", &[0u8; 50], CacheStrategy::memory()))
            .await
            .unwrap();

        let err = tier
            .put(fx.entry("huge", &[0u8; 101], CacheStrategy::memory()))
            .await
            .unwrap_err();
        assert!(err.is_capacity_exceeded());
        assert!(tier.contains("small").await);
    }

    #[tokio::test]
    async fn test_critical_entries_evicted_last() {
        let fx = Fixture::new();
        let tier = fx.memory(300);
        let critical = CacheStrategy::memory().with_priority(Priority::Critical);

        tier.put(fx.entry("pinned", &[0u8; 100], critical.clone()))
            .await
            .unwrap();
        tier.put(fx.entry("plain", &[0u8; 100], CacheStrategy::memory()))
            .await
            .unwrap();
        tier.put(fx.entry("pinned2", &[0u8; 100], critical))
            .await
            .unwrap();

        let outcome = tier
            .put(fx.entry("new", &[0u8; 150], CacheStrategy::memory()))
            .await
            .unwrap();
        let evicted: Vec<_> = outcome.evicted.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(evicted, vec!["plain", "pinned"]);
        assert!(tier.core().size_bytes() <= 300);
    }

    #[tokio::test]
    async fn test_lazy_expiry() {
        let fx = Fixture::new();
        let tier = fx.memory(1000);
        let strategy = CacheStrategy::memory().with_ttl(Duration::from_millis(100));

        tier.put(fx.entry("t", b"ttl", strategy)).await.unwrap();
        fx.clock.advance(Duration::from_millis(99));
        assert!(tier.get("t").await.is_hit());

        fx.clock.advance(Duration::from_millis(1));
        assert!(!tier.contains("t").await);
        assert!(matches!(tier.get("t").await, Lookup::Expired));
        assert_eq!(tier.core().len(), 0);
        assert_eq!(tier.core().size_bytes(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_entry_removed() {
        let fx = Fixture::new();
        let tier = fx.memory(1000);
        let mut entry = fx.entry("c", b"good", CacheStrategy::memory());
        entry.checksum ^= 1;
        tier.put(entry).await.unwrap();

        assert!(matches!(tier.get("c").await, Lookup::Corrupt));
        assert!(tier.core().peek("c").is_none());
    }

    #[tokio::test]
    async fn test_codec_failure_removed() {
        let fx = Fixture::new();
        let tier = fx.memory(1000);
        let strategy = CacheStrategy::memory().encrypted();
        let mut entry = fx.entry("e", b"secret", strategy);
        entry.value = Bytes::from_static(b"garbage-not-a-ciphertext");
        entry.size_bytes = entry.value.len() as u64;
        tier.put(entry).await.unwrap();

        assert!(matches!(tier.get("e").await, Lookup::CodecFailure));
        assert_eq!(tier.core().len(), 0);
    }

    #[tokio::test]
    async fn test_sweep_in_batches() {
        let fx = Fixture::new();
        let tier = fx.memory(10_000);
        let short = CacheStrategy::memory().with_ttl(Duration::from_millis(10));

        for i in 0..10 {
            let strategy = if i % 2 == 0 {
                short.clone()
            } else {
                CacheStrategy::memory()
            };
            tier.put(fx.entry(&format!("k{:02}", i), b"v", strategy))
                .await
                .unwrap();
        }
        fx.clock.advance(Duration::from_millis(10));

        let mut cursor: Option<String> = None;
        let mut removed = 0;
        let mut batches = 0;
        loop {
            let batch = tier.sweep_expired(cursor.as_deref(), 3).await.unwrap();
            removed += batch.removed.len();
            batches += 1;
            cursor = batch.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        assert_eq!(removed, 5);
        assert_eq!(batches, 4);
        assert_eq!(tier.core().len(), 5);
    }

    #[tokio::test]
    async fn test_replace_compare_and_swap() {
        let fx = Fixture::new();
        let tier = fx.memory(1000);
        let original = fx.entry("k", b"value", CacheStrategy::memory());
        tier.put(original.clone()).await.unwrap();

        let mut updated = original.clone();
        updated.strategy.priority = Priority::High;
        assert!(tier.replace(&original, updated.clone()).await.unwrap());

        // Stale expectation no longer matches after a re-set
        tier.put(fx.entry("k", b"newer", CacheStrategy::memory()))
            .await
            .unwrap();
        assert!(!tier.replace(&original, updated).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_priority() {
        let fx = Fixture::new();
        let tier = fx.memory(1000);
        tier.put(fx.entry("k", b"v", CacheStrategy::memory()))
            .await
            .unwrap();

        assert!(tier.update_priority("k", Priority::Low).await.unwrap());
        assert_eq!(
            tier.core().peek("k").unwrap().strategy.priority,
            Priority::Low
        );
        assert!(!tier.update_priority("nope", Priority::Low).await.unwrap());
    }

    #[tokio::test]
    async fn test_compact_preserves_keys() {
        let fx = Fixture::new();
        let tier = fx.memory(1000);
        for key in ["a", "b", "c"] {
            tier.put(fx.entry(key, b"v", CacheStrategy::memory()))
                .await
                .unwrap();
        }
        tier.delete("b").await.unwrap();

        tier.compact().await;
        assert_eq!(tier.core().keys(), vec!["a", "c"]);
        assert_eq!(tier.core().size_bytes(), 2);
    }

    #[tokio::test]
    async fn test_lfu_policy_from_incoming_entry() {
        let fx = Fixture::new();
        let tier = fx.memory(200);
        let lfu = CacheStrategy::memory().with_policy(EvictionPolicyKind::Lfu);

        tier.put(fx.entry("hot", &[0u8; 100], lfu.clone()))
            .await
            .unwrap();
        tier.put(fx.entry("cold", &[0u8; 100], lfu.clone()))
            .await
            .unwrap();
        tier.get("hot").await;
        tier.get("hot").await;
        // "cold" is now the most recent but the least frequent
        tier.get("cold").await;

        let outcome = tier.put(fx.entry("new", &[0u8; 100], lfu)).await.unwrap();
        assert_eq!(outcome.evicted[0].key, "cold");
    }

    #[tokio::test]
    async fn test_persistent_mirrors_backend() {
        let fx = Fixture::new();
        let backend = Arc::new(InMemoryBackend::new());
        let tier = PersistentTier::new(
            TierConfig::with_capacity(1000),
            backend.clone(),
            fx.codec.clone(),
            fx.clock.clone(),
        );

        tier.put(fx.entry("p", b"durable", CacheStrategy::persistent()))
            .await
            .unwrap();
        assert_eq!(backend.len(), 1);

        let reopened = PersistentTier::new(
            TierConfig::with_capacity(1000),
            backend.clone(),
            fx.codec.clone(),
            fx.clock.clone(),
        );
        let report = reopened.load().await.unwrap();
        assert_eq!(report.loaded, 1);
        match reopened.get("p").await {
            Lookup::Hit { value, .. } => assert_eq!(value.as_ref(), b"durable"),
            other => panic!("expected hit, got {:?}", other),
        }

        reopened.delete("p").await.unwrap();
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_persistent_load_skips_bad_records() {
        let fx = Fixture::new();
        let backend = Arc::new(InMemoryBackend::new());
        backend
            .put("junk", Bytes::from_static(b"{not json"))
            .await
            .unwrap();
        let stale = fx.entry(
            "stale",
            b"old",
            CacheStrategy::persistent().with_ttl(Duration::from_millis(5)),
        );
        backend
            .put("stale", stale.to_record().unwrap())
            .await
            .unwrap();
        fx.clock.advance(Duration::from_millis(10));

        let tier = PersistentTier::new(
            TierConfig::with_capacity(1000),
            backend.clone(),
            fx.codec.clone(),
            fx.clock.clone(),
        );
        let report = tier.load().await.unwrap();
        assert_eq!(
            report,
            LoadReport {
                loaded: 0,
                expired: 1,
                skipped: 1
            }
        );
        assert_eq!(backend.list_keys().await.unwrap(), vec!["junk".to_string()]);
    }

    #[tokio::test]
    async fn test_persistent_eviction_deletes_records() {
        let fx = Fixture::new();
        let backend = Arc::new(InMemoryBackend::new());
        let tier = PersistentTier::new(
            TierConfig::with_capacity(100),
            backend.clone(),
            fx.codec.clone(),
            fx.clock.clone(),
        );

        tier.put(fx.entry("a", &[0u8; 60], CacheStrategy::persistent()))
            .await
            .unwrap();
        tier.put(fx.entry("b", &[0u8; 60], CacheStrategy::persistent()))
            .await
            .unwrap();
        assert_eq!(backend.list_keys().await.unwrap(), vec!["b".to_string()]);
        assert!(matches!(
            tier.put(fx.entry("c", &[0u8; 200], CacheStrategy::persistent()))
                .await,
            Err(Error::CapacityExceeded { .. })
        ));
    }
}
