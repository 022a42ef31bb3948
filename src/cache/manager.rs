//! Cache Manager - Tiered Cache Facade
//!
//! Routes `set`/`get`/`invalidate` and bulk operations to the memory and
//! persistent tiers (plus optional network/CDN remotes), applies the entry
//! codec, keeps the invalidation index current and promotes hits from slower
//! tiers into memory.
//!
//! The manager is an explicitly constructed value; background work (warmup
//! worker, periodic optimizer, periodic sync) starts in [`CacheManager::init`]
//! and stops in [`CacheManager::shutdown`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::backend::{InMemoryBackend, PersistentBackend};
use super::clock::{Clock, SystemClock};
use super::codec::{AesGcmCipher, Cipher, CompressionConfig, EntryCodec};
use super::entry::{CacheEntry, CacheStrategy, Priority, TierKind};
use super::index::{InvalidationIndex, KeyPattern};
use super::optimizer::{OptimizeReport, Optimizer, OptimizerConfig};
use super::policy::PromotionPolicy;
use super::remote::{RemoteCache, RemoteTier};
use super::stats::{CacheStats, StatsSnapshot};
use super::sync::{synchronize, SyncConfig, SyncReport};
use super::tier::{Lookup, MemoryTier, PersistentTier, TierConfig, TierStore};
use super::warmup::{Loader, WarmupConfig, WarmupScheduler, WarmupTicket};
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Memory tier
    pub memory: TierConfig,
    /// Persistent tier (`None` disables it)
    pub persistent: Option<TierConfig>,
    pub compression: CompressionConfig,
    pub promotion: PromotionPolicy,
    pub warmup: WarmupConfig,
    pub optimizer: OptimizerConfig,
    pub sync: SyncConfig,
    /// Deadline for every network/CDN call
    pub remote_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory: TierConfig::default(),
            persistent: Some(TierConfig::persistent()),
            compression: CompressionConfig::default(),
            promotion: PromotionPolicy::default(),
            warmup: WarmupConfig::default(),
            optimizer: OptimizerConfig::default(),
            sync: SyncConfig::default(),
            remote_timeout_ms: 250,
        }
    }
}

impl CacheConfig {
    /// Parse from YAML; omitted fields take their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: CacheConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Reject configurations the manager cannot run with
    pub fn validate(&self) -> Result<()> {
        let tier_ok = |name: &str, tier: &TierConfig| -> Result<()> {
            if tier.max_size_bytes == 0 {
                return Err(Error::Config(format!("{}.max_size_bytes must be > 0", name)));
            }
            if tier.sweep_batch_size == 0 {
                return Err(Error::Config(format!("{}.sweep_batch_size must be > 0", name)));
            }
            Ok(())
        };
        tier_ok("memory", &self.memory)?;
        if let Some(persistent) = &self.persistent {
            tier_ok("persistent", persistent)?;
        }

        let utilization = self.promotion.max_memory_utilization;
        if !(utilization > 0.0 && utilization <= 1.0) {
            return Err(Error::Config(format!(
                "promotion.max_memory_utilization must be in (0, 1], got {}",
                utilization
            )));
        }
        if self.warmup.queue_capacity == 0 {
            return Err(Error::Config("warmup.queue_capacity must be > 0".into()));
        }
        if self.optimizer.batch_size == 0 {
            return Err(Error::Config("optimizer.batch_size must be > 0".into()));
        }
        if self.optimizer.interval_ms == Some(0) {
            return Err(Error::Config("optimizer.interval_ms must be > 0".into()));
        }
        if self.sync.batch_size == 0 {
            return Err(Error::Config("sync.batch_size must be > 0".into()));
        }
        if self.remote_timeout_ms == 0 {
            return Err(Error::Config("remote_timeout_ms must be > 0".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Operation Types
// =============================================================================

/// Successful lookup
#[derive(Debug, Clone)]
pub struct CacheHit {
    /// Decoded plaintext value
    pub value: Bytes,
    /// Tier the value was found in
    pub tier: TierKind,
    /// Entry as stored in that tier, after recording the access
    pub entry: CacheEntry,
}

/// What to invalidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationTarget {
    /// A single key
    Key(String),
    /// Glob pattern over keys (`*`, `?`)
    Pattern(String),
    /// Every key carrying any of these tags
    Tags(Vec<String>),
}

impl InvalidationTarget {
    pub fn key(key: impl Into<String>) -> Self {
        Self::Key(key.into())
    }

    pub fn pattern(glob: impl Into<String>) -> Self {
        Self::Pattern(glob.into())
    }

    pub fn tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Tags(tags.into_iter().map(Into::into).collect())
    }
}

/// One item of a bulk `set`
#[derive(Debug, Clone)]
pub struct BulkSet {
    pub key: String,
    pub value: Bytes,
    pub strategy: CacheStrategy,
}

impl BulkSet {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>, strategy: CacheStrategy) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            strategy,
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`CacheManager`]
#[derive(Default)]
pub struct CacheManagerBuilder {
    config: CacheConfig,
    clock: Option<Arc<dyn Clock>>,
    cipher: Option<Arc<dyn Cipher>>,
    backend: Option<Arc<dyn PersistentBackend>>,
    remotes: Vec<(TierKind, Arc<dyn RemoteCache>)>,
}

impl CacheManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Time source (defaults to the system clock)
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Cipher for encrypted entries (defaults to AES-256-GCM with a
    /// process-local random key)
    pub fn with_cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Backend for the persistent tier (defaults to in-memory)
    pub fn with_persistent_backend(mut self, backend: Arc<dyn PersistentBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Attach a network or CDN cache
    pub fn with_remote(mut self, tier: TierKind, cache: Arc<dyn RemoteCache>) -> Self {
        self.remotes.push((tier, cache));
        self
    }

    /// Build the manager; call [`CacheManager::init`] to start background work
    pub fn build(self) -> Result<Arc<CacheManager>> {
        let config = self.config;
        config.validate()?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let cipher: Arc<dyn Cipher> = match self.cipher {
            Some(cipher) => cipher,
            None => Arc::new(AesGcmCipher::generate()?),
        };
        let codec = Arc::new(EntryCodec::with_config(config.compression.clone(), cipher));

        let memory = MemoryTier::new(config.memory.clone(), codec.clone(), clock.clone());
        let persistent = match (&config.persistent, self.backend) {
            (Some(tier), backend) => Some(PersistentTier::new(
                tier.clone(),
                backend.unwrap_or_else(|| Arc::new(InMemoryBackend::new())),
                codec.clone(),
                clock.clone(),
            )),
            (None, Some(_)) => {
                return Err(Error::Config(
                    "persistent backend supplied but the persistent tier is disabled".into(),
                ))
            }
            (None, None) => None,
        };

        let timeout = Duration::from_millis(config.remote_timeout_ms);
        let mut remotes = BTreeMap::new();
        for (kind, cache) in self.remotes {
            if kind.is_local() {
                return Err(Error::Config(format!(
                    "{} is a local tier and cannot be backed by a remote cache",
                    kind
                )));
            }
            remotes.insert(kind, RemoteTier::new(kind, cache, timeout));
        }

        let shutdown = CancellationToken::new();
        let warmup = WarmupScheduler::new(&config.warmup, shutdown.clone());

        info!(
            memory_bytes = config.memory.max_size_bytes,
            persistent = persistent.is_some(),
            remotes = remotes.len(),
            "Built cache manager"
        );

        Ok(Arc::new(CacheManager {
            config,
            clock,
            codec,
            memory,
            persistent,
            remotes,
            index: InvalidationIndex::new(),
            stats: CacheStats::new(),
            warmup,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }))
    }
}

// =============================================================================
// Cache Manager
// =============================================================================

/// Tiered cache manager
pub struct CacheManager {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    codec: Arc<EntryCodec>,
    memory: MemoryTier,
    persistent: Option<PersistentTier>,
    remotes: BTreeMap<TierKind, RemoteTier>,
    index: InvalidationIndex,
    stats: CacheStats,
    warmup: WarmupScheduler,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl CacheManager {
    pub fn builder() -> CacheManagerBuilder {
        CacheManagerBuilder::new()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Rehydrate the persistent tier and start background tasks.
    /// Calling it again is a no-op.
    #[instrument(skip(self))]
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShutDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(persistent) = &self.persistent {
            let report = persistent.load().await?;
            for entry in persistent.list() {
                self.index.record(&entry.key, &entry.tags);
            }
            info!(
                loaded = report.loaded,
                expired = report.expired,
                skipped = report.skipped,
                "Persistent tier loaded"
            );
        }

        let mut tasks = Vec::new();
        if let Some(receiver) = self.warmup.take_receiver() {
            tasks.push(tokio::spawn(WarmupScheduler::run(
                receiver,
                Arc::downgrade(self),
                self.config.warmup.clone(),
                self.shutdown.clone(),
            )));
        }

        if let Some(period) = self.config.optimizer.interval() {
            let manager = Arc::downgrade(self);
            let token = self.shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(period);
                tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tick.tick() => {
                            let Some(manager) = manager.upgrade() else {
                                break;
                            };
                            Optimizer::new(&manager, &token).run().await;
                        }
                    }
                }
                debug!("Optimizer schedule stopped");
            }));
        }

        self.tasks.lock().extend(tasks);
        info!("Cache manager started");
        Ok(())
    }

    /// Periodically reconcile with `peer` until shutdown
    pub fn start_sync(self: &Arc<Self>, peer: Arc<CacheManager>, period: Duration) {
        let manager = Arc::downgrade(self);
        let token = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        synchronize(&manager, &peer).await;
                    }
                }
            }
            debug!("Sync schedule stopped");
        });
        self.tasks.lock().push(handle);
    }

    /// Cancel background work and wait for it to stop
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Background task failed");
            }
        }
        info!("Cache manager shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // -------------------------------------------------------------------------
    // Core Operations
    // -------------------------------------------------------------------------

    /// Store a value, replacing any previous entry for the key
    #[instrument(skip(self, value, strategy), fields(tier = %strategy.tier))]
    pub async fn set(&self, key: &str, value: &[u8], strategy: CacheStrategy) -> Result<()> {
        let start = Instant::now();
        let result = self.store(key, value, strategy).await;
        match &result {
            Ok(()) => self.stats.record_set(),
            Err(e) => {
                self.stats.record_set_failure();
                debug!(key = %key, error = %e, "Set failed");
            }
        }
        self.stats.record_set_latency(start.elapsed());
        result
    }

    /// `set` with extra tags merged into the strategy's
    pub async fn set_with_tags<I, S>(
        &self,
        key: &str,
        value: &[u8],
        strategy: CacheStrategy,
        tags: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set(key, value, strategy.with_tags(tags)).await
    }

    /// Look up a key across every configured tier, fastest first
    pub async fn get(&self, key: &str) -> Option<CacheHit> {
        let order = self.configured_tiers();
        self.get_from(key, &order).await
    }

    /// Look up a key in the given tiers, in order. Unconfigured tiers are skipped.
    #[instrument(skip(self, order))]
    pub async fn get_from(&self, key: &str, order: &[TierKind]) -> Option<CacheHit> {
        let start = Instant::now();
        let mut found = None;

        for &kind in order {
            let hit = if kind.is_local() {
                match self.tier(kind) {
                    Some(store) => self.read_local(store, key).await,
                    None => continue,
                }
            } else {
                match self.remotes.get(&kind) {
                    Some(remote) => self.read_remote(remote, key).await,
                    None => continue,
                }
            };

            match hit {
                Some(hit) => {
                    self.stats.record_hit(kind);
                    found = Some(hit);
                    break;
                }
                None => self.stats.record_miss(kind),
            }
        }

        self.stats.record_get(found.is_some());
        if let Some(hit) = &found {
            if hit.tier != TierKind::Memory {
                self.promote(hit).await;
            }
        }
        self.stats.record_get_latency(start.elapsed());
        found
    }

    /// Remove a key from every local tier
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let mut removed = false;
        for tier in self.tiers() {
            removed |= tier.delete(key).await?.is_some();
        }
        self.index.forget(key);
        Ok(removed)
    }

    /// Present and unexpired in any local tier
    pub async fn contains(&self, key: &str) -> bool {
        for tier in self.tiers() {
            if tier.contains(key).await {
                return true;
            }
        }
        false
    }

    /// Invalidate by key, pattern or tags; returns every key actually removed
    #[instrument(skip(self))]
    pub async fn invalidate(
        &self,
        target: InvalidationTarget,
        cascade: bool,
    ) -> Result<BTreeSet<String>> {
        let initial: BTreeSet<String> = match &target {
            InvalidationTarget::Key(key) => BTreeSet::from([key.clone()]),
            InvalidationTarget::Pattern(glob) => {
                let pattern = KeyPattern::new(glob)?;
                self.tiers()
                    .into_iter()
                    .flat_map(|t| t.core().keys())
                    .filter(|k| pattern.is_match(k))
                    .collect()
            }
            InvalidationTarget::Tags(tags) => self.index.keys_for_tags(tags.as_slice()),
        };

        let targets = if cascade {
            let outcome = self.index.cascade(&initial);
            if outcome.cycle_detected {
                warn!(roots = initial.len(), "Dependency cycle found during cascading invalidation");
            }
            outcome.keys
        } else {
            initial
        };

        let mut removed = BTreeSet::new();
        for key in targets {
            for tier in self.tiers() {
                match tier.delete(&key).await {
                    Ok(Some(_)) => {
                        removed.insert(key.clone());
                    }
                    Ok(None) => {}
                    Err(e) => warn!(key = %key, tier = %tier.kind(), error = %e, "Invalidation delete failed"),
                }
            }
            self.index.forget(&key);
        }

        self.stats.record_invalidations(removed.len() as u64);
        debug!(removed = removed.len(), "Invalidation finished");
        Ok(removed)
    }

    // -------------------------------------------------------------------------
    // Bulk Operations
    // -------------------------------------------------------------------------

    /// `set` each item concurrently; failures are reported per key
    pub async fn set_bulk(&self, items: Vec<BulkSet>) -> BTreeMap<String, Result<()>> {
        let results = join_all(
            items
                .iter()
                .map(|item| self.set(&item.key, &item.value, item.strategy.clone())),
        )
        .await;
        items
            .into_iter()
            .map(|item| item.key)
            .zip(results)
            .collect()
    }

    /// `get` each key concurrently
    pub async fn get_bulk<S: AsRef<str>>(&self, keys: &[S]) -> BTreeMap<String, Option<CacheHit>> {
        let results = join_all(keys.iter().map(|k| self.get(k.as_ref()))).await;
        keys.iter()
            .map(|k| k.as_ref().to_string())
            .zip(results)
            .collect()
    }

    // -------------------------------------------------------------------------
    // Background Operations
    // -------------------------------------------------------------------------

    /// Queue keys to be loaded into memory; returns immediately
    pub fn warmup<I, S>(&self, keys: I, loader: Loader, priority: Priority) -> Result<WarmupTicket>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys = keys.into_iter().map(Into::into).collect();
        self.warmup.submit(keys, loader, priority)
    }

    /// Run one maintenance pass now
    pub async fn optimize(&self) -> OptimizeReport {
        Optimizer::new(self, &self.shutdown).run().await
    }

    /// Reconcile memory tiers with `peer` once
    pub async fn sync(&self, peer: &CacheManager) -> SyncReport {
        synchronize(self, peer).await
    }

    /// Store a prebuilt entry as-is (timestamps and access counts preserved).
    /// The entry must verify against this manager's codec.
    pub async fn import_entry(&self, entry: CacheEntry) -> Result<()> {
        if !entry.strategy.tier.is_local() {
            return Err(Error::TierUnavailable(entry.strategy.tier.to_string()));
        }
        if !self.codec.verify(&entry) {
            return Err(Error::CorruptEntry { key: entry.key });
        }
        self.place(entry).await
    }

    // -------------------------------------------------------------------------
    // Dependencies
    // -------------------------------------------------------------------------

    /// Invalidating `parent` with `cascade` also invalidates `dependent`
    pub fn add_dependency(&self, parent: &str, dependent: &str) {
        self.index.add_dependency(parent, dependent);
    }

    pub fn remove_dependency(&self, parent: &str, dependent: &str) -> bool {
        self.index.remove_dependency(parent, dependent)
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Counters plus local tier occupancy
    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self
            .stats
            .snapshot(self.tiers().iter().map(|t| t.core().stats()).collect());
        snapshot.backend = self.persistent.as_ref().map(|p| p.backend().stats());
        snapshot
    }

    pub fn stats_collector(&self) -> &CacheStats {
        &self.stats
    }

    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    /// Local tier handle
    pub fn tier(&self, kind: TierKind) -> Option<&dyn TierStore> {
        match kind {
            TierKind::Memory => Some(&self.memory),
            TierKind::Persistent => self.persistent.as_ref().map(|p| p as &dyn TierStore),
            TierKind::Network | TierKind::Cdn => None,
        }
    }

    /// Local tiers, fastest first
    pub fn tiers(&self) -> Vec<&dyn TierStore> {
        let mut tiers: Vec<&dyn TierStore> = vec![&self.memory];
        if let Some(persistent) = &self.persistent {
            tiers.push(persistent);
        }
        tiers
    }

    /// Every configured tier, fastest first
    pub fn configured_tiers(&self) -> Vec<TierKind> {
        TierKind::ALL
            .into_iter()
            .filter(|k| match k {
                TierKind::Memory => true,
                TierKind::Persistent => self.persistent.is_some(),
                remote => self.remotes.contains_key(remote),
            })
            .collect()
    }

    pub fn index(&self) -> &InvalidationIndex {
        &self.index
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn codec(&self) -> &Arc<EntryCodec> {
        &self.codec
    }

    /// Resident and unexpired in memory
    pub fn is_resident(&self, key: &str) -> bool {
        self.memory.core().contains(key)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn store(&self, key: &str, value: &[u8], strategy: CacheStrategy) -> Result<()> {
        if !strategy.tier.is_local() && !self.remotes.contains_key(&strategy.tier) {
            return Err(Error::TierUnavailable(strategy.tier.to_string()));
        }
        let stored = self.codec.encode(value, &strategy)?;
        let entry = CacheEntry::new(
            key,
            stored,
            EntryCodec::checksum(value),
            strategy,
            self.clock.now_ms(),
        );
        self.place(entry).await
    }

    /// Put an encoded entry into its tier, clear other local copies and
    /// index its tags
    async fn place(&self, entry: CacheEntry) -> Result<()> {
        let key = entry.key.clone();
        let tags = entry.tags.clone();
        let target = entry.strategy.tier;

        if target.is_local() {
            let store = self
                .tier(target)
                .ok_or_else(|| Error::TierUnavailable(target.to_string()))?;
            let outcome = store.put(entry).await?;
            self.note_evicted(&outcome.evicted);
        } else {
            let remote = self
                .remotes
                .get(&target)
                .ok_or_else(|| Error::TierUnavailable(target.to_string()))?;
            remote.put(&entry).await?;
        }

        for other in self.tiers().into_iter().filter(|t| t.kind() != target) {
            if let Err(e) = other.delete(&key).await {
                warn!(key = %key, tier = %other.kind(), error = %e, "Failed to clear stale copy");
            }
        }
        self.index.record(&key, &tags);
        Ok(())
    }

    async fn read_local(&self, store: &dyn TierStore, key: &str) -> Option<CacheHit> {
        match store.get(key).await {
            Lookup::Hit { entry, value } => Some(CacheHit {
                value,
                tier: store.kind(),
                entry,
            }),
            Lookup::Miss => None,
            Lookup::Expired => {
                self.stats.record_expirations(1);
                self.forget_if_absent(key);
                None
            }
            Lookup::Corrupt => {
                self.stats.record_corruption();
                self.forget_if_absent(key);
                None
            }
            Lookup::CodecFailure => {
                self.stats.record_codec_failure();
                self.forget_if_absent(key);
                None
            }
        }
    }

    async fn read_remote(&self, remote: &RemoteTier, key: &str) -> Option<CacheHit> {
        let mut entry = remote.get(key).await?;
        let now = self.clock.now_ms();
        if entry.is_expired(now) {
            return None;
        }
        match self.codec.open(&entry) {
            Ok(value) => {
                entry.record_access(now);
                Some(CacheHit {
                    value,
                    tier: remote.kind(),
                    entry,
                })
            }
            Err(e) => {
                if e.is_codec_failure() {
                    self.stats.record_codec_failure();
                } else {
                    self.stats.record_corruption();
                }
                warn!(key = %key, tier = %remote.kind(), error = %e, "Ignoring unreadable remote entry");
                None
            }
        }
    }

    /// Copy a hit into memory with a fresh `created_at` and the remaining TTL.
    /// Persistent hits are moved unless the policy retains the source.
    async fn promote(&self, hit: &CacheHit) {
        let utilization = self.memory.core().utilization();
        if !self.config.promotion.should_promote(utilization) {
            debug!(key = %hit.entry.key, utilization, "Skipping promotion under memory pressure");
            return;
        }

        let now = self.clock.now_ms();
        let remaining = hit.entry.remaining_ttl(now);
        if remaining == Some(0) {
            return;
        }

        let mut promoted = hit.entry.clone();
        promoted.created_at = now;
        promoted.last_accessed_at = now;
        promoted.ttl_ms = remaining.unwrap_or(0);
        promoted.strategy.ttl_ms = promoted.ttl_ms;
        promoted.strategy.tier = TierKind::Memory;

        // A concurrent `set` may have stored a newer value since the read
        match self.memory.core().insert_if_absent(promoted) {
            Ok(Some(outcome)) => {
                self.note_evicted(&outcome.evicted);
                self.stats.record_promotion();
                debug!(key = %hit.entry.key, from = %hit.tier, "Promoted entry to memory");
            }
            Ok(None) => {
                debug!(key = %hit.entry.key, "Newer entry already resident; promotion dropped");
                return;
            }
            Err(e) => {
                debug!(key = %hit.entry.key, error = %e, "Promotion rejected");
                return;
            }
        }

        if hit.tier == TierKind::Persistent && !self.config.promotion.retain_source {
            if let Some(persistent) = &self.persistent {
                if let Err(e) = persistent.delete_if_same(&hit.entry).await {
                    warn!(key = %hit.entry.key, error = %e, "Failed to drop promoted source");
                }
            }
        }
    }

    fn note_evicted(&self, evicted: &[CacheEntry]) {
        if evicted.is_empty() {
            return;
        }
        self.stats.record_evictions(evicted.len() as u64);
        for entry in evicted {
            self.forget_if_absent(&entry.key);
        }
    }

    /// Account for entries removed by an expiry sweep
    pub(crate) fn note_expired(&self, expired: &[CacheEntry]) {
        if expired.is_empty() {
            return;
        }
        self.stats.record_expirations(expired.len() as u64);
        for entry in expired {
            self.forget_if_absent(&entry.key);
        }
    }

    fn forget_if_absent(&self, key: &str) {
        if self.tiers().iter().all(|t| t.core().peek(key).is_none()) {
            self.index.forget(key);
        }
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("memory", self.memory.core())
            .field("persistent", &self.persistent)
            .field("remotes", &self.remotes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================
