//! Cache Statistics
//!
//! Lock-free counters updated on every operation, plus a serializable
//! snapshot used by the `/stats` endpoint and the Prometheus exporter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use super::backend::BackendStats;
use super::entry::TierKind;
use super::tier::TierStats;

/// Cache statistics collector
#[derive(Debug, Default)]
pub struct CacheStats {
    // Per-tier lookups, indexed by `TierKind::index()`
    hits: [AtomicU64; 4],
    misses: [AtomicU64; 4],

    // One outcome per `get`, whichever tiers it consulted
    gets: AtomicU64,
    get_hits: AtomicU64,

    // Write path
    sets: AtomicU64,
    set_failures: AtomicU64,

    // Removals
    evictions: AtomicU64,
    expirations: AtomicU64,
    corruptions: AtomicU64,
    codec_failures: AtomicU64,
    invalidations: AtomicU64,

    promotions: AtomicU64,

    // Warmup
    warmup_loaded: AtomicU64,
    warmup_failed: AtomicU64,

    // Sync
    sync_runs: AtomicU64,
    sync_synchronized: AtomicU64,
    sync_conflicts: AtomicU64,
    sync_errors: AtomicU64,

    optimize_runs: AtomicU64,

    // Latencies (microseconds, exponential moving average)
    get_latency_us: AtomicU64,
    set_latency_us: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, tier: TierKind) {
        self.hits[tier.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self, tier: TierKind) {
        self.misses[tier.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Outcome of a whole `get`
    pub fn record_get(&self, hit: bool) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.get_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn hits(&self, tier: TierKind) -> u64 {
        self.hits[tier.index()].load(Ordering::Relaxed)
    }

    pub fn misses(&self, tier: TierKind) -> u64 {
        self.misses[tier.index()].load(Ordering::Relaxed)
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set_failure(&self) {
        self.set_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_expirations(&self, count: u64) {
        self.expirations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_corruption(&self) {
        self.corruptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_codec_failure(&self) {
        self.codec_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidations(&self, count: u64) {
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_warmup(&self, loaded: u64, failed: u64) {
        self.warmup_loaded.fetch_add(loaded, Ordering::Relaxed);
        self.warmup_failed.fetch_add(failed, Ordering::Relaxed);
    }

    pub fn record_sync(&self, synchronized: u64, conflicts: u64, errors: u64) {
        self.sync_runs.fetch_add(1, Ordering::Relaxed);
        self.sync_synchronized
            .fetch_add(synchronized, Ordering::Relaxed);
        self.sync_conflicts.fetch_add(conflicts, Ordering::Relaxed);
        self.sync_errors.fetch_add(errors, Ordering::Relaxed);
    }

    pub fn record_optimize(&self) {
        self.optimize_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get_latency(&self, duration: Duration) {
        Self::update_latency_ema(&self.get_latency_us, duration);
    }

    pub fn record_set_latency(&self, duration: Duration) {
        Self::update_latency_ema(&self.set_latency_us, duration);
    }

    fn update_latency_ema(target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Fraction of `get` calls that found the key in any tier
    pub fn hit_ratio(&self) -> f64 {
        let total = self.gets.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            self.get_hits.load(Ordering::Relaxed) as f64 / total as f64
        }
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self, tiers: Vec<TierStats>) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            tiers: TierKind::ALL
                .iter()
                .map(|t| TierCounters {
                    tier: *t,
                    hits: self.hits(*t),
                    misses: self.misses(*t),
                })
                .collect(),
            occupancy: tiers,
            backend: None,
            gets: load(&self.gets),
            get_hits: load(&self.get_hits),
            hit_ratio: self.hit_ratio(),
            sets: load(&self.sets),
            set_failures: load(&self.set_failures),
            evictions: load(&self.evictions),
            expirations: load(&self.expirations),
            corruptions: load(&self.corruptions),
            codec_failures: load(&self.codec_failures),
            invalidations: load(&self.invalidations),
            promotions: load(&self.promotions),
            warmup_loaded: load(&self.warmup_loaded),
            warmup_failed: load(&self.warmup_failed),
            sync_runs: load(&self.sync_runs),
            sync_synchronized: load(&self.sync_synchronized),
            sync_conflicts: load(&self.sync_conflicts),
            sync_errors: load(&self.sync_errors),
            optimize_runs: load(&self.optimize_runs),
            get_latency_us: load(&self.get_latency_us),
            set_latency_us: load(&self.set_latency_us),
        }
    }
}

/// Per-tier lookup counters
#[derive(Debug, Clone, Serialize)]
pub struct TierCounters {
    pub tier: TierKind,
    pub hits: u64,
    pub misses: u64,
}

/// Serializable statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub tiers: Vec<TierCounters>,
    /// Size and entry counts of local tiers
    pub occupancy: Vec<TierStats>,
    /// Operation counts of the persistent tier's backend
    pub backend: Option<BackendStats>,
    pub gets: u64,
    pub get_hits: u64,
    pub hit_ratio: f64,
    pub sets: u64,
    pub set_failures: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub corruptions: u64,
    pub codec_failures: u64,
    pub invalidations: u64,
    pub promotions: u64,
    pub warmup_loaded: u64,
    pub warmup_failed: u64,
    pub sync_runs: u64,
    pub sync_synchronized: u64,
    pub sync_conflicts: u64,
    pub sync_errors: u64,
    pub optimize_runs: u64,
    pub get_latency_us: u64,
    pub set_latency_us: u64,
}

impl StatsSnapshot {
    pub fn tier(&self, kind: TierKind) -> Option<&TierCounters> {
        self.tiers.iter().find(|t| t.tier == kind)
    }
}

// =============================================================================
// Tests
// =============================================================================
