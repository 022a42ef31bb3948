//! Cache Optimizer
//!
//! Periodic maintenance over every local tier, in bounded batches:
//!
//! 1. expire sweep
//! 2. compress large uncompressed entries
//! 3. rebalance priority labels from observed hits and idleness
//! 4. compact tier bookkeeping
//!
//! Cancellation is checked between batches; a cancelled run returns the
//! partial report with `cancelled = true`.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::codec::EntryCodec;
use super::entry::{CacheEntry, Priority};
use super::manager::CacheManager;
use super::tier::TierStore;

/// Optimizer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Run period; `None` disables the background schedule
    pub interval_ms: Option<u64>,
    /// Entries examined per batch
    pub batch_size: usize,
    /// Compress uncompressed entries at least this large
    pub compress_threshold_bytes: u64,
    /// Hits at which an entry is raised to `High`
    pub hot_hit_threshold: u64,
    /// Idle time after which an entry is lowered to `Low`
    pub cold_idle_ms: u64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            interval_ms: Some(60_000),
            batch_size: 128,
            compress_threshold_bytes: 4096,
            hot_hit_threshold: 10,
            cold_idle_ms: 3_600_000,
        }
    }
}

impl OptimizerConfig {
    pub fn interval(&self) -> Option<Duration> {
        self.interval_ms.map(Duration::from_millis)
    }
}

/// Summary of one optimizer run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OptimizeReport {
    pub expired_removed: u64,
    pub entries_compressed: u64,
    pub priorities_raised: u64,
    pub priorities_lowered: u64,
    pub defragmented_slots: u64,
    /// Bytes released by expiry and compression
    pub bytes_freed: u64,
    pub cancelled: bool,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Runs maintenance against a manager through its public tier handles
pub struct Optimizer<'a> {
    manager: &'a CacheManager,
    config: &'a OptimizerConfig,
    cancel: &'a CancellationToken,
}

impl<'a> Optimizer<'a> {
    pub fn new(manager: &'a CacheManager, cancel: &'a CancellationToken) -> Self {
        Self {
            manager,
            config: &manager.config().optimizer,
            cancel,
        }
    }

    #[instrument(skip_all)]
    pub async fn run(&self) -> OptimizeReport {
        let started = Instant::now();
        let mut report = OptimizeReport::default();

        for tier in self.manager.tiers() {
            let completed = self.sweep(tier, &mut report).await
                && self.compress(tier, &mut report).await
                && self.rebalance(tier, &mut report).await;
            if !completed {
                report.cancelled = true;
                break;
            }
            report.defragmented_slots += tier.compact().await as u64;
        }

        report.duration = started.elapsed();
        self.manager.stats_collector().record_optimize();
        info!(
            expired = report.expired_removed,
            compressed = report.entries_compressed,
            raised = report.priorities_raised,
            lowered = report.priorities_lowered,
            bytes_freed = report.bytes_freed,
            cancelled = report.cancelled,
            "Optimizer run finished"
        );
        report
    }

    /// Checked between batches; yields so foreground work can run
    async fn keep_going(&self) -> bool {
        tokio::task::yield_now().await;
        !self.cancel.is_cancelled()
    }

    async fn sweep(&self, tier: &dyn TierStore, report: &mut OptimizeReport) -> bool {
        let mut cursor: Option<String> = None;
        loop {
            if !self.keep_going().await {
                return false;
            }
            let batch = match tier
                .sweep_expired(cursor.as_deref(), self.config.batch_size)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(tier = %tier.kind(), error = %e, "Expire sweep failed");
                    return true;
                }
            };

            report.expired_removed += batch.removed.len() as u64;
            report.bytes_freed += batch.removed.iter().map(|e| e.size_bytes).sum::<u64>();
            self.manager.note_expired(&batch.removed);

            match batch.next_cursor {
                Some(next) => cursor = Some(next),
                None => return true,
            }
        }
    }

    async fn compress(&self, tier: &dyn TierStore, report: &mut OptimizeReport) -> bool {
        let codec = tier.core().codec().clone();
        let now = self.manager.clock().now_ms();
        let mut cursor: Option<String> = None;

        loop {
            if !self.keep_going().await {
                return false;
            }
            let batch = tier.core().scan(cursor.as_deref(), self.config.batch_size);
            let Some(last) = batch.last() else {
                return true;
            };
            cursor = Some(last.key.clone());

            for entry in batch
                .iter()
                .filter(|e| !e.strategy.compression && !e.is_expired(now))
                .filter(|e| e.size_bytes >= self.config.compress_threshold_bytes)
            {
                let Some(compressed) = recompress(&codec, entry) else {
                    continue;
                };
                let saved = entry.size_bytes - compressed.size_bytes;
                match tier.replace(entry, compressed).await {
                    Ok(true) => {
                        report.entries_compressed += 1;
                        report.bytes_freed += saved;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(key = %entry.key, error = %e, "Failed to store compressed entry"),
                }
            }

            if batch.len() < self.config.batch_size {
                return true;
            }
        }
    }

    async fn rebalance(&self, tier: &dyn TierStore, report: &mut OptimizeReport) -> bool {
        let now = self.manager.clock().now_ms();
        let mut cursor: Option<String> = None;

        loop {
            if !self.keep_going().await {
                return false;
            }
            let batch = tier.core().scan(cursor.as_deref(), self.config.batch_size);
            let Some(last) = batch.last() else {
                return true;
            };
            cursor = Some(last.key.clone());

            for entry in batch.iter().filter(|e| !e.is_pinned()) {
                let current = entry.strategy.priority;
                let target = if entry.hit_count >= self.config.hot_hit_threshold {
                    current.max(Priority::High)
                } else if entry.idle_ms(now) >= self.config.cold_idle_ms {
                    Priority::Low
                } else {
                    continue;
                };
                if target == current {
                    continue;
                }
                match tier.update_priority(&entry.key, target).await {
                    Ok(true) if target > current => report.priorities_raised += 1,
                    Ok(true) => report.priorities_lowered += 1,
                    Ok(false) => {}
                    Err(e) => warn!(key = %entry.key, error = %e, "Failed to update priority"),
                }
            }

            if batch.len() < self.config.batch_size {
                return true;
            }
        }
    }
}

/// Re-encode an entry with compression on; `None` if it would not shrink
fn recompress(codec: &EntryCodec, entry: &CacheEntry) -> Option<CacheEntry> {
    let plain = codec.open(entry).ok()?;
    let mut strategy = entry.strategy.clone();
    strategy.compression = true;

    let stored = match codec.encode(&plain, &strategy) {
        Ok(stored) => stored,
        Err(e) => {
            debug!(key = %entry.key, error = %e, "Skipping compression");
            return None;
        }
    };
    if stored.len() as u64 >= entry.size_bytes {
        return None;
    }

    let mut compressed = entry.clone();
    compressed.size_bytes = stored.len() as u64;
    compressed.value = stored;
    compressed.strategy = strategy;
    Some(compressed)
}

// =============================================================================
// Tests
// =============================================================================
