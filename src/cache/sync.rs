//! Sync Coordinator
//!
//! Best-effort, single-round reconciliation of two managers' memory tiers.
//! For every key on either side the entry with the later `last_accessed_at`
//! wins and is copied to the other side; equal timestamps with different
//! content go to the higher checksum so the result does not depend on which
//! side initiated. Keys present on one side only are copied unconditionally.
//!
//! Both managers must share an encryption key for encrypted entries to
//! verify on import; entries that fail verification count as errors.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::entry::CacheEntry;
use super::manager::CacheManager;
use super::tier::TierStore;

/// Sync configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Keys reconciled between yields
    pub batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { batch_size: 256 }
    }
}

/// Outcome counts for one sync round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Keys copied to either side (conflicts included)
    pub synchronized: u64,
    /// Keys present on both sides with different content
    pub conflicts_resolved: u64,
    /// Keys that could not be copied
    pub errors: u64,
}

enum Action {
    /// Copy the local entry to the peer
    Push(CacheEntry),
    /// Copy the peer entry locally
    Pull(CacheEntry),
    InSync,
}

/// Decide which side of a key wins
fn reconcile(local: Option<CacheEntry>, remote: Option<CacheEntry>) -> (Action, bool) {
    match (local, remote) {
        (Some(a), None) => (Action::Push(a), false),
        (None, Some(b)) => (Action::Pull(b), false),
        (None, None) => (Action::InSync, false),
        (Some(a), Some(b)) => {
            let conflict = a.checksum != b.checksum;
            let order = a
                .last_accessed_at
                .cmp(&b.last_accessed_at)
                .then(a.checksum.cmp(&b.checksum));
            match order {
                Ordering::Greater => (Action::Push(a), conflict),
                Ordering::Less => (Action::Pull(b), conflict),
                Ordering::Equal => (Action::InSync, false),
            }
        }
    }
}

/// Reconcile `local` and `peer` memory tiers
#[instrument(skip_all)]
pub async fn synchronize(local: &CacheManager, peer: &CacheManager) -> SyncReport {
    let batch_size = local.config().sync.batch_size.max(1);
    let now_local = local.clock().now_ms();
    let now_peer = peer.clock().now_ms();

    let keys: BTreeSet<String> = local
        .memory()
        .core()
        .keys()
        .into_iter()
        .chain(peer.memory().core().keys())
        .collect();
    let keys: Vec<String> = keys.into_iter().collect();

    let mut report = SyncReport::default();
    for chunk in keys.chunks(batch_size) {
        for key in chunk {
            let ours = local
                .memory()
                .core()
                .peek(key)
                .filter(|e| !e.is_expired(now_local));
            let theirs = peer
                .memory()
                .core()
                .peek(key)
                .filter(|e| !e.is_expired(now_peer));

            let (action, conflict) = reconcile(ours, theirs);
            let outcome = match action {
                Action::InSync => continue,
                Action::Push(entry) => peer.import_entry(entry).await,
                Action::Pull(entry) => local.import_entry(entry).await,
            };
            match outcome {
                Ok(()) => {
                    report.synchronized += 1;
                    if conflict {
                        report.conflicts_resolved += 1;
                        debug!(key = %key, "Resolved sync conflict");
                    }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to sync key");
                    report.errors += 1;
                }
            }
        }
        tokio::task::yield_now().await;
    }

    local.stats_collector().record_sync(
        report.synchronized,
        report.conflicts_resolved,
        report.errors,
    );
    info!(
        synchronized = report.synchronized,
        conflicts = report.conflicts_resolved,
        errors = report.errors,
        "Sync round finished"
    );
    report
}
