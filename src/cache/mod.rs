//! Multi-Tier Cache
//!
//! Key/value caching across a memory tier, a persistent tier and optional
//! network/CDN tiers, with per-entry strategy (TTL, eviction policy,
//! compression, encryption, priority, tags).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          Cache Manager                                    │
//! │        set / get / invalidate / bulk / warmup / optimize / sync          │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Entry Codec (LZ4 → AES-256-GCM, XXH3 checksum)   Invalidation Index     │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Memory Tier        │ Persistent Tier      │ Network / CDN Tier          │
//! │  ┌──────────────┐   │ ┌────────────────┐   │ ┌────────────────────┐      │
//! │  │ BTreeMap +   │   │ │ index + backend│   │ │ RemoteCache        │      │
//! │  │ LRU/LFU/TTL  │   │ │ (fs, in-memory)│   │ │ (deadline-bounded) │      │
//! │  └──────────────┘   │ └────────────────┘   │ └────────────────────┘      │
//! │         ▲           │         │            │           │                 │
//! │         └───────────┴─────────┴────────────┴───────────┘                 │
//! │                        promotion on hit                                  │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Warmup Scheduler   │  Optimizer (sweep, compress, rebalance)  │  Sync   │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - A tier never holds more than its configured byte budget
//! - Expired entries are never returned
//! - Corrupt or undecodable entries are removed and reported as misses
//! - A key lives in at most one local tier after a `set`

mod backend;
mod clock;
mod codec;
mod entry;
mod index;
mod manager;
mod optimizer;
mod policy;
mod remote;
mod stats;
mod sync;
mod tier;
mod warmup;

#[cfg(test)]
mod proptest;

pub use backend::{BackendStats, FsBackend, InMemoryBackend, PersistentBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{
    AesGcmCipher, Cipher, CompressionAlgorithm, CompressionConfig, Compressor, EntryCodec,
    Lz4Compressor,
};
pub use entry::{CacheEntry, CacheStrategy, EvictionPolicyKind, Priority, TierKind};
pub use index::{CascadeOutcome, InvalidationIndex, KeyPattern};
pub use manager::{
    BulkSet, CacheConfig, CacheHit, CacheManager, CacheManagerBuilder, InvalidationTarget,
};
pub use optimizer::{OptimizeReport, OptimizerConfig};
pub use policy::{EvictionTracker, PromotionPolicy, Victims};
pub use remote::{InMemoryRemote, RemoteCache, RemoteTier};
pub use stats::{CacheStats, StatsSnapshot, TierCounters};
pub use sync::{SyncConfig, SyncReport};
pub use tier::{
    LoadReport, Lookup, MemoryTier, PersistentTier, PutOutcome, SweepBatch, TierConfig, TierCore,
    TierStats, TierStore, DEFAULT_MEMORY_CAPACITY, DEFAULT_PERSISTENT_CAPACITY,
};
pub use warmup::{loader_fn, Loader, WarmupConfig, WarmupReport, WarmupTicket};
