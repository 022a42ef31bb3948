//! TierCache - Multi-Level Cache Manager
//!
//! Caches key/value data across a memory tier, a persistent tier and
//! optional network/CDN tiers. Every entry carries its own strategy: TTL,
//! eviction policy, compression, encryption, priority and invalidation tags.
//!
//! # Architecture
//!
//! ```text
//! set ──▶ Entry Codec ──▶ target tier ──▶ Invalidation Index
//! get ──▶ Memory ─▶ Persistent ─▶ Network ─▶ CDN ──▶ promote to Memory
//! ```
//!
//! Background work (warmup queue, periodic optimizer, peer sync) is owned by
//! the [`CacheManager`] and stops on [`CacheManager::shutdown`].
//!
//! # Modules
//!
//! - [`cache`] - Tiers, codec, eviction, invalidation, warmup, optimizer, sync
//! - [`error`] - Error types
//! - [`exporter`] - Prometheus exposition of cache statistics

pub mod cache;
pub mod error;
pub mod exporter;

// Re-export commonly used types
pub use cache::{
    CacheConfig, CacheEntry, CacheHit, CacheManager, CacheStrategy, EvictionPolicyKind,
    InvalidationTarget, Priority, TierKind,
};
pub use error::{Error, Result};
pub use exporter::PrometheusExporter;
