//! TierCache Integration Tests
//!
//! Exercises the public API end to end:
//! - Feature 1: Storage, expiry and eviction
//! - Feature 2: Invalidation by key, pattern, tag and dependency
//! - Feature 3: Codec (compression, encryption, corruption detection)
//! - Feature 4: Background work (warmup, optimizer, sync)

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use tiercache::cache::{
    AesGcmCipher, CacheConfig, CacheEntry, CacheManager, CacheStrategy, Clock, EvictionPolicyKind,
    InMemoryBackend, InvalidationTarget, ManualClock, OptimizerConfig, PersistentBackend, Priority,
    TierConfig, TierKind, TierStore,
};

const KEY: [u8; 32] = [7u8; 32];

fn config(memory_bytes: u64) -> CacheConfig {
    CacheConfig {
        memory: TierConfig::with_capacity(memory_bytes),
        optimizer: OptimizerConfig {
            interval_ms: None,
            ..OptimizerConfig::default()
        },
        ..CacheConfig::default()
    }
}

fn manager(memory_bytes: u64, clock: Arc<ManualClock>) -> Arc<CacheManager> {
    CacheManager::builder()
        .with_config(config(memory_bytes))
        .with_clock(clock)
        .with_cipher(Arc::new(AesGcmCipher::new(&KEY)))
        .build()
        .unwrap()
}

fn keys(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

// =============================================================================
// Feature 1: Storage, Expiry and Eviction
// =============================================================================

mod storage_tests {
    use super::*;

    #[tokio::test]
    async fn test_set_then_get_returns_value_and_counts_hit() {
        let cache = manager(1000, Arc::new(ManualClock::new(0)));
        let value = vec![9u8; 100];
        let strategy = CacheStrategy::memory().with_policy(EvictionPolicyKind::Lru);

        cache.set("car:1", &value, strategy).await.unwrap();
        let hit = cache.get("car:1").await.unwrap();

        assert_eq!(hit.value.as_ref(), &value[..]);
        assert_eq!(hit.tier, TierKind::Memory);
        assert_eq!(hit.entry.hit_count, 1);
    }

    #[tokio::test]
    async fn test_ttl_boundary() {
        let clock = Arc::new(ManualClock::new(5_000));
        let cache = manager(1000, clock.clone());
        let strategy = CacheStrategy::memory().with_ttl(Duration::from_millis(1_000));
        cache.set("session", b"token", strategy).await.unwrap();

        clock.advance(Duration::from_millis(999));
        assert!(cache.get("session").await.is_some());

        clock.advance(Duration::from_millis(1));
        assert!(cache.get("session").await.is_none());
        assert!(!cache.contains("session").await);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_never_expires() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = manager(1000, clock.clone());
        cache.set("forever", b"v", CacheStrategy::memory()).await.unwrap();

        clock.advance(Duration::from_secs(365 * 24 * 3600));
        assert!(cache.get("forever").await.is_some());
    }

    #[tokio::test]
    async fn test_lru_evicts_least_recently_touched() {
        let cache = manager(300, Arc::new(ManualClock::new(0)));
        for key in ["A", "B", "C"] {
            cache
                .set(key, &[1u8; 100], CacheStrategy::memory())
                .await
                .unwrap();
        }
        cache.get("A").await.unwrap();
        cache.set("D", &[1u8; 100], CacheStrategy::memory()).await.unwrap();

        assert!(cache.contains("A").await);
        assert!(!cache.contains("B").await);
        assert!(cache.contains("C").await);
        assert!(cache.contains("D").await);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_sixth_entry_evicts_exactly_one() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = manager(1000, clock.clone());
        for i in 0..5 {
            clock.advance(Duration::from_millis(1));
            cache
                .set(&format!("e{}", i), &[0u8; 200], CacheStrategy::memory())
                .await
                .unwrap();
        }
        assert_eq!(cache.memory().core().size_bytes(), 1000);

        cache.set("e5", &[0u8; 200], CacheStrategy::memory()).await.unwrap();

        let resident: BTreeSet<String> = cache.memory().core().keys().into_iter().collect();
        assert_eq!(resident, keys(&["e1", "e2", "e3", "e4", "e5"]));
        assert!(cache.memory().core().size_bytes() <= 1000);
    }

    #[tokio::test]
    async fn test_capacity_bound_under_mixed_sizes() {
        let cache = manager(1000, Arc::new(ManualClock::new(0)));
        for i in 0..50u64 {
            let size = 37 + (i * 53) % 400;
            let strategy = CacheStrategy::memory().with_policy(if i % 2 == 0 {
                EvictionPolicyKind::Lru
            } else {
                EvictionPolicyKind::Lfu
            });
            cache
                .set(&format!("k{}", i % 13), &vec![1u8; size as usize], strategy)
                .await
                .unwrap();
            assert!(cache.memory().core().size_bytes() <= 1000);
        }
    }

    #[tokio::test]
    async fn test_oversized_set_is_rejected_not_dropped() {
        let cache = manager(1000, Arc::new(ManualClock::new(0)));
        cache.set("small", b"v", CacheStrategy::memory()).await.unwrap();

        let err = cache
            .set("huge", &[0u8; 1001], CacheStrategy::memory())
            .await
            .unwrap_err();
        assert!(err.is_capacity_exceeded());
        assert!(cache.contains("small").await);
        assert!(!cache.contains("huge").await);
    }

    #[tokio::test]
    async fn test_reset_replaces_value() {
        let cache = manager(1000, Arc::new(ManualClock::new(0)));
        cache.set("k", b"v1", CacheStrategy::memory()).await.unwrap();
        cache.set("k", b"v2", CacheStrategy::memory()).await.unwrap();

        assert_eq!(cache.memory().core().len(), 1);
        assert_eq!(cache.get("k").await.unwrap().value.as_ref(), b"v2");
    }

    #[tokio::test]
    async fn test_get_missing_key_is_none() {
        let cache = manager(1000, Arc::new(ManualClock::new(0)));
        assert!(cache.get("nothing").await.is_none());
        let stats = cache.stats();
        assert_eq!(stats.tier(TierKind::Memory).unwrap().misses, 1);
        assert_eq!(stats.tier(TierKind::Persistent).unwrap().misses, 1);
        assert_eq!(stats.gets, 1);
        assert_eq!(stats.hit_ratio, 0.0);
    }

    #[tokio::test]
    async fn test_hit_ratio_counts_fallback_hit_once() {
        let cache = manager(1000, Arc::new(ManualClock::new(0)));
        cache
            .set("disk", b"value", CacheStrategy::persistent())
            .await
            .unwrap();

        assert_eq!(cache.get("disk").await.unwrap().tier, TierKind::Persistent);
        let stats = cache.stats();
        assert_eq!(stats.tier(TierKind::Memory).unwrap().misses, 1);
        assert_eq!(stats.tier(TierKind::Persistent).unwrap().hits, 1);
        assert_eq!(stats.gets, 1);
        assert_eq!(stats.get_hits, 1);
        assert_eq!(stats.hit_ratio, 1.0);
    }
}

// =============================================================================
// Feature 2: Invalidation
// =============================================================================

mod invalidation_tests {
    use super::*;

    #[tokio::test]
    async fn test_tag_invalidation_removes_only_tagged_keys() {
        let cache = manager(10_000, Arc::new(ManualClock::new(0)));
        cache
            .set_with_tags("k1", b"1", CacheStrategy::memory(), ["x"])
            .await
            .unwrap();
        cache
            .set_with_tags("k2", b"2", CacheStrategy::persistent(), ["x", "y"])
            .await
            .unwrap();
        cache
            .set_with_tags("k3", b"3", CacheStrategy::memory(), ["y"])
            .await
            .unwrap();

        let removed = cache
            .invalidate(InvalidationTarget::tags(["x"]), false)
            .await
            .unwrap();

        assert_eq!(removed, keys(&["k1", "k2"]));
        assert!(cache.get("k1").await.is_none());
        assert!(cache.get("k2").await.is_none());
        assert!(cache.get("k3").await.is_some());
        assert_eq!(cache.stats().invalidations, 2);
    }

    #[tokio::test]
    async fn test_cascade_terminates_on_cycle() {
        let cache = manager(10_000, Arc::new(ManualClock::new(0)));
        for key in ["a", "b", "c", "d"] {
            cache.set(key, b"v", CacheStrategy::memory()).await.unwrap();
        }
        cache.add_dependency("a", "b");
        cache.add_dependency("b", "c");
        cache.add_dependency("c", "a");

        let removed = cache
            .invalidate(InvalidationTarget::key("a"), true)
            .await
            .unwrap();

        assert_eq!(removed, keys(&["a", "b", "c"]));
        assert!(cache.contains("d").await);
    }

    #[tokio::test]
    async fn test_pattern_invalidation() {
        let cache = manager(10_000, Arc::new(ManualClock::new(0)));
        for key in ["user:1:profile", "user:2:profile", "user:1:cart", "order:1"] {
            cache.set(key, b"v", CacheStrategy::memory()).await.unwrap();
        }

        let removed = cache
            .invalidate(InvalidationTarget::pattern("user:?:profile"), false)
            .await
            .unwrap();
        assert_eq!(removed, keys(&["user:1:profile", "user:2:profile"]));

        let removed = cache
            .invalidate(InvalidationTarget::pattern("user:*"), false)
            .await
            .unwrap();
        assert_eq!(removed, keys(&["user:1:cart"]));
        assert!(cache.contains("order:1").await);
    }

    #[tokio::test]
    async fn test_invalid_pattern_syntax_is_literal() {
        let cache = manager(10_000, Arc::new(ManualClock::new(0)));
        cache.set("a[1]", b"v", CacheStrategy::memory()).await.unwrap();
        cache.set("a1", b"v", CacheStrategy::memory()).await.unwrap();

        let removed = cache
            .invalidate(InvalidationTarget::pattern("a[1]"), false)
            .await
            .unwrap();
        assert_eq!(removed, keys(&["a[1]"]));
    }
}

// =============================================================================
// Feature 3: Codec
// =============================================================================

mod codec_tests {
    use super::*;

    #[tokio::test]
    async fn test_encrypted_bytes_differ_from_plaintext() {
        let cache = manager(10_000, Arc::new(ManualClock::new(0)));
        let value = b"vin=WBA123;owner=alice".to_vec();
        cache
            .set("k", &value, CacheStrategy::memory().encrypted())
            .await
            .unwrap();

        let stored = cache.memory().core().peek("k").unwrap();
        assert_ne!(stored.value.as_ref(), &value[..]);
        assert!(!stored
            .value
            .windows(value.len())
            .any(|w| w == &value[..]));

        assert_eq!(cache.get("k").await.unwrap().value.as_ref(), &value[..]);
    }

    #[tokio::test]
    async fn test_compressed_entry_is_smaller() {
        let cache = manager(100_000, Arc::new(ManualClock::new(0)));
        let value = "listing ".repeat(1000).into_bytes();
        cache
            .set("big", &value, CacheStrategy::memory().compressed())
            .await
            .unwrap();

        let stored = cache.memory().core().peek("big").unwrap();
        assert!(stored.size_bytes < value.len() as u64);
        assert_eq!(cache.get("big").await.unwrap().value.as_ref(), &value[..]);
    }

    #[tokio::test]
    async fn test_corrupt_persistent_record_is_a_miss() {
        let clock = Arc::new(ManualClock::new(0));
        let backend = Arc::new(InMemoryBackend::new());
        let build = || {
            CacheManager::builder()
                .with_config(config(1000))
                .with_clock(clock.clone())
                .with_cipher(Arc::new(AesGcmCipher::new(&KEY)))
                .with_persistent_backend(backend.clone())
                .build()
                .unwrap()
        };

        let writer = build();
        writer
            .set("doc", b"original", CacheStrategy::persistent())
            .await
            .unwrap();

        let raw = backend.get("doc").await.unwrap().unwrap();
        let mut record = CacheEntry::from_record(&raw).unwrap();
        record.value = Bytes::from_static(b"tampered");
        backend.put("doc", record.to_record().unwrap()).await.unwrap();

        let reader = build();
        reader.init().await.unwrap();
        assert!(reader.get("doc").await.is_none());
        assert_eq!(reader.stats().corruptions, 1);
        assert!(backend.get("doc").await.unwrap().is_none());
        reader.shutdown().await;
    }
}

// =============================================================================
// Feature 4: Background Work
// =============================================================================

mod background_tests {
    use super::*;
    use tiercache::cache::loader_fn;

    #[tokio::test]
    async fn test_sync_converges_on_later_access() {
        let clock = Arc::new(ManualClock::new(1_000));
        let left = manager(10_000, clock.clone());
        let right = manager(10_000, clock.clone());

        left.set("shared", b"old", CacheStrategy::memory()).await.unwrap();
        left.set("left-only", b"l", CacheStrategy::memory()).await.unwrap();
        clock.advance(Duration::from_millis(500));
        right.set("shared", b"new", CacheStrategy::memory()).await.unwrap();

        let report = left.sync(&right).await;
        assert_eq!(report.synchronized, 2);
        assert_eq!(report.conflicts_resolved, 1);
        assert_eq!(report.errors, 0);

        for side in [&left, &right] {
            assert_eq!(side.get("shared").await.unwrap().value.as_ref(), b"new");
            assert!(side.contains("left-only").await);
        }
        assert_eq!(left.stats().sync_runs, 1);
    }

    #[tokio::test]
    async fn test_sync_is_stable_once_converged() {
        let clock = Arc::new(ManualClock::new(0));
        let left = manager(10_000, clock.clone());
        let right = manager(10_000, clock.clone());
        left.set("k", b"v", CacheStrategy::memory()).await.unwrap();

        assert_eq!(left.sync(&right).await.synchronized, 1);
        assert_eq!(left.sync(&right).await.synchronized, 0);
    }

    #[tokio::test]
    async fn test_warmup_populates_memory() {
        let cache = manager(10_000, Arc::new(ManualClock::new(0)));
        cache.init().await.unwrap();

        let loader = loader_fn(|key: String| async move { Ok(Bytes::from(key.into_bytes())) });
        let ticket = cache
            .warmup(["vehicle:1", "vehicle:2"], loader, Priority::Critical)
            .unwrap();
        let report = ticket.wait().await.unwrap();

        assert_eq!(report.loaded.len(), 2);
        assert!(cache.is_resident("vehicle:1"));
        assert_eq!(
            cache.get("vehicle:2").await.unwrap().value.as_ref(),
            b"vehicle:2"
        );
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_optimize_sweeps_and_compresses() {
        let clock = Arc::new(ManualClock::new(0));
        let mut cfg = config(100_000);
        cfg.optimizer.compress_threshold_bytes = 1024;
        let cache = CacheManager::builder()
            .with_config(cfg)
            .with_clock(clock.clone())
            .with_cipher(Arc::new(AesGcmCipher::new(&KEY)))
            .build()
            .unwrap();

        cache
            .set(
                "short",
                b"v",
                CacheStrategy::memory().with_ttl(Duration::from_millis(100)),
            )
            .await
            .unwrap();
        let big = "row,".repeat(2048).into_bytes();
        cache.set("big", &big, CacheStrategy::memory()).await.unwrap();
        clock.advance(Duration::from_millis(200));

        let report = cache.optimize().await;
        assert_eq!(report.expired_removed, 1);
        assert_eq!(report.entries_compressed, 1);
        assert!(!report.cancelled);

        let stored = cache.memory().core().peek("big").unwrap();
        assert!(stored.strategy.compression);
        assert_eq!(cache.get("big").await.unwrap().value.as_ref(), &big[..]);
        assert_eq!(cache.stats().optimize_runs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_optimizer_runs_until_shutdown() {
        let clock = Arc::new(ManualClock::new(0));
        let mut cfg = config(10_000);
        cfg.optimizer.interval_ms = Some(1_000);
        let cache = CacheManager::builder()
            .with_config(cfg)
            .with_clock(clock.clone())
            .build()
            .unwrap();

        cache
            .set(
                "stale",
                b"v",
                CacheStrategy::memory().with_ttl(Duration::from_millis(10)),
            )
            .await
            .unwrap();
        clock.advance(Duration::from_millis(50));
        cache.init().await.unwrap();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(cache.stats().optimize_runs >= 1);
        assert!(cache.memory().core().is_empty());

        cache.shutdown().await;
        let runs = cache.stats().optimize_runs;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(cache.stats().optimize_runs, runs);
        assert_eq!(clock.now_ms(), 50);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_warmup_mid_loader() {
        let mut cfg = config(10_000);
        cfg.warmup.loader_timeout_ms = None;
        let cache = CacheManager::builder()
            .with_config(cfg)
            .with_clock(Arc::new(ManualClock::new(0)))
            .with_cipher(Arc::new(AesGcmCipher::new(&KEY)))
            .build()
            .unwrap();
        cache.init().await.unwrap();

        let started = Arc::new(tokio::sync::Notify::new());
        let signal = started.clone();
        let loader = loader_fn(move |key: String| {
            let signal = signal.clone();
            async move {
                if key == "slow" {
                    signal.notify_one();
                    tokio::time::sleep(Duration::from_secs(3_600)).await;
                }
                Ok(Bytes::from(key.into_bytes()))
            }
        });
        let ticket = cache
            .warmup(["fast", "slow", "after"], loader, Priority::High)
            .unwrap();

        started.notified().await;
        cache.shutdown().await;
        let report = ticket.wait().await.unwrap();

        assert_eq!(report.loaded, vec!["fast"]);
        assert!(report.cancelled);
        assert!(report.failed.is_empty());
        assert!(cache.is_resident("fast"));
        assert!(!cache.is_resident("slow"));
        assert!(!cache.is_resident("after"));
        assert!(!cache.contains("slow").await);
    }

    #[tokio::test]
    async fn test_optimize_after_shutdown_reports_cancelled() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = manager(10_000, clock.clone());
        cache
            .set(
                "short",
                b"v",
                CacheStrategy::memory().with_ttl(Duration::from_millis(10)),
            )
            .await
            .unwrap();
        clock.advance(Duration::from_millis(20));
        cache.shutdown().await;

        let report = cache.optimize().await;
        assert!(report.cancelled);
        assert_eq!(report.expired_removed, 0);
        assert_eq!(cache.memory().core().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_set_never_tears() {
        let cache = manager(10_000, Arc::new(ManualClock::new(0)));
        let values: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 64]).collect();
        cache.set("shared", &values[0], CacheStrategy::memory()).await.unwrap();

        let mut handles = Vec::new();
        for worker in 0..4usize {
            let cache = cache.clone();
            let values = values.clone();
            handles.push(tokio::spawn(async move {
                for round in 0..500usize {
                    if (round + worker) % 2 == 0 {
                        let value = &values[(round * 3 + worker) % values.len()];
                        cache.set("shared", value, CacheStrategy::memory()).await.unwrap();
                    } else {
                        let hit = cache.get("shared").await.expect("key is never removed");
                        assert!(values.iter().any(|v| v[..] == hit.value[..]));
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(cache.memory().core().len(), 1);
        assert_eq!(cache.memory().core().size_bytes(), 64);
        let stats = cache.stats();
        assert_eq!(stats.corruptions, 0);
        assert_eq!(stats.codec_failures, 0);
    }
}
