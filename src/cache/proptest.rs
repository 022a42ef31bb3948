//! Property-Based Tests for the Cache
//!
//! # Test Properties
//!
//! 1. **Codec Roundtrip**: decode(encode(v)) = v for every compression/encryption mix
//! 2. **Capacity Bound**: a tier never holds more than its byte budget
//! 3. **TTL**: an expired entry is never returned
//! 4. **Key Patterns**: literal globs match only themselves

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;

use super::clock::{Clock, ManualClock};
use super::codec::{AesGcmCipher, EntryCodec};
use super::entry::{CacheEntry, CacheStrategy, EvictionPolicyKind, Priority, TierKind};
use super::index::KeyPattern;
use super::tier::{Lookup, TierConfig, TierCore};

fn codec() -> Arc<EntryCodec> {
    Arc::new(EntryCodec::new(Arc::new(AesGcmCipher::new(&[42u8; 32]))))
}

fn policy() -> impl Strategy<Value = EvictionPolicyKind> {
    prop_oneof![
        Just(EvictionPolicyKind::Lru),
        Just(EvictionPolicyKind::Lfu),
        Just(EvictionPolicyKind::TtlOnly),
    ]
}

fn priority() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Low),
        Just(Priority::Medium),
        Just(Priority::High),
        Just(Priority::Critical),
    ]
}

fn entry(codec: &EntryCodec, key: &str, value: &[u8], strategy: CacheStrategy, now: u64) -> CacheEntry {
    let stored = codec.encode(value, &strategy).unwrap();
    CacheEntry::new(key, stored, EntryCodec::checksum(value), strategy, now)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_codec_restores_plaintext(
        value in proptest::collection::vec(any::<u8>(), 0..4096),
        compression in any::<bool>(),
        encryption in any::<bool>(),
    ) {
        let codec = codec();
        let mut strategy = CacheStrategy::memory();
        strategy.compression = compression;
        strategy.encryption = encryption;

        let stored = codec.encode(&value, &strategy).unwrap();
        let restored = codec.decode(&stored, &strategy).unwrap();
        prop_assert_eq!(restored.as_ref(), &value[..]);
    }

    #[test]
    fn prop_tier_stays_within_budget(
        ops in proptest::collection::vec(
            (0u8..24, 1usize..400, policy(), priority(), 0u64..3),
            1..80,
        ),
    ) {
        let clock = Arc::new(ManualClock::new(0));
        let codec = codec();
        let tier = TierCore::new(
            TierKind::Memory,
            TierConfig::with_capacity(2048),
            codec.clone(),
            clock.clone(),
        );

        for (key, size, policy, priority, ttl_s) in ops {
            clock.advance(Duration::from_millis(500));
            let key = format!("k{}", key);
            let strategy = CacheStrategy::memory()
                .with_policy(policy)
                .with_priority(priority)
                .with_ttl(Duration::from_secs(ttl_s));
            let before = tier.size_bytes();
            let candidate = entry(&codec, &key, &vec![7u8; size], strategy, clock.now_ms());

            if tier.insert(candidate).is_err() {
                prop_assert_eq!(tier.size_bytes(), before);
            }
            prop_assert!(tier.size_bytes() <= 2048);

            let listed: u64 = tier.list().iter().map(|e| e.size_bytes).sum();
            prop_assert_eq!(listed, tier.size_bytes());
        }
    }

    #[test]
    fn prop_expired_entries_never_returned(
        ttl_ms in 1u64..10_000,
        elapsed in 0u64..20_000,
    ) {
        let clock = Arc::new(ManualClock::new(1_000));
        let codec = codec();
        let tier = TierCore::new(TierKind::Memory, TierConfig::default(), codec.clone(), clock.clone());
        let strategy = CacheStrategy::memory().with_ttl(Duration::from_millis(ttl_ms));
        tier.insert(entry(&codec, "k", b"value", strategy, 1_000)).unwrap();

        clock.advance(Duration::from_millis(elapsed));
        let lookup = tier.lookup("k");
        if elapsed >= ttl_ms {
            prop_assert!(matches!(lookup, Lookup::Expired));
            prop_assert!(tier.is_empty());
        } else {
            prop_assert!(lookup.is_hit());
        }
    }

    #[test]
    fn prop_literal_pattern_matches_only_itself(
        key in "[a-z0-9:._+\\[\\]()-]{1,24}",
        other in "[a-z0-9:._+\\[\\]()-]{1,24}",
    ) {
        let pattern = KeyPattern::new(&key).unwrap();
        prop_assert!(pattern.is_match(&key));
        prop_assert_eq!(pattern.is_match(&other), key == other);
    }

    #[test]
    fn prop_star_prefix_matches_extensions(
        prefix in "[a-z:]{0,12}",
        suffix in "[a-z0-9:]{0,12}",
    ) {
        let pattern = KeyPattern::new(&format!("{}*", prefix)).unwrap();
        let key = format!("{}{}", prefix, suffix);
        prop_assert!(pattern.is_match(&key));
    }
}

#[test]
fn test_record_roundtrip_preserves_entry() {
    let codec = codec();
    let strategy = CacheStrategy::persistent()
        .compressed()
        .encrypted()
        .with_tags(["fleet", "eu"]);
    let original = entry(&codec, "car:7", &[3u8; 512], strategy, 99);

    let restored = CacheEntry::from_record(&original.to_record().unwrap()).unwrap();
    assert_eq!(restored, original);
    assert_eq!(codec.open(&restored).unwrap(), Bytes::from(vec![3u8; 512]));
}
