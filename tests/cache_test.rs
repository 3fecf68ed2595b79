//! Tests for [`SemanticCache`] over the in-memory kv store.

use std::sync::Arc;
use std::time::Duration;

use mimir::cache::{fingerprint, SemanticCache};
use mimir::kv::{KvStore, MemoryKv};

const TTL: Duration = Duration::from_secs(60);

fn cache() -> (SemanticCache, Arc<dyn KvStore>) {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    (
        SemanticCache::new(Arc::clone(&kv), "test:cache", "test:lock"),
        kv,
    )
}

#[tokio::test]
async fn exact_miss_returns_none() {
    let (cache, _) = cache();
    let fp = fingerprint("nothing here", "m1");
    assert!(cache.get_exact(&fp).await.unwrap().is_none());
}

#[tokio::test]
async fn set_then_get_exact_round_trips_entry() {
    let (cache, _) = cache();
    let fp = fingerprint("what is python", "m1");
    let embedding = vec![0.1f32, 0.2, 0.3];

    cache
        .set(&fp, "what is python", "a language", Some(&embedding), TTL)
        .await
        .unwrap();

    let entry = cache.get_exact(&fp).await.unwrap().expect("entry stored");
    assert_eq!(entry.response, "a language");
    assert_eq!(entry.prompt.as_deref(), Some("what is python"));
    assert_eq!(entry.embedding.as_deref(), Some(&embedding[..]));
}

#[tokio::test]
async fn entry_without_embedding_serves_exact_hits_only() {
    let (cache, _) = cache();
    let fp = fingerprint("plain", "m1");
    cache.set(&fp, "plain", "response", None, TTL).await.unwrap();

    let entry = cache.get_exact(&fp).await.unwrap().expect("entry stored");
    assert_eq!(entry.response, "response");
    assert!(entry.embedding.is_none());

    // The semantic scan never sees it.
    assert!(cache.scan_all().await.unwrap().is_empty());
    let found = cache
        .find_semantic_match(&[1.0, 0.0, 0.0], 0.0)
        .await
        .unwrap();
    assert!(found.is_none());
}

#[tokio::test]
async fn entries_expire_with_ttl() {
    let (cache, _) = cache();
    let fp = fingerprint("short lived", "m1");
    cache
        .set(
            &fp,
            "short lived",
            "response",
            Some(&[1.0, 0.0]),
            Duration::from_millis(20),
        )
        .await
        .unwrap();

    assert!(cache.get_exact(&fp).await.unwrap().is_some());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(cache.get_exact(&fp).await.unwrap().is_none());
}

#[tokio::test]
async fn semantic_match_returns_best_above_threshold() {
    let (cache, _) = cache();
    let fp_a = fingerprint("a", "m1");
    let fp_b = fingerprint("b", "m1");
    cache
        .set(&fp_a, "a", "response a", Some(&[1.0, 0.0, 0.0]), TTL)
        .await
        .unwrap();
    cache
        .set(&fp_b, "b", "response b", Some(&[0.0, 1.0, 0.0]), TTL)
        .await
        .unwrap();

    // Query much closer to entry a.
    let found = cache
        .find_semantic_match(&[0.95, 0.05, 0.0], 0.75)
        .await
        .unwrap()
        .expect("entry a matches");
    assert_eq!(found.prompt, "a");
    assert_eq!(found.response, "response a");
    assert!(found.similarity > 0.9);
}

#[tokio::test]
async fn semantic_match_respects_threshold() {
    let (cache, _) = cache();
    let fp = fingerprint("a", "m1");
    cache
        .set(&fp, "a", "response a", Some(&[1.0, 0.0, 0.0]), TTL)
        .await
        .unwrap();

    // Cosine with the stored vector is ~0.707.
    let query = [0.7071f32, 0.7071, 0.0];
    assert!(cache
        .find_semantic_match(&query, 0.75)
        .await
        .unwrap()
        .is_none());
    assert!(cache
        .find_semantic_match(&query, 0.5)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn unit_threshold_only_matches_identical_vectors() {
    let (cache, _) = cache();
    let fp_a = fingerprint("a", "m1");
    let fp_b = fingerprint("b", "m1");
    cache
        .set(&fp_a, "a", "response a", Some(&[1.0, 0.0, 0.0]), TTL)
        .await
        .unwrap();
    cache
        .set(&fp_b, "b", "response b", Some(&[0.99, 0.14, 0.0]), TTL)
        .await
        .unwrap();

    let found = cache
        .find_semantic_match(&[1.0, 0.0, 0.0], 1.0)
        .await
        .unwrap()
        .expect("identical vector matches at threshold 1.0");
    assert_eq!(found.prompt, "a");
}

#[tokio::test]
async fn mismatched_dimension_entries_are_skipped() {
    let (cache, _) = cache();
    let fp_old = fingerprint("old producer", "m1");
    let fp_new = fingerprint("new producer", "m1");
    // Stored before an embedding producer upgrade: 2-dimensional.
    cache
        .set(&fp_old, "old producer", "old response", Some(&[1.0, 0.0]), TTL)
        .await
        .unwrap();
    cache
        .set(
            &fp_new,
            "new producer",
            "new response",
            Some(&[1.0, 0.0, 0.0]),
            TTL,
        )
        .await
        .unwrap();

    let found = cache
        .find_semantic_match(&[1.0, 0.0, 0.0], 0.0)
        .await
        .unwrap()
        .expect("3-dimensional entry still matches");
    assert_eq!(found.response, "new response");
}

#[tokio::test]
async fn scan_all_lists_embedded_entries() {
    let (cache, _) = cache();
    for (prompt, vector) in [("p1", [1.0f32, 0.0]), ("p2", [0.0, 1.0])] {
        let fp = fingerprint(prompt, "m1");
        cache
            .set(&fp, prompt, "response", Some(&vector), TTL)
            .await
            .unwrap();
    }

    let mut entries = cache.scan_all().await.unwrap();
    entries.sort_by(|a, b| a.prompt.cmp(&b.prompt));
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].prompt, "p1");
    assert_eq!(entries[0].fingerprint, fingerprint("p1", "m1"));
    assert_eq!(entries[1].prompt, "p2");
}

#[tokio::test]
async fn lock_is_exclusive_until_released() {
    let (cache, _) = cache();
    let fp = fingerprint("locked", "m1");

    assert!(cache.try_acquire_lock(&fp, "holder-1", TTL).await.unwrap());
    assert!(!cache.try_acquire_lock(&fp, "holder-2", TTL).await.unwrap());

    // A non-owner cannot release it.
    assert!(!cache.release_lock(&fp, "holder-2").await.unwrap());
    assert!(!cache.try_acquire_lock(&fp, "holder-2", TTL).await.unwrap());

    // The owner can.
    assert!(cache.release_lock(&fp, "holder-1").await.unwrap());
    assert!(cache.try_acquire_lock(&fp, "holder-2", TTL).await.unwrap());
}

#[tokio::test]
async fn lock_expires_on_holder_crash() {
    let (cache, _) = cache();
    let fp = fingerprint("crashed", "m1");

    assert!(cache
        .try_acquire_lock(&fp, "holder-1", Duration::from_millis(20))
        .await
        .unwrap());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(cache.try_acquire_lock(&fp, "holder-2", TTL).await.unwrap());
}

#[tokio::test]
async fn stats_count_outcomes_and_stored_items() {
    let (cache, _) = cache();
    cache.record_exact_hit();
    cache.record_exact_hit();
    cache.record_semantic_hit();
    cache.record_miss();

    let fp = fingerprint("stored", "m1");
    cache
        .set(&fp, "stored", "response", Some(&[1.0]), TTL)
        .await
        .unwrap();

    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.total_requests, 4);
    assert_eq!(stats.exact_hits, 2);
    assert_eq!(stats.semantic_hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hit_rate_percent, 75.0);
    // The embedding sidecar does not count as a second item.
    assert_eq!(stats.stored_items, 1);
}

#[tokio::test]
async fn clear_removes_entries_but_not_locks() {
    let (cache, kv) = cache();
    let fp = fingerprint("to clear", "m1");
    cache
        .set(&fp, "to clear", "response", Some(&[1.0]), TTL)
        .await
        .unwrap();
    cache.try_acquire_lock(&fp, "holder", TTL).await.unwrap();

    let deleted = cache.clear().await.unwrap();
    assert_eq!(deleted, 2); // response + sidecar
    assert!(cache.get_exact(&fp).await.unwrap().is_none());
    // The lock prefix is untouched.
    assert_eq!(kv.scan_prefix("test:lock:").await.unwrap().len(), 1);
}
