//! Tests for the path cache.

use bytes::Bytes;
use keel::cache::PathCache;
use keel::core::time::{ManualClock, Ttl};
use keel::store::Stat;
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn cache() -> (PathCache, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(10_000));
    (PathCache::new(clock.clone()), clock)
}

fn stat(version: i32) -> Stat {
    Stat {
        version,
        ..Stat::default()
    }
}

// ============================================================================
// Freshness Tests
// ============================================================================

#[test]
fn fresh_entry_within_ttl() {
    let (cache, clock) = cache();
    cache.put("/a", stat(0), Some(Bytes::from_static(b"x")), None);

    clock.advance(Duration::from_millis(500));
    let entry = cache.get_fresh("/a", Ttl::millis(1_000)).unwrap();
    assert_eq!(entry.bytes, Some(Bytes::from_static(b"x")));
    assert_eq!(entry.age_ms(cache.now_ms()), 500);

    clock.advance(Duration::from_millis(501));
    assert!(cache.get_fresh("/a", Ttl::millis(1_000)).is_none());
    // Stale entries are still there for untimed reads.
    assert!(cache.get("/a").is_some());
    assert!(cache.get_fresh("/a", Ttl::Unbounded).is_some());
}

#[test]
fn bypass_never_hits() {
    let (cache, _clock) = cache();
    cache.put("/a", stat(0), Some(Bytes::new()), None);
    assert!(cache.get_fresh("/a", Ttl::Bypass).is_none());
}

#[test]
fn hit_and_miss_counters() {
    let (cache, _clock) = cache();
    cache.put("/a", stat(0), Some(Bytes::new()), None);

    cache.get_fresh("/a", Ttl::Unbounded);
    cache.get_fresh("/a", Ttl::Unbounded);
    cache.get_fresh("/b", Ttl::Unbounded);

    let stats = cache.stats();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 1);
}

// ============================================================================
// Merge Tests
// ============================================================================

#[test]
fn put_merges_known_fields() {
    let (cache, clock) = cache();
    cache.put("/p", stat(0), Some(Bytes::from_static(b"data")), None);

    clock.advance(Duration::from_millis(10));
    cache.put("/p", stat(1), None, Some(vec!["a".to_string()]));

    let entry = cache.get("/p").unwrap();
    assert_eq!(entry.bytes, Some(Bytes::from_static(b"data")));
    assert_eq!(entry.children, Some(vec!["a".to_string()]));
    assert_eq!(entry.stat.version, 1);
    assert_eq!(entry.last_updated_ms, 10_010);
}

#[test]
fn child_edits_need_a_known_list() {
    let (cache, _clock) = cache();

    // No entry: nothing to edit.
    cache.add_child("/p", "a");
    assert!(cache.get("/p").is_none());

    // Entry without a child list stays without one.
    cache.put("/p", stat(0), Some(Bytes::new()), None);
    cache.add_child("/p", "a");
    assert_eq!(cache.get("/p").unwrap().children, None);

    cache.put("/p", stat(0), None, Some(Vec::new()));
    cache.add_child("/p", "a");
    cache.add_child("/p", "a");
    cache.add_child("/p", "b");
    assert_eq!(
        cache.get("/p").unwrap().children,
        Some(vec!["a".to_string(), "b".to_string()])
    );

    cache.remove_child("/p", "a");
    assert_eq!(cache.get("/p").unwrap().children, Some(vec!["b".to_string()]));
}

#[test]
fn remove_and_clear() {
    let (cache, _clock) = cache();
    cache.put("/a", stat(0), Some(Bytes::new()), None);
    cache.put("/b", stat(0), Some(Bytes::new()), None);

    assert!(cache.remove("/a").is_some());
    assert!(cache.remove("/a").is_none());
    assert_eq!(cache.len(), 1);

    cache.clear();
    assert!(cache.is_empty());
}

// ============================================================================
// Generation Tests
// ============================================================================

#[test]
fn fill_after_remove_is_skipped() {
    let (cache, _clock) = cache();
    cache.put("/a", stat(0), Some(Bytes::from_static(b"v0")), None);

    let seen = cache.generation("/a");
    cache.remove("/a");
    assert!(!cache.put_if_current("/a", seen, stat(1), Some(Bytes::from_static(b"v1")), None));
    assert!(cache.get("/a").is_none());

    let seen = cache.generation("/a");
    assert!(cache.put_if_current("/a", seen, stat(2), Some(Bytes::from_static(b"v2")), None));
    assert_eq!(cache.get("/a").unwrap().bytes, Some(Bytes::from_static(b"v2")));
}

#[test]
fn fill_after_clear_is_skipped() {
    let (cache, _clock) = cache();
    let seen_a = cache.generation("/a");
    let seen_b = cache.generation("/b");
    cache.remove("/b");
    cache.clear();

    assert!(!cache.put_if_current("/a", seen_a, stat(0), Some(Bytes::new()), None));
    assert!(!cache.put_if_current("/b", seen_b, stat(0), Some(Bytes::new()), None));
    assert!(cache.is_empty());
}

#[test]
fn unrelated_remove_does_not_block_fill() {
    let (cache, _clock) = cache();
    let seen = cache.generation("/a");
    cache.remove("/b");
    cache.put("/a", stat(0), None, Some(Vec::new()));

    assert!(cache.put_if_current("/a", seen, stat(1), None, Some(vec!["x".to_string()])));
    assert_eq!(cache.get("/a").unwrap().children, Some(vec!["x".to_string()]));
}

// ============================================================================
// Property Tests
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Put(usize, Vec<u8>),
    Get(usize),
}

const PATHS: [&str; 3] = ["/a", "/a/b", "/c"];

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..PATHS.len(), proptest::collection::vec(any::<u8>(), 0..8))
            .prop_map(|(path, bytes)| Op::Put(path, bytes)),
        (0..PATHS.len()).prop_map(Op::Get),
    ]
}

proptest! {
    #[test]
    fn last_put_wins(ops in proptest::collection::vec(op(), 1..64)) {
        let (cache, clock) = cache();
        let mut model: HashMap<usize, (Vec<u8>, i32)> = HashMap::new();

        for (version, op) in ops.into_iter().enumerate() {
            match op {
                Op::Put(path, bytes) => {
                    let version = version as i32;
                    cache.put(PATHS[path], stat(version), Some(Bytes::from(bytes.clone())), None);
                    model.insert(path, (bytes, version));
                    clock.advance(Duration::from_millis(1));
                }
                Op::Get(path) => {
                    let entry = cache.get(PATHS[path]);
                    match model.get(&path) {
                        Some((bytes, version)) => {
                            let entry = entry.expect("entry for written path");
                            prop_assert_eq!(entry.bytes, Some(Bytes::from(bytes.clone())));
                            prop_assert_eq!(entry.stat.version, *version);
                        }
                        None => prop_assert!(entry.is_none()),
                    }
                }
            }
        }
        prop_assert_eq!(cache.len(), model.len());
    }
}
