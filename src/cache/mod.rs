//! Path cache.
//!
//! In-memory mirror of remote node state keyed by absolute path. Each entry
//! records when it was last refreshed; callers decide per read how stale an
//! entry may be by passing a [`Ttl`]. There is no implicit eviction.
//!
//! `put` is last-writer-wins by call order. Keeping the cache consistent with
//! the store is the job of the watch/refresh protocol in [`crate::observe`].
//!
//! Every `remove` and `clear` advances the invalidation [`Generation`] of the
//! affected paths. A reader that snapshots the generation before a store call
//! and fills the cache with [`PathCache::put_if_current`] never stores bytes
//! that an invalidation processed during the call has already superseded.

use crate::core::time::{Clock, Ttl};
use crate::store::Stat;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cached state of one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Absolute path.
    pub path: String,
    /// Node data, `None` when not known to the cache.
    pub bytes: Option<Bytes>,
    /// Last known version metadata.
    pub stat: Stat,
    /// Child names, `None` when not known to the cache.
    pub children: Option<Vec<String>>,
    /// When the entry was last written, in clock milliseconds.
    pub last_updated_ms: u64,
}

impl CacheEntry {
    /// Check whether the entry is acceptable under `ttl` at `now_ms`.
    pub fn is_fresh(&self, ttl: Ttl, now_ms: u64) -> bool {
        ttl.is_fresh(self.last_updated_ms, now_ms)
    }

    /// Age of the entry at `now_ms`.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_updated_ms)
    }
}

/// Invalidation count of one path, snapshotted before a store read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation {
    epoch: u64,
    count: u64,
}

#[derive(Default)]
struct Entries {
    map: HashMap<String, CacheEntry>,
    /// Removals per path since the last `clear`.
    removals: HashMap<String, u64>,
    /// Number of `clear` calls.
    epoch: u64,
}

impl Entries {
    fn generation(&self, path: &str) -> Generation {
        Generation {
            epoch: self.epoch,
            count: self.removals.get(path).copied().unwrap_or(0),
        }
    }
}

/// Shared path cache.
pub struct PathCache {
    entries: RwLock<Entries>,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PathCache {
    /// Create an empty cache timed by `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Get the entry for a path regardless of age.
    pub fn get(&self, path: &str) -> Option<CacheEntry> {
        self.entries.read().map.get(path).cloned()
    }

    /// Get the entry for a path if it is fresh under `ttl`.
    pub fn get_fresh(&self, path: &str, ttl: Ttl) -> Option<CacheEntry> {
        let now_ms = self.clock.now_ms();
        let entry = self
            .entries
            .read()
            .map
            .get(path)
            .filter(|entry| entry.is_fresh(ttl, now_ms))
            .cloned();
        match entry {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        entry
    }

    /// Record the state of a path.
    ///
    /// `None` for `bytes` or `children` leaves the cached field unchanged; an
    /// empty child list means "zero children confirmed".
    pub fn put(
        &self,
        path: &str,
        stat: Stat,
        bytes: Option<Bytes>,
        children: Option<Vec<String>>,
    ) {
        let mut entries = self.entries.write();
        self.merge(&mut entries.map, path, stat, bytes, children);
    }

    /// Invalidation generation of a path.
    pub fn generation(&self, path: &str) -> Generation {
        self.entries.read().generation(path)
    }

    /// Like [`PathCache::put`], but only if the path was not invalidated since
    /// `seen` was taken. Returns whether the entry was written.
    pub fn put_if_current(
        &self,
        path: &str,
        seen: Generation,
        stat: Stat,
        bytes: Option<Bytes>,
        children: Option<Vec<String>>,
    ) -> bool {
        let mut entries = self.entries.write();
        if entries.generation(path) != seen {
            return false;
        }
        self.merge(&mut entries.map, path, stat, bytes, children);
        true
    }

    fn merge(
        &self,
        map: &mut HashMap<String, CacheEntry>,
        path: &str,
        stat: Stat,
        bytes: Option<Bytes>,
        children: Option<Vec<String>>,
    ) {
        let now_ms = self.clock.now_ms();
        match map.get_mut(path) {
            Some(entry) => {
                entry.stat = stat;
                if bytes.is_some() {
                    entry.bytes = bytes;
                }
                if children.is_some() {
                    entry.children = children;
                }
                entry.last_updated_ms = now_ms;
            }
            None => {
                map.insert(
                    path.to_string(),
                    CacheEntry {
                        path: path.to_string(),
                        bytes,
                        stat,
                        children,
                        last_updated_ms: now_ms,
                    },
                );
            }
        }
    }

    /// Drop the entry for a path and advance its generation.
    pub fn remove(&self, path: &str) -> Option<CacheEntry> {
        let mut entries = self.entries.write();
        *entries.removals.entry(path.to_string()).or_insert(0) += 1;
        entries.map.remove(path)
    }

    /// Add a child name to a cached parent whose child list is known.
    pub fn add_child(&self, parent: &str, child: &str) {
        if let Some(children) = self
            .entries
            .write()
            .map
            .get_mut(parent)
            .and_then(|entry| entry.children.as_mut())
        {
            if !children.iter().any(|c| c == child) {
                children.push(child.to_string());
            }
        }
    }

    /// Remove a child name from a cached parent whose child list is known.
    pub fn remove_child(&self, parent: &str, child: &str) {
        if let Some(children) = self
            .entries
            .write()
            .map
            .get_mut(parent)
            .and_then(|entry| entry.children.as_mut())
        {
            children.retain(|c| c != child);
        }
    }

    /// Drop every entry and advance every generation.
    pub fn clear(&self) {
        let mut entries = self.entries.write();
        let dropped = entries.map.len();
        entries.map.clear();
        entries.removals.clear();
        entries.epoch += 1;
        tracing::debug!(entries = dropped, "path cache cleared");
    }

    /// Number of cached paths.
    pub fn len(&self) -> usize {
        self.entries.read().map.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().map.is_empty()
    }

    /// Current time according to the cache clock.
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Get statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Path cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cached paths.
    pub entries: usize,
    /// TTL-aware reads served from the cache.
    pub hits: u64,
    /// TTL-aware reads that found no fresh entry.
    pub misses: u64,
}
