//! Cached single-path reads and writes.
//!
//! Reads go to the path cache first and fall through to the store when no
//! entry is fresh enough; a store read arms a watch so later changes
//! invalidate the entry. Writes update the cache only after the store
//! accepted them. Neither fills the cache if the path was invalidated while
//! the store call was in flight.

use crate::cache::PathCache;
use crate::core::error::{KeelError, KeelResult};
use crate::core::time::Ttl;
use crate::store::path::PathScheme;
use crate::store::util::update_path;
use crate::store::{Acl, Stat, StoreClient};
use bytes::Bytes;
use std::sync::Arc;

/// Read-through, write-through access to node data.
pub struct DataAccess {
    store: Arc<dyn StoreClient>,
    cache: Arc<PathCache>,
    acl: Vec<Acl>,
}

impl DataAccess {
    pub fn new(store: Arc<dyn StoreClient>, cache: Arc<PathCache>, acl: Vec<Acl>) -> Self {
        Self { store, cache, acl }
    }

    /// Read node data, serving from the cache when fresh under `ttl`.
    ///
    /// Returns `None` if the node does not exist.
    pub fn read(&self, path: &str, ttl: Ttl) -> KeelResult<Option<Bytes>> {
        self.read_with_stat(path, ttl)
            .map(|found| found.map(|(bytes, _)| bytes))
    }

    /// Like [`DataAccess::read`] but also returns the node's stat.
    pub fn read_with_stat(&self, path: &str, ttl: Ttl) -> KeelResult<Option<(Bytes, Stat)>> {
        PathScheme::check(path)?;
        if let Some(entry) = self.cache.get_fresh(path, ttl) {
            if let Some(bytes) = entry.bytes {
                return Ok(Some((bytes, entry.stat)));
            }
        }

        let seen = self.cache.generation(path);
        match self.store.get_data(path, true) {
            Ok((bytes, stat)) => {
                if !self.cache.put_if_current(path, seen, stat, Some(bytes.clone()), None) {
                    tracing::trace!(path = %path, "path changed during read, not cached");
                }
                Ok(Some((bytes, stat)))
            }
            Err(KeelError::NodeAbsent { .. }) => {
                self.cache.remove(path);
                // Watch for creation so an observer of this path hears about it.
                self.store.exists(path, true)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// List child names, serving from the cache when fresh under `ttl`.
    ///
    /// A missing node has no children.
    pub fn read_children(&self, path: &str, ttl: Ttl) -> KeelResult<Vec<String>> {
        PathScheme::check(path)?;
        if let Some(entry) = self.cache.get_fresh(path, ttl) {
            if let Some(children) = entry.children {
                return Ok(children);
            }
        }

        let seen = self.cache.generation(path);
        match self.store.get_children(path, true) {
            Ok((children, stat)) => {
                if !self.cache.put_if_current(path, seen, stat, None, Some(children.clone())) {
                    tracing::trace!(path = %path, "children changed during read, not cached");
                }
                Ok(children)
            }
            Err(KeelError::NodeAbsent { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Write node data, creating the node and its ancestors if needed.
    pub fn write(&self, path: &str, bytes: Bytes) -> KeelResult<Stat> {
        PathScheme::check(path)?;
        let seen = self.cache.generation(path);
        let stat = update_path(self.store.as_ref(), path, bytes.clone(), &self.acl)?;
        self.cache.put_if_current(path, seen, stat, Some(bytes), None);
        if let Some(parent) = PathScheme::parent(path)? {
            self.cache.add_child(&parent, PathScheme::leaf(path));
        }
        tracing::trace!(path = %path, version = stat.version, "data written");
        Ok(stat)
    }

    /// Delete a node. Returns false if it did not exist.
    pub fn delete(&self, path: &str) -> KeelResult<bool> {
        PathScheme::check(path)?;
        let existed = match self.store.delete(path, None) {
            Ok(()) => true,
            Err(KeelError::NodeAbsent { .. }) => false,
            Err(e) => return Err(e),
        };
        self.cache.remove(path);
        if let Some(parent) = PathScheme::parent(path)? {
            self.cache.remove_child(&parent, PathScheme::leaf(path));
        }
        Ok(existed)
    }

    /// Authoritative stat of a node, bypassing the cache.
    pub fn stat(&self, path: &str) -> KeelResult<Option<Stat>> {
        self.store.exists(path, false)
    }

    /// Current time according to the cache clock.
    pub fn now_ms(&self) -> u64 {
        self.cache.now_ms()
    }
}
