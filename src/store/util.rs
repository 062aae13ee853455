//! Create-with-parents and set-or-create helpers.
//!
//! Both helpers tolerate other clients racing to create the same nodes.

use super::{Acl, CreateMode, Stat, StoreClient};
use crate::core::error::{KeelError, KeelResult};
use crate::store::path::{PathScheme, ROOT};
use bytes::Bytes;

/// Create every missing persistent node on the way to `path`, inclusive.
pub fn ensure_path(store: &dyn StoreClient, path: &str, acl: &[Acl]) -> KeelResult<()> {
    PathScheme::check(path)?;
    let mut current = String::new();
    for token in PathScheme::tokenize(path) {
        current.push('/');
        current.push_str(token);
        if store.exists(&current, false)?.is_some() {
            continue;
        }
        match store.create(&current, Bytes::new(), CreateMode::PERSISTENT, acl) {
            Ok(_) => tracing::trace!(path = %current, "created path node"),
            Err(KeelError::NodeExists { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Ensure every ancestor of `path` exists.
pub fn ensure_parent(store: &dyn StoreClient, path: &str, acl: &[Acl]) -> KeelResult<()> {
    match PathScheme::parent(path)? {
        Some(parent) if parent != ROOT => ensure_path(store, &parent, acl),
        _ => Ok(()),
    }
}

/// Write `data` at `path`, creating the node and its ancestors if needed.
pub fn update_path(store: &dyn StoreClient, path: &str, data: Bytes, acl: &[Acl]) -> KeelResult<Stat> {
    match store.set_data(path, data.clone(), None) {
        Ok(stat) => return Ok(stat),
        Err(KeelError::NodeAbsent { .. }) => {}
        Err(e) => return Err(e),
    }

    ensure_parent(store, path, acl)?;
    match store.create(path, data.clone(), CreateMode::PERSISTENT, acl) {
        Ok(_) => store
            .exists(path, false)?
            .ok_or_else(|| KeelError::node_absent(path)),
        // Lost the create race; our write still has to land.
        Err(KeelError::NodeExists { .. }) => store.set_data(path, data, None),
        Err(e) => Err(e),
    }
}
