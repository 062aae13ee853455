//! Store client contract.
//!
//! The kernel consumes a consistent, hierarchical, watch-capable store through
//! the synchronous [`StoreClient`] trait. Watches are one-shot: a watch armed by
//! `get_data`, `exists` or `get_children` fires at most once and must be re-armed
//! by the next read.
//!
//! # Modules
//!
//! - [`path`] - Path validation and the reserved layout
//! - [`memory`] - Embedded in-process store
//! - [`util`] - Create-with-parents and set-or-create helpers

pub mod memory;
pub mod path;
pub mod util;

use crate::core::error::{KeelError, KeelResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use memory::{MemorySession, MemoryStore};
pub use path::{PathKind, PathScheme};

bitflags::bitflags! {
    /// Node creation mode. The empty set is a persistent node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct CreateMode: u8 {
        /// Removed when the creating session ends.
        const EPHEMERAL = 0b0000_0001;
        /// Name suffixed with a store-assigned, monotonically increasing number.
        const SEQUENTIAL = 0b0000_0010;
    }
}

impl CreateMode {
    /// Persistent, non-sequential node.
    pub const PERSISTENT: Self = Self::empty();

    /// Ephemeral node carrying a sequence suffix.
    pub const EPHEMERAL_SEQUENTIAL: Self = Self::EPHEMERAL.union(Self::SEQUENTIAL);

    /// Check if nodes created with this mode are ephemeral.
    pub fn is_ephemeral(&self) -> bool {
        self.contains(Self::EPHEMERAL)
    }

    /// Check if nodes created with this mode are sequential.
    pub fn is_sequential(&self) -> bool {
        self.contains(Self::SEQUENTIAL)
    }
}

bitflags::bitflags! {
    /// Permissions granted by an ACL entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Perms: u8 {
        const READ = 0b0000_0001;
        const WRITE = 0b0000_0010;
        const CREATE = 0b0000_0100;
        const DELETE = 0b0000_1000;
        const ADMIN = 0b0001_0000;
        const ALL = Self::READ.bits()
            | Self::WRITE.bits()
            | Self::CREATE.bits()
            | Self::DELETE.bits()
            | Self::ADMIN.bits();
    }
}

/// Access control entry attached to a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Acl {
    /// Granted permissions.
    pub perms: Perms,
    /// Authentication scheme, e.g. "world" or "digest".
    pub scheme: String,
    /// Identity within the scheme.
    pub id: String,
}

impl Acl {
    /// Open access for everyone.
    pub fn world_anyone() -> Self {
        Self {
            perms: Perms::ALL,
            scheme: "world".to_string(),
            id: "anyone".to_string(),
        }
    }

    /// Parse a `scheme:id:perms` entry where perms is a subset of `rwcda`.
    pub fn parse(entry: &str) -> KeelResult<Self> {
        let mut parts = entry.splitn(3, ':');
        let (scheme, id, perm_chars) = match (parts.next(), parts.next(), parts.next()) {
            (Some(s), Some(i), Some(p)) if !s.is_empty() && !i.is_empty() => (s, i, p),
            _ => {
                return Err(KeelError::invalid_request(format!(
                    "ACL entry must be scheme:id:perms, got '{}'",
                    entry
                )))
            }
        };

        let mut perms = Perms::empty();
        for c in perm_chars.chars() {
            perms |= match c {
                'r' => Perms::READ,
                'w' => Perms::WRITE,
                'c' => Perms::CREATE,
                'd' => Perms::DELETE,
                'a' => Perms::ADMIN,
                other => {
                    return Err(KeelError::invalid_request(format!(
                        "unknown ACL permission '{}' in '{}'",
                        other, entry
                    )))
                }
            };
        }
        if perms.is_empty() {
            return Err(KeelError::invalid_request(format!(
                "ACL entry grants no permissions: '{}'",
                entry
            )));
        }

        Ok(Self {
            perms,
            scheme: scheme.to_string(),
            id: id.to_string(),
        })
    }
}

/// Version and bookkeeping metadata of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Transaction id that created the node.
    pub czxid: i64,
    /// Transaction id of the last data modification.
    pub mzxid: i64,
    /// Creation time in milliseconds.
    pub ctime_ms: u64,
    /// Last data modification time in milliseconds.
    pub mtime_ms: u64,
    /// Data version; increments on every write.
    pub version: i32,
    /// Child version; increments on every child create or delete.
    pub cversion: i32,
    /// Owning session for ephemeral nodes, 0 otherwise.
    pub ephemeral_owner: u64,
    /// Length of the node data.
    pub data_length: usize,
    /// Number of children.
    pub num_children: usize,
}

impl Stat {
    /// Check if the node is ephemeral.
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral_owner != 0
    }
}

/// Kind of a watch notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A watched, previously absent node was created.
    NodeCreated,
    /// A watched node's data changed.
    NodeDataChanged,
    /// A watched node was deleted.
    NodeDeleted,
    /// A watched node's child list changed.
    NodeChildrenChanged,
    /// The session is (re)connected.
    Connected,
    /// The connection was lost; the session may still be alive.
    Disconnected,
    /// The session is gone along with its ephemeral nodes and watches.
    SessionExpired,
}

impl EventType {
    /// Check if this is a session-state event rather than a node event.
    pub fn is_session_event(&self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Disconnected | Self::SessionExpired
        )
    }
}

/// Raw notification delivered by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    /// Event type.
    pub event_type: EventType,
    /// Affected path, absent for session events.
    pub path: Option<String>,
}

impl WatchedEvent {
    /// Node event on a path.
    pub fn node(event_type: EventType, path: impl Into<String>) -> Self {
        Self {
            event_type,
            path: Some(path.into()),
        }
    }

    /// Session-state event.
    pub fn session(event_type: EventType) -> Self {
        Self {
            event_type,
            path: None,
        }
    }

    /// Affected path, if any.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }
}

/// Receiver of raw store notifications.
///
/// `process` runs on the store's delivery thread; slow implementations delay
/// every later event.
pub trait Watcher: Send + Sync {
    /// Handle one event.
    fn process(&self, event: &WatchedEvent);
}

/// Synchronous facade over the coordination store.
///
/// Every call blocks until the store answers. A call that fails with
/// [`KeelError::Connectivity`] may still have been applied remotely.
pub trait StoreClient: Send + Sync {
    /// Create a node and return its actual path (with sequence suffix if any).
    fn create(&self, path: &str, data: Bytes, mode: CreateMode, acl: &[Acl]) -> KeelResult<String>;

    /// Read node data, optionally arming a data watch.
    fn get_data(&self, path: &str, watch: bool) -> KeelResult<(Bytes, Stat)>;

    /// Write node data. `None` matches any version.
    fn set_data(&self, path: &str, data: Bytes, expected_version: Option<i32>) -> KeelResult<Stat>;

    /// Delete a childless node. `None` matches any version.
    fn delete(&self, path: &str, expected_version: Option<i32>) -> KeelResult<()>;

    /// List child names, optionally arming a child watch.
    fn get_children(&self, path: &str, watch: bool) -> KeelResult<(Vec<String>, Stat)>;

    /// Stat a node, optionally arming a watch that also fires on creation.
    fn exists(&self, path: &str, watch: bool) -> KeelResult<Option<Stat>>;

    /// Add a receiver for this session's notifications.
    fn register(&self, watcher: Arc<dyn Watcher>);

    /// Identifier of the session backing this client.
    fn session_id(&self) -> u64;

    /// End the session, removing its ephemeral nodes.
    fn close(&self);
}
