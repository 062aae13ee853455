//! Embedded in-process store.
//!
//! [`MemoryStore`] is the server side: one node tree shared by every session.
//! [`MemoryStore::connect`] opens a [`MemorySession`], which implements
//! [`StoreClient`] and owns a named delivery thread. Events for a session are
//! queued in the order the tree observed the mutations and dispatched one at a
//! time to the session's registered watchers.
//!
//! Watch semantics:
//! - `get_data(watch)` on an existing node arms a data watch
//!   (fires `NodeDataChanged` or `NodeDeleted`).
//! - `exists(watch)` arms a data watch if the node exists, otherwise a
//!   creation watch (fires `NodeCreated`).
//! - `get_children(watch)` arms a child watch (fires `NodeChildrenChanged`,
//!   or `NodeDeleted` when the parent itself goes away).
//!
//! A session can be disconnected, reconnected and expired. While disconnected
//! every call fails with a connectivity error and triggered events are held
//! back until the `Connected` event on reconnect. A reconnect later than the
//! session timeout expires the session instead.

use super::{Acl, CreateMode, EventType, Stat, StoreClient, WatchedEvent, Watcher};
use crate::core::config::StoreConfig;
use crate::core::error::{KeelError, KeelResult};
use crate::core::time::Clock;
use crate::store::path::{PathScheme, ROOT};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// First session id handed out. Zero means "not ephemeral" in [`Stat`].
const FIRST_SESSION_ID: u64 = 0x1000;

/// Width of the zero-padded sequence suffix.
const SEQUENCE_WIDTH: usize = 10;

/// Work item on a session's delivery queue.
enum Delivery {
    Event(WatchedEvent),
    Barrier(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStatus {
    Connected,
    Disconnected { since_ms: u64 },
    Expired,
    Closed,
}

struct Node {
    data: Bytes,
    stat: Stat,
    acl: Vec<Acl>,
    children: BTreeSet<String>,
    next_sequence: u64,
}

struct SessionState {
    status: SessionStatus,
    sender: Option<mpsc::UnboundedSender<Delivery>>,
    depth: Arc<AtomicUsize>,
    held_back: Vec<WatchedEvent>,
    data_watches: HashSet<String>,
    exist_watches: HashSet<String>,
    child_watches: HashSet<String>,
    ephemerals: BTreeSet<String>,
}

impl SessionState {
    fn clear_watches(&mut self) {
        self.data_watches.clear();
        self.exist_watches.clear();
        self.child_watches.clear();
    }

    fn enqueue(&mut self, event: WatchedEvent, warn_depth: usize, session_id: u64) {
        if let SessionStatus::Disconnected { .. } = self.status {
            self.held_back.push(event);
            return;
        }
        if let Some(ref sender) = self.sender {
            let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
            if depth == warn_depth {
                tracing::warn!(
                    session_id = session_id,
                    depth = depth,
                    "event delivery queue is backing up"
                );
            }
            if sender.send(Delivery::Event(event)).is_err() {
                self.depth.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    fn check_usable(&self) -> KeelResult<()> {
        match self.status {
            SessionStatus::Connected => Ok(()),
            SessionStatus::Disconnected { .. } => {
                Err(KeelError::connectivity("session is disconnected"))
            }
            SessionStatus::Expired | SessionStatus::Closed => Err(KeelError::SessionExpired),
        }
    }
}

/// Which armed watches an event consumes.
#[derive(Clone, Copy)]
struct Triggers {
    data: bool,
    exist: bool,
    child: bool,
}

struct Tree {
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<u64, SessionState>,
    zxid: i64,
    next_session_id: u64,
}

impl Tree {
    fn new(now_ms: u64) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            ROOT.to_string(),
            Node {
                data: Bytes::new(),
                stat: Stat {
                    ctime_ms: now_ms,
                    mtime_ms: now_ms,
                    ..Stat::default()
                },
                acl: vec![Acl::world_anyone()],
                children: BTreeSet::new(),
                next_sequence: 0,
            },
        );
        Self {
            nodes,
            sessions: HashMap::new(),
            zxid: 0,
            next_session_id: FIRST_SESSION_ID,
        }
    }

    fn next_zxid(&mut self) -> i64 {
        self.zxid += 1;
        self.zxid
    }

    fn session(&self, id: u64) -> KeelResult<&SessionState> {
        self.sessions.get(&id).ok_or(KeelError::SessionExpired)
    }

    fn fire(&mut self, path: &str, event_type: EventType, triggers: Triggers, warn_depth: usize) {
        for (id, session) in self.sessions.iter_mut() {
            let mut hit = false;
            if triggers.data {
                hit |= session.data_watches.remove(path);
            }
            if triggers.exist {
                hit |= session.exist_watches.remove(path);
            }
            if triggers.child {
                hit |= session.child_watches.remove(path);
            }
            if hit {
                session.enqueue(WatchedEvent::node(event_type, path), warn_depth, *id);
            }
        }
    }

    fn stat_of(node: &Node) -> Stat {
        Stat {
            data_length: node.data.len(),
            num_children: node.children.len(),
            ..node.stat
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn create(
        &mut self,
        session_id: u64,
        path: &str,
        data: Bytes,
        mode: CreateMode,
        acl: &[Acl],
        now_ms: u64,
        warn_depth: usize,
    ) -> KeelResult<String> {
        let parent_path = PathScheme::parent(path)?.ok_or_else(|| KeelError::node_exists(ROOT))?;
        let parent = self
            .nodes
            .get_mut(&parent_path)
            .ok_or_else(|| KeelError::node_absent(parent_path.clone()))?;
        if parent.stat.is_ephemeral() {
            return Err(KeelError::NoChildrenForEphemerals { path: parent_path });
        }

        let actual = if mode.is_sequential() {
            let sequence = parent.next_sequence;
            format!("{}{:0width$}", path, sequence, width = SEQUENCE_WIDTH)
        } else {
            path.to_string()
        };
        PathScheme::check(&actual)?;
        if parent.children.contains(PathScheme::leaf(&actual)) {
            return Err(KeelError::node_exists(actual));
        }

        if mode.is_sequential() {
            parent.next_sequence += 1;
        }
        parent.children.insert(PathScheme::leaf(&actual).to_string());
        parent.stat.cversion += 1;

        let zxid = self.next_zxid();
        let owner = if mode.is_ephemeral() { session_id } else { 0 };
        self.nodes.insert(
            actual.clone(),
            Node {
                data,
                stat: Stat {
                    czxid: zxid,
                    mzxid: zxid,
                    ctime_ms: now_ms,
                    mtime_ms: now_ms,
                    ephemeral_owner: owner,
                    ..Stat::default()
                },
                acl: acl.to_vec(),
                children: BTreeSet::new(),
                next_sequence: 0,
            },
        );
        if mode.is_ephemeral() {
            if let Some(session) = self.sessions.get_mut(&session_id) {
                session.ephemerals.insert(actual.clone());
            }
        }

        self.fire(
            &actual,
            EventType::NodeCreated,
            Triggers {
                data: true,
                exist: true,
                child: false,
            },
            warn_depth,
        );
        self.fire(
            &parent_path,
            EventType::NodeChildrenChanged,
            Triggers {
                data: false,
                exist: false,
                child: true,
            },
            warn_depth,
        );
        Ok(actual)
    }

    fn set_data(
        &mut self,
        path: &str,
        data: Bytes,
        expected_version: Option<i32>,
        now_ms: u64,
        warn_depth: usize,
    ) -> KeelResult<Stat> {
        let zxid = self.zxid + 1;
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| KeelError::node_absent(path))?;
        if let Some(expected) = expected_version {
            if expected != node.stat.version {
                return Err(KeelError::VersionConflict {
                    path: path.to_string(),
                    expected,
                    actual: node.stat.version,
                });
            }
        }
        node.data = data;
        node.stat.version += 1;
        node.stat.mzxid = zxid;
        node.stat.mtime_ms = now_ms;
        let stat = Self::stat_of(node);
        self.zxid = zxid;

        self.fire(
            path,
            EventType::NodeDataChanged,
            Triggers {
                data: true,
                exist: false,
                child: false,
            },
            warn_depth,
        );
        Ok(stat)
    }

    fn delete(
        &mut self,
        path: &str,
        expected_version: Option<i32>,
        warn_depth: usize,
    ) -> KeelResult<()> {
        if path == ROOT {
            return Err(KeelError::invalid_request("cannot delete the root node"));
        }
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| KeelError::node_absent(path))?;
        if let Some(expected) = expected_version {
            if expected != node.stat.version {
                return Err(KeelError::VersionConflict {
                    path: path.to_string(),
                    expected,
                    actual: node.stat.version,
                });
            }
        }
        if !node.children.is_empty() {
            return Err(KeelError::NotEmpty {
                path: path.to_string(),
            });
        }
        let owner = node.stat.ephemeral_owner;

        self.nodes.remove(path);
        self.next_zxid();
        if owner != 0 {
            if let Some(session) = self.sessions.get_mut(&owner) {
                session.ephemerals.remove(path);
            }
        }

        let parent_path = PathScheme::parent(path)?;
        if let Some(ref parent_path) = parent_path {
            if let Some(parent) = self.nodes.get_mut(parent_path) {
                parent.children.remove(PathScheme::leaf(path));
                parent.stat.cversion += 1;
            }
        }

        self.fire(
            path,
            EventType::NodeDeleted,
            Triggers {
                data: true,
                exist: false,
                child: true,
            },
            warn_depth,
        );
        if let Some(parent_path) = parent_path {
            self.fire(
                &parent_path,
                EventType::NodeChildrenChanged,
                Triggers {
                    data: false,
                    exist: false,
                    child: true,
                },
                warn_depth,
            );
        }
        Ok(())
    }

    fn remove_ephemerals(&mut self, session_id: u64, warn_depth: usize) {
        let owned: Vec<String> = match self.sessions.get_mut(&session_id) {
            Some(session) => std::mem::take(&mut session.ephemerals).into_iter().collect(),
            None => return,
        };
        // Reverse order so deeper paths go first.
        for path in owned.into_iter().rev() {
            if let Err(e) = self.delete(&path, None, warn_depth) {
                tracing::debug!(path = %path, error = %e, "ephemeral already gone");
            }
        }
    }
}

struct Shared {
    tree: Mutex<Tree>,
    clock: Arc<dyn Clock>,
    session_timeout_ms: u64,
    warn_depth: usize,
}

/// Embedded coordination store shared by any number of sessions.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Create a store with default session settings.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_config(&StoreConfig::default(), clock)
    }

    /// Create a store from configuration.
    pub fn with_config(config: &StoreConfig, clock: Arc<dyn Clock>) -> Self {
        let now_ms = clock.now_ms();
        Self {
            shared: Arc::new(Shared {
                tree: Mutex::new(Tree::new(now_ms)),
                clock,
                session_timeout_ms: config.session_timeout_ms,
                warn_depth: config.event_queue_warn_depth,
            }),
        }
    }

    /// Open a new session with its own delivery thread.
    pub fn connect(&self) -> KeelResult<Arc<MemorySession>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let watchers: Arc<RwLock<Vec<Arc<dyn Watcher>>>> = Arc::new(RwLock::new(Vec::new()));

        let id = {
            let mut tree = self.shared.tree.lock();
            let id = tree.next_session_id;
            tree.next_session_id += 1;
            tree.sessions.insert(
                id,
                SessionState {
                    status: SessionStatus::Connected,
                    sender: Some(sender),
                    depth: depth.clone(),
                    held_back: Vec::new(),
                    data_watches: HashSet::new(),
                    exist_watches: HashSet::new(),
                    child_watches: HashSet::new(),
                    ephemerals: BTreeSet::new(),
                },
            );
            id
        };

        let thread_watchers = watchers.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("keel-events-{:x}", id))
            .spawn(move || deliver(receiver, thread_watchers, depth));
        if let Err(e) = spawned {
            self.shared.tree.lock().sessions.remove(&id);
            return Err(KeelError::internal(format!(
                "failed to spawn delivery thread: {}",
                e
            )));
        }

        tracing::debug!(session_id = id, "session opened");
        Ok(Arc::new(MemorySession {
            id,
            store: self.clone(),
            watchers,
        }))
    }

    /// Declare a session expired.
    ///
    /// Its watches are dropped, its ephemeral nodes deleted (firing other
    /// sessions' watches), and `SessionExpired` is delivered to it. Every later
    /// call on the session fails with [`KeelError::SessionExpired`].
    pub fn expire_session(&self, session_id: u64) {
        let warn_depth = self.shared.warn_depth;
        let mut tree = self.shared.tree.lock();
        match tree.sessions.get_mut(&session_id) {
            Some(session)
                if !matches!(
                    session.status,
                    SessionStatus::Expired | SessionStatus::Closed
                ) =>
            {
                session.clear_watches();
                session.held_back.clear();
                // The expiry notice is delivered even to a disconnected session.
                session.status = SessionStatus::Connected;
            }
            _ => return,
        }
        tree.remove_ephemerals(session_id, warn_depth);
        if let Some(session) = tree.sessions.get_mut(&session_id) {
            session.enqueue(
                WatchedEvent::session(EventType::SessionExpired),
                warn_depth,
                session_id,
            );
            session.status = SessionStatus::Expired;
        }
        tracing::info!(session_id = session_id, "session expired");
    }

    /// Drop the connection of a session without ending it.
    pub fn disconnect(&self, session_id: u64) {
        let warn_depth = self.shared.warn_depth;
        let now_ms = self.shared.clock.now_ms();
        let mut tree = self.shared.tree.lock();
        if let Some(session) = tree.sessions.get_mut(&session_id) {
            if session.status == SessionStatus::Connected {
                session.enqueue(
                    WatchedEvent::session(EventType::Disconnected),
                    warn_depth,
                    session_id,
                );
                session.status = SessionStatus::Disconnected { since_ms: now_ms };
                tracing::info!(session_id = session_id, "session disconnected");
            }
        }
    }

    /// Restore the connection of a disconnected session.
    ///
    /// `Connected` is delivered first, followed by any events triggered while
    /// the session was away. If the session was disconnected for longer than
    /// the session timeout it is expired instead.
    pub fn reconnect(&self, session_id: u64) {
        let warn_depth = self.shared.warn_depth;
        let now_ms = self.shared.clock.now_ms();
        let timed_out = {
            let mut tree = self.shared.tree.lock();
            let session = match tree.sessions.get_mut(&session_id) {
                Some(session) => session,
                None => return,
            };
            let since_ms = match session.status {
                SessionStatus::Disconnected { since_ms } => since_ms,
                _ => return,
            };
            if now_ms.saturating_sub(since_ms) > self.shared.session_timeout_ms {
                true
            } else {
                session.status = SessionStatus::Connected;
                session.enqueue(
                    WatchedEvent::session(EventType::Connected),
                    warn_depth,
                    session_id,
                );
                for event in std::mem::take(&mut session.held_back) {
                    session.enqueue(event, warn_depth, session_id);
                }
                tracing::info!(session_id = session_id, "session reconnected");
                false
            }
        };
        if timed_out {
            self.expire_session(session_id);
        }
    }

    /// Number of nodes in the tree, root included.
    pub fn node_count(&self) -> usize {
        self.shared.tree.lock().nodes.len()
    }

    /// ACL a node was created with.
    pub fn acl(&self, path: &str) -> Option<Vec<Acl>> {
        self.shared
            .tree
            .lock()
            .nodes
            .get(path)
            .map(|node| node.acl.clone())
    }

    fn with_session<R>(
        &self,
        session_id: u64,
        op: impl FnOnce(&mut Tree, u64, usize) -> KeelResult<R>,
    ) -> KeelResult<R> {
        let now_ms = self.shared.clock.now_ms();
        let warn_depth = self.shared.warn_depth;
        let mut tree = self.shared.tree.lock();
        tree.session(session_id)?.check_usable()?;
        op(&mut *tree, now_ms, warn_depth)
    }

    fn close_session(&self, session_id: u64) {
        let warn_depth = self.shared.warn_depth;
        let mut tree = self.shared.tree.lock();
        let was_live = match tree.sessions.get_mut(&session_id) {
            Some(session) => {
                let live = !matches!(
                    session.status,
                    SessionStatus::Expired | SessionStatus::Closed
                );
                session.clear_watches();
                session.held_back.clear();
                live
            }
            None => return,
        };
        if was_live {
            tree.remove_ephemerals(session_id, warn_depth);
        }
        if let Some(session) = tree.sessions.get_mut(&session_id) {
            session.status = SessionStatus::Closed;
            // Dropping the sender lets the delivery thread drain and exit.
            session.sender = None;
        }
        tracing::debug!(session_id = session_id, "session closed");
    }
}

fn deliver(
    mut receiver: mpsc::UnboundedReceiver<Delivery>,
    watchers: Arc<RwLock<Vec<Arc<dyn Watcher>>>>,
    depth: Arc<AtomicUsize>,
) {
    while let Some(delivery) = receiver.blocking_recv() {
        match delivery {
            Delivery::Event(event) => {
                depth.fetch_sub(1, Ordering::AcqRel);
                let targets = watchers.read().clone();
                tracing::trace!(event = ?event.event_type, path = ?event.path, "delivering event");
                for watcher in targets {
                    watcher.process(&event);
                }
            }
            Delivery::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// One client session against a [`MemoryStore`].
pub struct MemorySession {
    id: u64,
    store: MemoryStore,
    watchers: Arc<RwLock<Vec<Arc<dyn Watcher>>>>,
}

impl MemorySession {
    /// Store this session belongs to.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Block until every event queued before this call has been dispatched.
    ///
    /// Must not be called from a watcher.
    pub fn sync(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        let queued = {
            let tree = self.store.shared.tree.lock();
            match tree.sessions.get(&self.id).and_then(|s| s.sender.as_ref()) {
                Some(sender) => sender.send(Delivery::Barrier(done_tx)).is_ok(),
                None => false,
            }
        };
        if queued {
            let _ = done_rx.blocking_recv();
        }
    }

    /// Expire this session.
    pub fn expire(&self) {
        self.store.expire_session(self.id);
    }

    /// Disconnect this session.
    pub fn disconnect(&self) {
        self.store.disconnect(self.id);
    }

    /// Reconnect this session.
    pub fn reconnect(&self) {
        self.store.reconnect(self.id);
    }
}

impl StoreClient for MemorySession {
    fn create(&self, path: &str, data: Bytes, mode: CreateMode, acl: &[Acl]) -> KeelResult<String> {
        let id = self.id;
        self.store.with_session(id, |tree, now_ms, warn_depth| {
            tree.create(id, path, data, mode, acl, now_ms, warn_depth)
        })
    }

    fn get_data(&self, path: &str, watch: bool) -> KeelResult<(Bytes, Stat)> {
        let id = self.id;
        self.store.with_session(id, |tree, _, _| {
            let (data, stat) = match tree.nodes.get(path) {
                Some(node) => (node.data.clone(), Tree::stat_of(node)),
                None => return Err(KeelError::node_absent(path)),
            };
            if watch {
                if let Some(session) = tree.sessions.get_mut(&id) {
                    session.data_watches.insert(path.to_string());
                }
            }
            Ok((data, stat))
        })
    }

    fn set_data(&self, path: &str, data: Bytes, expected_version: Option<i32>) -> KeelResult<Stat> {
        self.store.with_session(self.id, |tree, now_ms, warn_depth| {
            tree.set_data(path, data, expected_version, now_ms, warn_depth)
        })
    }

    fn delete(&self, path: &str, expected_version: Option<i32>) -> KeelResult<()> {
        self.store.with_session(self.id, |tree, _, warn_depth| {
            tree.delete(path, expected_version, warn_depth)
        })
    }

    fn get_children(&self, path: &str, watch: bool) -> KeelResult<(Vec<String>, Stat)> {
        let id = self.id;
        self.store.with_session(id, |tree, _, _| {
            let (children, stat) = match tree.nodes.get(path) {
                Some(node) => (
                    node.children.iter().cloned().collect::<Vec<_>>(),
                    Tree::stat_of(node),
                ),
                None => return Err(KeelError::node_absent(path)),
            };
            if watch {
                if let Some(session) = tree.sessions.get_mut(&id) {
                    session.child_watches.insert(path.to_string());
                }
            }
            Ok((children, stat))
        })
    }

    fn exists(&self, path: &str, watch: bool) -> KeelResult<Option<Stat>> {
        let id = self.id;
        self.store.with_session(id, |tree, _, _| {
            let stat = tree.nodes.get(path).map(Tree::stat_of);
            if watch {
                if let Some(session) = tree.sessions.get_mut(&id) {
                    if stat.is_some() {
                        session.data_watches.insert(path.to_string());
                    } else {
                        session.exist_watches.insert(path.to_string());
                    }
                }
            }
            Ok(stat)
        })
    }

    fn register(&self, watcher: Arc<dyn Watcher>) {
        self.watchers.write().push(watcher);
    }

    fn session_id(&self) -> u64 {
        self.id
    }

    fn close(&self) {
        self.store.close_session(self.id);
    }
}

impl std::fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySession").field("id", &self.id).finish()
    }
}
