//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use bytes::Bytes;
use keel::core::config::Config;
use keel::core::error::KeelResult;
use keel::core::runtime::Kernel;
use keel::core::time::ManualClock;
use keel::coord::lease::{Lease, LeaseObserver};
use keel::coord::lock::{LockHandle, LockObserver};
use keel::observe::manager::DataObserver;
use keel::store::{Acl, CreateMode, MemorySession, MemoryStore, Stat, StoreClient, Watcher};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

/// Start time of every manual clock, in milliseconds.
pub const START_MS: u64 = 1_000_000;

// ============================================================================
// Store and kernel fixtures
// ============================================================================

/// One embedded store plus the manual clock driving it.
pub struct TestCluster {
    pub store: MemoryStore,
    pub clock: Arc<ManualClock>,
}

impl TestCluster {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = MemoryStore::new(clock.clone());
        Self { store, clock }
    }

    /// Open a bare session.
    pub fn session(&self) -> Arc<MemorySession> {
        self.store.connect().expect("connect")
    }

    /// Open a session and start a kernel with default configuration on it.
    pub fn node(&self) -> TestNode {
        self.node_with(Config::default())
    }

    /// Open a session and start a kernel with the given configuration.
    pub fn node_with(&self, config: Config) -> TestNode {
        let session = self.session();
        let kernel = Kernel::new(config, session.clone(), self.clock.clone()).expect("kernel");
        kernel.start().expect("start");
        session.sync();
        TestNode { session, kernel }
    }

    /// Open a session wrapped in a [`CountingStore`] and start a kernel on it.
    pub fn counting_node(&self) -> (TestNode, Arc<CountingStore>) {
        let session = self.session();
        let counting = Arc::new(CountingStore::new(session.clone()));
        let kernel =
            Kernel::new(Config::default(), counting.clone(), self.clock.clone()).expect("kernel");
        kernel.start().expect("start");
        session.sync();
        (TestNode { session, kernel }, counting)
    }

    /// Open a session wrapped in a [`RacingStore`] and start a kernel on it.
    pub fn racing_node(&self) -> (TestNode, Arc<RacingStore>) {
        let session = self.session();
        let racing = Arc::new(RacingStore::new(session.clone(), self.session()));
        let kernel =
            Kernel::new(Config::default(), racing.clone(), self.clock.clone()).expect("kernel");
        kernel.start().expect("start");
        session.sync();
        (TestNode { session, kernel }, racing)
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// A started kernel and the session it runs on.
pub struct TestNode {
    pub session: Arc<MemorySession>,
    pub kernel: Kernel,
}

impl TestNode {
    /// Wait until every event queued for this session was dispatched.
    pub fn sync(&self) {
        self.session.sync();
    }

    pub fn session_id(&self) -> u64 {
        self.session.session_id()
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

// ============================================================================
// Store wrappers
// ============================================================================

/// Store client that counts reads before delegating to a session.
pub struct CountingStore {
    inner: Arc<MemorySession>,
    get_data_calls: AtomicUsize,
    get_children_calls: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: Arc<MemorySession>) -> Self {
        Self {
            inner,
            get_data_calls: AtomicUsize::new(0),
            get_children_calls: AtomicUsize::new(0),
        }
    }

    pub fn get_data_calls(&self) -> usize {
        self.get_data_calls.load(Ordering::SeqCst)
    }

    pub fn get_children_calls(&self) -> usize {
        self.get_children_calls.load(Ordering::SeqCst)
    }
}

impl StoreClient for CountingStore {
    fn create(&self, path: &str, data: Bytes, mode: CreateMode, acl: &[Acl]) -> KeelResult<String> {
        self.inner.create(path, data, mode, acl)
    }

    fn get_data(&self, path: &str, watch: bool) -> KeelResult<(Bytes, Stat)> {
        self.get_data_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_data(path, watch)
    }

    fn set_data(&self, path: &str, data: Bytes, expected_version: Option<i32>) -> KeelResult<Stat> {
        self.inner.set_data(path, data, expected_version)
    }

    fn delete(&self, path: &str, expected_version: Option<i32>) -> KeelResult<()> {
        self.inner.delete(path, expected_version)
    }

    fn get_children(&self, path: &str, watch: bool) -> KeelResult<(Vec<String>, Stat)> {
        self.get_children_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_children(path, watch)
    }

    fn exists(&self, path: &str, watch: bool) -> KeelResult<Option<Stat>> {
        self.inner.exists(path, watch)
    }

    fn register(&self, watcher: Arc<dyn Watcher>) {
        self.inner.register(watcher)
    }

    fn session_id(&self) -> u64 {
        self.inner.session_id()
    }

    fn close(&self) {
        self.inner.close()
    }
}

/// Write made by another session between a read and its return.
pub type RacingWrite = Box<dyn FnOnce(&MemorySession) + Send>;

/// Store client that lets another session change a node after a read has
/// been answered but before the caller sees the answer.
///
/// The change's notification is dispatched before the read returns, which
/// is the widest window a real store can produce.
pub struct RacingStore {
    inner: Arc<MemorySession>,
    writer: Arc<MemorySession>,
    pending: Mutex<Option<(String, RacingWrite)>>,
}

impl RacingStore {
    pub fn new(inner: Arc<MemorySession>, writer: Arc<MemorySession>) -> Self {
        Self {
            inner,
            writer,
            pending: Mutex::new(None),
        }
    }

    /// Run `write` on the writer session right after the next read of `path`.
    pub fn race_next_read(&self, path: &str, write: impl FnOnce(&MemorySession) + Send + 'static) {
        *self.pending.lock() = Some((path.to_string(), Box::new(write)));
    }

    /// Set `path` to `bytes` right after its next read.
    pub fn race_next_read_with_data(&self, path: &str, bytes: &'static [u8]) {
        let target = path.to_string();
        self.race_next_read(path, move |writer| {
            writer
                .set_data(&target, Bytes::from_static(bytes), None)
                .expect("racing write");
        });
    }

    pub fn is_armed(&self) -> bool {
        self.pending.lock().is_some()
    }

    fn after_read(&self, path: &str) {
        let write = {
            let mut pending = self.pending.lock();
            match pending.take() {
                Some((target, write)) if target == path => Some(write),
                other => {
                    *pending = other;
                    None
                }
            }
        };
        if let Some(write) = write {
            write(&self.writer);
            self.inner.sync();
        }
    }
}

impl StoreClient for RacingStore {
    fn create(&self, path: &str, data: Bytes, mode: CreateMode, acl: &[Acl]) -> KeelResult<String> {
        self.inner.create(path, data, mode, acl)
    }

    fn get_data(&self, path: &str, watch: bool) -> KeelResult<(Bytes, Stat)> {
        let result = self.inner.get_data(path, watch);
        self.after_read(path);
        result
    }

    fn set_data(&self, path: &str, data: Bytes, expected_version: Option<i32>) -> KeelResult<Stat> {
        self.inner.set_data(path, data, expected_version)
    }

    fn delete(&self, path: &str, expected_version: Option<i32>) -> KeelResult<()> {
        self.inner.delete(path, expected_version)
    }

    fn get_children(&self, path: &str, watch: bool) -> KeelResult<(Vec<String>, Stat)> {
        let result = self.inner.get_children(path, watch);
        self.after_read(path);
        result
    }

    fn exists(&self, path: &str, watch: bool) -> KeelResult<Option<Stat>> {
        self.inner.exists(path, watch)
    }

    fn register(&self, watcher: Arc<dyn Watcher>) {
        self.inner.register(watcher)
    }

    fn session_id(&self) -> u64 {
        self.inner.session_id()
    }

    fn close(&self) {
        self.inner.close()
    }
}

// ============================================================================
// Recording observers
// ============================================================================

/// What a [`RecordingObserver`] saw.
#[derive(Debug, Clone, PartialEq)]
pub enum DataEvent<T> {
    Updated { new: Option<T>, old: Option<T> },
    Reset,
    Unknown,
    Error(String),
}

/// Data observer that records every callback.
pub struct RecordingObserver<T> {
    events: Mutex<Vec<DataEvent<T>>>,
}

impl<T: Clone> RecordingObserver<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<DataEvent<T>> {
        self.events.lock().clone()
    }

    /// Only the `updated` calls, as (new, old) pairs.
    pub fn updates(&self) -> Vec<(Option<T>, Option<T>)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                DataEvent::Updated { new, old } => Some((new.clone(), old.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl<T: Clone + Send + Sync> DataObserver<T> for RecordingObserver<T> {
    fn updated(&self, new: Option<&T>, old: Option<&T>) {
        self.events.lock().push(DataEvent::Updated {
            new: new.cloned(),
            old: old.cloned(),
        });
    }

    fn state_reset(&self) {
        self.events.lock().push(DataEvent::Reset);
    }

    fn state_unknown(&self) {
        self.events.lock().push(DataEvent::Unknown);
    }

    fn error(&self, path: &str, _error: &keel::KeelError) {
        self.events.lock().push(DataEvent::Error(path.to_string()));
    }
}

/// Lock observer that records revoked tickets.
#[derive(Default)]
pub struct RecordingLockObserver {
    revoked: Mutex<Vec<String>>,
}

impl RecordingLockObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn revoked(&self) -> Vec<String> {
        self.revoked.lock().clone()
    }
}

impl LockObserver for RecordingLockObserver {
    fn revoked(&self, handle: &LockHandle) {
        self.revoked.lock().push(handle.ticket().to_string());
    }
}

/// What a [`RecordingLeaseObserver`] saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseEvent {
    Acquired { ticket: String, rank: usize },
    Renewed { ticket: String, rank: usize },
    Relinquished { ticket: String, rank: usize },
    Revoked { ticket: String, rank: usize },
}

/// Lease observer that records every signal.
#[derive(Default)]
pub struct RecordingLeaseObserver {
    events: Mutex<Vec<LeaseEvent>>,
}

impl RecordingLeaseObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<LeaseEvent> {
        self.events.lock().clone()
    }

    pub fn count_acquired(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, LeaseEvent::Acquired { .. }))
            .count()
    }

    pub fn count_renewed(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, LeaseEvent::Renewed { .. }))
            .count()
    }

    pub fn count_revoked(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, LeaseEvent::Revoked { .. }))
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl LeaseObserver for RecordingLeaseObserver {
    fn acquired(&self, lease: &Lease) {
        self.events.lock().push(LeaseEvent::Acquired {
            ticket: lease.ticket.clone(),
            rank: lease.rank,
        });
    }

    fn renewed(&self, lease: &Lease) {
        self.events.lock().push(LeaseEvent::Renewed {
            ticket: lease.ticket.clone(),
            rank: lease.rank,
        });
    }

    fn relinquished(&self, lease: &Lease) {
        self.events.lock().push(LeaseEvent::Relinquished {
            ticket: lease.ticket.clone(),
            rank: lease.rank,
        });
    }

    fn revoked(&self, lease: &Lease) {
        self.events.lock().push(LeaseEvent::Revoked {
            ticket: lease.ticket.clone(),
            rank: lease.rank,
        });
    }
}

// ============================================================================
// Configuration files
// ============================================================================

/// Write a configuration file with the given TOML content.
pub fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Create a minimal valid configuration file.
pub fn create_minimal_config() -> NamedTempFile {
    write_config(
        r#"
[kernel]
base_path = "/keel"
"#,
    )
}
