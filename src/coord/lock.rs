//! Distributed exclusive and shared locks.
//!
//! Acquisition follows the ticket protocol:
//!
//! 1. Create an ephemeral sequential ticket under `<base>/lock/<resource>`.
//! 2. List the root's children sorted by sequence.
//! 3. If nothing blocks the ticket, the lock is held.
//! 4. Otherwise watch only the blocking ticket and wait for it to change.
//! 5. Re-list and repeat from 3.
//!
//! If the own ticket disappears before acquisition the caller must start over:
//! it gets [`AcquireError::SessionExpired`] when the session ended and
//! [`AcquireError::Retryable`] when the ticket was deleted by someone else.
//! A held lock keeps an existence watch on its own ticket; losing the ticket
//! for any reason other than [`LockService::release`] fires
//! [`LockObserver::revoked`].
//!
//! No fencing token is provided: a holder that is revoked may still believe it
//! holds the lock until its observer runs.

use super::ticket::{blocker, is_owner, sorted_tickets, Blocker, LockMode, Ticket};
use crate::core::error::KeelError;
use crate::store::path::PathScheme;
use crate::store::util::ensure_path;
use crate::store::{Acl, CreateMode, EventType, StoreClient, WatchedEvent, Watcher};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Lock acquisition failure.
#[derive(Debug, Clone, Error)]
pub enum AcquireError {
    /// Transient store failure; still contending is possible after a retry.
    #[error("retryable: {0}")]
    Retryable(KeelError),

    /// The session ended; every ticket of this session is gone.
    #[error("session expired")]
    SessionExpired,

    /// The bounded wait ran out; the ticket was withdrawn.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// Any other store or usage failure.
    #[error("store error: {0}")]
    Store(KeelError),
}

impl AcquireError {
    /// Check if the caller may retry the acquisition.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Retryable(_) | Self::TimedOut(_))
    }
}

impl From<KeelError> for AcquireError {
    fn from(err: KeelError) -> Self {
        match err {
            KeelError::Connectivity { .. } => Self::Retryable(err),
            KeelError::SessionExpired => Self::SessionExpired,
            other => Self::Store(other),
        }
    }
}

/// Notified when a held lock is lost without being released.
pub trait LockObserver: Send + Sync {
    fn revoked(&self, handle: &LockHandle);
}

/// Options for [`LockService::acquire_with`].
#[derive(Clone)]
pub struct AcquireOptions {
    /// Exclusive or shared.
    pub mode: LockMode,
    /// Bound on the wait for blocking tickets. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Receiver of revocation signals while the lock is held.
    pub observer: Option<Arc<dyn LockObserver>>,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            mode: LockMode::Exclusive,
            timeout: None,
            observer: None,
        }
    }
}

impl AcquireOptions {
    /// Exclusive lock, unbounded wait.
    pub fn exclusive() -> Self {
        Self::default()
    }

    /// Shared lock, unbounded wait.
    pub fn shared() -> Self {
        Self {
            mode: LockMode::Shared,
            ..Self::default()
        }
    }

    /// Bound the wait.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a revocation observer.
    pub fn with_observer(mut self, observer: Arc<dyn LockObserver>) -> Self {
        self.observer = Some(observer);
        self
    }
}

/// Proof of a held lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockHandle {
    resource: String,
    root: String,
    ticket: String,
    mode: LockMode,
}

impl LockHandle {
    /// Locked resource id.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Ticket name, e.g. `write-0000000003`.
    pub fn ticket(&self) -> &str {
        &self.ticket
    }

    /// Absolute path of the ticket node.
    pub fn path(&self) -> String {
        format!("{}/{}", self.root, self.ticket)
    }

    /// Mode the lock was acquired in.
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

struct HeldLock {
    handle: LockHandle,
    observer: Option<Arc<dyn LockObserver>>,
}

#[derive(Default)]
struct WaitSlot {
    waiters: usize,
    fired: u64,
}

/// Blocking waits on watched tickets, woken by the dispatcher.
#[derive(Default)]
struct WaitBoard {
    slots: HashMap<String, WaitSlot>,
    epoch: u64,
}

#[derive(Clone, Copy)]
struct WaitMark {
    fired: u64,
    epoch: u64,
}

/// Lock service bound to one store session.
pub struct LockService {
    store: Arc<dyn StoreClient>,
    scheme: PathScheme,
    acl: Vec<Acl>,
    board: Mutex<WaitBoard>,
    wakeup: Condvar,
    held: Mutex<HashMap<String, HeldLock>>,
    acquired_total: AtomicU64,
    revoked_total: AtomicU64,
}

impl LockService {
    /// Create a lock service.
    pub fn new(store: Arc<dyn StoreClient>, scheme: PathScheme, acl: Vec<Acl>) -> Self {
        Self {
            store,
            scheme,
            acl,
            board: Mutex::new(WaitBoard::default()),
            wakeup: Condvar::new(),
            held: Mutex::new(HashMap::new()),
            acquired_total: AtomicU64::new(0),
            revoked_total: AtomicU64::new(0),
        }
    }

    /// Acquire an exclusive lock, waiting as long as it takes.
    pub fn acquire(&self, resource: &str) -> Result<LockHandle, AcquireError> {
        self.acquire_with(resource, AcquireOptions::exclusive())
    }

    /// Acquire a lock with explicit options.
    pub fn acquire_with(
        &self,
        resource: &str,
        options: AcquireOptions,
    ) -> Result<LockHandle, AcquireError> {
        let root = self.scheme.lock_root(resource)?;
        ensure_path(self.store.as_ref(), &root, &self.acl)?;

        let prefix = format!("{}/{}", root, options.mode.ticket_kind().prefix());
        let created = self.store.create(
            &prefix,
            Bytes::new(),
            CreateMode::EPHEMERAL_SEQUENTIAL,
            &self.acl,
        )?;
        let ticket = PathScheme::leaf(&created).to_string();
        tracing::debug!(resource = %resource, ticket = %ticket, "lock ticket created");

        let deadline = options.timeout.map(|t| Instant::now() + t);
        loop {
            let children = match self.store.get_children(&root, false) {
                Ok((children, _)) => children,
                Err(e) => {
                    self.withdraw(&created);
                    return Err(e.into());
                }
            };
            let tickets = sorted_tickets(&children);
            let predecessor = match blocker(options.mode, &tickets, &ticket) {
                Blocker::Acquired => break,
                Blocker::Lost => {
                    tracing::warn!(resource = %resource, ticket = %ticket, "lock ticket vanished while waiting");
                    return Err(self.lost_ticket(&root, &created));
                }
                Blocker::WaitOn(predecessor) => predecessor,
            };

            let watched = format!("{}/{}", root, predecessor.name);
            let mark = self.enter_wait(&watched);
            let still_there = match self.store.exists(&watched, true) {
                Ok(stat) => stat.is_some(),
                Err(e) => {
                    self.leave_wait(&watched);
                    self.withdraw(&created);
                    return Err(e.into());
                }
            };
            let woke = !still_there || self.wait(&watched, mark, deadline);
            self.leave_wait(&watched);
            if !woke {
                self.withdraw(&created);
                let timeout = options.timeout.unwrap_or_default();
                tracing::debug!(resource = %resource, ticket = %ticket, "lock wait timed out");
                return Err(AcquireError::TimedOut(timeout));
            }
        }

        let handle = LockHandle {
            resource: resource.to_string(),
            root,
            ticket,
            mode: options.mode,
        };
        self.held.lock().insert(
            created.clone(),
            HeldLock {
                handle: handle.clone(),
                observer: options.observer,
            },
        );
        // Watch our own ticket so an outside delete is noticed.
        match self.store.exists(&created, true) {
            Ok(Some(_)) => {}
            Ok(None) => {
                self.held.lock().remove(&created);
                return Err(self.lost_ticket(&handle.root, &created));
            }
            Err(e) => {
                self.held.lock().remove(&created);
                self.withdraw(&created);
                return Err(e.into());
            }
        }

        self.acquired_total.fetch_add(1, Ordering::Relaxed);
        tracing::info!(resource = %resource, ticket = %handle.ticket, mode = ?handle.mode, "lock acquired");
        Ok(handle)
    }

    /// Release a held lock by deleting its ticket.
    ///
    /// Never produces a `revoked` signal. Releasing a lock whose ticket is
    /// already gone succeeds.
    pub fn release(&self, handle: &LockHandle) -> Result<(), KeelError> {
        let path = handle.path();
        let held = self.held.lock().remove(&path);
        match self.store.delete(&path, None) {
            Ok(()) | Err(KeelError::NodeAbsent { .. }) => {
                tracing::info!(resource = %handle.resource, ticket = %handle.ticket, "lock released");
                Ok(())
            }
            Err(e) => {
                if let Some(held) = held {
                    self.held.lock().insert(path, held);
                }
                Err(e)
            }
        }
    }

    /// Recompute ownership of a handle from the current children.
    pub fn is_held(&self, handle: &LockHandle) -> Result<bool, KeelError> {
        if !self.held.lock().contains_key(&handle.path()) {
            return Ok(false);
        }
        let (children, _) = self.store.get_children(&handle.root, false)?;
        Ok(is_owner(handle.mode, &sorted_tickets(&children), &handle.ticket))
    }

    /// Tickets currently bidding for a resource, in sequence order.
    pub fn contenders(&self, resource: &str) -> Result<Vec<Ticket>, KeelError> {
        let root = self.scheme.lock_root(resource)?;
        match self.store.get_children(&root, false) {
            Ok((children, _)) => Ok(sorted_tickets(&children)),
            Err(KeelError::NodeAbsent { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Number of locks this service currently holds.
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Get statistics.
    pub fn stats(&self) -> LockStats {
        LockStats {
            held: self.held_count(),
            waiting: self.board.lock().slots.values().map(|s| s.waiters).sum(),
            acquired_total: self.acquired_total.load(Ordering::Relaxed),
            revoked_total: self.revoked_total.load(Ordering::Relaxed),
        }
    }

    /// Classify the loss of an own ticket before acquisition. A live session
    /// means someone else deleted it and the caller may bid again.
    fn lost_ticket(&self, root: &str, ticket_path: &str) -> AcquireError {
        match self.store.exists(root, false) {
            Ok(_) => AcquireError::Retryable(KeelError::node_absent(ticket_path)),
            Err(e) => e.into(),
        }
    }

    fn withdraw(&self, ticket_path: &str) {
        match self.store.delete(ticket_path, None) {
            Ok(()) | Err(KeelError::NodeAbsent { .. }) => {}
            Err(e) => {
                tracing::warn!(ticket = %ticket_path, error = %e, "failed to withdraw lock ticket");
            }
        }
    }

    fn enter_wait(&self, path: &str) -> WaitMark {
        let mut board = self.board.lock();
        let epoch = board.epoch;
        let slot = board.slots.entry(path.to_string()).or_default();
        slot.waiters += 1;
        WaitMark {
            fired: slot.fired,
            epoch,
        }
    }

    fn leave_wait(&self, path: &str) {
        let mut board = self.board.lock();
        if let Some(slot) = board.slots.get_mut(path) {
            slot.waiters -= 1;
            if slot.waiters == 0 {
                board.slots.remove(path);
            }
        }
    }

    /// Block until `path` fires or the session changes state. Returns false on
    /// deadline.
    fn wait(&self, path: &str, mark: WaitMark, deadline: Option<Instant>) -> bool {
        let mut board = self.board.lock();
        loop {
            let fired = board.slots.get(path).map(|s| s.fired).unwrap_or(mark.fired);
            if fired != mark.fired || board.epoch != mark.epoch {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if self.wakeup.wait_until(&mut board, deadline).timed_out() {
                        let fired = board.slots.get(path).map(|s| s.fired).unwrap_or(mark.fired);
                        return fired != mark.fired || board.epoch != mark.epoch;
                    }
                }
                None => self.wakeup.wait(&mut board),
            }
        }
    }

    fn fire(&self, path: &str) {
        let mut board = self.board.lock();
        if let Some(slot) = board.slots.get_mut(path) {
            slot.fired += 1;
            self.wakeup.notify_all();
        }
    }

    fn bump_epoch(&self) {
        self.board.lock().epoch += 1;
        self.wakeup.notify_all();
    }

    fn revoke_all(&self) {
        let lost: Vec<HeldLock> = self.held.lock().drain().map(|(_, held)| held).collect();
        for held in lost {
            self.signal_revoked(held);
        }
    }

    fn signal_revoked(&self, held: HeldLock) {
        self.revoked_total.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(resource = %held.handle.resource, ticket = %held.handle.ticket, "lock revoked");
        if let Some(observer) = held.observer {
            observer.revoked(&held.handle);
        }
    }
}

impl Watcher for LockService {
    fn process(&self, event: &WatchedEvent) {
        match (event.event_type, event.path()) {
            (EventType::NodeDeleted, Some(path)) => {
                self.fire(path);
                let lost = self.held.lock().remove(path);
                if let Some(held) = lost {
                    self.signal_revoked(held);
                }
            }
            (EventType::NodeCreated | EventType::NodeDataChanged, Some(path)) => {
                self.fire(path);
            }
            (EventType::SessionExpired, _) => {
                self.bump_epoch();
                self.revoke_all();
            }
            (EventType::Connected, _) => self.bump_epoch(),
            _ => {}
        }
    }
}

/// Lock service statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStats {
    /// Locks currently held.
    pub held: usize,
    /// Acquisitions currently blocked on a ticket.
    pub waiting: usize,
    /// Successful acquisitions since start.
    pub acquired_total: u64,
    /// Revocations since start.
    pub revoked_total: u64,
}
