//! Observer registrations and watch dispatch.
//!
//! The [`ObserverManager`] keeps a multi-set of registrations per path and
//! turns raw store notifications into domain signals:
//!
//! | store event | action |
//! |-------------|--------|
//! | `NodeCreated`, `NodeDataChanged` | re-read, decode, signal if the value changed |
//! | `NodeDeleted` | signal absent, re-arm an existence watch |
//! | `NodeChildrenChanged` | invalidate the cache entry |
//! | `Connected` | `state_reset`, then re-arm paths that lost their watch |
//! | `Disconnected` | `state_unknown` |
//! | `SessionExpired` | `state_unknown`, every path unwatched, cache cleared |
//!
//! Events for paths nobody observes only invalidate the cache entry; no store
//! call is made for them.

use super::codec::Codec;
use crate::cache::PathCache;
use crate::core::error::{KeelError, KeelResult};
use crate::store::path::PathScheme;
use crate::store::{EventType, Stat, StoreClient, WatchedEvent, Watcher};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Identifies one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverHandle(u64);

impl ObserverHandle {
    /// Numeric id of the handle.
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Receiver of decoded value changes on one path.
///
/// Callbacks run on the store's delivery thread and must return quickly.
pub trait DataObserver<T>: Send + Sync {
    /// The value changed. `None` means the node does not exist.
    fn updated(&self, new: Option<&T>, old: Option<&T>);

    /// The session (re)connected; cached state may have been refreshed.
    fn state_reset(&self) {}

    /// The session is disconnected or expired; the value may be stale.
    fn state_unknown(&self) {}

    /// A re-read failed to fetch or decode the value.
    fn error(&self, _path: &str, _error: &KeelError) {}
}

/// Watch state of an observed path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// No watch is armed in the store.
    Unwatched,
    /// A one-shot watch is armed.
    Watching,
    /// The watch fired and has not been re-armed yet.
    FiredPendingRearm,
}

/// What a re-read found.
enum Signal<'a> {
    /// The node holds these bytes.
    Value(&'a [u8]),
    /// A delete notification arrived.
    Deleted,
    /// A re-read found the node gone without a delete notification.
    Vanished,
}

trait Registration: Send + Sync {
    fn handle(&self) -> ObserverHandle;
    fn signal(&self, signal: &Signal<'_>);
    fn state_reset(&self);
    fn state_unknown(&self);
    fn error(&self, error: &KeelError);
}

/// Value tracking of one registration.
///
/// A registration is visible to dispatch before `subscribe` has read the
/// initial value. Changes dispatched in that window are parked in `early`
/// and reported against the initial value once it is known.
struct Slot<T> {
    last: Option<T>,
    seeded: bool,
    early: Option<Option<T>>,
}

struct TypedRegistration<T> {
    handle: ObserverHandle,
    path: String,
    codec: Arc<dyn Codec<T>>,
    observer: Arc<dyn DataObserver<T>>,
    slot: Mutex<Slot<T>>,
}

impl<T> TypedRegistration<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Record the value read by `subscribe` and report anything dispatched
    /// while the read was in flight.
    fn seed(&self, initial: Option<T>) {
        let mut slot = self.slot.lock();
        slot.seeded = true;
        slot.last = initial;
        if let Some(early) = slot.early.take() {
            if early != slot.last {
                let old = std::mem::replace(&mut slot.last, early.clone());
                tracing::debug!(path = %self.path, handle = self.handle.0, "change during subscribe");
                // Called under the slot lock so a concurrent dispatch cannot
                // report a newer value first.
                self.observer.updated(early.as_ref(), old.as_ref());
            }
        }
    }
}

impl<T> Registration for TypedRegistration<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn handle(&self) -> ObserverHandle {
        self.handle
    }

    fn signal(&self, signal: &Signal<'_>) {
        let new = match signal {
            Signal::Value(bytes) => match self.codec.decode(bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    self.observer.error(&self.path, &e);
                    return;
                }
            },
            Signal::Deleted | Signal::Vanished => None,
        };

        let mut slot = self.slot.lock();
        if !slot.seeded {
            slot.early = Some(new);
            return;
        }
        let old = match signal {
            Signal::Value(_) => {
                if slot.last == new {
                    tracing::trace!(path = %self.path, handle = self.handle.0, "value unchanged");
                    return;
                }
                std::mem::replace(&mut slot.last, new.clone())
            }
            Signal::Deleted => slot.last.take(),
            Signal::Vanished => match slot.last.take() {
                Some(old) => Some(old),
                None => return,
            },
        };
        drop(slot);
        self.observer.updated(new.as_ref(), old.as_ref());
    }

    fn state_reset(&self) {
        self.observer.state_reset();
    }

    fn state_unknown(&self) {
        self.observer.state_unknown();
    }

    fn error(&self, error: &KeelError) {
        self.observer.error(&self.path, error);
    }
}

/// Per-path watch states.
#[derive(Debug, Default)]
struct WatchTable {
    states: HashMap<String, WatchState>,
}

impl WatchTable {
    fn set(&mut self, path: &str, state: WatchState) {
        self.states.insert(path.to_string(), state);
    }

    fn get(&self, path: &str) -> WatchState {
        self.states
            .get(path)
            .copied()
            .unwrap_or(WatchState::Unwatched)
    }

    fn reset_all(&mut self) {
        for state in self.states.values_mut() {
            *state = WatchState::Unwatched;
        }
    }

    fn needing_rearm(&self) -> Vec<String> {
        self.states
            .iter()
            .filter(|(_, state)| **state != WatchState::Watching)
            .map(|(path, _)| path.clone())
            .collect()
    }
}

/// Registry of data observers and dispatcher of store events.
pub struct ObserverManager {
    store: Arc<dyn StoreClient>,
    cache: Arc<PathCache>,
    registrations: RwLock<HashMap<String, Vec<Arc<dyn Registration>>>>,
    handles: RwLock<HashMap<ObserverHandle, String>>,
    watches: Mutex<WatchTable>,
    next_handle: AtomicU64,
    shut_down: AtomicBool,
}

impl ObserverManager {
    /// Create a manager that reads through `store` and refreshes `cache`.
    pub fn new(store: Arc<dyn StoreClient>, cache: Arc<PathCache>) -> Self {
        Self {
            store,
            cache,
            registrations: RwLock::new(HashMap::new()),
            handles: RwLock::new(HashMap::new()),
            watches: Mutex::new(WatchTable::default()),
            next_handle: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Observe a path.
    ///
    /// Reads the current value (arming a watch) and seeds the registration
    /// with it; the observer is only called for later changes, including
    /// changes that land while the initial read is in flight. Fails with a
    /// serialization error if the current bytes do not decode.
    pub fn subscribe<T>(
        &self,
        path: &str,
        codec: Arc<dyn Codec<T>>,
        observer: Arc<dyn DataObserver<T>>,
    ) -> KeelResult<ObserverHandle>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(KeelError::ShutDown);
        }
        PathScheme::check(path)?;

        // Register before reading so an event consuming the new watch is
        // dispatched to this registration instead of being dropped.
        let handle = ObserverHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let registration = Arc::new(TypedRegistration {
            handle,
            path: path.to_string(),
            codec: codec.clone(),
            observer,
            slot: Mutex::new(Slot {
                last: None,
                seeded: false,
                early: None,
            }),
        });
        self.registrations
            .write()
            .entry(path.to_string())
            .or_default()
            .push(registration.clone() as Arc<dyn Registration>);
        self.handles.write().insert(handle, path.to_string());

        let seen = self.cache.generation(path);
        let initial = match self.read_and_arm(path) {
            Ok(Some((bytes, stat))) => {
                self.cache
                    .put_if_current(path, seen, stat, Some(bytes.clone()), None);
                codec.decode(&bytes).map(Some)
            }
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        let initial = match initial {
            Ok(initial) => initial,
            Err(e) => {
                self.unsubscribe(handle);
                return Err(e);
            }
        };
        self.watches.lock().set(path, WatchState::Watching);
        registration.seed(initial);

        tracing::debug!(path = %path, handle = handle.0, "observer subscribed");
        Ok(handle)
    }

    /// Remove a registration. Returns false if the handle is unknown.
    pub fn unsubscribe(&self, handle: ObserverHandle) -> bool {
        let path = match self.handles.write().remove(&handle) {
            Some(path) => path,
            None => return false,
        };
        let mut registrations = self.registrations.write();
        if let Some(list) = registrations.get_mut(&path) {
            list.retain(|r| r.handle() != handle);
            if list.is_empty() {
                registrations.remove(&path);
                self.watches.lock().states.remove(&path);
            }
        }
        tracing::debug!(path = %path, handle = handle.0, "observer unsubscribed");
        true
    }

    /// Check if any registration exists for a path.
    pub fn is_being_observed(&self, path: &str) -> bool {
        self.registrations.read().contains_key(path)
    }

    /// Watch state of an observed path.
    pub fn watch_state(&self, path: &str) -> WatchState {
        self.watches.lock().get(path)
    }

    /// Drop every registration and ignore later events.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        self.registrations.write().clear();
        self.handles.write().clear();
        self.watches.lock().states.clear();
    }

    /// Get statistics.
    pub fn stats(&self) -> ObserverStats {
        let registrations = self.registrations.read();
        let watches = self.watches.lock();
        ObserverStats {
            observed_paths: registrations.len(),
            registrations: registrations.values().map(Vec::len).sum(),
            watching: watches
                .states
                .values()
                .filter(|s| **s == WatchState::Watching)
                .count(),
        }
    }

    fn registrations_for(&self, path: &str) -> Vec<Arc<dyn Registration>> {
        self.registrations
            .read()
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    fn all_registrations(&self) -> Vec<Arc<dyn Registration>> {
        self.registrations
            .read()
            .values()
            .flat_map(|list| list.iter().cloned())
            .collect()
    }

    /// Read a node and arm a watch on it whether or not it exists.
    fn read_and_arm(&self, path: &str) -> KeelResult<Option<(Bytes, Stat)>> {
        loop {
            match self.store.get_data(path, true) {
                Ok(found) => return Ok(Some(found)),
                Err(KeelError::NodeAbsent { .. }) => {}
                Err(e) => return Err(e),
            }
            // Created between the two calls: read again.
            if self.store.exists(path, true)?.is_none() {
                return Ok(None);
            }
        }
    }

    fn refresh(&self, path: &str) {
        let signal_all = |signal: Signal<'_>| {
            for registration in self.registrations_for(path) {
                registration.signal(&signal);
            }
        };
        match self.read_and_arm(path) {
            Ok(Some((bytes, stat))) => {
                self.cache.put(path, stat, Some(bytes.clone()), None);
                self.watches.lock().set(path, WatchState::Watching);
                signal_all(Signal::Value(&bytes));
            }
            Ok(None) => {
                self.cache.remove(path);
                self.watches.lock().set(path, WatchState::Watching);
                signal_all(Signal::Vanished);
            }
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "failed to refresh observed path");
                for registration in self.registrations_for(path) {
                    registration.error(&e);
                }
            }
        }
    }

    fn on_deleted(&self, path: &str) {
        self.cache.remove(path);
        if !self.is_being_observed(path) {
            return;
        }
        for registration in self.registrations_for(path) {
            registration.signal(&Signal::Deleted);
        }
        match self.store.exists(path, true) {
            Ok(None) => self.watches.lock().set(path, WatchState::Watching),
            // Recreated before we re-armed; the creation notification is lost.
            Ok(Some(_)) => self.refresh(path),
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "failed to re-arm watch after delete");
            }
        }
    }

    fn on_connected(&self) {
        for registration in self.all_registrations() {
            registration.state_reset();
        }
        let pending = self.watches.lock().needing_rearm();
        for path in pending {
            if self.is_being_observed(&path) {
                tracing::debug!(path = %path, "re-arming watch");
                self.refresh(&path);
            }
        }
    }

    fn on_state_unknown(&self) {
        for registration in self.all_registrations() {
            registration.state_unknown();
        }
    }
}

impl Watcher for ObserverManager {
    fn process(&self, event: &WatchedEvent) {
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }
        match (event.event_type, event.path()) {
            (EventType::NodeCreated | EventType::NodeDataChanged, Some(path)) => {
                if !self.is_being_observed(path) {
                    self.cache.remove(path);
                    return;
                }
                self.watches
                    .lock()
                    .set(path, WatchState::FiredPendingRearm);
                // Supersede any read that is filling the cache concurrently.
                self.cache.remove(path);
                self.refresh(path);
            }
            (EventType::NodeDeleted, Some(path)) => {
                if self.is_being_observed(path) {
                    self.watches
                        .lock()
                        .set(path, WatchState::FiredPendingRearm);
                }
                self.on_deleted(path);
            }
            (EventType::NodeChildrenChanged, Some(path)) => {
                self.cache.remove(path);
            }
            (EventType::Connected, _) => self.on_connected(),
            (EventType::Disconnected, _) => self.on_state_unknown(),
            (EventType::SessionExpired, _) => {
                self.watches.lock().reset_all();
                self.cache.clear();
                self.on_state_unknown();
            }
            (_, None) => {
                tracing::debug!(event = ?event.event_type, "node event without path ignored");
            }
        }
    }
}

/// Observer manager statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverStats {
    /// Paths with at least one registration.
    pub observed_paths: usize,
    /// Total registrations.
    pub registrations: usize,
    /// Observed paths with an armed watch.
    pub watching: usize,
}
