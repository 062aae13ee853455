//! Pooled leases.
//!
//! A lease id names a pool of `N` slots. Every participant bids with an
//! ephemeral sequential ticket under `<base>/lease/<lease_id>`; the `N`
//! lowest-sequence live tickets hold the lease. Each evaluation re-lists the
//! root (re-arming its children watch) and compares the new holder set with
//! the last one seen:
//!
//! - a ticket entering the holder set fires `acquired`
//! - a holder that stays across a change or a renewal fires `renewed`
//! - a holder leaving the set or losing its ticket fires `revoked`
//! - a holder giving up its ticket fires `relinquished` before the delete
//!
//! Spectators run the same evaluation without owning a ticket and receive
//! the signals for every holder.

use super::ticket::{holders, rank_of, sorted_tickets, Ticket, TicketKind};
use crate::core::config::LeaseConfig;
use crate::core::error::{KeelError, KeelResult};
use crate::core::time::Clock;
use crate::store::path::PathScheme;
use crate::store::util::ensure_path;
use crate::store::{Acl, CreateMode, EventType, StoreClient, WatchedEvent, Watcher};
use bytes::Bytes;
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Snapshot of one holder slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Lease id.
    pub lease_id: String,
    /// Ticket name holding the slot.
    pub ticket: String,
    /// 0-based rank of the ticket among live tickets.
    pub rank: usize,
    /// Number of slots in the pool.
    pub pool_size: usize,
    /// Renewal period.
    pub duration: Duration,
}

/// Receiver of lease lifecycle signals.
pub trait LeaseObserver: Send + Sync {
    fn acquired(&self, lease: &Lease);
    fn renewed(&self, lease: &Lease);
    fn relinquished(&self, lease: &Lease);
    fn revoked(&self, lease: &Lease);
}

/// Identifies a request or spectator subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseHandle(u64);

impl LeaseHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// The root's children changed or the session reconnected.
    Topology,
    /// Periodic renewal tick.
    Renewal,
}

#[derive(Debug, Clone, Copy)]
enum SignalKind {
    Acquired,
    Renewed,
    Relinquished,
    Revoked,
}

enum Role {
    Requester {
        ticket: String,
        rank: Option<usize>,
        renewed_at_ms: u64,
    },
    Spectator,
}

struct Tracker {
    lease_id: String,
    root: String,
    pool_size: usize,
    duration: Duration,
    observer: Arc<dyn LeaseObserver>,
    role: Role,
    /// Holder tickets and ranks at the last evaluation.
    seen: Vec<(String, usize)>,
}

impl Tracker {
    fn lease(&self, ticket: &str, rank: usize) -> Lease {
        Lease {
            lease_id: self.lease_id.clone(),
            ticket: ticket.to_string(),
            rank,
            pool_size: self.pool_size,
            duration: self.duration,
        }
    }

    fn is_holding(&self) -> bool {
        matches!(self.role, Role::Requester { rank: Some(_), .. })
    }
}

type Signal = (Arc<dyn LeaseObserver>, SignalKind, Lease);

fn emit(signals: Vec<Signal>) {
    for (observer, kind, lease) in signals {
        match kind {
            SignalKind::Acquired => observer.acquired(&lease),
            SignalKind::Renewed => observer.renewed(&lease),
            SignalKind::Relinquished => observer.relinquished(&lease),
            SignalKind::Revoked => observer.revoked(&lease),
        }
    }
}

/// Lease service bound to one store session.
pub struct LeaseService {
    store: Arc<dyn StoreClient>,
    scheme: PathScheme,
    acl: Vec<Acl>,
    clock: Arc<dyn Clock>,
    config: LeaseConfig,
    trackers: Mutex<HashMap<LeaseHandle, Tracker>>,
    /// Serializes evaluations so signals for a root come out in order.
    /// Re-entrant because observers may call back into the service.
    eval_lock: ReentrantMutex<()>,
    next_handle: AtomicU64,
}

impl LeaseService {
    /// Create a lease service.
    pub fn new(
        store: Arc<dyn StoreClient>,
        scheme: PathScheme,
        acl: Vec<Acl>,
        clock: Arc<dyn Clock>,
        config: LeaseConfig,
    ) -> Self {
        Self {
            store,
            scheme,
            acl,
            clock,
            config,
            trackers: Mutex::new(HashMap::new()),
            eval_lock: ReentrantMutex::new(()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Bid for a slot in the pool of `lease_id`.
    ///
    /// Returns once the ticket exists; `acquired` fires when (and if) the
    /// ticket ranks within the pool.
    pub fn request(
        &self,
        lease_id: &str,
        pool_size: usize,
        duration: Duration,
        observer: Arc<dyn LeaseObserver>,
    ) -> KeelResult<LeaseHandle> {
        self.validate(pool_size, duration)?;
        let root = self.scheme.lease_root(lease_id)?;
        ensure_path(self.store.as_ref(), &root, &self.acl)?;

        let _eval = self.eval_lock.lock();
        let created = self.store.create(
            &format!("{}/{}", root, TicketKind::Lease.prefix()),
            Bytes::new(),
            CreateMode::EPHEMERAL_SEQUENTIAL,
            &self.acl,
        )?;
        let ticket = PathScheme::leaf(&created).to_string();
        let handle = self.insert(Tracker {
            lease_id: lease_id.to_string(),
            root: root.clone(),
            pool_size,
            duration,
            observer,
            role: Role::Requester {
                ticket: ticket.clone(),
                rank: None,
                renewed_at_ms: self.clock.now_ms(),
            },
            seen: Vec::new(),
        });
        tracing::debug!(lease_id = %lease_id, ticket = %ticket, pool_size = pool_size, "lease requested");

        self.evaluate(&root, Trigger::Topology);
        Ok(handle)
    }

    /// Watch the holders of `lease_id` without bidding.
    pub fn observe(
        &self,
        lease_id: &str,
        pool_size: usize,
        duration: Duration,
        observer: Arc<dyn LeaseObserver>,
    ) -> KeelResult<LeaseHandle> {
        self.validate(pool_size, duration)?;
        let root = self.scheme.lease_root(lease_id)?;
        ensure_path(self.store.as_ref(), &root, &self.acl)?;

        let _eval = self.eval_lock.lock();
        let handle = self.insert(Tracker {
            lease_id: lease_id.to_string(),
            root: root.clone(),
            pool_size,
            duration,
            observer,
            role: Role::Spectator,
            seen: Vec::new(),
        });
        tracing::debug!(lease_id = %lease_id, "lease observed");

        self.evaluate(&root, Trigger::Topology);
        Ok(handle)
    }

    /// Give up a request or end a spectator subscription.
    ///
    /// A holder gets `relinquished` before its ticket is deleted.
    pub fn relinquish(&self, handle: LeaseHandle) -> KeelResult<()> {
        let _eval = self.eval_lock.lock();
        let tracker = match self.trackers.lock().remove(&handle) {
            Some(tracker) => tracker,
            None => return Ok(()),
        };
        let ticket = match tracker.role {
            Role::Requester {
                ref ticket, rank, ..
            } => {
                if let Some(rank) = rank {
                    emit(vec![(
                        tracker.observer.clone(),
                        SignalKind::Relinquished,
                        tracker.lease(ticket, rank),
                    )]);
                }
                ticket.clone()
            }
            Role::Spectator => return Ok(()),
        };

        let path = format!("{}/{}", tracker.root, ticket);
        match self.store.delete(&path, None) {
            Ok(()) | Err(KeelError::NodeAbsent { .. }) => {
                tracing::info!(lease_id = %tracker.lease_id, ticket = %ticket, "lease relinquished");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Administratively delete a participant's ticket.
    ///
    /// Returns false if the ticket did not exist. The owner learns about it
    /// through `revoked`.
    pub fn revoke(&self, lease_id: &str, ticket: &str) -> KeelResult<bool> {
        let root = self.scheme.lease_root(lease_id)?;
        let path = PathScheme::join(&root, ticket)?;
        match self.store.delete(&path, None) {
            Ok(()) => {
                tracing::info!(lease_id = %lease_id, ticket = %ticket, "lease revoked");
                Ok(true)
            }
            Err(KeelError::NodeAbsent { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Current holders of `lease_id` for a pool of `pool_size` leased for
    /// `duration`.
    pub fn holders(
        &self,
        lease_id: &str,
        pool_size: usize,
        duration: Duration,
    ) -> KeelResult<Vec<Lease>> {
        let root = self.scheme.lease_root(lease_id)?;
        let children = match self.store.get_children(&root, false) {
            Ok((children, _)) => children,
            Err(KeelError::NodeAbsent { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let tickets = lease_tickets(&children);
        Ok(holders(&tickets, pool_size)
            .iter()
            .enumerate()
            .map(|(rank, t)| Lease {
                lease_id: lease_id.to_string(),
                ticket: t.name.clone(),
                rank,
                pool_size,
                duration,
            })
            .collect())
    }

    /// Lease currently held through `handle`, if any.
    pub fn held(&self, handle: LeaseHandle) -> Option<Lease> {
        let trackers = self.trackers.lock();
        let tracker = trackers.get(&handle)?;
        match tracker.role {
            Role::Requester {
                ref ticket,
                rank: Some(rank),
                ..
            } => Some(tracker.lease(ticket, rank)),
            _ => None,
        }
    }

    /// Renew every held lease whose duration has elapsed since its last
    /// signal. Called by the kernel's maintenance tick.
    pub fn renew_due(&self) {
        let _eval = self.eval_lock.lock();
        let now_ms = self.clock.now_ms();
        let mut roots: Vec<String> = self
            .trackers
            .lock()
            .values()
            .filter(|t| match t.role {
                Role::Requester {
                    rank: Some(_),
                    renewed_at_ms,
                    ..
                } => now_ms.saturating_sub(renewed_at_ms) >= t.duration.as_millis() as u64,
                _ => false,
            })
            .map(|t| t.root.clone())
            .collect();
        roots.sort();
        roots.dedup();
        for root in roots {
            self.evaluate(&root, Trigger::Renewal);
        }
    }

    /// Get statistics.
    pub fn stats(&self) -> LeaseStats {
        let trackers = self.trackers.lock();
        let requesters = trackers
            .values()
            .filter(|t| matches!(t.role, Role::Requester { .. }))
            .count();
        LeaseStats {
            requesters,
            spectators: trackers.len() - requesters,
            holding: trackers.values().filter(|t| t.is_holding()).count(),
        }
    }

    fn validate(&self, pool_size: usize, duration: Duration) -> KeelResult<()> {
        if pool_size == 0 || pool_size > self.config.max_pool_size {
            return Err(KeelError::invalid_request(format!(
                "pool size must be within 1..={}, got {}",
                self.config.max_pool_size, pool_size
            )));
        }
        if duration.is_zero() {
            return Err(KeelError::invalid_request("lease duration must be > 0"));
        }
        Ok(())
    }

    fn insert(&self, tracker: Tracker) -> LeaseHandle {
        let handle = LeaseHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.trackers.lock().insert(handle, tracker);
        handle
    }

    fn roots(&self) -> Vec<String> {
        let mut roots: Vec<String> = self
            .trackers
            .lock()
            .values()
            .map(|t| t.root.clone())
            .collect();
        roots.sort();
        roots.dedup();
        roots
    }

    fn evaluate(&self, root: &str, trigger: Trigger) {
        let _eval = self.eval_lock.lock();
        let children = match self.store.get_children(root, true) {
            Ok((children, _)) => children,
            Err(KeelError::NodeAbsent { .. }) => Vec::new(),
            Err(e) => {
                tracing::warn!(root = %root, error = %e, "lease evaluation failed");
                return;
            }
        };
        let tickets = lease_tickets(&children);
        let now_ms = self.clock.now_ms();

        let mut signals: Vec<Signal> = Vec::new();
        let mut finished: Vec<LeaseHandle> = Vec::new();
        {
            let mut trackers = self.trackers.lock();
            for (handle, tracker) in trackers.iter_mut().filter(|(_, t)| t.root == root) {
                let current: Vec<(String, usize)> = holders(&tickets, tracker.pool_size)
                    .iter()
                    .enumerate()
                    .map(|(rank, t)| (t.name.clone(), rank))
                    .collect();
                let changed = current != tracker.seen;

                match tracker.role {
                    Role::Requester {
                        ref ticket,
                        ref mut rank,
                        ref mut renewed_at_ms,
                    } => {
                        let now_rank = rank_of(&tickets, ticket);
                        let holding_now = now_rank.filter(|r| *r < tracker.pool_size);
                        let lease_for = |r: usize| Lease {
                            lease_id: tracker.lease_id.clone(),
                            ticket: ticket.clone(),
                            rank: r,
                            pool_size: tracker.pool_size,
                            duration: tracker.duration,
                        };
                        let due = now_ms.saturating_sub(*renewed_at_ms)
                            >= tracker.duration.as_millis() as u64;
                        match (*rank, holding_now) {
                            (None, Some(r)) => {
                                signals.push((tracker.observer.clone(), SignalKind::Acquired, lease_for(r)));
                                *renewed_at_ms = now_ms;
                            }
                            (Some(_), Some(r)) => {
                                let renew = match trigger {
                                    Trigger::Topology => changed,
                                    Trigger::Renewal => due,
                                };
                                if renew {
                                    signals.push((tracker.observer.clone(), SignalKind::Renewed, lease_for(r)));
                                    *renewed_at_ms = now_ms;
                                }
                            }
                            (Some(prev), None) => {
                                signals.push((tracker.observer.clone(), SignalKind::Revoked, lease_for(prev)));
                            }
                            (None, None) => {}
                        }
                        *rank = holding_now;
                        if now_rank.is_none() {
                            tracing::info!(lease_id = %tracker.lease_id, ticket = %ticket, "lease ticket gone");
                            finished.push(*handle);
                        }
                    }
                    Role::Spectator => {
                        if changed {
                            for (name, r) in &current {
                                let kind = if tracker.seen.iter().any(|(n, _)| n == name) {
                                    SignalKind::Renewed
                                } else {
                                    SignalKind::Acquired
                                };
                                signals.push((tracker.observer.clone(), kind, tracker.lease(name, *r)));
                            }
                            for (name, r) in &tracker.seen {
                                if !current.iter().any(|(n, _)| n == name) {
                                    signals.push((
                                        tracker.observer.clone(),
                                        SignalKind::Revoked,
                                        tracker.lease(name, *r),
                                    ));
                                }
                            }
                        }
                    }
                }
                tracker.seen = current;
            }
            for handle in finished {
                trackers.remove(&handle);
            }
        }

        tracing::trace!(root = %root, tickets = tickets.len(), signals = signals.len(), "lease evaluated");
        emit(signals);
    }

    fn on_session_expired(&self) {
        let _eval = self.eval_lock.lock();
        let mut signals: Vec<Signal> = Vec::new();
        {
            let mut trackers = self.trackers.lock();
            trackers.retain(|_, tracker| match tracker.role {
                Role::Requester { ref ticket, rank, .. } => {
                    if let Some(rank) = rank {
                        signals.push((
                            tracker.observer.clone(),
                            SignalKind::Revoked,
                            tracker.lease(ticket, rank),
                        ));
                    }
                    false
                }
                Role::Spectator => {
                    // The view of the holder set is gone with the session.
                    let seen = std::mem::take(&mut tracker.seen);
                    for (name, rank) in seen {
                        signals.push((
                            tracker.observer.clone(),
                            SignalKind::Revoked,
                            tracker.lease(&name, rank),
                        ));
                    }
                    true
                }
            });
        }
        if !signals.is_empty() {
            tracing::warn!(signals = signals.len(), "session expired, leases revoked");
        }
        emit(signals);
    }
}

impl Watcher for LeaseService {
    fn process(&self, event: &WatchedEvent) {
        match (event.event_type, event.path()) {
            (EventType::NodeChildrenChanged, Some(path)) => {
                let tracked = self.trackers.lock().values().any(|t| t.root == path);
                if tracked {
                    self.evaluate(path, Trigger::Topology);
                }
            }
            (EventType::SessionExpired, _) => self.on_session_expired(),
            (EventType::Connected, _) => {
                for root in self.roots() {
                    self.evaluate(&root, Trigger::Topology);
                }
            }
            _ => {}
        }
    }
}

fn lease_tickets(children: &[String]) -> Vec<Ticket> {
    sorted_tickets(children)
        .into_iter()
        .filter(|t| t.kind == TicketKind::Lease)
        .collect()
}

/// Lease service statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseStats {
    /// Outstanding requests.
    pub requesters: usize,
    /// Spectator subscriptions.
    pub spectators: usize,
    /// Requests currently holding a slot.
    pub holding: usize,
}
