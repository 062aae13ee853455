//! Coordination primitives built from ephemeral sequential tickets.
//!
//! # Modules
//!
//! - [`ticket`] - Ticket names and the ownership rules
//! - [`lock`] - Exclusive and shared distributed locks
//! - [`lease`] - Pooled leases with acquire/renew/relinquish/revoke signals

pub mod lease;
pub mod lock;
pub mod ticket;

pub use lease::{Lease, LeaseHandle, LeaseObserver, LeaseService, LeaseStats};
pub use lock::{AcquireError, AcquireOptions, LockHandle, LockObserver, LockService, LockStats};
pub use ticket::{LockMode, Ticket, TicketKind};
