//! keel - coordination kernel over a hierarchical store.
//!
//! keel layers coordination primitives on top of a hierarchical,
//! watch-capable key-value store (znodes with ephemeral and sequential
//! flags, versioned data, one-shot watches). Everything runs inside one
//! [`Kernel`] bound to one store session.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            Kernel                               │
//! │        config │ lifecycle │ event dispatch │ maintenance        │
//! └─────────────────────────────────────────────────────────────────┘
//!          │                    │                      │
//! ┌────────────────┐ ┌────────────────────┐ ┌──────────────────────┐
//! │   Observers    │ │  Locks │ Leases    │ │  Data │ MultiData    │
//! │ (watch → typed │ │ (sequential-child  │ │ (cached reads and    │
//! │   callbacks)   │ │      tickets)      │ │  indexed values)     │
//! └────────────────┘ └────────────────────┘ └──────────────────────┘
//!          │                    │                      │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Path cache │ Store client                      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Kernel context and lifecycle
//! - [`core::time`] - Clocks and freshness windows
//! - [`core::error`] - Error types and classification
//!
//! ## Store
//! - [`store`] - Store client contract and node model
//! - [`store::path`] - Path layout and validation
//! - [`store::memory`] - Embedded in-process store
//! - [`store::util`] - Path creation helpers
//!
//! ## Caching and observation
//! - [`cache`] - Path cache with freshness windows
//! - [`observe::codec`] - Value codecs and registry
//! - [`observe::manager`] - Watch dispatch to typed observers
//!
//! ## Coordination
//! - [`coord::ticket`] - Ticket naming and ordering
//! - [`coord::lock`] - Exclusive and shared locks
//! - [`coord::lease`] - Pooled leases
//!
//! ## Data
//! - [`data::access`] - Cached reads and writes
//! - [`data::multi`] - Indexed multi-value records
//!
//! ## CLI
//! - [`cli::commands`] - CLI command implementations
//!
//! # Key Invariants
//!
//! - A lock resource has at most one exclusive holder, and never an
//!   exclusive holder together with shared holders.
//! - A lease pool of size N has at most N holders: the N lowest tickets.
//! - Observers see each distinct value once, in store order.
//! - Cache entries are only replaced by data read from or accepted by the
//!   store.

// Core infrastructure
pub mod core;

// Store contract and embedded store
pub mod store;

// Path cache
pub mod cache;

// Watch dispatch
pub mod observe;

// Locks and leases
pub mod coord;

// Data utilities
pub mod data;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::config::Config;
pub use self::core::error::{ErrorKind, KeelError, KeelResult};
pub use self::core::runtime::Kernel;
pub use self::core::time::{Clock, ManualClock, SystemClock, Ttl};
pub use self::core::{config, error, runtime, time};
pub use cache::{CacheEntry, PathCache};
pub use coord::{lease, lock, ticket};
pub use data::{access, multi};
pub use observe::{codec, manager};
