//! Read/write utility layer over the path cache.
//!
//! # Modules
//!
//! - [`access`] - Cached single-path reads and writes
//! - [`multi`] - Indexed values under a base path

pub mod access;
pub mod multi;

pub use access::DataAccess;
pub use multi::{DataLock, MultiData, DEFAULT_INDEX};
