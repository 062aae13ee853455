//! Core kernel infrastructure.
//!
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - Kernel context and lifecycle
//! - [`time`] - Clocks and freshness windows
//! - [`error`] - Error types and classification

pub mod config;
pub mod error;
pub mod runtime;
pub mod time;
