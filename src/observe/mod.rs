//! Observation of remote node values.
//!
//! # Modules
//!
//! - [`codec`] - Typed encode/decode pairs and the codec registry
//! - [`manager`] - Observer registrations and watch dispatch

pub mod codec;
pub mod manager;

pub use codec::{Codec, CodecRegistry};
pub use manager::{DataObserver, ObserverHandle, ObserverManager, ObserverStats, WatchState};
