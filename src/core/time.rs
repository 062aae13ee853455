//! Time sources and staleness tolerance.
//!
//! Cache freshness and lease renewal read time through the [`Clock`] trait so
//! that tests can drive time explicitly with a [`ManualClock`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock milliseconds.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Clock backed by the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    ms: AtomicU64,
}

impl ManualClock {
    /// Create a manual clock starting at the given millisecond value.
    pub fn new(start_ms: u64) -> Self {
        Self {
            ms: AtomicU64::new(start_ms),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.ms.fetch_add(by.as_millis() as u64, Ordering::AcqRel);
    }

    /// Set the clock to an absolute value.
    pub fn set(&self, ms: u64) {
        self.ms.store(ms, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.ms.load(Ordering::Acquire)
    }
}

/// Staleness tolerance chosen by the caller of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ttl {
    /// Never serve from the cache.
    Bypass,
    /// Serve cached state no older than this many milliseconds.
    Millis(u64),
    /// Serve any cached state regardless of age.
    Unbounded,
}

impl Ttl {
    /// Tolerance of the given number of milliseconds.
    pub const fn millis(ms: u64) -> Self {
        Self::Millis(ms)
    }

    /// Tolerance of the given duration.
    pub fn from_duration(duration: Duration) -> Self {
        Self::Millis(duration.as_millis() as u64)
    }

    /// Check whether state recorded at `since_ms` is still acceptable at `now_ms`.
    pub fn is_fresh(self, since_ms: u64, now_ms: u64) -> bool {
        match self {
            Self::Bypass => false,
            Self::Millis(ttl) => now_ms.saturating_sub(since_ms) <= ttl,
            Self::Unbounded => true,
        }
    }

    /// Inverse of [`Ttl::is_fresh`].
    pub fn is_expired(self, since_ms: u64, now_ms: u64) -> bool {
        !self.is_fresh(since_ms, now_ms)
    }
}

impl std::fmt::Display for Ttl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bypass => write!(f, "ttl(bypass)"),
            Self::Millis(ms) => write!(f, "ttl({}ms)", ms),
            Self::Unbounded => write!(f, "ttl(unbounded)"),
        }
    }
}
