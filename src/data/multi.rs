//! Indexed values under one base path.
//!
//! Each value lives at `<base>/<index>`. Operations are best-effort: store
//! and lock failures are logged and reported as "no value" or an empty
//! result, while encoding and decoding failures are returned as errors.
//!
//! With a distributed lock attached, reads run under a shared lock and
//! writes under an exclusive lock on the same resource, and the cache is
//! bypassed.

use super::access::DataAccess;
use crate::coord::lock::{AcquireError, AcquireOptions, LockService};
use crate::core::error::{ErrorKind, KeelError, KeelResult};
use crate::core::time::Ttl;
use crate::observe::codec::Codec;
use crate::store::path::PathScheme;
use std::sync::Arc;
use std::time::Duration;

/// Index used by the single-value convenience methods.
pub const DEFAULT_INDEX: &str = "_";

/// Distributed read/write lock guarding a [`MultiData`].
#[derive(Clone)]
pub struct DataLock {
    service: Arc<LockService>,
    resource: String,
    timeout: Option<Duration>,
}

impl DataLock {
    /// Guard with the lock on `resource`.
    pub fn new(service: Arc<LockService>, resource: impl Into<String>) -> Self {
        Self {
            service,
            resource: resource.into(),
            timeout: None,
        }
    }

    /// Bound every lock wait.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn options(&self, shared: bool) -> AcquireOptions {
        let options = if shared {
            AcquireOptions::shared()
        } else {
            AcquireOptions::exclusive()
        };
        match self.timeout {
            Some(timeout) => options.with_timeout(timeout),
            None => options,
        }
    }
}

/// Typed, indexed values under a base path.
pub struct MultiData<T> {
    base: String,
    access: Arc<DataAccess>,
    codec: Arc<dyn Codec<T>>,
    lock: Option<DataLock>,
}

impl<T> MultiData<T> {
    /// Values under the absolute path `base`.
    pub fn new(
        base: impl Into<String>,
        access: Arc<DataAccess>,
        codec: Arc<dyn Codec<T>>,
    ) -> KeelResult<Self> {
        let base = base.into();
        PathScheme::check(&base)?;
        Ok(Self {
            base,
            access,
            codec,
            lock: None,
        })
    }

    /// Serialize operations through a distributed read/write lock.
    pub fn with_lock(mut self, lock: DataLock) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Base path.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Write the value at `index`. Returns false if the store write failed.
    pub fn set(&self, index: &str, value: &T) -> KeelResult<bool> {
        let path = self.path_of(index)?;
        let bytes = self.codec.encode(value)?;
        let result = self.locked(false, || self.access.write(&path, bytes).map(|_| true));
        self.degrade("set", &path, result, false)
    }

    /// Read the value at `index`.
    ///
    /// An absent node and a node with empty data both read as `None`.
    pub fn get(&self, index: &str, ttl: Ttl) -> KeelResult<Option<T>> {
        let path = self.path_of(index)?;
        let ttl = self.effective_ttl(ttl);
        let bytes = self.locked(true, || self.access.read(&path, ttl));
        match self.degrade("get", &path, bytes, None)? {
            Some(bytes) if !bytes.is_empty() => self.codec.decode(&bytes).map(Some),
            _ => Ok(None),
        }
    }

    /// Read every value, in index order. Absent values are skipped.
    pub fn get_all(&self, ttl: Ttl) -> KeelResult<Vec<T>> {
        let ttl = self.effective_ttl(ttl);
        let raw = self.locked(true, || {
            let mut indices = self.access.read_children(&self.base, ttl)?;
            indices.sort();
            let mut raw = Vec::with_capacity(indices.len());
            for index in indices {
                let path = self.path_of(&index)?;
                match self.access.read(&path, ttl) {
                    Ok(Some(bytes)) if !bytes.is_empty() => raw.push(bytes),
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::NodeAbsent => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(raw)
        });
        self.degrade("get_all", &self.base, raw, Vec::new())?
            .iter()
            .map(|bytes| self.codec.decode(bytes))
            .collect()
    }

    /// Delete the value at `index`. Returns true if it existed.
    pub fn remove(&self, index: &str) -> KeelResult<bool> {
        let path = self.path_of(index)?;
        let result = self.locked(false, || self.access.delete(&path));
        self.degrade("remove", &path, result, false)
    }

    /// Delete every value. Returns the removed indices.
    pub fn remove_all(&self) -> KeelResult<Vec<String>> {
        let result = self.locked(false, || self.remove_matching(None));
        self.degrade("remove_all", &self.base, result, Vec::new())
    }

    /// Delete the value at `index` if it was last modified more than `ttl` ago.
    pub fn remove_expired(&self, index: &str, ttl: Duration) -> KeelResult<bool> {
        let path = self.path_of(index)?;
        let result = self.locked(false, || {
            if self.is_expired(&path, ttl)? {
                self.access.delete(&path)
            } else {
                Ok(false)
            }
        });
        self.degrade("remove_expired", &path, result, false)
    }

    /// Delete every value last modified more than `ttl` ago. Returns the
    /// removed indices.
    pub fn remove_all_expired(&self, ttl: Duration) -> KeelResult<Vec<String>> {
        let result = self.locked(false, || self.remove_matching(Some(ttl)));
        self.degrade("remove_all_expired", &self.base, result, Vec::new())
    }

    /// Write the value at the default index.
    pub fn set_default(&self, value: &T) -> KeelResult<bool> {
        self.set(DEFAULT_INDEX, value)
    }

    /// Read the value at the default index.
    pub fn get_default(&self, ttl: Ttl) -> KeelResult<Option<T>> {
        self.get(DEFAULT_INDEX, ttl)
    }

    /// Delete the value at the default index.
    pub fn remove_default(&self) -> KeelResult<bool> {
        self.remove(DEFAULT_INDEX)
    }

    fn path_of(&self, index: &str) -> KeelResult<String> {
        if !PathScheme::is_valid_token(index) {
            return Err(KeelError::invalid_request(format!(
                "invalid index: '{}'",
                index
            )));
        }
        PathScheme::join(&self.base, index)
    }

    fn effective_ttl(&self, ttl: Ttl) -> Ttl {
        if self.lock.is_some() {
            Ttl::Bypass
        } else {
            ttl
        }
    }

    fn is_expired(&self, path: &str, ttl: Duration) -> KeelResult<bool> {
        match self.access.stat(path)? {
            Some(stat) => {
                let now_ms = self.access.now_ms();
                Ok(Ttl::from_duration(ttl).is_expired(stat.mtime_ms, now_ms))
            }
            None => Ok(false),
        }
    }

    fn remove_matching(&self, older_than: Option<Duration>) -> KeelResult<Vec<String>> {
        let mut indices = self.access.read_children(&self.base, Ttl::Bypass)?;
        indices.sort();
        let mut removed = Vec::new();
        for index in indices {
            let path = self.path_of(&index)?;
            if let Some(ttl) = older_than {
                if !self.is_expired(&path, ttl)? {
                    continue;
                }
            }
            if self.access.delete(&path)? {
                removed.push(index);
            }
        }
        Ok(removed)
    }

    fn locked<R>(&self, shared: bool, op: impl FnOnce() -> KeelResult<R>) -> KeelResult<R> {
        let lock = match self.lock {
            Some(ref lock) => lock,
            None => return op(),
        };
        let handle = lock
            .service
            .acquire_with(&lock.resource, lock.options(shared))
            .map_err(lock_error)?;
        let result = op();
        if let Err(e) = lock.service.release(&handle) {
            tracing::warn!(resource = %lock.resource, error = %e, "failed to release data lock");
        }
        result
    }

    fn degrade<R>(
        &self,
        op: &str,
        path: &str,
        result: KeelResult<R>,
        fallback: R,
    ) -> KeelResult<R> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => match e.kind() {
                ErrorKind::Serialization | ErrorKind::Usage => Err(e),
                ErrorKind::NodeAbsent => Ok(fallback),
                ErrorKind::Connectivity
                | ErrorKind::SessionExpired
                | ErrorKind::VersionConflict => {
                    tracing::warn!(
                        op = %op,
                        path = %path,
                        error = %e,
                        "best-effort data operation degraded"
                    );
                    Ok(fallback)
                }
            },
        }
    }
}

fn lock_error(err: AcquireError) -> KeelError {
    match err {
        AcquireError::Retryable(e) | AcquireError::Store(e) => e,
        AcquireError::SessionExpired => KeelError::SessionExpired,
        AcquireError::TimedOut(after) => {
            KeelError::connectivity(format!("lock wait timed out after {:?}", after))
        }
    }
}
