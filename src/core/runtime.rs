//! Kernel context and lifecycle.
//!
//! The [`Kernel`] is the single object owning every component bound to one
//! store session:
//!
//! - path cache and codec registry
//! - observer manager
//! - lock and lease services
//! - cached data access
//!
//! Store notifications reach the components through one [`Dispatcher`] in a
//! fixed order: observers, locks, leases.
//!
//! Lifecycle: `new` → `start` (base path created, dispatcher registered,
//! readiness signalled) → `stop` (events ignored, observers dropped, session
//! closed). `run` adds the periodic maintenance tick.
//!
//! Optional start and stop hooks may be installed before `start`; each runs
//! once, as the last step of its transition.

use crate::cache::PathCache;
use crate::coord::lease::{LeaseHandle, LeaseObserver, LeaseService};
use crate::coord::lock::{AcquireError, AcquireOptions, LockHandle, LockService};
use crate::core::config::Config;
use crate::core::error::{KeelError, KeelResult};
use crate::core::time::Clock;
use crate::data::access::DataAccess;
use crate::data::multi::{DataLock, MultiData};
use crate::observe::codec::{Codec, CodecRegistry};
use crate::observe::manager::{DataObserver, ObserverHandle, ObserverManager};
use crate::store::path::{PathKind, PathScheme};
use crate::store::util::ensure_path;
use crate::store::{Acl, StoreClient, WatchedEvent, Watcher};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Fans store events out to the kernel components in a fixed order.
pub struct Dispatcher {
    watchers: Vec<Arc<dyn Watcher>>,
    stopped: AtomicBool,
}

impl Dispatcher {
    /// Create a dispatcher calling `watchers` in order.
    pub fn new(watchers: Vec<Arc<dyn Watcher>>) -> Self {
        Self {
            watchers,
            stopped: AtomicBool::new(false),
        }
    }

    /// Ignore every later event.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

impl Watcher for Dispatcher {
    fn process(&self, event: &WatchedEvent) {
        if self.stopped.load(Ordering::Acquire) {
            tracing::trace!(event = ?event.event_type, "event after shutdown ignored");
            return;
        }
        tracing::debug!(event = ?event.event_type, path = ?event.path, "dispatching event");
        for watcher in &self.watchers {
            watcher.process(event);
        }
    }
}

/// One-shot readiness flag that async callers can wait on.
pub struct ReadySignal {
    tx: watch::Sender<bool>,
}

impl ReadySignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Flip to ready. Later calls are no-ops.
    pub fn mark(&self) {
        self.tx.send_replace(true);
    }

    /// Check if ready.
    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until ready.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Default for ReadySignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Callback run on a lifecycle transition.
pub type LifecycleHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Hooks {
    start: Option<LifecycleHook>,
    stop: Option<LifecycleHook>,
}

/// Coordination kernel bound to one store session.
pub struct Kernel {
    /// Configuration.
    config: Arc<Config>,

    /// Store session.
    store: Arc<dyn StoreClient>,

    /// Time source shared by cache and leases.
    clock: Arc<dyn Clock>,

    /// Layout under the base path.
    scheme: PathScheme,

    /// ACL for nodes the kernel creates.
    acl: Vec<Acl>,

    cache: Arc<PathCache>,
    codecs: Arc<CodecRegistry>,
    observers: Arc<ObserverManager>,
    locks: Arc<LockService>,
    leases: Arc<LeaseService>,
    access: Arc<DataAccess>,
    dispatcher: Arc<Dispatcher>,

    /// Set once `start` completed.
    ready: ReadySignal,

    /// Whether `stop` ran.
    stopped: AtomicBool,

    hooks: Mutex<Hooks>,

    /// Shutdown signal sender.
    shutdown_tx: watch::Sender<bool>,
}

impl Kernel {
    /// Build a kernel over an open store session.
    pub fn new(config: Config, store: Arc<dyn StoreClient>, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let acl = config.acl()?;
        let scheme = PathScheme::new(config.kernel.base_path.clone())
            .context("invalid kernel.base_path")?;

        let cache = Arc::new(PathCache::new(clock.clone()));
        let codecs = Arc::new(CodecRegistry::with_defaults());
        let observers = Arc::new(ObserverManager::new(store.clone(), cache.clone()));
        let locks = Arc::new(LockService::new(store.clone(), scheme.clone(), acl.clone()));
        let leases = Arc::new(LeaseService::new(
            store.clone(),
            scheme.clone(),
            acl.clone(),
            clock.clone(),
            config.lease.clone(),
        ));
        let access = Arc::new(DataAccess::new(store.clone(), cache.clone(), acl.clone()));
        let dispatcher = Arc::new(Dispatcher::new(vec![
            observers.clone() as Arc<dyn Watcher>,
            locks.clone() as Arc<dyn Watcher>,
            leases.clone() as Arc<dyn Watcher>,
        ]));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            store,
            clock,
            scheme,
            acl,
            cache,
            codecs,
            observers,
            locks,
            leases,
            access,
            dispatcher,
            ready: ReadySignal::new(),
            stopped: AtomicBool::new(false),
            hooks: Mutex::new(Hooks::default()),
            shutdown_tx,
        })
    }

    /// Install a callback run at the end of `start`.
    ///
    /// Fails once the kernel has started or stopped.
    pub fn set_start_hook(&self, hook: impl Fn() + Send + Sync + 'static) -> KeelResult<()> {
        let mut hooks = self.hooks.lock();
        self.check_unstarted("start")?;
        hooks.start = Some(Box::new(hook));
        Ok(())
    }

    /// Install a callback run at the end of `stop`.
    ///
    /// Fails once the kernel has started or stopped.
    pub fn set_stop_hook(&self, hook: impl Fn() + Send + Sync + 'static) -> KeelResult<()> {
        let mut hooks = self.hooks.lock();
        self.check_unstarted("stop")?;
        hooks.stop = Some(Box::new(hook));
        Ok(())
    }

    fn check_unstarted(&self, hook: &str) -> KeelResult<()> {
        if self.ready.is_ready() || self.stopped.load(Ordering::Acquire) {
            return Err(KeelError::invalid_request(format!(
                "{hook} hook must be set before the kernel starts"
            )));
        }
        Ok(())
    }

    /// Create the base path and start receiving store events.
    pub fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            anyhow::bail!("kernel was stopped and cannot be restarted");
        }
        if self.ready.is_ready() {
            return Ok(());
        }
        tracing::info!(
            base_path = %self.scheme.base_path(),
            session_id = self.store.session_id(),
            "starting keel kernel"
        );

        ensure_path(self.store.as_ref(), self.scheme.base_path(), &self.acl)
            .with_context(|| format!("failed to create {}", self.scheme.base_path()))?;
        self.store.register(self.dispatcher.clone());

        self.ready.mark();
        tracing::info!("keel kernel started");

        let hook = self.hooks.lock().start.take();
        if let Some(hook) = hook {
            tracing::debug!("running start hook");
            hook();
        }
        Ok(())
    }

    /// Stop dispatching, drop every observer and close the session.
    ///
    /// Closing the session removes every ticket this kernel owns.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("stopping keel kernel");
        self.dispatcher.stop();
        self.observers.shutdown();
        self.store.close();
        self.shutdown_tx.send_replace(true);
        tracing::info!("keel kernel stopped");

        let hook = self.hooks.lock().stop.take();
        if let Some(hook) = hook {
            tracing::debug!("running stop hook");
            hook();
        }
    }

    /// Ask a running [`Kernel::run`] loop to return.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        self.shutdown_tx.send_replace(true);
    }

    /// Check if `start` completed and `stop` has not run.
    pub fn is_ready(&self) -> bool {
        self.ready.is_ready() && !self.stopped.load(Ordering::Acquire)
    }

    /// Wait until `start` completed.
    pub async fn wait_ready(&self) {
        self.ready.wait().await
    }

    /// Run periodic maintenance once.
    pub fn tick(&self) {
        if self.is_ready() {
            self.leases.renew_due();
        }
    }

    /// Start, tick every `lease.renew_interval_ms` until shutdown or Ctrl-C,
    /// then stop.
    pub async fn run(&self) -> Result<()> {
        self.start()?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut interval = tokio::time::interval(self.config.lease.renew_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown_rx.borrow_and_update() {
                tracing::info!("shutdown requested by caller");
                break;
            }
            tokio::select! {
                _ = interval.tick() => self.tick(),
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("shutdown signal received (SIGINT)");
                    break;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.stop();
        Ok(())
    }

    fn check_started(&self) -> KeelResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(KeelError::ShutDown);
        }
        if !self.ready.is_ready() {
            return Err(KeelError::NotStarted);
        }
        Ok(())
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
        self.check_started().map_err(AcquireError::Store)?;
        self.locks.acquire_with(resource, options)
    }

    /// Release a held lock.
    pub fn release(&self, handle: &LockHandle) -> KeelResult<()> {
        self.check_started()?;
        self.locks.release(handle)
    }

    /// Bid for a slot in a lease pool.
    pub fn request_lease(
        &self,
        lease_id: &str,
        pool_size: usize,
        duration: Duration,
        observer: Arc<dyn LeaseObserver>,
    ) -> KeelResult<LeaseHandle> {
        self.check_started()?;
        self.leases.request(lease_id, pool_size, duration, observer)
    }

    /// Observe a path with an explicit codec.
    pub fn subscribe<T>(
        &self,
        path: &str,
        codec: Arc<dyn Codec<T>>,
        observer: Arc<dyn DataObserver<T>>,
    ) -> KeelResult<ObserverHandle>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        self.check_started()?;
        self.observers.subscribe(path, codec, observer)
    }

    /// Observe a path with a codec from the registry.
    pub fn subscribe_with_key<T>(
        &self,
        path: &str,
        codec_key: &str,
        observer: Arc<dyn DataObserver<T>>,
    ) -> KeelResult<ObserverHandle>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        let codec = self.codecs.get::<T>(codec_key)?;
        self.subscribe(path, codec, observer)
    }

    /// Remove an observer registration.
    pub fn unsubscribe(&self, handle: ObserverHandle) -> bool {
        self.observers.unsubscribe(handle)
    }

    /// Indexed values under `<base>/data/<relative>`.
    pub fn multi_data<T>(&self, relative: &str, codec: Arc<dyn Codec<T>>) -> KeelResult<MultiData<T>> {
        self.check_started()?;
        let base = self.scheme.absolute_with(PathKind::Data, relative)?;
        MultiData::new(base, self.access.clone(), codec)
    }

    /// Like [`Kernel::multi_data`] but serialized by a distributed
    /// read/write lock named after the relative path.
    pub fn multi_data_locked<T>(
        &self,
        relative: &str,
        codec: Arc<dyn Codec<T>>,
    ) -> KeelResult<MultiData<T>> {
        let data = self.multi_data(relative, codec)?;
        let resource = format!("data.{}", PathScheme::tokenize(relative).join("."));
        Ok(data.with_lock(DataLock::new(self.locks.clone(), resource)))
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the store session.
    pub fn store(&self) -> &Arc<dyn StoreClient> {
        &self.store
    }

    /// Get the clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Get the path layout.
    pub fn scheme(&self) -> &PathScheme {
        &self.scheme
    }

    /// Get the path cache.
    pub fn cache(&self) -> &Arc<PathCache> {
        &self.cache
    }

    /// Get the codec registry.
    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.codecs
    }

    /// Get the observer manager.
    pub fn observers(&self) -> &Arc<ObserverManager> {
        &self.observers
    }

    /// Get the lock service.
    pub fn locks(&self) -> &Arc<LockService> {
        &self.locks
    }

    /// Get the lease service.
    pub fn leases(&self) -> &Arc<LeaseService> {
        &self.leases
    }

    /// Get cached data access.
    pub fn data(&self) -> &Arc<DataAccess> {
        &self.access
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.stop();
    }
}
