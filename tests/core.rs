//! Tests for configuration, errors, time and the kernel lifecycle.

mod common;

use common::{create_minimal_config, write_config, RecordingLeaseObserver, TestCluster};
use keel::core::config::{Config, ConfigOverrides};
use keel::core::error::{ErrorKind, KeelError};
use keel::core::runtime::Kernel;
use keel::core::time::{Clock, ManualClock, Ttl};
use keel::store::{Perms, StoreClient};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Configuration Tests
// ============================================================================

#[test]
fn config_minimal_file_uses_defaults() {
    let file = create_minimal_config();
    let config = Config::from_file(file.path()).unwrap();

    assert_eq!(config.kernel.base_path, "/keel");
    assert_eq!(config.store.session_timeout_ms, 30_000);
    assert_eq!(config.lease.renew_interval(), Duration::from_secs(1));
    assert_eq!(config.lease.default_duration(), Duration::from_secs(30));
    assert_eq!(config.telemetry.log_level, "info");
}

#[test]
fn config_empty_string_is_valid() {
    let config = Config::from_toml("").unwrap();
    assert_eq!(config.kernel.base_path, "/keel");
    assert_eq!(config.kernel.default_acl, vec!["world:anyone:rwcda".to_string()]);
}

#[test]
fn config_full_file() {
    let file = write_config(
        r#"
[kernel]
base_path = "/apps/orders"
default_acl = ["world:anyone:r", "digest:admin:rwcda"]

[store]
session_timeout_ms = 5000
event_queue_warn_depth = 64

[lease]
renew_interval_ms = 250
default_duration_ms = 2000
max_pool_size = 8

[telemetry]
log_level = "debug"
"#,
    );
    let config = Config::from_file(file.path()).unwrap();

    assert_eq!(config.kernel.base_path, "/apps/orders");
    assert_eq!(config.store.event_queue_warn_depth, 64);
    assert_eq!(config.lease.max_pool_size, 8);

    let acl = config.acl().unwrap();
    assert_eq!(acl.len(), 2);
    assert_eq!(acl[0].perms, Perms::READ);
    assert_eq!(acl[1].scheme, "digest");
    assert_eq!(acl[1].perms, Perms::ALL);
}

#[test]
fn config_rejects_relative_base_path() {
    let err = Config::from_toml("[kernel]\nbase_path = \"keel\"\n").unwrap_err();
    assert!(format!("{:#}", err).contains("base_path"));
}

#[test]
fn config_rejects_root_base_path() {
    assert!(Config::from_toml("[kernel]\nbase_path = \"/\"\n").is_err());
}

#[test]
fn config_rejects_bad_acl() {
    assert!(Config::from_toml("[kernel]\ndefault_acl = [\"world:anyone:xyz\"]\n").is_err());
    assert!(Config::from_toml("[kernel]\ndefault_acl = []\n").is_err());
}

#[test]
fn config_rejects_duration_shorter_than_interval() {
    let toml = "[lease]\nrenew_interval_ms = 1000\ndefault_duration_ms = 500\n";
    assert!(Config::from_toml(toml).is_err());
}

#[test]
fn config_rejects_unknown_log_level() {
    assert!(Config::from_toml("[telemetry]\nlog_level = \"chatty\"\n").is_err());
}

#[test]
fn config_missing_file_fails() {
    assert!(Config::from_file(std::path::Path::new("/nonexistent/keel.toml")).is_err());
}

#[test]
fn config_overrides_apply() {
    let mut config = Config::default();
    config.apply_overrides(&ConfigOverrides {
        log_level: Some("warn".to_string()),
        base_path: Some("/elsewhere".to_string()),
    });
    assert_eq!(config.telemetry.log_level, "warn");
    assert_eq!(config.kernel.base_path, "/elsewhere");
    assert!(config.validate().is_ok());
}

// ============================================================================
// Error Tests
// ============================================================================

#[test]
fn error_kinds() {
    assert_eq!(KeelError::connectivity("down").kind(), ErrorKind::Connectivity);
    assert_eq!(KeelError::node_absent("/a").kind(), ErrorKind::NodeAbsent);
    assert_eq!(KeelError::SessionExpired.kind(), ErrorKind::SessionExpired);
    assert_eq!(KeelError::serialization("bad").kind(), ErrorKind::Serialization);
    assert_eq!(
        KeelError::CodecNotFound {
            key: "x".to_string()
        }
        .kind(),
        ErrorKind::Serialization
    );
    assert_eq!(
        KeelError::VersionConflict {
            path: "/a".to_string(),
            expected: 1,
            actual: 2
        }
        .kind(),
        ErrorKind::VersionConflict
    );
    assert_eq!(KeelError::node_exists("/a").kind(), ErrorKind::Usage);
    assert_eq!(KeelError::NotStarted.kind(), ErrorKind::Usage);
}

#[test]
fn error_classification_helpers() {
    assert!(KeelError::connectivity("down").is_retriable());
    assert!(!KeelError::SessionExpired.is_retriable());
    assert!(KeelError::SessionExpired.is_session_fatal());
    assert!(KeelError::node_absent("/a").is_node_absent());
    assert!(!KeelError::invalid_path("a").is_node_absent());
}

#[test]
fn error_display() {
    let err = KeelError::VersionConflict {
        path: "/a".to_string(),
        expected: 1,
        actual: 3,
    };
    assert_eq!(err.to_string(), "version conflict on /a: expected 1, actual 3");
    assert_eq!(ErrorKind::NodeAbsent.to_string(), "NODE_ABSENT");
}

// ============================================================================
// Time Tests
// ============================================================================

#[test]
fn manual_clock_moves_only_when_told() {
    let clock = ManualClock::new(500);
    assert_eq!(clock.now_ms(), 500);
    clock.advance(Duration::from_millis(250));
    assert_eq!(clock.now_ms(), 750);
    clock.set(10);
    assert_eq!(clock.now_ms(), 10);
}

#[test]
fn ttl_freshness() {
    assert!(!Ttl::Bypass.is_fresh(100, 100));
    assert!(Ttl::Unbounded.is_fresh(0, u64::MAX));

    let ttl = Ttl::millis(1_000);
    assert!(ttl.is_fresh(100, 1_100));
    assert!(!ttl.is_fresh(100, 1_101));
    assert!(ttl.is_expired(100, 1_101));
    // A clock that went backwards never makes state stale.
    assert!(ttl.is_fresh(5_000, 1_000));

    assert_eq!(Ttl::from_duration(Duration::from_secs(2)), Ttl::Millis(2_000));
}

// ============================================================================
// Kernel Lifecycle Tests
// ============================================================================

#[test]
fn kernel_start_creates_base_path() {
    let cluster = TestCluster::new();
    let node = cluster.node();

    assert!(node.kernel.is_ready());
    assert!(node.session.exists("/keel", false).unwrap().is_some());
}

#[test]
fn kernel_start_is_idempotent() {
    let cluster = TestCluster::new();
    let node = cluster.node();
    node.kernel.start().unwrap();
    assert!(node.kernel.is_ready());
}

#[test]
fn kernel_rejects_invalid_config() {
    let cluster = TestCluster::new();
    let mut config = Config::default();
    config.kernel.base_path = "relative".to_string();
    let session = cluster.session();
    assert!(Kernel::new(config, session, cluster.clock.clone()).is_err());
}

#[test]
fn kernel_operations_before_start_fail() {
    let cluster = TestCluster::new();
    let session = cluster.session();
    let kernel = Kernel::new(Config::default(), session, cluster.clock.clone()).unwrap();

    assert!(!kernel.is_ready());
    let err = kernel
        .request_lease("pool", 1, Duration::from_secs(1), RecordingLeaseObserver::new())
        .unwrap_err();
    assert!(matches!(err, KeelError::NotStarted));
}

#[test]
fn kernel_stop_closes_session() {
    let cluster = TestCluster::new();
    let node = cluster.node();
    let other = cluster.session();

    let handle = node.kernel.acquire("jobs").unwrap();
    let ticket_path = handle.path();
    assert!(other.exists(&ticket_path, false).unwrap().is_some());

    node.kernel.stop();
    assert!(!node.kernel.is_ready());
    assert!(other.exists(&ticket_path, false).unwrap().is_none());

    let err = node
        .kernel
        .request_lease("pool", 1, Duration::from_secs(1), RecordingLeaseObserver::new())
        .unwrap_err();
    assert!(matches!(err, KeelError::ShutDown));
    assert!(node.kernel.start().is_err());
}

#[test]
fn kernel_hooks_run_at_end_of_transitions() {
    let cluster = TestCluster::new();
    let session = cluster.session();
    let kernel = Kernel::new(Config::default(), session, cluster.clock.clone()).unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let started = calls.clone();
    kernel
        .set_start_hook(move || started.lock().unwrap().push("start"))
        .unwrap();
    let stopped = calls.clone();
    kernel
        .set_stop_hook(move || stopped.lock().unwrap().push("stop"))
        .unwrap();
    assert!(calls.lock().unwrap().is_empty());

    kernel.start().unwrap();
    assert_eq!(*calls.lock().unwrap(), vec!["start"]);
    kernel.start().unwrap();
    assert_eq!(*calls.lock().unwrap(), vec!["start"]);

    kernel.stop();
    kernel.stop();
    assert_eq!(*calls.lock().unwrap(), vec!["start", "stop"]);
}

#[test]
fn kernel_hooks_rejected_after_start() {
    let cluster = TestCluster::new();
    let node = cluster.node();

    let err = node.kernel.set_start_hook(|| {}).unwrap_err();
    assert!(matches!(err, KeelError::InvalidRequest { .. }));
    let err = node.kernel.set_stop_hook(|| {}).unwrap_err();
    assert!(matches!(err, KeelError::InvalidRequest { .. }));

    node.kernel.stop();
    assert!(node.kernel.set_stop_hook(|| {}).is_err());
}

#[test]
fn kernel_tick_renews_due_leases() {
    let cluster = TestCluster::new();
    let node = cluster.node();
    let observer = RecordingLeaseObserver::new();

    node.kernel
        .request_lease("pool", 1, Duration::from_secs(5), observer.clone())
        .unwrap();
    assert_eq!(observer.count_acquired(), 1);

    node.kernel.tick();
    assert_eq!(observer.count_renewed(), 0);

    cluster.advance(Duration::from_secs(5));
    node.kernel.tick();
    assert_eq!(observer.count_renewed(), 1);
}

#[tokio::test]
async fn kernel_wait_ready_resolves_after_start() {
    let clock = Arc::new(ManualClock::new(0));
    let store = keel::store::MemoryStore::new(clock.clone());
    let session = store.connect().unwrap();
    let kernel = Arc::new(Kernel::new(Config::default(), session, clock).unwrap());

    let waiter = {
        let kernel = kernel.clone();
        tokio::spawn(async move { kernel.wait_ready().await })
    };
    kernel.start().unwrap();
    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("wait_ready did not resolve")
        .unwrap();
}

#[tokio::test]
async fn kernel_run_returns_after_shutdown() {
    let clock = Arc::new(ManualClock::new(0));
    let store = keel::store::MemoryStore::new(clock.clone());
    let session = store.connect().unwrap();
    let kernel = Arc::new(Kernel::new(Config::default(), session, clock).unwrap());

    let runner = {
        let kernel = kernel.clone();
        tokio::spawn(async move { kernel.run().await })
    };
    kernel.wait_ready().await;
    kernel.shutdown();

    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("run did not return")
        .unwrap()
        .unwrap();
    assert!(!kernel.is_ready());
}
