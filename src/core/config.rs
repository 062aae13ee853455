//! Configuration parsing and validation.
//!
//! keel configuration is loaded from TOML files with CLI overrides. Every
//! section has defaults, so an empty file is a valid configuration.

use crate::store::path::PathScheme;
use crate::store::Acl;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level keel configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Kernel layout and defaults.
    #[serde(default)]
    pub kernel: KernelConfig,

    /// Store session configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Lease service configuration.
    #[serde(default)]
    pub lease: LeaseConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Kernel layout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Reserved prefix under which all coordination metadata lives.
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// ACL entries applied to nodes the kernel creates, as `scheme:id:perms`.
    #[serde(default = "default_acl")]
    pub default_acl: Vec<String>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            default_acl: default_acl(),
        }
    }
}

/// Store session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Session timeout negotiated with the store, in milliseconds.
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Log a warning once this many events are waiting for delivery.
    #[serde(default = "default_event_queue_warn_depth")]
    pub event_queue_warn_depth: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: default_session_timeout_ms(),
            event_queue_warn_depth: default_event_queue_warn_depth(),
        }
    }
}

/// Lease service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Maintenance tick period in milliseconds.
    #[serde(default = "default_renew_interval_ms")]
    pub renew_interval_ms: u64,

    /// Lease duration used when a caller does not pick one.
    #[serde(default = "default_lease_duration_ms")]
    pub default_duration_ms: u64,

    /// Largest pool size a lease request may ask for.
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            renew_interval_ms: default_renew_interval_ms(),
            default_duration_ms: default_lease_duration_ms(),
            max_pool_size: default_max_pool_size(),
        }
    }
}

impl LeaseConfig {
    /// Maintenance tick period.
    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }

    /// Default lease duration.
    pub fn default_duration(&self) -> Duration {
        Duration::from_millis(self.default_duration_ms)
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions

fn default_base_path() -> String {
    "/keel".to_string()
}

fn default_acl() -> Vec<String> {
    vec!["world:anyone:rwcda".to_string()]
}

fn default_session_timeout_ms() -> u64 {
    30_000
}

fn default_event_queue_warn_depth() -> usize {
    1024
}

fn default_renew_interval_ms() -> u64 {
    1_000
}

fn default_lease_duration_ms() -> u64 {
    30_000
}

fn default_max_pool_size() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref base_path) = overrides.base_path {
            self.kernel.base_path = base_path.clone();
        }
    }

    /// Parse the configured default ACL.
    pub fn acl(&self) -> Result<Vec<Acl>> {
        self.kernel
            .default_acl
            .iter()
            .map(|entry| {
                Acl::parse(entry).with_context(|| format!("invalid ACL entry: {}", entry))
            })
            .collect()
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_kernel()?;
        self.validate_store()?;
        self.validate_lease()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_kernel(&self) -> Result<()> {
        if !PathScheme::is_valid_path(&self.kernel.base_path) {
            anyhow::bail!(
                "kernel.base_path must be an absolute path, got: {}",
                self.kernel.base_path
            );
        }
        if self.kernel.base_path == "/" {
            anyhow::bail!("kernel.base_path must not be the root path");
        }
        if self.kernel.default_acl.is_empty() {
            anyhow::bail!("kernel.default_acl must contain at least one entry");
        }
        self.acl()?;
        Ok(())
    }

    fn validate_store(&self) -> Result<()> {
        if self.store.session_timeout_ms == 0 {
            anyhow::bail!("store.session_timeout_ms must be > 0");
        }
        if self.store.event_queue_warn_depth == 0 {
            anyhow::bail!("store.event_queue_warn_depth must be > 0");
        }
        Ok(())
    }

    fn validate_lease(&self) -> Result<()> {
        if self.lease.renew_interval_ms == 0 {
            anyhow::bail!("lease.renew_interval_ms must be > 0");
        }
        if self.lease.default_duration_ms < self.lease.renew_interval_ms {
            anyhow::bail!(
                "lease.default_duration_ms ({}) cannot be shorter than lease.renew_interval_ms ({})",
                self.lease.default_duration_ms,
                self.lease.renew_interval_ms
            );
        }
        if self.lease.max_pool_size == 0 {
            anyhow::bail!("lease.max_pool_size must be > 0");
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override base path.
    pub base_path: Option<String>,
}
