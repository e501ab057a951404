//! Configuration system for Foundry.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FOUNDRY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/foundry/config.toml
//!   3. ~/.config/foundry/config.toml
//!
//! The loaded value is passed explicitly to every component at startup.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FoundryConfig {
    pub store: StoreConfig,
    pub registry: RegistryConfig,
    pub builder: BuilderConfig,
    pub router: RouterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `redis://host:port`, a bare `host:port`, or `memory` for a
    /// single-process store.
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Lease duration of a service record.
    pub lease_ttl_secs: u64,
    /// Renew this long before the lease runs out.
    pub renew_margin_secs: u64,
    /// Delay before recreating a key the store lost.
    pub recreate_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    pub listen_port: u16,
    /// Address published in the registry. Empty = hostname.
    pub advertised_host: String,
    pub service_name: String,
    /// Empty = `build-{hostname}`.
    pub queue_name: String,
    /// Run packaging out of process. Disabling drops concurrency to 1.
    pub sandboxed: bool,
    /// Max concurrent jobs. 0 = num_cpus + 1.
    pub concurrency: u32,
    pub stage_dir: PathBuf,
    pub temp_dir: PathBuf,
    /// Prepended to `x-file` when uploads live on a different mount.
    pub archive_dir_prefix: Option<PathBuf>,
    pub orphan_ttl_secs: u64,
    pub orphan_check_interval_secs: u64,
    /// Base URL of the notification relay.
    pub notify_endpoint: String,
    /// External packaging command and its leading arguments.
    pub packager_command: Vec<String>,
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub listen_port: u16,
    pub default_worker_port: u16,
    /// Reject routing when the best worker runs more jobs than this. 0 = off.
    pub overload_threshold: u32,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 30,
            renew_margin_secs: 2,
            recreate_backoff_ms: 1000,
        }
    }
}

impl Default for BuilderConfig {
    fn default() -> Self {
        let tmp = std::env::temp_dir().join("foundry");
        Self {
            listen_port: 443,
            advertised_host: String::new(),
            service_name: "builder".to_string(),
            queue_name: String::new(),
            sandboxed: true,
            concurrency: 0,
            stage_dir: tmp.join("stage"),
            temp_dir: tmp.join("tmp"),
            archive_dir_prefix: None,
            orphan_ttl_secs: 60 * 60,
            orphan_check_interval_secs: 60,
            notify_endpoint: "http://nginx:8001".to_string(),
            packager_command: vec!["foundry-package".to_string()],
            shutdown_timeout_secs: 60,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            listen_port: 443,
            default_worker_port: 443,
            overload_threshold: 0,
        }
    }
}

// ── Derived values ────────────────────────────────────────────────────────────

impl RegistryConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    /// Interval between renewals: lease minus safety margin, never zero.
    pub fn renew_interval(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs.saturating_sub(self.renew_margin_secs).max(1))
    }

    pub fn recreate_backoff(&self) -> Duration {
        Duration::from_millis(self.recreate_backoff_ms)
    }

    /// How long a catalog snapshot stays fresh.
    pub fn catalog_freshness(&self) -> Duration {
        self.lease_ttl() * 2
    }
}

impl BuilderConfig {
    pub fn queue_name(&self) -> String {
        if self.queue_name.is_empty() {
            format!("build-{}", hostname())
        } else {
            self.queue_name.clone()
        }
    }

    pub fn advertised_host(&self) -> String {
        if self.advertised_host.is_empty() {
            hostname()
        } else {
            self.advertised_host.clone()
        }
    }

    pub fn concurrency(&self) -> usize {
        if !self.sandboxed {
            return 1;
        }
        if self.concurrency == 0 {
            cpu_count() + 1
        } else {
            self.concurrency as usize
        }
    }

    pub fn orphan_ttl(&self) -> Duration {
        Duration::from_secs(self.orphan_ttl_secs)
    }

    pub fn orphan_check_interval(&self) -> Duration {
        Duration::from_secs(self.orphan_check_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Logical CPUs on this machine.
pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Best-effort hostname without pulling in libc.
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("foundry")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl FoundryConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            FoundryConfig::default()
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("FOUNDRY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&FoundryConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply FOUNDRY_* overrides. `lookup` is the environment in production.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(v: Option<String>, slot: &mut T) {
            if let Some(p) = v.and_then(|v| v.trim().parse().ok()) {
                *slot = p;
            }
        }
        let flag = |v: String| v == "true" || v == "1";

        if let Some(v) = lookup("FOUNDRY_STORE__ENDPOINT").or_else(|| lookup("REDIS_ENDPOINT")) {
            self.store.endpoint = v;
        }
        parse(lookup("FOUNDRY_REGISTRY__LEASE_TTL_SECS"), &mut self.registry.lease_ttl_secs);
        parse(lookup("FOUNDRY_REGISTRY__RENEW_MARGIN_SECS"), &mut self.registry.renew_margin_secs);
        parse(
            lookup("FOUNDRY_REGISTRY__RECREATE_BACKOFF_MS"),
            &mut self.registry.recreate_backoff_ms,
        );
        parse(lookup("FOUNDRY_BUILDER__LISTEN_PORT"), &mut self.builder.listen_port);
        if let Some(v) = lookup("FOUNDRY_BUILDER__ADVERTISED_HOST") {
            self.builder.advertised_host = v.trim().to_string();
        }
        if let Some(v) = lookup("FOUNDRY_BUILDER__SERVICE_NAME").filter(|v| !v.trim().is_empty()) {
            self.builder.service_name = v.trim().to_string();
        }
        if let Some(v) = lookup("FOUNDRY_BUILDER__QUEUE_NAME") {
            self.builder.queue_name = v.trim().to_string();
        }
        if let Some(v) = lookup("FOUNDRY_BUILDER__SANDBOXED") {
            self.builder.sandboxed = flag(v);
        }
        parse(lookup("FOUNDRY_BUILDER__CONCURRENCY"), &mut self.builder.concurrency);
        if let Some(v) = lookup("FOUNDRY_BUILDER__STAGE_DIR") {
            self.builder.stage_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FOUNDRY_BUILDER__TEMP_DIR") {
            self.builder.temp_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FOUNDRY_BUILDER__ARCHIVE_DIR_PREFIX") {
            self.builder.archive_dir_prefix = Some(PathBuf::from(v));
        }
        parse(lookup("FOUNDRY_BUILDER__ORPHAN_TTL_SECS"), &mut self.builder.orphan_ttl_secs);
        parse(
            lookup("FOUNDRY_BUILDER__ORPHAN_CHECK_INTERVAL_SECS"),
            &mut self.builder.orphan_check_interval_secs,
        );
        if let Some(v) = lookup("FOUNDRY_BUILDER__NOTIFY_ENDPOINT") {
            self.builder.notify_endpoint = v;
        }
        // Whitespace separated; arguments with spaces need the config file.
        if let Some(v) = lookup("FOUNDRY_BUILDER__PACKAGER_COMMAND") {
            let command: Vec<String> = v.split_whitespace().map(str::to_string).collect();
            if !command.is_empty() {
                self.builder.packager_command = command;
            }
        }
        parse(
            lookup("FOUNDRY_BUILDER__SHUTDOWN_TIMEOUT_SECS"),
            &mut self.builder.shutdown_timeout_secs,
        );
        parse(lookup("FOUNDRY_ROUTER__LISTEN_PORT"), &mut self.router.listen_port);
        parse(
            lookup("FOUNDRY_ROUTER__DEFAULT_WORKER_PORT"),
            &mut self.router.default_worker_port,
        );
        parse(lookup("FOUNDRY_ROUTER__OVERLOAD_THRESHOLD"), &mut self.router.overload_threshold);
    }
}
