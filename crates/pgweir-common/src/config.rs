//! Configuration for pgweir
//!
//! Four YAML files: the app config names the listener and points at the
//! logging, backends and routing configs. Sub-config paths are resolved
//! relative to the app config file's directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeirError};

/// When a backend connection is returned to the idle pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    /// One client = one backend connection until the client disconnects.
    #[default]
    Session,
    /// Return the backend after each transaction (ReadyForQuery 'I').
    Transaction,
    /// Return the backend after each statement (every ReadyForQuery).
    Statement,
}

/// Listener address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_listen_host")]
    pub host: String,
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_listen_host(),
            port: default_listen_port(),
        }
    }
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    6432
}

/// Reference to a sub-config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigRef {
    pub path: String,
}

/// One worker process: owns the pools for the listed backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerEntry {
    pub backends: Vec<String>,
}

/// Main application config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub listen: ListenConfig,
    pub logging: ConfigRef,
    pub backends: ConfigRef,
    pub routing: ConfigRef,
    /// Non-empty: run in dispatcher+workers mode.
    #[serde(default)]
    pub workers: Vec<WorkerEntry>,
}

/// Log file destination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLogConfig {
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub append: bool,
}

/// Logging config: level, format, destination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// error, warn, info or debug
    #[serde(default = "default_log_level")]
    pub level: String,
    /// JSON log format (for production)
    #[serde(default)]
    pub json: bool,
    /// Log to a file instead of stderr
    #[serde(default)]
    pub file: Option<FileLogConfig>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// One configured PostgreSQL backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendEntry {
    pub name: String,
    pub host: String,
    #[serde(default = "default_backend_port")]
    pub port: u16,
    /// Max connections to this backend (0 = unlimited).
    #[serde(default)]
    pub pool_size: u32,
    /// Unset: routing defaults apply.
    #[serde(default)]
    pub pool_mode: Option<PoolMode>,
    /// Close a pooled connection idle longer than this (seconds, 0 = disabled).
    #[serde(default = "default_idle_timeout")]
    pub server_idle_timeout_sec: u32,
    /// Close a connection older than this since creation (seconds, 0 = disabled).
    #[serde(default = "default_lifetime")]
    pub server_lifetime_sec: u32,
    /// Max time to wait in queue for a connection (seconds, 0 = queue default).
    #[serde(default)]
    pub query_wait_timeout_sec: u32,
}

fn default_backend_port() -> u16 {
    5432
}

fn default_idle_timeout() -> u32 {
    600
}

fn default_lifetime() -> u32 {
    3600
}

/// Backends config file: list of PostgreSQL backends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendsConfig {
    pub backends: Vec<BackendEntry>,
}

/// Global routing defaults applied where backends/rules leave fields unset
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingDefaults {
    #[serde(default)]
    pub pool_size: u32,
    #[serde(default)]
    pub pool_mode: PoolMode,
}

/// Matcher for one routing field: a scalar (exact / `foo*` prefix /
/// `~ regex`) or a list (membership).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MatcherSpec {
    One(String),
    Many(Vec<String>),
}

/// One routing rule: conditions + target backend + optional overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    #[serde(default)]
    pub database: Option<MatcherSpec>,
    #[serde(default)]
    pub user: Option<MatcherSpec>,
    pub backend: String,
    #[serde(default)]
    pub pool_size: Option<u32>,
    #[serde(default)]
    pub pool_mode: Option<PoolMode>,
    #[serde(default)]
    pub is_default: bool,
}

/// Routing config file: defaults + ordered rules
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub defaults: RoutingDefaults,
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
}

/// The effective backend for a given (user, database) after the router merges
/// rule overrides onto the backend entry and routing defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBackend {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub pool_size: u32,
    pub pool_mode: PoolMode,
    pub server_idle_timeout_sec: u32,
    pub server_lifetime_sec: u32,
    pub query_wait_timeout_sec: u32,
}

impl BackendEntry {
    /// Pool size after routing defaults (0 stays 0 only if the default is 0 too).
    pub fn effective_pool_size(&self, defaults: &RoutingDefaults) -> u32 {
        if self.pool_size != 0 {
            self.pool_size
        } else {
            defaults.pool_size
        }
    }

    /// Pool mode after routing defaults.
    pub fn effective_pool_mode(&self, defaults: &RoutingDefaults) -> PoolMode {
        self.pool_mode.unwrap_or(defaults.pool_mode)
    }
}

/// If `path` is relative, resolve it against the directory of `base_file`.
pub fn resolve_path(base_file: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        return p.to_path_buf();
    }
    match base_file.parent() {
        Some(dir) => dir.join(p),
        None => p.to_path_buf(),
    }
}

fn load_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let cfg = config::Config::builder()
        .add_source(config::File::from(path).format(config::FileFormat::Yaml))
        .build()
        .map_err(|e| WeirError::ConfigError(format!("{}: {}", path.display(), e)))?;
    cfg.try_deserialize()
        .map_err(|e| WeirError::ConfigError(format!("{}: {}", path.display(), e)))
}

/// Load the main application config. `PGWEIR__`-prefixed environment
/// variables override file values (e.g. `PGWEIR__LISTEN__PORT=7000`).
pub fn load_app_config(path: &Path) -> Result<AppConfig> {
    let cfg = config::Config::builder()
        .add_source(config::File::from(path).format(config::FileFormat::Yaml))
        .add_source(config::Environment::with_prefix("PGWEIR").separator("__"))
        .build()
        .map_err(|e| WeirError::ConfigError(format!("{}: {}", path.display(), e)))?;
    cfg.try_deserialize()
        .map_err(|e| WeirError::ConfigError(format!("{}: {}", path.display(), e)))
}

/// Load the logging config.
pub fn load_logging_config(path: &Path) -> Result<LoggingConfig> {
    load_yaml(path)
}

/// Load the backends config. At least one backend is required.
pub fn load_backends_config(path: &Path) -> Result<BackendsConfig> {
    let cfg: BackendsConfig = load_yaml(path)?;
    if cfg.backends.is_empty() {
        return Err(WeirError::ConfigError(format!(
            "{}: no backends configured",
            path.display()
        )));
    }
    Ok(cfg)
}

/// Load the routing config.
pub fn load_routing_config(path: &Path) -> Result<RoutingConfig> {
    load_yaml(path)
}
