use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Lease duration used when `lock.default_ttl_ms` is not configured.
pub const DEFAULT_TTL_MS: u64 = 3000;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub lock: LockConfig,
}

// ---------------------------------------------------------------------------
// Store connection pool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Connection string (e.g. `redis://redis.local:6379`).
    pub endpoint: String,
    /// Enable TLS for the store connection.
    #[serde(default)]
    pub tls: bool,
    /// Name of the environment variable that holds the store password.
    #[serde(default = "default_auth_token_env")]
    pub auth_token_env: String,
    /// Logical database index (0-15).
    #[serde(default)]
    pub database: u8,
    /// Name announced with `CLIENT SETNAME` on every pooled connection.
    #[serde(default)]
    pub client_name: Option<String>,
    /// Number of connections kept in the pool.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// TCP connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Upper bound (milliseconds) on a single store command, including the
    /// time spent waiting for a pooled connection.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    /// PING the store once the pool is connected and refuse to start if it
    /// does not answer.
    #[serde(default = "bool_true")]
    pub verify_on_connect: bool,
}

impl StoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

fn default_auth_token_env() -> String {
    "GLOBALLOCK_STORE_AUTH".to_string()
}

fn default_pool_size() -> usize {
    8
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_max_wait_ms() -> u64 {
    10_000
}

fn bool_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Lock protocol
// ---------------------------------------------------------------------------

/// How a context remembers the tokens it acquired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OwnershipMode {
    /// One remembered token per execution context.  Acquiring a second lock
    /// from the same context replaces the token of the first, so a later
    /// release of the first key becomes a no-op.
    #[default]
    SingleSlot,
    /// One remembered token per `(context, key)` pair.
    PerKey,
}

/// How extension and release verify that the caller still owns a lease.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OwnershipCheck {
    /// GET the current holder, then SET / DEL in a second round trip.  The
    /// lease can expire and change hands between the two commands.
    #[default]
    TwoStep,
    /// Compare and act inside one server-side script.
    Atomic,
}

/// Retry pacing for the blocking acquire loop.
///
/// A zero `initial_backoff_ms` retries immediately after every failed
/// attempt.  Otherwise the delay doubles after each attempt up to
/// `max_backoff_ms`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SpinPolicy {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Randomise each delay within `[delay / 2, delay]`.
    pub jitter: bool,
}

impl SpinPolicy {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LockConfig {
    /// Namespace prepended to every resource key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Lease duration in milliseconds for calls that do not pass one.
    #[serde(default)]
    pub default_ttl_ms: Option<u64>,
    #[serde(default)]
    pub ownership_mode: OwnershipMode,
    #[serde(default)]
    pub ownership_check: OwnershipCheck,
    #[serde(default)]
    pub spin: SpinPolicy,
    /// Give up a blocking acquire after this many milliseconds.  Unset means
    /// wait forever.
    #[serde(default)]
    pub wait_timeout_ms: Option<u64>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            default_ttl_ms: None,
            ownership_mode: OwnershipMode::default(),
            ownership_check: OwnershipCheck::default(),
            spin: SpinPolicy::default(),
            wait_timeout_ms: None,
        }
    }
}

impl LockConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms.unwrap_or(DEFAULT_TTL_MS))
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }
}

fn default_key_prefix() -> String {
    "globallock:lock:".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.store.endpoint.trim().is_empty(),
        "store.endpoint must not be empty"
    );
    anyhow::ensure!(config.store.database < 16, "store.database must be 0-15");
    anyhow::ensure!(config.store.pool_size > 0, "store.pool_size must be at least 1");
    anyhow::ensure!(
        config.store.max_wait_ms > 0,
        "store.max_wait_ms must be greater than zero"
    );
    validate_lock_config(&config.lock)
}

pub fn validate_lock_config(lock: &LockConfig) -> Result<()> {
    anyhow::ensure!(!lock.key_prefix.is_empty(), "lock.key_prefix must not be empty");
    anyhow::ensure!(
        lock.default_ttl_ms != Some(0),
        "lock.default_ttl_ms must be greater than zero"
    );
    anyhow::ensure!(
        lock.wait_timeout_ms != Some(0),
        "lock.wait_timeout_ms must be greater than zero when set"
    );
    anyhow::ensure!(
        lock.spin.max_backoff_ms == 0 || lock.spin.max_backoff_ms >= lock.spin.initial_backoff_ms,
        "lock.spin.max_backoff_ms must not be below initial_backoff_ms"
    );
    Ok(())
}
