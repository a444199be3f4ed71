//! ConnectionConfig — process-wide graph connection settings.
//!
//! Loaded once per worker process, before any work context exists, and shared
//! read-only by every context-local pool afterwards. The global slot is a
//! plain `parking_lot::Mutex`: it has to be usable from a startup hook that
//! runs outside of any async runtime.
//!
//! Values come from `GRAPHPOOL_*` environment variables, optionally layered
//! over a TOML file:
//!
//! ```toml
//! [graph]
//! uri = "bolt://graph.internal:7687"
//! username = "worker"
//! password = "secret"
//!
//! [pool]
//! max_size = 8
//! min_size = 1
//! acquire_timeout_ms = 5000
//! sweep_interval_secs = 30
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::Semaphore;

use crate::error::ConfigError;

pub const ENV_URI: &str = "GRAPHPOOL_URI";
pub const ENV_USERNAME: &str = "GRAPHPOOL_USERNAME";
pub const ENV_PASSWORD: &str = "GRAPHPOOL_PASSWORD";
pub const ENV_MAX_SIZE: &str = "GRAPHPOOL_POOL_MAX_SIZE";
pub const ENV_MIN_SIZE: &str = "GRAPHPOOL_POOL_MIN_SIZE";
pub const ENV_ACQUIRE_TIMEOUT_MS: &str = "GRAPHPOOL_ACQUIRE_TIMEOUT_MS";
pub const ENV_SWEEP_INTERVAL_SECS: &str = "GRAPHPOOL_SWEEP_INTERVAL_SECS";

const DEFAULT_MAX_SIZE: usize = 10;
const DEFAULT_MIN_SIZE: usize = 0;
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

static GLOBAL_CONFIG: Mutex<Option<Arc<ConnectionConfig>>> = Mutex::new(None);

/// Endpoint, credentials and per-context pool sizing.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Graph database URI, e.g. `bolt://host:7687`.
    pub endpoint: String,
    pub username: String,
    password: String,
    /// Maximum connections per context (default: 10). Zero disables checkout.
    pub max_size: usize,
    /// Connections `ContextPool::warm_up` creates ahead of demand (default: 0).
    pub min_size: usize,
    /// Maximum time a checkout waits for a free connection (default: 30s).
    pub acquire_timeout: Duration,
    /// Period of the background registry sweep (default: 60s).
    pub sweep_interval: Duration,
}

impl ConnectionConfig {
    /// Create a config with default pool sizing.
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            max_size: DEFAULT_MAX_SIZE,
            min_size: DEFAULT_MIN_SIZE,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn with_max_size(self, max_size: usize) -> Self {
        Self { max_size, ..self }
    }

    pub fn with_min_size(self, min_size: usize) -> Self {
        Self { min_size, ..self }
    }

    pub fn with_acquire_timeout(self, acquire_timeout: Duration) -> Self {
        Self {
            acquire_timeout,
            ..self
        }
    }

    pub fn with_sweep_interval(self, sweep_interval: Duration) -> Self {
        Self {
            sweep_interval,
            ..self
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.endpoint.split_once("://") {
            Some((scheme, rest)) if !scheme.is_empty() && !rest.is_empty() => {}
            _ => {
                return Err(ConfigError::Invalid {
                    key: ENV_URI,
                    reason: format!("expected scheme://host, got {:?}", self.endpoint),
                });
            }
        }
        if self.username.is_empty() {
            return Err(ConfigError::Missing(ENV_USERNAME));
        }
        if self.password.is_empty() {
            return Err(ConfigError::Missing(ENV_PASSWORD));
        }
        if self.max_size > Semaphore::MAX_PERMITS {
            return Err(ConfigError::Invalid {
                key: ENV_MAX_SIZE,
                reason: format!(
                    "max_size ({}) exceeds the supported maximum ({})",
                    self.max_size,
                    Semaphore::MAX_PERMITS
                ),
            });
        }
        if self.min_size > self.max_size {
            return Err(ConfigError::Invalid {
                key: ENV_MIN_SIZE,
                reason: format!(
                    "min_size ({}) cannot exceed max_size ({})",
                    self.min_size, self.max_size
                ),
            });
        }
        Ok(())
    }

    /// Resolve every setting through `lookup`, keyed by the `GRAPHPOOL_*`
    /// variable names. Empty values count as absent.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let endpoint = get(ENV_URI).ok_or(ConfigError::Missing(ENV_URI))?;
        let username = get(ENV_USERNAME).ok_or(ConfigError::Missing(ENV_USERNAME))?;
        let password = get(ENV_PASSWORD).ok_or(ConfigError::Missing(ENV_PASSWORD))?;

        let mut config = Self::new(endpoint.trim(), username, password);
        if let Some(v) = get(ENV_MAX_SIZE) {
            config.max_size = parse_value(ENV_MAX_SIZE, &v)?;
        }
        if let Some(v) = get(ENV_MIN_SIZE) {
            config.min_size = parse_value(ENV_MIN_SIZE, &v)?;
        }
        if let Some(v) = get(ENV_ACQUIRE_TIMEOUT_MS) {
            config.acquire_timeout =
                Duration::from_millis(parse_value(ENV_ACQUIRE_TIMEOUT_MS, &v)?);
        }
        if let Some(v) = get(ENV_SWEEP_INTERVAL_SECS) {
            let secs: u64 = parse_value(ENV_SWEEP_INTERVAL_SECS, &v)?;
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    key: ENV_SWEEP_INTERVAL_SECS,
                    reason: "must be at least 1 second".to_string(),
                });
            }
            config.sweep_interval = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Resolve settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parse a TOML config file body (no environment overrides).
    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        Self::layered(src, |_| None)
    }

    /// Load from `path` if given, with environment variables taking
    /// precedence over file values; environment only otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Self::from_env();
        };
        let src = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::layered(&src, |key| std::env::var(key).ok())
    }

    fn layered<F>(src: &str, overrides: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file: ConfigFile = toml::from_str(src)?;
        let values = file.into_values();
        Self::from_lookup(|key| overrides(key).or_else(|| values.get(key).cloned()))
    }

    /// The process-wide config, loading it from the environment on first use.
    pub fn get_or_init() -> Result<Arc<Self>, ConfigError> {
        Self::get_or_init_with(Self::from_env)
    }

    /// Like [`get_or_init`](Self::get_or_init), but the first caller's `load`
    /// decides the config. Later callers get the installed one unchanged.
    pub fn get_or_init_with<F>(load: F) -> Result<Arc<Self>, ConfigError>
    where
        F: FnOnce() -> Result<Self, ConfigError>,
    {
        let mut slot = GLOBAL_CONFIG.lock();
        if let Some(existing) = slot.as_ref() {
            return Ok(Arc::clone(existing));
        }
        let config = load()?;
        config.validate()?;
        tracing::info!(
            endpoint = %config.endpoint,
            max_size = config.max_size,
            min_size = config.min_size,
            acquire_timeout = ?config.acquire_timeout,
            "connection config initialized"
        );
        let config = Arc::new(config);
        *slot = Some(Arc::clone(&config));
        Ok(config)
    }

    /// The installed process-wide config, if any.
    pub fn global() -> Option<Arc<Self>> {
        GLOBAL_CONFIG.lock().clone()
    }

    /// JSON view with the password redacted.
    pub fn redacted(&self) -> serde_json::Value {
        serde_json::json!({
            "endpoint": self.endpoint,
            "username": self.username,
            "password": "***",
            "max_size": self.max_size,
            "min_size": self.min_size,
            "acquire_timeout_ms": self.acquire_timeout.as_millis() as u64,
            "sweep_interval_secs": self.sweep_interval.as_secs(),
        })
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &"***")
            .field("max_size", &self.max_size)
            .field("min_size", &self.min_size)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("sweep_interval", &self.sweep_interval)
            .finish()
    }
}

fn parse_value<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: format!("{value:?}: {e}"),
        })
}

// ── File format ─────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    graph: GraphSection,
    #[serde(default)]
    pool: PoolSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GraphSection {
    uri: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PoolSection {
    max_size: Option<usize>,
    min_size: Option<usize>,
    acquire_timeout_ms: Option<u64>,
    sweep_interval_secs: Option<u64>,
}

impl ConfigFile {
    /// Flatten into the same keys the environment uses.
    fn into_values(self) -> HashMap<&'static str, String> {
        let mut values = HashMap::new();
        let mut put = |key, value: Option<String>| {
            if let Some(value) = value {
                values.insert(key, value);
            }
        };
        put(ENV_URI, self.graph.uri);
        put(ENV_USERNAME, self.graph.username);
        put(ENV_PASSWORD, self.graph.password);
        put(ENV_MAX_SIZE, self.pool.max_size.map(|v| v.to_string()));
        put(ENV_MIN_SIZE, self.pool.min_size.map(|v| v.to_string()));
        put(
            ENV_ACQUIRE_TIMEOUT_MS,
            self.pool.acquire_timeout_ms.map(|v| v.to_string()),
        );
        put(
            ENV_SWEEP_INTERVAL_SECS,
            self.pool.sweep_interval_secs.map(|v| v.to_string()),
        );
        values
    }
}
