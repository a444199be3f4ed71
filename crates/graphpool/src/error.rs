//! Error types for configuration, drivers, and pools.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::connection::ConnectionId;
use crate::context::ContextId;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Configuration is missing or malformed. Fatal for a worker process.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    Missing(&'static str),

    #[error("invalid configuration value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Errors reported by a graph driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("namespace {name} could not be prepared: {reason}")]
    Namespace { name: String, reason: String },

    #[error("close failed: {0}")]
    Close(String),

    #[error("driver handle already closed")]
    Closed,
}

/// Errors returned to the unit of work that asked for a connection.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connection error: {0}")]
    Connection(#[from] DriverError),

    #[error("connection pool exhausted for {context} (timeout: {timeout:?})")]
    Exhausted { context: ContextId, timeout: Duration },

    #[error("connection pool for {0} is closed")]
    Closed(ContextId),

    #[error("no work context is active on this task or thread")]
    NoContext,

    #[error("worker lifecycle not started: no pool registry installed")]
    NotStarted,

    #[error("connection {0} was already released to its pool")]
    Released(ConnectionId),
}

/// Bookkeeping mistakes made by calling code.
///
/// These are logged and otherwise ignored; they never abort a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolMisuse {
    #[error("connection {connection} belongs to {owner}, not {pool}")]
    ForeignConnection {
        connection: ConnectionId,
        owner: ContextId,
        pool: ContextId,
    },

    #[error("connection {connection} is not checked out from {pool}")]
    NotCheckedOut {
        connection: ConnectionId,
        pool: ContextId,
    },

    #[error("connection {connection} was already released")]
    DoubleRelease { connection: ConnectionId },
}
