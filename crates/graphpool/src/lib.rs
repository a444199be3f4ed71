//! graphpool — per-context connection pooling for graph database drivers.
//!
//! Driver handles are bound to the scheduling context (event loop) that
//! created them. Background workers that run several contexts side by side
//! therefore get one bounded pool per context:
//! - **context**: `WorkContext` identity, made current per thread or per task
//! - **config**: `ConnectionConfig` from environment / TOML, installed once per process
//! - **driver**: `DriverFactory` / `GraphDriver` boundary, plus an in-memory driver
//! - **connection**: `PooledConnection` with its namespace preparation cache
//! - **pool**: `ContextPool`, bounded checkout/return with acquire timeout
//! - **guard**: `BorrowGuard`, returns its connection exactly once
//! - **registry**: `PoolRegistry`, context → pool map with sweeping of dead contexts
//! - **lifecycle**: worker start/stop hooks and the `borrow_connection` entry point

pub mod config;
pub mod connection;
pub mod context;
pub mod driver;
pub mod error;
pub mod guard;
pub mod lifecycle;
pub mod pool;
pub mod registry;
pub mod stats;

pub use config::ConnectionConfig;
pub use connection::{ConnectionId, PooledConnection};
pub use context::{ContextId, WeakContext, WorkContext};
pub use driver::{DriverFactory, GraphDriver, NamespaceHandle};
pub use error::{ConfigError, DriverError, PoolError, PoolMisuse, PoolResult};
pub use guard::BorrowGuard;
pub use lifecycle::{borrow_connection, on_worker_start, on_worker_stop};
pub use pool::ContextPool;
pub use registry::PoolRegistry;
pub use stats::{PoolPhase, PoolStats};
