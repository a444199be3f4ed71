//! Worker lifecycle hooks.
//!
//! A worker process calls [`on_worker_start`] once when it boots and
//! [`on_worker_stop`] when it is asked to shut down. In between, unit-of-work
//! code only ever calls [`borrow_connection`].

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::config::ConnectionConfig;
use crate::driver::DriverFactory;
use crate::error::{ConfigError, PoolError, PoolResult};
use crate::guard::BorrowGuard;
use crate::registry::PoolRegistry;

static REGISTRY: Mutex<Option<Arc<PoolRegistry>>> = Mutex::new(None);

/// Load the process configuration and install the pool registry.
///
/// A second call returns the already-installed registry.
pub fn on_worker_start<F: DriverFactory>(factory: F) -> Result<Arc<PoolRegistry>, ConfigError> {
    install(ConnectionConfig::get_or_init, factory)
}

/// Like [`on_worker_start`] with an explicit config. The config becomes the
/// process-wide one unless another was installed first.
pub fn on_worker_start_with_config<F: DriverFactory>(
    config: ConnectionConfig,
    factory: F,
) -> Result<Arc<PoolRegistry>, ConfigError> {
    install(
        move || ConnectionConfig::get_or_init_with(move || Ok(config)),
        factory,
    )
}

fn install<L, F>(load: L, factory: F) -> Result<Arc<PoolRegistry>, ConfigError>
where
    L: FnOnce() -> Result<Arc<ConnectionConfig>, ConfigError>,
    F: DriverFactory,
{
    let mut slot = REGISTRY.lock();
    if let Some(existing) = slot.as_ref() {
        return Ok(Arc::clone(existing));
    }
    let config = load()?;
    let registry = Arc::new(PoolRegistry::new(config, Arc::new(factory)));
    *slot = Some(Arc::clone(&registry));
    info!(
        max_size = registry.config().max_size,
        endpoint = %registry.config().endpoint,
        "worker pool registry installed"
    );
    Ok(registry)
}

/// Close every pool and uninstall the registry. Returns the number of
/// connections closed; 0 when nothing was installed.
pub fn on_worker_stop() -> usize {
    let Some(registry) = REGISTRY.lock().take() else {
        return 0;
    };
    let closed = registry.close_all_pools();
    info!(connections = closed, "worker pool registry shut down");
    closed
}

/// The installed registry, if the worker has started.
pub fn registry() -> Option<Arc<PoolRegistry>> {
    REGISTRY.lock().clone()
}

/// Borrow a connection for the current unit of work.
pub async fn borrow_connection() -> PoolResult<BorrowGuard> {
    let registry = registry().ok_or(PoolError::NotStarted)?;
    registry.borrow_connection().await
}

/// Start/stop hooks bundled for a task-queue integration that wants one
/// object to register.
pub struct WorkerHooks<F> {
    factory: Arc<F>,
}

impl<F: DriverFactory> WorkerHooks<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory: Arc::new(factory),
        }
    }

    /// Process boot. Later calls return the installed registry.
    pub fn process_started(&self) -> Result<Arc<PoolRegistry>, ConfigError> {
        on_worker_start(Arc::clone(&self.factory))
    }

    /// Process shutdown.
    pub fn process_stopping(&self) -> usize {
        on_worker_stop()
    }
}
