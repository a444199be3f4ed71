//! Driver boundary — how pools construct and talk to graph driver handles.
//!
//! The pool never speaks the graph database's wire protocol itself. It asks a
//! [`DriverFactory`] for a fresh [`GraphDriver`] whenever a context-local pool
//! needs another connection, and only uses the handle for namespace
//! preparation, liveness pings and shutdown.

pub mod memory;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ConnectionConfig;
use crate::error::DriverError;

/// A prepared logical namespace (database / graph partition).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceHandle {
    name: String,
    resource: String,
}

impl NamespaceHandle {
    /// `resource` is the driver-specific identifier the name resolved to.
    pub fn new(name: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource: resource.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }
}

/// One live driver connection. Owned exclusively by a `PooledConnection`.
#[async_trait]
pub trait GraphDriver: Send + Sync + fmt::Debug {
    /// Create or validate `name` so queries can target it. Expensive; the
    /// pooled connection caches the result.
    async fn prepare_namespace(&self, name: &str) -> Result<NamespaceHandle, DriverError>;

    /// Round-trip liveness check.
    async fn ping(&self) -> Result<(), DriverError>;

    /// Release the underlying transport. Called at most once.
    fn close(&mut self) -> Result<(), DriverError>;
}

/// Constructs driver handles from the shared configuration.
#[async_trait]
pub trait DriverFactory: Send + Sync + 'static {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn GraphDriver>, DriverError>;
}

#[async_trait]
impl<T: DriverFactory> DriverFactory for Arc<T> {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn GraphDriver>, DriverError> {
        (**self).connect(config).await
    }
}

/// Adapts a plain async constructor into a [`DriverFactory`].
pub struct FnFactory<F> {
    connect: F,
}

/// Build a factory from `f`, which receives its own copy of the config.
pub fn factory_fn<F, Fut>(f: F) -> FnFactory<F>
where
    F: Fn(ConnectionConfig) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Box<dyn GraphDriver>, DriverError>> + Send + 'static,
{
    FnFactory { connect: f }
}

#[async_trait]
impl<F, Fut> DriverFactory for FnFactory<F>
where
    F: Fn(ConnectionConfig) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Box<dyn GraphDriver>, DriverError>> + Send + 'static,
{
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn GraphDriver>, DriverError> {
        (self.connect)(config.clone()).await
    }
}
