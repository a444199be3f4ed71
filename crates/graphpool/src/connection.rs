//! PooledConnection — one driver handle plus its per-connection setup cache.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use serde::Serialize;

use crate::config::ConnectionConfig;
use crate::context::ContextId;
use crate::driver::{DriverFactory, GraphDriver, NamespaceHandle};
use crate::error::DriverError;
use crate::pool::ContextPool;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A live driver handle owned by exactly one context-local pool.
///
/// The connection travels with its borrower while checked out, so only one
/// unit of work can reach it at a time. Prepared namespaces are cached for the
/// connection's whole life and dropped only when it is closed.
pub struct PooledConnection {
    id: ConnectionId,
    context: ContextId,
    driver: Box<dyn GraphDriver>,
    namespaces: HashMap<String, Arc<NamespaceHandle>>,
    in_use: bool,
    closed: bool,
    /// Owning pool, for routing returns only.
    pool: Weak<ContextPool>,
    created_at: Instant,
    last_used: Instant,
    checkouts: u64,
}

impl PooledConnection {
    /// Open a new driver handle. Failures are returned as-is; retrying is the
    /// caller's decision.
    pub async fn create(
        config: &ConnectionConfig,
        factory: &dyn DriverFactory,
        pool: Weak<ContextPool>,
        context: ContextId,
    ) -> Result<Self, DriverError> {
        Self::create_with_id(ConnectionId::next(), config, factory, pool, context).await
    }

    pub(crate) async fn create_with_id(
        id: ConnectionId,
        config: &ConnectionConfig,
        factory: &dyn DriverFactory,
        pool: Weak<ContextPool>,
        context: ContextId,
    ) -> Result<Self, DriverError> {
        let driver = factory.connect(config).await?;
        let now = Instant::now();
        tracing::debug!(
            connection = %id,
            context = %context,
            endpoint = %config.endpoint,
            "opened driver connection"
        );
        Ok(Self {
            id,
            context,
            driver,
            namespaces: HashMap::new(),
            in_use: false,
            closed: false,
            pool,
            created_at: now,
            last_used: now,
            checkouts: 0,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Context whose pool owns this connection.
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// The exclusive driver handle. Must not be used after the connection is
    /// returned to its pool.
    pub fn driver(&self) -> &dyn GraphDriver {
        self.driver.as_ref()
    }

    pub fn driver_mut(&mut self) -> &mut dyn GraphDriver {
        self.driver.as_mut()
    }

    /// Return the cached handle for `name`, preparing it on first use.
    ///
    /// Failed preparations are not cached.
    pub async fn prepare_namespace(
        &mut self,
        name: &str,
    ) -> Result<Arc<NamespaceHandle>, DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        if let Some(handle) = self.namespaces.get(name) {
            return Ok(Arc::clone(handle));
        }
        let handle = Arc::new(self.driver.prepare_namespace(name).await?);
        tracing::debug!(
            connection = %self.id,
            namespace = %name,
            cached = self.namespaces.len() + 1,
            "prepared namespace"
        );
        self.namespaces.insert(name.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Liveness check through the driver.
    pub async fn ping(&self) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        self.driver.ping().await
    }

    /// Release the driver handle. Calling again is a no-op.
    pub fn close(&mut self) -> Result<(), DriverError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.in_use = false;
        self.namespaces.clear();
        tracing::debug!(connection = %self.id, context = %self.context, "closing driver connection");
        self.driver.close()
    }

    /// Close and log instead of returning the error.
    pub(crate) fn close_logged(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(
                connection = %self.id,
                context = %self.context,
                error = %e,
                "driver connection did not close cleanly"
            );
        }
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn cached_namespaces(&self) -> usize {
        self.namespaces.len()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// How many times this connection has been checked out.
    pub fn checkouts(&self) -> u64 {
        self.checkouts
    }

    pub(crate) fn belongs_to(&self, pool: &Weak<ContextPool>) -> bool {
        Weak::ptr_eq(&self.pool, pool)
    }

    pub(crate) fn owner(&self) -> Option<Arc<ContextPool>> {
        self.pool.upgrade()
    }

    // Only called by the owning pool while holding its lock.
    pub(crate) fn mark_checked_out(&mut self) {
        self.in_use = true;
        self.checkouts += 1;
        self.last_used = Instant::now();
    }

    pub(crate) fn mark_returned(&mut self) {
        self.in_use = false;
        self.last_used = Instant::now();
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.close_logged();
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("context", &self.context)
            .field("in_use", &self.in_use)
            .field("closed", &self.closed)
            .field("namespaces", &self.namespaces.len())
            .field("checkouts", &self.checkouts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WorkContext;
    use crate::driver::memory::MemoryDriverFactory;

    fn config() -> ConnectionConfig {
        ConnectionConfig::new("memory://graph", "worker", "secret")
    }

    async fn open(factory: &MemoryDriverFactory) -> PooledConnection {
        let ctx = WorkContext::new("conn-test");
        PooledConnection::create(&config(), factory, Weak::new(), ctx.id())
            .await
            .unwrap()
    }

    // ── Create ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn create_opens_one_driver() {
        let factory = MemoryDriverFactory::new();
        let conn = open(&factory).await;
        assert_eq!(factory.stats().connects, 1);
        assert!(!conn.is_in_use());
        assert!(!conn.is_closed());
        assert_eq!(conn.checkouts(), 0);
    }

    #[tokio::test]
    async fn create_failure_propagates() {
        let factory = MemoryDriverFactory::new();
        factory.set_fail_connects(true);
        let ctx = WorkContext::new("fail");
        let result = PooledConnection::create(&config(), &factory, Weak::new(), ctx.id()).await;
        assert!(matches!(result, Err(DriverError::Connect(_))));
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let factory = MemoryDriverFactory::new();
        let a = open(&factory).await;
        let b = open(&factory).await;
        assert_ne!(a.id(), b.id());
    }

    // ── Namespace cache ─────────────────────────────────────────────

    #[tokio::test]
    async fn prepare_namespace_is_cached() {
        let factory = MemoryDriverFactory::new();
        let mut conn = open(&factory).await;

        let first = conn.prepare_namespace("x").await.unwrap();
        let second = conn.prepare_namespace("x").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.stats().prepares, 1);
        assert_eq!(conn.cached_namespaces(), 1);
    }

    #[tokio::test]
    async fn distinct_namespaces_prepared_separately() {
        let factory = MemoryDriverFactory::new();
        let mut conn = open(&factory).await;

        let docs = conn.prepare_namespace("docs").await.unwrap();
        let chunks = conn.prepare_namespace("chunks").await.unwrap();

        assert!(!Arc::ptr_eq(&docs, &chunks));
        assert_eq!(factory.stats().prepares, 2);
        assert_eq!(conn.cached_namespaces(), 2);
    }

    #[tokio::test]
    async fn failed_preparation_not_cached() {
        let factory = MemoryDriverFactory::new();
        let mut conn = open(&factory).await;

        assert!(conn.prepare_namespace("bad name").await.is_err());
        assert!(conn.prepare_namespace("bad name").await.is_err());
        assert_eq!(conn.cached_namespaces(), 0);
    }

    #[tokio::test]
    async fn cache_is_per_connection() {
        let factory = MemoryDriverFactory::new();
        let mut a = open(&factory).await;
        let mut b = open(&factory).await;

        let from_a = a.prepare_namespace("x").await.unwrap();
        let from_b = b.prepare_namespace("x").await.unwrap();

        assert!(!Arc::ptr_eq(&from_a, &from_b));
        assert_eq!(factory.stats().prepares, 2);
    }

    // ── Close ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn close_is_idempotent() {
        let factory = MemoryDriverFactory::new();
        let mut conn = open(&factory).await;

        conn.close().unwrap();
        conn.close().unwrap();

        assert!(conn.is_closed());
        assert_eq!(factory.stats().closes, 1);
    }

    #[tokio::test]
    async fn close_clears_cache_and_blocks_use() {
        let factory = MemoryDriverFactory::new();
        let mut conn = open(&factory).await;
        conn.prepare_namespace("x").await.unwrap();

        conn.close().unwrap();

        assert_eq!(conn.cached_namespaces(), 0);
        assert!(matches!(conn.prepare_namespace("x").await, Err(DriverError::Closed)));
        assert!(matches!(conn.ping().await, Err(DriverError::Closed)));
    }

    #[tokio::test]
    async fn close_error_reported_once() {
        let factory = MemoryDriverFactory::new();
        let mut conn = open(&factory).await;
        factory.set_fail_closes(true);

        assert!(matches!(conn.close(), Err(DriverError::Close(_))));
        assert!(conn.close().is_ok());
        assert_eq!(factory.stats().closes, 1);
    }

    #[tokio::test]
    async fn drop_closes_unclosed_connection() {
        let factory = MemoryDriverFactory::new();
        let conn = open(&factory).await;
        drop(conn);
        assert_eq!(factory.stats().closes, 1);
        assert_eq!(factory.stats().open(), 0);
    }

    #[tokio::test]
    async fn ping_goes_through_driver() {
        let factory = MemoryDriverFactory::new();
        let mut conn = open(&factory).await;
        conn.ping().await.unwrap();
        conn.driver_mut().ping().await.unwrap();
        assert_eq!(factory.stats().pings, 2);
    }
}
