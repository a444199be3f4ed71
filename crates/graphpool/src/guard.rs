//! Scoped borrowing: a connection that returns itself to its pool.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::connection::{ConnectionId, PooledConnection};
use crate::context::ContextId;
use crate::driver::{GraphDriver, NamespaceHandle};
use crate::error::{PoolError, PoolMisuse, PoolResult};
use crate::pool::ContextPool;

/// Exclusive access to a pooled connection for the guard's lifetime.
///
/// The connection goes back to the pool exactly once, on [`release`] or on
/// drop, whichever comes first. Dropping during unwinding or cancellation
/// returns it as well. After release every accessor reports
/// [`PoolError::Released`].
///
/// [`release`]: BorrowGuard::release
pub struct BorrowGuard {
    id: ConnectionId,
    conn: Option<PooledConnection>,
    pool: Arc<ContextPool>,
}

impl BorrowGuard {
    pub(crate) fn new(conn: PooledConnection, pool: Arc<ContextPool>) -> Self {
        Self {
            id: conn.id(),
            conn: Some(conn),
            pool,
        }
    }

    /// Return the connection now. Returns `false` (and logs) when it was
    /// already released.
    pub fn release(&mut self) -> bool {
        match self.conn.take() {
            Some(conn) => {
                // Misuse is already logged by the pool.
                let _ = self.pool.return_connection(conn);
                true
            }
            None => {
                let misuse = PoolMisuse::DoubleRelease {
                    connection: self.id,
                };
                warn!(context = %self.pool.context(), error = %misuse, "ignored repeated release");
                false
            }
        }
    }

    /// The borrowed connection.
    pub fn connection(&self) -> PoolResult<&PooledConnection> {
        self.conn.as_ref().ok_or(PoolError::Released(self.id))
    }

    pub fn connection_mut(&mut self) -> PoolResult<&mut PooledConnection> {
        self.conn.as_mut().ok_or(PoolError::Released(self.id))
    }

    /// The exclusive driver handle.
    pub fn driver(&self) -> PoolResult<&dyn GraphDriver> {
        Ok(self.connection()?.driver())
    }

    /// See [`PooledConnection::prepare_namespace`].
    pub async fn prepare_namespace(&mut self, name: &str) -> PoolResult<Arc<NamespaceHandle>> {
        Ok(self.connection_mut()?.prepare_namespace(name).await?)
    }

    pub async fn ping(&self) -> PoolResult<()> {
        Ok(self.connection()?.ping().await?)
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.id
    }

    pub fn context(&self) -> ContextId {
        self.pool.context()
    }

    pub fn pool(&self) -> &Arc<ContextPool> {
        &self.pool
    }

    pub fn is_released(&self) -> bool {
        self.conn.is_none()
    }
}

impl Drop for BorrowGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = self.pool.return_connection(conn);
        }
    }
}

impl fmt::Debug for BorrowGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BorrowGuard")
            .field("connection", &self.id)
            .field("context", &self.pool.context())
            .field("released", &self.is_released())
            .finish()
    }
}
