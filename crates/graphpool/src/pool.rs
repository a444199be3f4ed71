//! ContextPool — bounded connection pool owned by a single work context.
//!
//! # Architecture
//!
//! ```text
//! checkout()
//!   → wait for a capacity permit (suspends, bounded by acquire_timeout)
//!     → idle connection available → mark in use, return it
//!     → none idle → reserve a slot, open a driver connection outside the lock
//! return_connection(conn)
//!   → foreign connection → reject (routed back to its owner), logged
//!   → move from in_use to available, give the permit back
//! ```
//!
//! The collections live behind a `parking_lot::Mutex` that is never held
//! across an `.await`. Capacity is a tokio semaphore whose permits equal
//! `max_size - in_use`: a checkout forgets its permit and the matching return
//! adds it back.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::connection::{ConnectionId, PooledConnection};
use crate::context::ContextId;
use crate::driver::DriverFactory;
use crate::error::{PoolError, PoolMisuse, PoolResult};
use crate::guard::BorrowGuard;
use crate::stats::{PoolPhase, PoolStats};

#[derive(Debug)]
struct PoolState {
    available: Vec<PooledConnection>,
    in_use: HashSet<ConnectionId>,
    phase: PoolPhase,
    created: u64,
    timeouts: u64,
}

impl PoolState {
    fn total(&self) -> usize {
        self.available.len() + self.in_use.len()
    }
}

/// Connection pool for exactly one work context.
pub struct ContextPool {
    context: ContextId,
    config: Arc<ConnectionConfig>,
    factory: Arc<dyn DriverFactory>,
    state: Mutex<PoolState>,
    capacity: Semaphore,
    waiting: AtomicUsize,
    this: Weak<ContextPool>,
}

impl ContextPool {
    /// Create an empty pool. Connections are opened on demand.
    pub fn new(
        context: ContextId,
        config: Arc<ConnectionConfig>,
        factory: Arc<dyn DriverFactory>,
    ) -> Arc<Self> {
        // Validated configs never exceed MAX_PERMITS; clamp for hand-built ones.
        let capacity = Semaphore::new(config.max_size.min(Semaphore::MAX_PERMITS));
        Arc::new_cyclic(|this| Self {
            context,
            config,
            factory,
            state: Mutex::new(PoolState {
                available: Vec::new(),
                in_use: HashSet::new(),
                phase: PoolPhase::Created,
                created: 0,
                timeouts: 0,
            }),
            capacity,
            waiting: AtomicUsize::new(0),
            this: this.clone(),
        })
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn phase(&self) -> PoolPhase {
        self.state.lock().phase
    }

    /// Check out a connection, reusing an idle one when possible.
    ///
    /// Suspends while the pool is at `max_size`; gives up with
    /// [`PoolError::Exhausted`] after the configured acquire timeout. A failed
    /// or cancelled connection attempt leaves no trace in the pool.
    pub async fn checkout(&self) -> PoolResult<PooledConnection> {
        let permit = self.acquire_permit().await?;

        let reservation = {
            let mut state = self.state.lock();
            if !state.phase.is_open() {
                return Err(PoolError::Closed(self.context));
            }
            state.phase = PoolPhase::Active;

            if let Some(mut conn) = state.available.pop() {
                conn.mark_checked_out();
                state.in_use.insert(conn.id());
                permit.forget();
                debug!(
                    context = %self.context,
                    connection = %conn.id(),
                    idle = state.available.len(),
                    "reused idle connection"
                );
                return Ok(conn);
            }

            let id = ConnectionId::next();
            state.in_use.insert(id);
            Reservation::new(self, id)
        };

        let conn = PooledConnection::create_with_id(
            reservation.id,
            &self.config,
            self.factory.as_ref(),
            self.this.clone(),
            self.context,
        )
        .await;

        let mut conn = match conn {
            Ok(conn) => conn,
            Err(e) => {
                // Dropping the reservation and permit frees the slot.
                warn!(context = %self.context, error = %e, "failed to open connection");
                return Err(e.into());
            }
        };

        let mut state = self.state.lock();
        state.created += 1;
        if !state.phase.is_open() {
            state.in_use.remove(&reservation.id);
            reservation.disarm();
            drop(state);
            conn.close_logged();
            return Err(PoolError::Closed(self.context));
        }
        reservation.disarm();
        conn.mark_checked_out();
        permit.forget();
        debug!(
            context = %self.context,
            connection = %conn.id(),
            total = state.total(),
            max = self.config.max_size,
            "created new connection"
        );
        Ok(conn)
    }

    /// [`checkout`](Self::checkout) wrapped in a guard that returns the
    /// connection when dropped.
    pub async fn borrow(self: &Arc<Self>) -> PoolResult<BorrowGuard> {
        let conn = self.checkout().await?;
        Ok(BorrowGuard::new(conn, Arc::clone(self)))
    }

    async fn acquire_permit(&self) -> PoolResult<SemaphorePermit<'_>> {
        let _waiting = WaitingGuard::new(&self.waiting);
        let acquired =
            tokio::time::timeout(self.config.acquire_timeout, self.capacity.acquire()).await;

        match acquired {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(PoolError::Closed(self.context)),
            Err(_) => {
                let timeouts = {
                    let mut state = self.state.lock();
                    state.timeouts += 1;
                    state.timeouts
                };
                warn!(
                    context = %self.context,
                    max = self.config.max_size,
                    timeout = ?self.config.acquire_timeout,
                    timeouts,
                    "connection pool exhausted"
                );
                Err(PoolError::Exhausted {
                    context: self.context,
                    timeout: self.config.acquire_timeout,
                })
            }
        }
    }

    /// Return a checked-out connection for reuse.
    ///
    /// Misuse is logged and reported, never raised: a connection from another
    /// pool is routed back to its owner (or closed if the owner is gone), and
    /// a connection this pool did not hand out is closed. Returning to a
    /// closed pool closes the connection.
    pub fn return_connection(&self, mut conn: PooledConnection) -> Result<(), PoolMisuse> {
        if !conn.belongs_to(&self.this) {
            let misuse = PoolMisuse::ForeignConnection {
                connection: conn.id(),
                owner: conn.context(),
                pool: self.context,
            };
            warn!(error = %misuse, "rejected connection returned to the wrong pool");
            match conn.owner() {
                Some(owner) => {
                    let _ = owner.return_connection(conn);
                }
                None => conn.close_logged(),
            }
            return Err(misuse);
        }

        let mut state = self.state.lock();
        let was_checked_out = state.in_use.remove(&conn.id());

        if !state.phase.is_open() {
            drop(state);
            debug!(
                context = %self.context,
                connection = %conn.id(),
                "closing connection returned to a closed pool"
            );
            conn.close_logged();
            return Ok(());
        }

        if !was_checked_out {
            drop(state);
            let misuse = PoolMisuse::NotCheckedOut {
                connection: conn.id(),
                pool: self.context,
            };
            warn!(error = %misuse, "closing connection this pool did not hand out");
            conn.close_logged();
            return Err(misuse);
        }

        conn.mark_returned();
        let id = conn.id();
        state.available.push(conn);
        let idle = state.available.len();
        drop(state);

        self.capacity.add_permits(1);
        debug!(context = %self.context, connection = %id, idle, "returned connection to pool");
        Ok(())
    }

    /// Open idle connections until the pool holds `min_size`.
    ///
    /// Stops early, without error, once the pool is busy enough that no
    /// capacity is free.
    pub async fn warm_up(&self) -> PoolResult<usize> {
        let mut opened = 0;
        loop {
            let Ok(permit) = self.capacity.try_acquire() else {
                break;
            };
            let reservation = {
                let mut state = self.state.lock();
                if !state.phase.is_open() {
                    return Err(PoolError::Closed(self.context));
                }
                if state.total() >= self.config.min_size {
                    break;
                }
                let id = ConnectionId::next();
                state.in_use.insert(id);
                Reservation::new(self, id)
            };

            let mut conn = PooledConnection::create_with_id(
                reservation.id,
                &self.config,
                self.factory.as_ref(),
                self.this.clone(),
                self.context,
            )
            .await?;

            let mut state = self.state.lock();
            state.in_use.remove(&reservation.id);
            reservation.disarm();
            state.created += 1;
            if !state.phase.is_open() {
                drop(state);
                conn.close_logged();
                return Err(PoolError::Closed(self.context));
            }
            state.available.push(conn);
            opened += 1;
            drop(permit);
        }

        if opened > 0 {
            info!(
                context = %self.context,
                min = self.config.min_size,
                opened,
                "context pool warmed"
            );
        }
        Ok(opened)
    }

    /// Close every idle connection and stop accepting checkouts.
    ///
    /// Precondition: no connection is checked out. Outstanding connections
    /// (forced shutdown) are closed when they come back. Close failures are
    /// logged and do not stop the remaining closes. Returns the number of
    /// connections closed here.
    pub fn close_all(&self) -> usize {
        let closed = {
            let mut state = self.state.lock();
            if !state.phase.is_open() {
                return 0;
            }
            state.phase = PoolPhase::Closing;

            let outstanding = state.in_use.len();
            if outstanding > 0 {
                warn!(
                    context = %self.context,
                    outstanding,
                    "closing pool while connections are still checked out"
                );
            }

            let mut idle = std::mem::take(&mut state.available);
            for conn in idle.iter_mut() {
                conn.close_logged();
            }
            state.in_use.clear();
            state.phase = PoolPhase::Closed;
            idle.len()
        };

        self.capacity.close();
        info!(context = %self.context, closed, "context pool closed");
        closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            context: self.context,
            phase: state.phase,
            available: state.available.len(),
            in_use: state.in_use.len(),
            total: state.total(),
            max_size: self.config.max_size,
            min_size: self.config.min_size,
            waiting: self.waiting.load(Ordering::Relaxed),
            timeouts: state.timeouts,
            created: state.created,
        }
    }
}

impl fmt::Debug for ContextPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextPool")
            .field("context", &self.context)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// A slot counted in `in_use` while its connection is being opened. Released
/// on drop unless disarmed, so a failed or cancelled open frees the slot.
struct Reservation<'a> {
    pool: &'a ContextPool,
    id: ConnectionId,
    armed: bool,
}

impl<'a> Reservation<'a> {
    fn new(pool: &'a ContextPool, id: ConnectionId) -> Self {
        Self {
            pool,
            id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.state.lock().in_use.remove(&self.id);
        }
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
