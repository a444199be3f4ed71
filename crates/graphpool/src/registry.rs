//! PoolRegistry — process-wide map from work context to its pool.
//!
//! # Architecture
//!
//! ```text
//! pool_for(ctx)
//!   → lock map
//!     → entry exists → clone the Arc<ContextPool>
//!     → missing or closed → unlink dead contexts, insert an empty pool
//!   → after the lock: close the unlinked pools
//! sweep()
//!   → under the lock: unlink every entry whose context has no strong handle left
//!   → after the lock: close_all() on each unlinked pool
//! ```
//!
//! The map holds only a weak reference to each context, so an idle pool never
//! keeps its context alive. Driver closes never run under the registry lock;
//! an unlinked pool is unreachable through the registry, so no lookup can hand
//! out a pool that is being closed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::ConnectionConfig;
use crate::context::{ContextId, WeakContext, WorkContext};
use crate::driver::DriverFactory;
use crate::error::{PoolError, PoolResult};
use crate::guard::BorrowGuard;
use crate::pool::ContextPool;
use crate::stats::PoolStats;

struct RegistryEntry {
    context: WeakContext,
    pool: Arc<ContextPool>,
}

/// Maps every live work context to its own [`ContextPool`].
pub struct PoolRegistry {
    config: Arc<ConnectionConfig>,
    factory: Arc<dyn DriverFactory>,
    pools: Mutex<HashMap<ContextId, RegistryEntry>>,
}

impl PoolRegistry {
    pub fn new(config: Arc<ConnectionConfig>, factory: Arc<dyn DriverFactory>) -> Self {
        Self {
            config,
            factory,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Arc<ConnectionConfig> {
        &self.config
    }

    /// Pool of the caller's current context. Never suspends.
    pub fn pool_for_current_context(&self) -> PoolResult<Arc<ContextPool>> {
        let context = WorkContext::current().ok_or(PoolError::NoContext)?;
        Ok(self.pool_for(&context))
    }

    /// Pool of `context`, created empty on first use.
    ///
    /// A pool that was closed while its context is still live is replaced
    /// with a fresh one.
    pub fn pool_for(&self, context: &WorkContext) -> Arc<ContextPool> {
        let (pool, dead) = {
            let mut pools = self.pools.lock();
            if let Some(entry) = pools.get(&context.id()) {
                if entry.pool.phase().is_open() {
                    return Arc::clone(&entry.pool);
                }
                debug!(context = %context.id(), "replacing closed context pool");
            }

            let dead = take_dead(&mut pools);
            let pool = ContextPool::new(
                context.id(),
                Arc::clone(&self.config),
                Arc::clone(&self.factory),
            );
            pools.insert(
                context.id(),
                RegistryEntry {
                    context: context.downgrade(),
                    pool: Arc::clone(&pool),
                },
            );
            info!(
                context = %context.id(),
                label = %context.label(),
                pools = pools.len(),
                swept = dead.len(),
                "registered context pool"
            );
            (pool, dead)
        };

        close_pools(dead);
        pool
    }

    /// Borrow a connection from the current context's pool.
    pub async fn borrow_connection(&self) -> PoolResult<BorrowGuard> {
        let pool = self.pool_for_current_context()?;
        pool.borrow().await
    }

    /// Close and remove the pools of contexts that no longer exist.
    ///
    /// Returns the number of pools removed.
    pub fn sweep(&self) -> usize {
        let dead = take_dead(&mut self.pools.lock());
        close_pools(dead)
    }

    /// Close every pool, including those of live contexts, and empty the
    /// registry. Returns the number of connections closed.
    pub fn close_all_pools(&self) -> usize {
        let drained: Vec<RegistryEntry> = {
            let mut pools = self.pools.lock();
            pools.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        let closed = drained.iter().map(|entry| entry.pool.close_all()).sum();
        info!(pools = count, connections = closed, "closed all context pools");
        closed
    }

    /// Stats for every live context, ordered by context id.
    pub fn stats(&self) -> Vec<PoolStats> {
        let pools = self.pools.lock();
        let mut stats: Vec<PoolStats> = pools
            .values()
            .filter(|entry| entry.context.is_alive())
            .map(|entry| entry.pool.stats())
            .collect();
        stats.sort_by_key(|s| s.context);
        stats
    }

    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.lock().is_empty()
    }

    pub fn contains(&self, context: ContextId) -> bool {
        self.pools.lock().contains_key(&context)
    }

    /// Emit one log line per live pool.
    pub fn log_stats(&self) {
        for s in self.stats() {
            info!(
                context = %s.context,
                phase = ?s.phase,
                available = s.available,
                in_use = s.in_use,
                total = s.total,
                waiting = s.waiting,
                timeouts = s.timeouts,
                "context pool stats"
            );
        }
    }

    /// Sweep every `interval` until `shutdown` changes.
    pub async fn run_sweeper(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "pool sweeper started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let removed = self.sweep();
                    if removed > 0 {
                        debug!(removed, remaining = self.len(), "swept dead context pools");
                    }
                }
                _ = shutdown.changed() => {
                    info!("pool sweeper shutting down");
                    break;
                }
            }
        }
    }
}

/// Unlink entries whose context is gone. Their pools are closed by the
/// caller after the registry lock is released.
fn take_dead(pools: &mut HashMap<ContextId, RegistryEntry>) -> Vec<Arc<ContextPool>> {
    let dead: Vec<ContextId> = pools
        .iter()
        .filter(|(_, entry)| !entry.context.is_alive())
        .map(|(id, _)| *id)
        .collect();
    dead.iter()
        .filter_map(|id| pools.remove(id))
        .map(|entry| entry.pool)
        .collect()
}

fn close_pools(pools: Vec<Arc<ContextPool>>) -> usize {
    for pool in &pools {
        let closed = pool.close_all();
        debug!(context = %pool.context(), closed, "reclaimed pool of finished context");
    }
    pools.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::driver::memory::MemoryDriverFactory;
    use crate::stats::PoolPhase;

    fn registry() -> (PoolRegistry, Arc<MemoryDriverFactory>) {
        let config = ConnectionConfig::new("memory://graph", "worker", "secret")
            .with_max_size(2)
            .with_acquire_timeout(Duration::from_millis(100));
        let factory = Arc::new(MemoryDriverFactory::new());
        (PoolRegistry::new(Arc::new(config), factory.clone()), factory)
    }

    // ── Lookup ──────────────────────────────────────────────────────

    #[test]
    fn same_context_same_pool() {
        let (registry, _) = registry();
        let ctx = WorkContext::new("a");

        let first = registry.pool_for(&ctx);
        let second = registry.pool_for(&ctx);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(ctx.id()));
    }

    #[test]
    fn different_contexts_different_pools() {
        let (registry, _) = registry();
        let a = WorkContext::new("a");
        let b = WorkContext::new("b");

        let pa = registry.pool_for(&a);
        let pb = registry.pool_for(&b);

        assert!(!Arc::ptr_eq(&pa, &pb));
        assert_eq!(pa.context(), a.id());
        assert_eq!(pb.context(), b.id());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn no_context_is_an_error() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.pool_for_current_context(),
            Err(PoolError::NoContext)
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn current_context_from_thread() {
        let (registry, _) = registry();
        let ctx = WorkContext::new("thread");
        let _entered = ctx.enter();

        let pool = registry.pool_for_current_context().unwrap();
        assert_eq!(pool.context(), ctx.id());
    }

    #[tokio::test]
    async fn borrow_uses_task_context() {
        let (registry, factory) = registry();
        let ctx = WorkContext::new("task");

        let id = ctx
            .scope(async {
                let guard = registry.borrow_connection().await.unwrap();
                guard.context()
            })
            .await;

        assert_eq!(id, ctx.id());
        assert_eq!(factory.stats().connects, 1);
        assert_eq!(registry.pool_for(&ctx).stats().available, 1);
    }

    #[tokio::test]
    async fn borrow_without_context_fails() {
        let (registry, factory) = registry();
        let result = registry.borrow_connection().await;
        assert!(matches!(result, Err(PoolError::NoContext)));
        assert_eq!(factory.stats().connects, 0);
    }

    // ── Sweep ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn sweep_reclaims_dead_context() {
        let (registry, factory) = registry();
        let ctx = WorkContext::new("short-lived");
        let id = ctx.id();
        let pool = registry.pool_for(&ctx);
        drop(pool.borrow().await.unwrap());

        assert_eq!(registry.sweep(), 0);
        drop(ctx);

        assert_eq!(registry.sweep(), 1);
        assert!(!registry.contains(id));
        assert_eq!(pool.phase(), PoolPhase::Closed);
        assert_eq!(factory.stats().closes, 1);
    }

    #[test]
    fn insert_sweeps_first() {
        let (registry, _) = registry();
        let dead = WorkContext::new("dead");
        let dead_id = dead.id();
        registry.pool_for(&dead);
        drop(dead);

        let live = WorkContext::new("live");
        registry.pool_for(&live);

        assert!(!registry.contains(dead_id));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn slow_close_does_not_block_lookups() {
        let (registry, factory) = registry();
        let registry = Arc::new(registry);
        let live = WorkContext::new("live");
        let live_pool = registry.pool_for(&live);

        let dead = WorkContext::new("dead");
        let dead_id = dead.id();
        drop(registry.pool_for(&dead).borrow().await.unwrap());
        drop(dead);
        factory.set_close_latency(Duration::from_millis(500));

        let sweeper = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.sweep())
        };
        // The sweeper unlinks first, then sits in the slow close.
        while registry.contains(dead_id) {
            std::thread::sleep(Duration::from_millis(1));
        }

        let started = std::time::Instant::now();
        let again = registry.pool_for(&live);
        let another = registry.pool_for(&WorkContext::new("newcomer"));
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(Arc::ptr_eq(&live_pool, &again));
        assert_eq!(another.phase(), PoolPhase::Created);

        assert_eq!(sweeper.join().unwrap(), 1);
        assert_eq!(factory.stats().closes, 1);
    }

    #[tokio::test]
    async fn closed_pool_of_live_context_is_replaced() {
        let (registry, factory) = registry();
        let ctx = WorkContext::new("reopened");
        let first = registry.pool_for(&ctx);
        drop(first.borrow().await.unwrap());
        first.close_all();

        let second = registry.pool_for(&ctx);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.phase(), PoolPhase::Created);
        assert_eq!(registry.len(), 1);

        let id = ctx
            .scope(async { registry.borrow_connection().await.unwrap().context() })
            .await;
        assert_eq!(id, ctx.id());
        assert_eq!(factory.stats().connects, 2);
    }

    #[test]
    fn stats_skip_dead_contexts() {
        let (registry, _) = registry();
        let b = WorkContext::new("b");
        let a = WorkContext::new("a");
        let dead = WorkContext::new("dead");
        registry.pool_for(&a);
        registry.pool_for(&b);
        registry.pool_for(&dead);
        drop(dead);

        let stats = registry.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].context, b.id());
        assert_eq!(stats[1].context, a.id());
    }

    // ── Shutdown ────────────────────────────────────────────────────

    #[tokio::test]
    async fn close_all_pools_closes_live_pools() {
        let (registry, factory) = registry();
        let a = WorkContext::new("a");
        let b = WorkContext::new("b");
        for ctx in [&a, &b] {
            let pool = registry.pool_for(ctx);
            let one = pool.borrow().await.unwrap();
            let two = pool.borrow().await.unwrap();
            drop((one, two));
        }

        assert_eq!(registry.close_all_pools(), 4);
        assert!(registry.is_empty());
        assert_eq!(factory.stats().closes, 4);
        assert_eq!(factory.stats().open(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_until_shutdown() {
        let (registry, _) = registry();
        let registry = Arc::new(registry);
        let dead = WorkContext::new("dead");
        registry.pool_for(&dead);
        drop(dead);

        let (tx, rx) = watch::channel(false);
        let sweeper = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.run_sweeper(Duration::from_secs(1), rx).await })
        };

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(registry.is_empty());

        tx.send(true).unwrap();
        sweeper.await.unwrap();
    }
}
