//! Registry integration tests.
//!
//! Each scenario drives real tokio runtimes on dedicated threads, one work
//! context per thread, against the in-memory driver.

use std::sync::Arc;
use std::time::Duration;

use graphpool::driver::memory::MemoryDriverFactory;
use graphpool::{ConnectionConfig, PoolError, PoolPhase, PoolRegistry, WorkContext};

fn setup(max_size: usize) -> (Arc<PoolRegistry>, Arc<MemoryDriverFactory>) {
    let config = ConnectionConfig::new("memory://graph", "worker", "secret")
        .with_max_size(max_size)
        .with_acquire_timeout(Duration::from_secs(2));
    let factory = Arc::new(MemoryDriverFactory::new());
    let registry = Arc::new(PoolRegistry::new(Arc::new(config), factory.clone()));
    (registry, factory)
}

fn current_thread_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// ── Isolation ───────────────────────────────────────────────────────

#[test]
fn contexts_on_separate_runtimes_get_distinct_pools() {
    let (registry, factory) = setup(4);

    let workers: Vec<_> = (0..2)
        .map(|i| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                let ctx = WorkContext::new(format!("worker-{i}"));
                let _entered = ctx.enter();
                current_thread_runtime().block_on(async {
                    let mut guard = registry.borrow_connection().await.unwrap();
                    guard.prepare_namespace("docs").await.unwrap();
                    assert_eq!(guard.context(), ctx.id());
                    (
                        ctx.id(),
                        guard.connection_id(),
                        Arc::as_ptr(guard.pool()) as usize,
                    )
                })
            })
        })
        .collect();

    let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    let (ctx_a, conn_a, pool_a) = results[0];
    let (ctx_b, conn_b, pool_b) = results[1];

    assert_ne!(ctx_a, ctx_b);
    assert_ne!(conn_a, conn_b);
    assert_ne!(pool_a, pool_b);
    assert_eq!(factory.stats().connects, 2);
    assert_eq!(factory.stats().prepares, 2);

    // Both worker threads have exited, so both contexts are gone.
    assert!(registry.stats().is_empty());
    assert_eq!(registry.sweep(), 2);
    assert!(registry.is_empty());
    assert_eq!(factory.stats().closes, 2);
}

#[test]
fn connections_never_cross_contexts() {
    let (registry, factory) = setup(2);

    let workers: Vec<_> = (0..3)
        .map(|i| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                let ctx = WorkContext::new(format!("worker-{i}"));
                let _entered = ctx.enter();
                current_thread_runtime().block_on(async {
                    let mut jobs = Vec::new();
                    for _ in 0..8 {
                        let registry = Arc::clone(&registry);
                        let expected = ctx.id();
                        // Spawned tasks run on this thread, so they see its context.
                        jobs.push(tokio::spawn(async move {
                            let guard = registry.borrow_connection().await.unwrap();
                            assert_eq!(guard.context(), expected);
                            tokio::task::yield_now().await;
                            guard.connection_id()
                        }));
                    }
                    let mut ids = Vec::new();
                    for job in jobs {
                        ids.push(job.await.unwrap());
                    }
                    ids
                })
            })
        })
        .collect();

    let per_context: Vec<Vec<_>> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    for (i, ids) in per_context.iter().enumerate() {
        for (j, other) in per_context.iter().enumerate() {
            if i != j {
                assert!(ids.iter().all(|id| !other.contains(id)));
            }
        }
    }
    // At most max_size connections per context.
    assert!(factory.stats().connects <= 6);
}

#[tokio::test]
async fn task_scope_overrides_thread_context() {
    let (registry, _factory) = setup(2);
    let outer = WorkContext::new("outer");
    let inner = WorkContext::new("inner");

    let pool = {
        let _entered = outer.enter();
        inner
            .scope(async { registry.pool_for_current_context() })
            .await
            .unwrap()
    };

    assert_eq!(pool.context(), inner.id());
    assert!(!registry.contains(outer.id()));
}

// ── Sweep ───────────────────────────────────────────────────────────

#[tokio::test]
async fn sweep_reclaims_finished_context() {
    let (registry, factory) = setup(2);
    let ctx = WorkContext::new("job-runner");
    let id = ctx.id();

    let pool = ctx
        .scope(async {
            let guard = registry.borrow_connection().await.unwrap();
            Arc::clone(guard.pool())
        })
        .await;

    assert_eq!(registry.sweep(), 0);
    assert_eq!(pool.phase(), PoolPhase::Active);

    drop(ctx);
    assert_eq!(registry.sweep(), 1);
    assert!(!registry.contains(id));
    assert_eq!(pool.phase(), PoolPhase::Closed);
    assert_eq!(factory.stats().open(), 0);
}

#[tokio::test]
async fn live_context_is_never_swept() {
    let (registry, _factory) = setup(2);
    let ctx = WorkContext::new("long-lived");
    let before = registry.pool_for(&ctx);

    for _ in 0..3 {
        assert_eq!(registry.sweep(), 0);
    }
    let after = registry.pool_for(&ctx);
    assert!(Arc::ptr_eq(&before, &after));
}

// ── Shutdown ────────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_drains_every_pool() {
    let (registry, factory) = setup(4);
    let contexts: Vec<_> = (0..3).map(|i| WorkContext::new(format!("ctx-{i}"))).collect();

    for ctx in &contexts {
        ctx.scope(async {
            let first = registry.borrow_connection().await.unwrap();
            let second = registry.borrow_connection().await.unwrap();
            assert_ne!(first.connection_id(), second.connection_id());
        })
        .await;
    }
    assert_eq!(factory.stats().connects, 6);
    let idle: usize = registry.stats().iter().map(|s| s.available).sum();
    assert_eq!(idle, 6);

    assert_eq!(registry.close_all_pools(), 6);
    assert_eq!(factory.stats().closes, 6);
    assert!(registry.is_empty());

    // A context that is still live gets a fresh pool on its next borrow.
    let result = contexts[0]
        .scope(async { registry.borrow_connection().await })
        .await;
    assert!(result.is_ok());
    drop(result);
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn exhausted_context_does_not_block_others() {
    let config = ConnectionConfig::new("memory://graph", "worker", "secret")
        .with_max_size(1)
        .with_acquire_timeout(Duration::from_millis(50));
    let registry = PoolRegistry::new(Arc::new(config), Arc::new(MemoryDriverFactory::new()));
    let busy = WorkContext::new("busy");
    let idle = WorkContext::new("idle");

    let _held = busy
        .scope(async { registry.borrow_connection().await.unwrap() })
        .await;

    let blocked = busy.scope(async { registry.borrow_connection().await }).await;
    assert!(matches!(blocked, Err(PoolError::Exhausted { .. })));

    let other = idle.scope(async { registry.borrow_connection().await }).await;
    assert!(other.is_ok());
}
