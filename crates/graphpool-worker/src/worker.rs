//! Worker threads: one work context and one single-threaded runtime each.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, anyhow};
use graphpool::driver::memory::{MemoryDriverFactory, MemoryStats};
use graphpool::{
    ConnectionConfig, ContextId, PoolError, PoolResult, PoolStats, WorkContext, lifecycle,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub struct RunOptions {
    pub contexts: usize,
    pub jobs: usize,
    pub concurrency: usize,
    pub namespaces: Vec<String>,
    pub connect_latency: Duration,
}

#[derive(Debug, Serialize)]
pub struct ContextReport {
    pub label: String,
    pub context: ContextId,
    pub warmed: usize,
    pub completed: usize,
    pub failed: usize,
    pub pool: PoolStats,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub contexts: Vec<ContextReport>,
    /// Pools of finished contexts reclaimed after the run.
    pub pools_reclaimed: usize,
    pub driver: MemoryStats,
    pub interrupted: bool,
}

/// Run every context to completion (or until Ctrl-C), then tear the
/// registry down.
pub async fn run(config: ConnectionConfig, options: RunOptions) -> anyhow::Result<RunReport> {
    let factory =
        Arc::new(MemoryDriverFactory::new().with_connect_latency(options.connect_latency));
    let sweep_interval = config.sweep_interval;
    let registry = lifecycle::on_worker_start_with_config(config, Arc::clone(&factory))?;

    // ── Sweeper ────────────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.run_sweeper(sweep_interval, shutdown_rx).await })
    };

    // ── Worker threads ─────────────────────────────────────────

    let stop = Arc::new(AtomicBool::new(false));
    let options = Arc::new(options);
    let mut threads = Vec::with_capacity(options.contexts);
    for index in 0..options.contexts {
        let options = Arc::clone(&options);
        let stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name(format!("graph-worker-{index}"))
            .spawn(move || run_context(index, &options, stop))
            .context("failed to spawn worker thread")?;
        threads.push(handle);
    }

    let joined = tokio::task::spawn_blocking(move || {
        threads
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .map_err(|_| anyhow!("worker thread panicked"))
                    .and_then(|report| report)
            })
            .collect::<anyhow::Result<Vec<_>>>()
    });
    tokio::pin!(joined);

    let mut interrupted = false;
    let reports = tokio::select! {
        res = &mut joined => res??,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, finishing in-flight jobs");
            interrupted = true;
            stop.store(true, Ordering::Relaxed);
            joined.await??
        }
    };

    // ── Shutdown ───────────────────────────────────────────────

    let _ = shutdown_tx.send(true);
    let _ = sweeper.await;

    let pools_reclaimed = registry.sweep();
    let closed = lifecycle::on_worker_stop();
    debug!(pools_reclaimed, closed, "worker registry torn down");

    Ok(RunReport {
        contexts: reports,
        pools_reclaimed,
        driver: factory.stats(),
        interrupted,
    })
}

fn run_context(
    index: usize,
    options: &RunOptions,
    stop: Arc<AtomicBool>,
) -> anyhow::Result<ContextReport> {
    let ctx = WorkContext::new(format!("graph-worker-{index}"));
    let _entered = ctx.enter();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build worker runtime")?;

    runtime.block_on(async {
        let registry = lifecycle::registry().ok_or(PoolError::NotStarted)?;
        let pool = registry.pool_for_current_context()?;
        let warmed = pool.warm_up().await?;

        let next = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let namespaces: Arc<[String]> = options.namespaces.clone().into();
        let jobs = options.jobs;

        // Tasks run on this thread, so they share its work context.
        let mut tasks = JoinSet::new();
        for _ in 0..options.concurrency.max(1) {
            let next = Arc::clone(&next);
            let completed = Arc::clone(&completed);
            let failed = Arc::clone(&failed);
            let namespaces = Arc::clone(&namespaces);
            let stop = Arc::clone(&stop);
            tasks.spawn(async move {
                while !stop.load(Ordering::Relaxed) {
                    let job = next.fetch_add(1, Ordering::Relaxed);
                    if job >= jobs {
                        break;
                    }
                    let namespace = &namespaces[job % namespaces.len()];
                    match run_job(job, namespace).await {
                        Ok(()) => {
                            completed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            warn!(job, namespace = %namespace, error = %e, "graph job failed");
                        }
                    }
                }
            });
        }
        while let Some(res) = tasks.join_next().await {
            res?;
        }

        let stats = pool.stats();
        info!(
            context = %ctx.id(),
            completed = completed.load(Ordering::Relaxed),
            failed = failed.load(Ordering::Relaxed),
            connections = stats.total,
            timeouts = stats.timeouts,
            "work context finished"
        );
        Ok::<_, anyhow::Error>(ContextReport {
            label: ctx.label().to_string(),
            context: ctx.id(),
            warmed,
            completed: completed.load(Ordering::Relaxed),
            failed: failed.load(Ordering::Relaxed),
            pool: stats,
        })
    })
}

async fn run_job(job: usize, namespace: &str) -> PoolResult<()> {
    let mut conn = lifecycle::borrow_connection().await?;
    let handle = conn.prepare_namespace(namespace).await?;
    conn.ping().await?;
    debug!(
        job,
        connection = %conn.connection_id(),
        resource = handle.resource(),
        "graph job done"
    );
    Ok(())
}
