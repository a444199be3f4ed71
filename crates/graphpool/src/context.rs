//! Work contexts — the isolation boundary for pooled connections.
//!
//! A [`WorkContext`] stands for one cooperative scheduling context, normally a
//! single tokio runtime driven by a dedicated worker thread. Driver handles are
//! bound to the runtime that created them, so every connection pool belongs to
//! exactly one context and never hands a connection to another.
//!
//! A context becomes "current" in one of two ways:
//!
//! ```text
//! WorkContext::enter()      → thread-local slot, for a thread that drives its own runtime
//! WorkContext::scope(fut)   → task-local slot, for one future (takes precedence)
//! ```
//!
//! Liveness is reference-counted: the context is live while any strong
//! `WorkContext` clone exists. The pool registry only keeps a [`WeakContext`],
//! so pooling a connection never extends a context's life.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static TASK_CONTEXT: WorkContext;
}

thread_local! {
    static THREAD_CONTEXT: RefCell<Option<WorkContext>> = const { RefCell::new(None) };
}

/// Process-unique context identifier. Never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(u64);

impl ContextId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

#[derive(Debug)]
struct ContextInner {
    id: ContextId,
    label: String,
}

/// Strong handle to a work context. Cloning shares the same identity.
#[derive(Clone, Debug)]
pub struct WorkContext {
    inner: Arc<ContextInner>,
}

impl WorkContext {
    /// Create a new context with a fresh identity.
    pub fn new(label: impl Into<String>) -> Self {
        let id = ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed));
        let label = label.into();
        tracing::trace!(context = %id, label = %label, "work context created");
        Self {
            inner: Arc::new(ContextInner { id, label }),
        }
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Non-owning handle used for liveness checks.
    pub fn downgrade(&self) -> WeakContext {
        WeakContext {
            id: self.inner.id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// The calling task's context, falling back to the thread's context.
    pub fn current() -> Option<Self> {
        TASK_CONTEXT
            .try_with(Clone::clone)
            .ok()
            .or_else(|| THREAD_CONTEXT.with(|slot| slot.borrow().clone()))
    }

    /// Run `fut` with this context as the current one.
    pub async fn scope<F: Future>(&self, fut: F) -> F::Output {
        TASK_CONTEXT.scope(self.clone(), fut).await
    }

    /// Make this the current context for the calling thread until the guard
    /// is dropped. The previous thread context is restored afterwards.
    pub fn enter(&self) -> EnterGuard {
        let previous = THREAD_CONTEXT.with(|slot| slot.replace(Some(self.clone())));
        EnterGuard {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl PartialEq for WorkContext {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for WorkContext {}

/// Restores the previous thread context on drop.
///
/// Bound to the thread that created it.
#[must_use = "the context is only current while the guard is alive"]
pub struct EnterGuard {
    previous: Option<WorkContext>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        THREAD_CONTEXT.with(|slot| {
            *slot.borrow_mut() = previous;
        });
    }
}

/// Non-owning reference to a work context.
#[derive(Clone, Debug)]
pub struct WeakContext {
    id: ContextId,
    inner: Weak<ContextInner>,
}

impl WeakContext {
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Whether any strong handle to the context still exists.
    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    pub fn upgrade(&self) -> Option<WorkContext> {
        self.inner.upgrade().map(|inner| WorkContext { inner })
    }
}
