//! In-process graph driver for tests and dry runs.
//!
//! Every handle shares one set of counters with the factory that created it,
//! so callers can observe how many connections were opened, prepared and
//! closed. Connect latency and connect/close failures can be injected.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

use super::{DriverFactory, GraphDriver, NamespaceHandle};
use crate::config::ConnectionConfig;
use crate::error::DriverError;

#[derive(Debug, Default)]
struct SharedState {
    next_id: AtomicU64,
    connects: AtomicU64,
    closes: AtomicU64,
    prepares: AtomicU64,
    pings: AtomicU64,
    fail_connects: AtomicBool,
    fail_closes: AtomicBool,
    close_latency_ms: AtomicU64,
    closed_ids: Mutex<HashSet<u64>>,
}

/// Counter snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub connects: u64,
    pub closes: u64,
    pub prepares: u64,
    pub pings: u64,
}

impl MemoryStats {
    /// Handles created but not yet closed.
    pub fn open(&self) -> u64 {
        self.connects.saturating_sub(self.closes)
    }
}

/// Factory producing [`MemoryDriver`] handles.
#[derive(Debug, Default)]
pub struct MemoryDriverFactory {
    state: Arc<SharedState>,
    connect_latency: Duration,
}

impl MemoryDriverFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every `connect` to mimic handshake cost.
    pub fn with_connect_latency(self, connect_latency: Duration) -> Self {
        Self {
            connect_latency,
            ..self
        }
    }

    /// Make subsequent connects fail with `DriverError::Connect`.
    pub fn set_fail_connects(&self, fail: bool) {
        self.state.fail_connects.store(fail, Ordering::Relaxed);
    }

    /// Make closes (of existing and future handles) report an error.
    pub fn set_fail_closes(&self, fail: bool) {
        self.state.fail_closes.store(fail, Ordering::Relaxed);
    }

    /// Block inside every `close` this long, like a driver flushing its
    /// transport synchronously.
    pub fn set_close_latency(&self, latency: Duration) {
        self.state
            .close_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            connects: self.state.connects.load(Ordering::Relaxed),
            closes: self.state.closes.load(Ordering::Relaxed),
            prepares: self.state.prepares.load(Ordering::Relaxed),
            pings: self.state.pings.load(Ordering::Relaxed),
        }
    }

    /// Whether the handle with `id` has received its close call.
    pub fn is_closed(&self, id: u64) -> bool {
        self.state.closed_ids.lock().contains(&id)
    }
}

#[async_trait]
impl DriverFactory for MemoryDriverFactory {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn GraphDriver>, DriverError> {
        if !self.connect_latency.is_zero() {
            tokio::time::sleep(self.connect_latency).await;
        }
        if self.state.fail_connects.load(Ordering::Relaxed) {
            return Err(DriverError::Connect(format!(
                "{} refused connection",
                config.endpoint
            )));
        }
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.state.connects.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(driver = id, endpoint = %config.endpoint, "memory driver connected");
        Ok(Box::new(MemoryDriver {
            id,
            endpoint: config.endpoint.clone(),
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

/// A driver handle with no transport behind it.
#[derive(Debug)]
pub struct MemoryDriver {
    id: u64,
    endpoint: String,
    state: Arc<SharedState>,
    closed: bool,
}

impl MemoryDriver {
    /// A handle not attached to any factory.
    pub fn detached(id: u64) -> Self {
        Self {
            id,
            endpoint: "memory://detached".to_string(),
            state: Arc::default(),
            closed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl GraphDriver for MemoryDriver {
    async fn prepare_namespace(&self, name: &str) -> Result<NamespaceHandle, DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        let valid = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if name.is_empty() || !valid {
            return Err(DriverError::Namespace {
                name: name.to_string(),
                reason: "names may only contain ASCII letters, digits, '_' and '-'".to_string(),
            });
        }
        self.state.prepares.fetch_add(1, Ordering::Relaxed);
        Ok(NamespaceHandle::new(
            name,
            format!("{}/{}", self.endpoint.trim_end_matches('/'), name),
        ))
    }

    async fn ping(&self) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        self.state.pings.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        self.closed = true;
        let latency = self.state.close_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            std::thread::sleep(Duration::from_millis(latency));
        }
        self.state.closes.fetch_add(1, Ordering::Relaxed);
        self.state.closed_ids.lock().insert(self.id);
        if self.state.fail_closes.load(Ordering::Relaxed) {
            return Err(DriverError::Close(format!(
                "driver {} did not shut down cleanly",
                self.id
            )));
        }
        Ok(())
    }
}
