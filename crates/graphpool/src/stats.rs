//! Pool statistics types.

use serde::Serialize;

use crate::context::ContextId;

/// Lifecycle of a context-local pool.
///
/// ```text
/// Created → Active → Closing → Closed → (removed from the registry)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolPhase {
    /// Registered, no checkout yet.
    Created,
    /// At least one checkout has happened.
    Active,
    /// `close_all` is running.
    Closing,
    /// All idle connections closed; no further checkouts.
    Closed,
}

impl PoolPhase {
    /// Whether checkouts are still accepted.
    pub fn is_open(self) -> bool {
        matches!(self, PoolPhase::Created | PoolPhase::Active)
    }
}

/// Point-in-time view of one context's pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub context: ContextId,
    pub phase: PoolPhase,
    /// Idle connections ready for checkout.
    pub available: usize,
    /// Connections checked out (or being opened for a checkout).
    pub in_use: usize,
    /// `available + in_use`.
    pub total: usize,
    pub max_size: usize,
    pub min_size: usize,
    /// Checkouts currently waiting for capacity.
    pub waiting: usize,
    /// Checkouts that gave up after the acquire timeout.
    pub timeouts: u64,
    /// Connections ever opened by this pool.
    pub created: u64,
}

impl PoolStats {
    /// Fraction of `max_size` currently checked out (0.0 when `max_size` is 0).
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            self.in_use as f64 / self.max_size as f64
        }
    }

    /// Every permitted connection is checked out.
    pub fn is_saturated(&self) -> bool {
        self.in_use >= self.max_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WorkContext;

    fn stats(in_use: usize, available: usize, max_size: usize) -> PoolStats {
        PoolStats {
            context: WorkContext::new("stats").id(),
            phase: PoolPhase::Active,
            available,
            in_use,
            total: in_use + available,
            max_size,
            min_size: 0,
            waiting: 0,
            timeouts: 0,
            created: (in_use + available) as u64,
        }
    }

    #[test]
    fn utilization() {
        assert!((stats(2, 1, 4).utilization() - 0.5).abs() < 0.001);
        assert!((stats(4, 0, 4).utilization() - 1.0).abs() < 0.001);
        assert!((stats(0, 0, 0).utilization() - 0.0).abs() < 0.001);
    }

    #[test]
    fn saturation() {
        assert!(stats(4, 0, 4).is_saturated());
        assert!(!stats(3, 1, 4).is_saturated());
        assert!(stats(0, 0, 0).is_saturated());
    }

    #[test]
    fn phase_openness() {
        assert!(PoolPhase::Created.is_open());
        assert!(PoolPhase::Active.is_open());
        assert!(!PoolPhase::Closing.is_open());
        assert!(!PoolPhase::Closed.is_open());
    }

    #[test]
    fn serializes_for_dashboards() {
        let value = serde_json::to_value(stats(1, 2, 5)).unwrap();
        assert_eq!(value["phase"], "active");
        assert_eq!(value["in_use"], 1);
        assert_eq!(value["available"], 2);
        assert_eq!(value["total"], 3);
        assert!(value["context"].is_u64());
    }
}
