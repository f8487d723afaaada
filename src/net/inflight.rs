//! In-flight request tracking.
//!
//! # Responsibilities
//! - Count requests currently being served by one instance
//! - Report how much work a drain left behind
//!
//! # Design Decisions
//! - A guard per request decrements on drop, so panics and cancelled
//!   futures are accounted for

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

/// Shared counter of in-flight requests.
#[derive(Debug, Clone, Default)]
pub struct InflightTracker {
    active_count: Arc<AtomicU64>,
}

impl InflightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new request. Returns a guard that decrements on drop.
    pub fn track(&self) -> InflightGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        InflightGuard {
            active_count: Arc::clone(&self.active_count),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }
}

/// Decrements the tracker when dropped.
#[derive(Debug)]
pub struct InflightGuard {
    active_count: Arc<AtomicU64>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Middleware counting every request that reaches the instance.
pub async fn track_inflight(State(tracker): State<InflightTracker>, request: Request, next: Next) -> Response {
    let _guard = tracker.track();
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_counts() {
        let tracker = InflightTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track();
        let guard2 = tracker.clone().track();
        assert_eq!(tracker.active_count(), 2);

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);

        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
    }
}
