//! In-flight request tracking for graceful drain.
//!
//! # Responsibilities
//! - Count requests currently being handled
//! - Let the shutdown sequence wait until the count reaches zero
//!
//! # Design Decisions
//! - The count lives in a watch channel so waiting needs no polling
//! - Guards decrement on drop, so a panicking handler still releases its slot

use std::sync::Arc;
use tokio::sync::watch;

/// Shared counter of in-flight requests.
#[derive(Debug, Clone)]
pub struct InFlightTracker {
    count: Arc<watch::Sender<usize>>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { count: Arc::new(tx) }
    }

    /// Record a new in-flight request. The returned guard ends it on drop.
    pub fn track(&self) -> InFlightGuard {
        self.count.send_modify(|n| *n += 1);
        InFlightGuard {
            count: Arc::clone(&self.count),
        }
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Resolve once no requests are in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        // The sender is owned by `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for InFlightTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks one request as in flight for as long as it is held.
#[derive(Debug)]
pub struct InFlightGuard {
    count: Arc<watch::Sender<usize>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.count.send_modify(|n| *n = n.saturating_sub(1));
    }
}
