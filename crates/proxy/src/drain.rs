//! Connection draining for graceful stop and reload.
//!
//! Each listener owns a [`DrainTracker`]; every accepted connection holds a
//! guard for its lifetime. Stopping a listener first cancels its accept
//! loop, then waits for guards to release within a bounded grace window
//! before the remaining tasks are aborted.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Grace window allowed for in-flight connections to finish.
pub const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Counts in-flight connections on one listener.
#[derive(Default)]
pub struct DrainTracker {
    active: Arc<AtomicUsize>,
}

impl DrainTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; the guard releases it on drop.
    pub fn enter(&self) -> ConnGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        ConnGuard {
            active: self.active.clone(),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Wait for all connections to finish, up to `grace`. Returns whether
    /// the listener drained fully.
    pub async fn wait(&self, grace: Duration) -> bool {
        let started = Instant::now();
        let initial = self.active();
        if initial == 0 {
            return true;
        }

        info!(active = initial, "draining connections");
        while self.active() > 0 {
            if started.elapsed() > grace {
                warn!(
                    remaining = self.active(),
                    elapsed_ms = started.elapsed().as_millis(),
                    "drain grace expired"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        debug!(elapsed_ms = started.elapsed().as_millis(), "drained");
        true
    }
}

/// RAII guard for one in-flight connection.
pub struct ConnGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guards_track_active_count() {
        let tracker = DrainTracker::new();
        let a = tracker.enter();
        let b = tracker.enter();
        assert_eq!(tracker.active(), 2);

        drop(a);
        assert_eq!(tracker.active(), 1);
        drop(b);
        assert!(tracker.wait(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn wait_times_out_with_connections_held() {
        let tracker = DrainTracker::new();
        let _held = tracker.enter();
        assert!(!tracker.wait(Duration::from_millis(120)).await);
    }
}
