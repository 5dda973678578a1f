//! Configuration for the lock manager.

use std::time::Duration;

/// Tunables for the client-side lock manager.
#[derive(Debug, Clone)]
pub struct LockManagerConfig {
    /// How long an empty lock entry must sit unused before the idle
    /// collector may reclaim it, in milliseconds.
    pub idle_timeout_ms: u64,
    /// Interval between idle-collection sweeps, in milliseconds.
    pub gc_interval_ms: u64,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 60_000, // 1 minute idle before reclaim
            gc_interval_ms: 10_000,  // sweep every 10 seconds
        }
    }
}

impl LockManagerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        // A zero interval would spin the collector task.
        Duration::from_millis(self.gc_interval_ms.max(100))
    }
}
