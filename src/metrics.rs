//! Metrics collection module for the AutoConv daemon.
//!
//! Tracks frame throughput, manual adjustments, lock events, and other
//! operational counters.

use crate::controller::AdjustDirection;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Metrics data exposed via IPC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsResponse {
    /// Frames processed since daemon start
    pub frames_processed: u64,
    /// Convergence records actually written to the sink
    pub convergence_writes: u64,
    /// Manual increase nudges accepted
    pub manual_increases: u64,
    /// Manual decrease nudges accepted
    pub manual_decreases: u64,
    /// Times the anti-judder lock engaged
    pub locks_engaged: u64,
    /// Lock engagements in the last hour
    pub locks_last_hour: u64,
    /// Enable/disable toggles
    pub toggles: u64,
    /// Uptime in seconds
    pub uptime_sec: u64,
}

/// Metrics collector for the daemon
pub struct MetricsCollector {
    /// Daemon start time
    start_time: Instant,
    frames_processed: AtomicU64,
    convergence_writes: AtomicU64,
    manual_increases: AtomicU64,
    manual_decreases: AtomicU64,
    locks_engaged: AtomicU64,
    toggles: AtomicU64,
    /// Recent lock engagements for the per-hour count
    recent_locks: RwLock<Vec<Instant>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            frames_processed: AtomicU64::new(0),
            convergence_writes: AtomicU64::new(0),
            manual_increases: AtomicU64::new(0),
            manual_decreases: AtomicU64::new(0),
            locks_engaged: AtomicU64::new(0),
            toggles: AtomicU64::new(0),
            recent_locks: RwLock::new(Vec::new()),
        }
    }

    /// Record one processed frame.
    pub fn record_frame(&self) {
        self.frames_processed.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a convergence record written to the sink.
    pub fn record_write(&self) {
        self.convergence_writes.fetch_add(1, Ordering::SeqCst);
    }

    /// Record an accepted manual nudge.
    pub fn record_manual(&self, direction: AdjustDirection) {
        match direction {
            AdjustDirection::Increase => self.manual_increases.fetch_add(1, Ordering::SeqCst),
            AdjustDirection::Decrease => self.manual_decreases.fetch_add(1, Ordering::SeqCst),
        };
    }

    /// Record an anti-judder lock engagement.
    pub fn record_lock(&self) {
        let now = Instant::now();
        self.locks_engaged.fetch_add(1, Ordering::SeqCst);

        if let Ok(mut locks) = self.recent_locks.write() {
            locks.push(now);
            // Keep only the last hour of engagements
            let hour_ago = now - Duration::from_secs(3600);
            locks.retain(|t| *t > hour_ago);
        }
    }

    /// Record an enable/disable toggle.
    pub fn record_toggle(&self) {
        self.toggles.fetch_add(1, Ordering::SeqCst);
    }

    /// Get current metrics
    pub fn get_metrics(&self) -> MetricsResponse {
        let now = Instant::now();
        let uptime = now.duration_since(self.start_time);

        let locks_last_hour = self
            .recent_locks
            .read()
            .map(|locks| {
                let hour_ago = now - Duration::from_secs(3600);
                locks.iter().filter(|t| **t > hour_ago).count() as u64
            })
            .unwrap_or(0);

        MetricsResponse {
            frames_processed: self.frames_processed.load(Ordering::SeqCst),
            convergence_writes: self.convergence_writes.load(Ordering::SeqCst),
            manual_increases: self.manual_increases.load(Ordering::SeqCst),
            manual_decreases: self.manual_decreases.load(Ordering::SeqCst),
            locks_engaged: self.locks_engaged.load(Ordering::SeqCst),
            locks_last_hour,
            toggles: self.toggles.load(Ordering::SeqCst),
            uptime_sec: uptime.as_secs(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
