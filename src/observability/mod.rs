//! Delivery metrics and timing.
//!
//! The process keeps one set of delivery counters, reachable through
//! [`DeliveryMetrics::global`]. Counters are only ever incremented; read
//! them with [`DeliveryMetrics::snapshot`] and compare snapshots to get
//! per-interval numbers.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static GLOBAL_METRICS: DeliveryMetrics = DeliveryMetrics::new();

/// Delivery counters.
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    /// Send attempts, including ones that failed.
    attempted: AtomicU64,
    /// Messages the server accepted.
    sent: AtomicU64,
    /// Failed sends, excluding malformed addresses.
    failed: AtomicU64,
}

impl DeliveryMetrics {
    /// Creates a zeroed set of counters.
    pub const fn new() -> Self {
        Self {
            attempted: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Returns the process-wide counters.
    pub fn global() -> &'static DeliveryMetrics {
        &GLOBAL_METRICS
    }

    /// Records a send attempt.
    pub fn record_attempt(&self) {
        self.attempted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an accepted message.
    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed send.
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            attempted: self.attempted.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Send attempts.
    pub attempted: u64,
    /// Accepted messages.
    pub sent: u64,
    /// Failed sends.
    pub failed: u64,
}

impl MetricsSnapshot {
    /// Returns the counts accumulated since `earlier`.
    pub fn since(&self, earlier: &MetricsSnapshot) -> MetricsSnapshot {
        MetricsSnapshot {
            attempted: self.attempted.saturating_sub(earlier.attempted),
            sent: self.sent.saturating_sub(earlier.sent),
            failed: self.failed.saturating_sub(earlier.failed),
        }
    }

    /// Returns the share of attempts that were accepted.
    pub fn success_rate(&self) -> f64 {
        if self.attempted == 0 {
            1.0
        } else {
            self.sent as f64 / self.attempted as f64
        }
    }
}

/// Timer for measuring operation duration.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    /// Creates and starts a new timer.
    pub fn start(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    /// Returns the elapsed time.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stops the timer and returns the duration.
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            timer = self.name,
            duration_ms = elapsed.as_millis() as u64,
            "Timer stopped"
        );

        elapsed
    }
}
