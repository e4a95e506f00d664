//! Pipeline counters.
//!
//! All counters are relaxed atomics — they are monotonic tallies, not
//! synchronization. The accounting invariant the fast path maintains:
//! every fault record lands in exactly one of `events_received`,
//! `events_dropped`, or `dropped_by_pause`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Smoothing factor for the latency average, span-1024 convention.
const LATENCY_ALPHA: f64 = 2.0 / 1025.0;

#[derive(Debug, Default)]
pub struct Metrics {
    events_received: AtomicU64,
    events_processed: AtomicU64,
    events_dropped: AtomicU64,
    dropped_by_pause: AtomicU64,
    callbacks_failed: AtomicU64,
    /// EWMA of enrichment latency in milliseconds, stored as f64 bits.
    latency_ewma_bits: AtomicU64,
    latency_samples: AtomicU64,
}

impl Metrics {
    pub fn add_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_processed(&self) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_dropped_by_pause(&self) {
        self.dropped_by_pause.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_callback_failed(&self) {
        self.callbacks_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold one fault-to-enrichment latency sample into the moving
    /// average. The first sample seeds the average directly.
    pub fn record_latency_ms(&self, sample_ms: f64) {
        if !sample_ms.is_finite() || sample_ms < 0.0 {
            return;
        }
        let first = self.latency_samples.fetch_add(1, Ordering::Relaxed) == 0;
        let mut current = self.latency_ewma_bits.load(Ordering::Relaxed);
        loop {
            let mean = if first {
                sample_ms
            } else {
                let prev = f64::from_bits(current);
                prev + LATENCY_ALPHA * (sample_ms - prev)
            };
            match self.latency_ewma_bits.compare_exchange_weak(
                current,
                mean.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn snapshot(&self, queue_depth: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            dropped_by_pause: self.dropped_by_pause.load(Ordering::Relaxed),
            callbacks_failed: self.callbacks_failed.load(Ordering::Relaxed),
            mean_latency_ms: f64::from_bits(self.latency_ewma_bits.load(Ordering::Relaxed)),
            queue_depth,
        }
    }
}

/// Point-in-time metrics view handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub events_received: u64,
    pub events_processed: u64,
    pub events_dropped: u64,
    pub dropped_by_pause: u64,
    pub callbacks_failed: u64,
    pub mean_latency_ms: f64,
    pub queue_depth: usize,
}
