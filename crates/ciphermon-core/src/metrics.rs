//! Instrumentation for the registry and the oracle.
//!
//! - **Counters**: submissions, requests, reveals, proof failures, replays
//! - **Gauges**: pending decrypt requests
//! - **Histograms**: request-to-reveal latency
//!
//! # Usage
//!
//! ```rust,ignore
//! use ciphermon_core::metrics::MonitorMetrics;
//!
//! let metrics = std::sync::Arc::new(MonitorMetrics::new());
//! let registry = RecordRegistry::new(store, &collaborators, &config).with_metrics(metrics.clone());
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Metric Types
// =============================================================================

/// A simple counter that can only increase.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge that can go up or down.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A histogram with fixed upper bounds plus an overflow bucket.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    bucket_bounds: Vec<f64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

#[derive(Clone, Debug, Serialize)]
pub struct HistogramSnapshot {
    pub bucket_bounds: Vec<f64>,
    /// Non-cumulative; one longer than `bucket_bounds` (last is `+Inf`).
    pub bucket_counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
}

impl Histogram {
    /// Buckets suited to decrypt round trips, in milliseconds.
    pub fn new_reveal_latency_ms() -> Self {
        Self::new(vec![
            10.0, 50.0, 100.0, 500.0, 1_000.0, 5_000.0, 30_000.0, 60_000.0, 600_000.0,
        ])
    }

    pub fn new(bucket_bounds: Vec<f64>) -> Self {
        let buckets = (0..=bucket_bounds.len())
            .map(|_| AtomicU64::new(0))
            .collect();

        Self {
            buckets,
            bucket_bounds,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .bucket_bounds
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(self.bucket_bounds.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        let micros = (value.max(0.0) * 1000.0).round() as u64;
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            bucket_bounds: self.bucket_bounds.clone(),
            bucket_counts: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
            sum: self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0,
            count: self.count.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Monitor metrics
// =============================================================================

#[derive(Debug)]
pub struct MonitorMetrics {
    pub records_submitted: Counter,
    pub aggregate_updates: Counter,
    pub analyses_requested: Counter,
    pub alerts_revealed: Counter,
    pub critical_alerts: Counter,
    pub retraining_flags: Counter,
    pub metrics_requested: Counter,
    pub metrics_delivered: Counter,
    pub proof_failures: Counter,
    pub replays_rejected: Counter,
    pub requests_expired: Counter,
    pub requests_cancelled: Counter,
    pub unauthorized_attempts: Counter,
    pub pending_requests: Gauge,
    pub reveal_latency_ms: Histogram,
}

impl MonitorMetrics {
    pub fn new() -> Self {
        Self {
            records_submitted: Counter::new(),
            aggregate_updates: Counter::new(),
            analyses_requested: Counter::new(),
            alerts_revealed: Counter::new(),
            critical_alerts: Counter::new(),
            retraining_flags: Counter::new(),
            metrics_requested: Counter::new(),
            metrics_delivered: Counter::new(),
            proof_failures: Counter::new(),
            replays_rejected: Counter::new(),
            requests_expired: Counter::new(),
            requests_cancelled: Counter::new(),
            unauthorized_attempts: Counter::new(),
            pending_requests: Gauge::new(),
            reveal_latency_ms: Histogram::new_reveal_latency_ms(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_submitted: self.records_submitted.get(),
            aggregate_updates: self.aggregate_updates.get(),
            analyses_requested: self.analyses_requested.get(),
            alerts_revealed: self.alerts_revealed.get(),
            critical_alerts: self.critical_alerts.get(),
            retraining_flags: self.retraining_flags.get(),
            metrics_requested: self.metrics_requested.get(),
            metrics_delivered: self.metrics_delivered.get(),
            proof_failures: self.proof_failures.get(),
            replays_rejected: self.replays_rejected.get(),
            requests_expired: self.requests_expired.get(),
            requests_cancelled: self.requests_cancelled.get(),
            unauthorized_attempts: self.unauthorized_attempts.get(),
            pending_requests: self.pending_requests.get(),
            reveal_latency_ms: self.reveal_latency_ms.snapshot(),
        }
    }
}

impl Default for MonitorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`MonitorMetrics`].
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub records_submitted: u64,
    pub aggregate_updates: u64,
    pub analyses_requested: u64,
    pub alerts_revealed: u64,
    pub critical_alerts: u64,
    pub retraining_flags: u64,
    pub metrics_requested: u64,
    pub metrics_delivered: u64,
    pub proof_failures: u64,
    pub replays_rejected: u64,
    pub requests_expired: u64,
    pub requests_cancelled: u64,
    pub unauthorized_attempts: u64,
    pub pending_requests: u64,
    pub reveal_latency_ms: HistogramSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_and_overflow() {
        let h = Histogram::new(vec![1.0, 10.0]);
        h.observe(0.5);
        h.observe(5.0);
        h.observe(50.0);
        let s = h.snapshot();
        assert_eq!(s.bucket_counts, vec![1, 1, 1]);
        assert_eq!(s.count, 3);
        assert!((s.sum - 55.5).abs() < 1e-9);
    }

    #[test]
    fn snapshot_reflects_counters() {
        let m = MonitorMetrics::new();
        m.records_submitted.inc();
        m.records_submitted.inc();
        m.pending_requests.set(3);
        let s = m.snapshot();
        assert_eq!(s.records_submitted, 2);
        assert_eq!(s.pending_requests, 3);
        assert_eq!(s.alerts_revealed, 0);
    }
}
