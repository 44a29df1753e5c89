//! Prometheus text exposition for [`MonitorMetrics`].

use crate::metrics::{HistogramSnapshot, MonitorMetrics};
use std::fmt::Write;
use std::sync::Arc;

/// Metric exporter interface for observability backends.
pub trait MetricsExporter: Send + Sync {
    /// Render metrics in a backend-specific format.
    fn render(&self) -> String;
}

pub struct PrometheusExporter {
    metrics: Arc<MonitorMetrics>,
}

impl PrometheusExporter {
    pub fn new(metrics: Arc<MonitorMetrics>) -> Self {
        Self { metrics }
    }

    pub fn metrics(&self) -> Arc<MonitorMetrics> {
        Arc::clone(&self.metrics)
    }
}

impl MetricsExporter for PrometheusExporter {
    fn render(&self) -> String {
        let s = self.metrics.snapshot();
        let mut out = String::new();

        let counters: [(&str, &str, u64); 13] = [
            ("ciphermon_records_submitted_total", "Encrypted records submitted.", s.records_submitted),
            ("ciphermon_aggregate_updates_total", "Homomorphic aggregate updates.", s.aggregate_updates),
            ("ciphermon_analyses_requested_total", "Record analysis decrypt requests issued.", s.analyses_requested),
            ("ciphermon_alerts_revealed_total", "Alert states revealed.", s.alerts_revealed),
            ("ciphermon_critical_alerts_total", "Revealed alerts at critical level.", s.critical_alerts),
            ("ciphermon_retraining_flags_total", "Revealed alerts flagging retraining.", s.retraining_flags),
            ("ciphermon_metrics_requested_total", "Aggregate metrics decrypt requests issued.", s.metrics_requested),
            ("ciphermon_metrics_delivered_total", "Aggregate metrics decryptions delivered.", s.metrics_delivered),
            ("ciphermon_proof_failures_total", "Reveal callbacks rejected for an invalid proof.", s.proof_failures),
            ("ciphermon_replays_rejected_total", "Callbacks for already retired request ids.", s.replays_rejected),
            ("ciphermon_requests_expired_total", "Pending requests retired by expiry.", s.requests_expired),
            ("ciphermon_requests_cancelled_total", "Pending requests cancelled by a caller.", s.requests_cancelled),
            ("ciphermon_unauthorized_attempts_total", "Operations refused by the authorization policy.", s.unauthorized_attempts),
        ];
        for (name, help, value) in counters {
            push_metric(&mut out, name, help, "counter", value);
        }

        push_metric(
            &mut out,
            "ciphermon_pending_requests",
            "Decrypt requests awaiting a callback.",
            "gauge",
            s.pending_requests,
        );

        push_histogram(
            &mut out,
            "ciphermon_reveal_latency_ms",
            "Milliseconds from decrypt request to verified reveal.",
            &s.reveal_latency_ms,
        );

        out
    }
}

fn push_metric(out: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}

fn push_histogram(out: &mut String, name: &str, help: &str, h: &HistogramSnapshot) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} histogram");
    let mut cumulative = 0u64;
    for (idx, bound) in h.bucket_bounds.iter().enumerate() {
        cumulative = cumulative.saturating_add(h.bucket_counts[idx]);
        let _ = writeln!(out, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
    }
    cumulative = cumulative.saturating_add(h.bucket_counts.last().copied().unwrap_or_default());
    let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(out, "{name}_sum {}", h.sum);
    let _ = writeln!(out, "{name}_count {}", h.count);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_counters_and_histogram() {
        let metrics = Arc::new(MonitorMetrics::new());
        metrics.alerts_revealed.inc();
        metrics.reveal_latency_ms.observe(20.0);
        let text = PrometheusExporter::new(metrics).render();

        assert!(text.contains("# TYPE ciphermon_alerts_revealed_total counter"));
        assert!(text.contains("ciphermon_alerts_revealed_total 1\n"));
        assert!(text.contains("ciphermon_reveal_latency_ms_bucket{le=\"10\"} 0"));
        assert!(text.contains("ciphermon_reveal_latency_ms_bucket{le=\"50\"} 1"));
        assert!(text.contains("ciphermon_reveal_latency_ms_bucket{le=\"+Inf\"} 1"));
        assert!(text.contains("ciphermon_reveal_latency_ms_count 1"));
    }
}
