//! Notifications emitted by the registry and the oracle.
//!
//! Events never carry plaintext values or ciphertext bytes.

use crate::scoring::AlertLevel;
use crate::{ModelId, MonitorError, NotificationSink, RecordId, RequestId, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    RecordRecorded {
        model_id: ModelId,
        record_id: RecordId,
        timestamp_ms: i64,
    },
    AnalysisRequested {
        record_id: RecordId,
        request_id: RequestId,
    },
    AlertRevealed {
        record_id: RecordId,
        request_id: RequestId,
        level: AlertLevel,
        needs_retraining: bool,
    },
    MetricsRequested {
        model_id: ModelId,
        request_id: RequestId,
    },
    MetricsDelivered {
        model_id: ModelId,
        request_id: RequestId,
    },
    RequestExpired {
        request_id: RequestId,
    },
    RequestCancelled {
        request_id: RequestId,
    },
}

impl MonitorEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            MonitorEvent::RecordRecorded { .. } => "record_recorded",
            MonitorEvent::AnalysisRequested { .. } => "analysis_requested",
            MonitorEvent::AlertRevealed { .. } => "alert_revealed",
            MonitorEvent::MetricsRequested { .. } => "metrics_requested",
            MonitorEvent::MetricsDelivered { .. } => "metrics_delivered",
            MonitorEvent::RequestExpired { .. } => "request_expired",
            MonitorEvent::RequestCancelled { .. } => "request_cancelled",
        }
    }
}

/// Emits each event as a structured `tracing` line.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, event: &MonitorEvent) -> Result<()> {
        match event {
            MonitorEvent::RecordRecorded {
                model_id,
                record_id,
                timestamp_ms,
            } => info!(%model_id, %record_id, timestamp_ms, "record recorded"),
            MonitorEvent::AnalysisRequested {
                record_id,
                request_id,
            } => info!(%record_id, %request_id, "analysis requested"),
            MonitorEvent::AlertRevealed {
                record_id,
                level,
                needs_retraining,
                ..
            } => info!(%record_id, %level, needs_retraining, "alert revealed"),
            MonitorEvent::MetricsRequested {
                model_id,
                request_id,
            } => info!(%model_id, %request_id, "metrics requested"),
            MonitorEvent::MetricsDelivered { model_id, .. } => {
                info!(%model_id, "metrics delivered")
            }
            MonitorEvent::RequestExpired { request_id } => info!(%request_id, "request expired"),
            MonitorEvent::RequestCancelled { request_id } => {
                info!(%request_id, "request cancelled")
            }
        }
        Ok(())
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<MonitorEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MonitorEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events().iter().filter(|e| e.kind() == kind).count()
    }
}

impl NotificationSink for MemorySink {
    fn notify(&self, event: &MonitorEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| MonitorError::EventLog("memory sink lock poisoned".into()))?
            .push(event.clone());
        Ok(())
    }
}

/// Delivers every event to each inner sink; one failing sink does not starve the others.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }
}

impl NotificationSink for FanoutSink {
    fn notify(&self, event: &MonitorEvent) -> Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(err) = sink.notify(event) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
