//! [`AuditSink`] implementations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use common::Severity;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::{AuditEvent, AuditSink};

/// Writes each event as a structured log record with target `audit`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, e: AuditEvent) {
        let timestamp_ms = e
            .timestamp
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        let latency_ms = e.latency.as_secs_f64() * 1000.0;
        let entity_type = e.entity_type.as_deref().unwrap_or("");
        let entity_id = e.entity_id.as_deref().unwrap_or("");
        let caller_id = e.caller_id.as_deref().unwrap_or("");
        let field = e.field_name.as_deref().unwrap_or("");
        let scope = e.scope.map_or("", |s| s.as_str());
        let detail = e.detail.as_deref().unwrap_or("");

        macro_rules! emit {
            ($level:ident) => {
                $level!(
                    target: "audit",
                    operation = e.operation.as_str(),
                    outcome = e.outcome.as_str(),
                    severity = e.severity.as_str(),
                    entity_type,
                    entity_id,
                    caller_id,
                    field,
                    scope,
                    latency_ms,
                    timestamp_ms,
                    detail,
                    "audit event"
                )
            };
        }
        match e.severity {
            Severity::Info => emit!(info),
            Severity::Warning => emit!(warn),
            Severity::Critical => emit!(error),
        }
    }
}

/// Counts events and records their latency as OpenTelemetry metrics.
///
/// Labels are limited to operation, outcome and severity.
#[derive(Clone)]
pub struct MetricsAuditSink {
    events: Counter<u64>,
    latency_ms: Histogram<f64>,
}

impl MetricsAuditSink {
    /// Build instruments on the global meter provider.
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("fieldvault");
        Self {
            events: meter
                .u64_counter("fieldvault.audit.events")
                .with_description("Field encryption audit events")
                .init(),
            latency_ms: meter
                .f64_histogram("fieldvault.audit.latency_ms")
                .with_description("Latency of audited operations in milliseconds")
                .init(),
        }
    }
}

impl Default for MetricsAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for MetricsAuditSink {
    fn record(&self, e: AuditEvent) {
        let labels = [
            KeyValue::new("operation", e.operation.as_str()),
            KeyValue::new("outcome", e.outcome.as_str()),
            KeyValue::new("severity", e.severity.as_str()),
        ];
        self.events.add(1, &labels);
        self.latency_ms
            .record(e.latency.as_secs_f64() * 1000.0, &labels);
    }
}

/// Hands events to a bounded channel drained by a background task.
///
/// When the channel is full the event is dropped and counted, so the
/// encryption path never waits on audit I/O.
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    tx: mpsc::Sender<AuditEvent>,
    dropped: Arc<AtomicU64>,
}

impl ChannelAuditSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Events dropped because the channel was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            // One warning per power of two keeps a flood from flooding the log.
            if total.is_power_of_two() {
                warn!(dropped_total = total, reason = %e, "audit channel rejected event");
            }
        }
    }
}

/// Drain `rx` into `sink` until every sender is gone.
pub fn forward_task(
    mut rx: mpsc::Receiver<AuditEvent>,
    sink: Arc<dyn AuditSink>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            sink.record(event);
        }
    })
}

/// Sends every event to each inner sink in turn.
#[derive(Clone, Default)]
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn AuditSink>) {
        self.sinks.push(sink);
    }
}

impl AuditSink for FanoutAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(event.clone());
            }
            last.record(event);
        }
    }
}

/// Keeps events in memory. For tests and local inspection.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{MockAuditSink, Operation, Outcome};
    use common::SensitivityLevel;
    use std::time::Duration;

    fn event() -> AuditEvent {
        AuditEvent::rotation(SensitivityLevel::Sensitive, Outcome::Success, Duration::ZERO)
    }

    #[tokio::test]
    async fn channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelAuditSink::new(1);
        sink.record(event());
        sink.record(event());
        assert_eq!(sink.dropped(), 1);
        assert_eq!(rx.recv().await.map(|e| e.operation), Some(Operation::Rotate));
    }

    #[tokio::test]
    async fn forward_task_drains_into_sink() {
        let (sink, rx) = ChannelAuditSink::new(8);
        let memory = Arc::new(MemoryAuditSink::new());
        let handle = forward_task(rx, memory.clone());
        sink.record(event());
        sink.record(event());
        drop(sink);
        handle.await.unwrap();
        assert_eq!(memory.len(), 2);
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let mut a = MockAuditSink::new();
        a.expect_record().times(1).return_const(());
        let b = Arc::new(MemoryAuditSink::new());
        let fanout = FanoutAuditSink::new(vec![Arc::new(a), b.clone()]);
        fanout.record(event());
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn tracing_sink_accepts_every_severity() {
        let sink = TracingAuditSink;
        for outcome in [Outcome::Success, Outcome::KeyUnavailable, Outcome::Denied] {
            sink.record(AuditEvent::rotation(SensitivityLevel::Internal, outcome, Duration::ZERO));
        }
    }

    #[test]
    fn metrics_sink_records_without_provider() {
        // The global no-op provider accepts measurements silently.
        MetricsAuditSink::new().record(event());
    }
}
