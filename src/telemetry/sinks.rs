use super::events::QuotaEvent;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service;

type SinkFuture = Pin<Box<dyn Future<Output = Result<(), Infallible>> + Send>>;

/// A telemetry sink that consumes quota events.
///
/// Sinks are `tower::Service`s so they compose with ordinary tower combinators.
/// Each bucket owns a clone of the manager's sink.
pub trait TelemetrySink:
    tower::Service<QuotaEvent, Response = (), Error = Self::SinkError, Future = Self::SinkFuture>
    + Clone
    + Send
    + Sync
    + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
    /// The future returned by `call`.
    type SinkFuture: Future<Output = Result<(), Self::SinkError>> + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
///
/// Buckets must not stall on telemetry: a sink that is not ready or fails simply
/// drops the event.
pub async fn emit_best_effort<S>(sink: S, event: QuotaEvent)
where
    S: TelemetrySink,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<QuotaEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: QuotaEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
    type SinkFuture = SinkFuture;
}

/// A telemetry sink that logs events using the `tracing` crate.
///
/// Faults log at ERROR, everything else at INFO.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<QuotaEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: QuotaEvent) -> Self::Future {
        match &event {
            QuotaEvent::Terminated { reason, .. } if reason.is_abnormal() => {
                tracing::error!(target: "quotabox::telemetry", key = %event.key(), event = %event, "quota_event");
            }
            _ => {
                tracing::info!(target: "quotabox::telemetry", key = %event.key(), event = %event, "quota_event");
            }
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
    type SinkFuture = SinkFuture;
}

/// A telemetry sink that stores events in memory.
///
/// Bounded; the oldest events are evicted when capacity is exceeded.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<QuotaEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Creates a bounded memory sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Creates a bounded memory sink with explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Snapshot of the recorded events, oldest first.
    pub fn events(&self) -> Vec<QuotaEvent> {
        self.events.lock().expect("memory sink poisoned").clone()
    }

    pub fn clear(&self) {
        self.events.lock().expect("memory sink poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("memory sink poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().expect("memory sink poisoned").is_empty()
    }

    /// Number of events dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<QuotaEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: QuotaEvent) -> Self::Future {
        let mut guard = self.events.lock().expect("memory sink poisoned");
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
    type SinkFuture = SinkFuture;
}
